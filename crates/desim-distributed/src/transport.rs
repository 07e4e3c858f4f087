//! Point-to-point channels between ranks.

use bytes::Bytes;
use desim_common::{ContextId, Rank, VirtualTime};
use desim_sync::BarrierTimeout;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Messages exchanged between synchronizers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// A model event to fire on the destination at `arrival`.
    ///
    /// `bound` is the sender's promise that no later message on this channel
    /// carries an earlier arrival.
    Event {
        source: Rank,
        context: ContextId,
        arrival: VirtualTime,
        bound: VirtualTime,
        payload: Bytes,
    },
    /// Time-bound advance with no payload.
    Null { source: Rank, bound: VirtualTime },
    /// Conservative round announcement: the sender will not send anything
    /// arriving before `bound`. `stop` is set when the sender's engine asked
    /// to stop.
    Grant {
        source: Rank,
        round: u64,
        bound: VirtualTime,
        stop: bool,
    },
    /// The sender completed its run and sends nothing further.
    Done { source: Rank },
    /// The sender failed and left the run.
    Abort { source: Rank },
}

impl SyncMessage {
    /// Rank that sent the message.
    pub fn source(&self) -> Rank {
        match self {
            SyncMessage::Event { source, .. }
            | SyncMessage::Null { source, .. }
            | SyncMessage::Grant { source, .. }
            | SyncMessage::Done { source }
            | SyncMessage::Abort { source } => *source,
        }
    }
}

/// Channel failures. All are recoverable from the kernel's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("unknown destination {0}")]
    UnknownRank(Rank),

    #[error("{0} has left the cluster")]
    Disconnected(Rank),

    #[error("no message received within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Barrier(#[from] BarrierTimeout),
}

/// Transport used by one rank.
///
/// Messages between a given pair of ranks are delivered in the order they
/// were sent.
pub trait Transport: Send {
    /// This rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the run.
    fn size(&self) -> usize;

    /// Send `message` to `dest`.
    fn send(&self, dest: Rank, message: SyncMessage) -> Result<(), TransportError>;

    /// Receive a message if one is waiting.
    fn try_recv(&self) -> Option<SyncMessage>;

    /// Receive a message, waiting up to `timeout`.
    fn recv_timeout(&self, timeout: Duration) -> Result<SyncMessage, TransportError>;

    /// Block until every rank has reached the barrier.
    fn barrier(&self) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn rank(&self) -> Rank {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn send(&self, dest: Rank, message: SyncMessage) -> Result<(), TransportError> {
        (**self).send(dest, message)
    }

    fn try_recv(&self) -> Option<SyncMessage> {
        (**self).try_recv()
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<SyncMessage, TransportError> {
        (**self).recv_timeout(timeout)
    }

    fn barrier(&self) -> Result<(), TransportError> {
        (**self).barrier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_survive_json_encoding() {
        let null = SyncMessage::Null {
            source: Rank::new(1),
            bound: VirtualTime::from_nanos(5),
        };
        assert_eq!(
            serde_json::to_string(&null).unwrap(),
            r#"{"Null":{"source":1,"bound":5}}"#
        );

        let messages = [
            SyncMessage::Event {
                source: Rank::new(0),
                context: ContextId::new(7),
                arrival: VirtualTime::from_millis(3),
                bound: VirtualTime::from_millis(2),
                payload: Bytes::from_static(&[0, 1, 255]),
            },
            SyncMessage::Grant {
                source: Rank::new(2),
                round: 9,
                bound: VirtualTime::MAX,
                stop: true,
            },
            SyncMessage::Done { source: Rank::new(3) },
            SyncMessage::Abort { source: Rank::new(4) },
        ];
        for message in messages {
            let json = serde_json::to_vec(&message).unwrap();
            let decoded: SyncMessage = serde_json::from_slice(&json).unwrap();
            assert_eq!(decoded.source(), message.source());
            assert_eq!(decoded, message);
        }
    }
}
