//! In-process transport: one [`Mailbox`] per rank, one shared [`Barrier`].

use crate::transport::{SyncMessage, Transport, TransportError};
use desim_common::Rank;
use desim_sync::{Barrier, Mailbox};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

#[derive(Debug)]
struct Shared {
    mailboxes: Vec<Mailbox<SyncMessage>>,
    alive: Vec<AtomicBool>,
    barrier: Barrier,
}

/// Factory for a set of connected [`LocalTransport`]s.
#[derive(Debug, Clone, Copy)]
pub struct LocalCluster;

impl LocalCluster {
    /// Create `size` transports, ranks `0..size`, whose barriers wait forever.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(size: usize) -> Vec<LocalTransport> {
        Self::with_barrier_timeout(size, None)
    }

    /// Create `size` transports whose barriers give up after `timeout`.
    pub fn with_barrier_timeout(size: usize, timeout: Option<Duration>) -> Vec<LocalTransport> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            mailboxes: (0..size).map(|_| Mailbox::new()).collect(),
            alive: (0..size).map(|_| AtomicBool::new(true)).collect(),
            barrier: Barrier::new(size),
        });
        (0..size)
            .map(|rank| LocalTransport {
                rank: Rank::new(rank as u32),
                shared: Arc::clone(&shared),
                barrier_timeout: timeout,
            })
            .collect()
    }
}

/// One rank's end of a [`LocalCluster`].
#[derive(Debug)]
pub struct LocalTransport {
    rank: Rank,
    shared: Arc<Shared>,
    barrier_timeout: Option<Duration>,
}

impl LocalTransport {
    fn mailbox(&self) -> &Mailbox<SyncMessage> {
        &self.shared.mailboxes[self.rank.index()]
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.mailboxes.len()
    }

    fn send(&self, dest: Rank, message: SyncMessage) -> Result<(), TransportError> {
        let mailbox = self
            .shared
            .mailboxes
            .get(dest.index())
            .ok_or(TransportError::UnknownRank(dest))?;
        if !self.shared.alive[dest.index()].load(Ordering::Acquire) {
            return Err(TransportError::Disconnected(dest));
        }
        trace!(from = %self.rank, to = %dest, ?message, "send");
        mailbox.push(message);
        Ok(())
    }

    fn try_recv(&self) -> Option<SyncMessage> {
        self.mailbox().try_pop()
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<SyncMessage, TransportError> {
        self.mailbox()
            .pop_timeout(timeout)
            .ok_or(TransportError::Timeout(timeout))
    }

    fn barrier(&self) -> Result<(), TransportError> {
        match self.barrier_timeout {
            Some(timeout) => {
                self.shared.barrier.wait_timeout(timeout)?;
            }
            None => {
                self.shared.barrier.wait();
            }
        }
        Ok(())
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.shared.alive[self.rank.index()].store(false, Ordering::Release);
    }
}
