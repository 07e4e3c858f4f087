//! # desim-distributed
//!
//! Keeps several [`SimulationEngine`]s ("ranks") causally consistent while
//! they run in parallel and exchange events over a [`Transport`].
//!
//! Every rank declares a lookahead `L > 0` per destination: any event it sends
//! arrives at least `L` after the sender's clock at the time of sending. Two
//! algorithms turn that promise into safe execution windows:
//!
//! - [`SyncAlgorithm::Conservative`]: global rounds. Each rank announces
//!   `min(next local event, earliest arrival it sent this round) + min L`;
//!   all ranks then run events strictly before the minimum of the
//!   announcements (the LBTS). Stops on global quiescence or once the LBTS
//!   passes `end_time`.
//! - [`SyncAlgorithm::NullMessage`] (Chandy-Misra-Bryant): no rounds. Each
//!   rank runs events strictly before the smallest bound its peers promised,
//!   then sends each peer a null message carrying its own advanced bound.
//!   Requires `end_time`, since there is no global quiescence detection.
//!
//! A received event that would fire before the receiver's clock, or before a
//! bound its sender already promised, is a [`SyncError::CausalityViolation`].
//! A send whose delay is shorter than the declared lookahead is a
//! [`SyncError::LookaheadViolation`]. Both mean the lookahead is
//! mis-declared, not that the kernel is broken.

mod local;
mod transport;

pub use local::{LocalCluster, LocalTransport};
pub use transport::{SyncMessage, Transport, TransportError};

use bytes::Bytes;
use desim_common::{ContextId, Rank, SimError, VirtualTime};
use desim_engine::{
    metric_defs, Callback, HandlerResult, LifecycleEvent, RunStats, SimulationEngine,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

// ============================================================================
// Errors
// ============================================================================

/// Synchronizer errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A remote event would have fired in the receiver's past.
    #[error(
        "causality violation on {rank}: event from {sender} arrives at {arrival}, \
         but the bound is {bound} and local time is {now}; check the declared lookahead"
    )]
    CausalityViolation {
        rank: Rank,
        sender: Rank,
        arrival: VirtualTime,
        bound: VirtualTime,
        now: VirtualTime,
    },

    /// A send used a delay below the declared lookahead for its destination.
    #[error("event to {dest} sent with delay {delay}, below the declared lookahead {lookahead}")]
    LookaheadViolation {
        dest: Rank,
        delay: VirtualTime,
        lookahead: VirtualTime,
    },

    #[error("distributed synchronization requires a transport")]
    MissingTransport,

    #[error("lookahead must be positive, got {0}")]
    ZeroLookahead(VirtualTime),

    #[error("{0} is not a peer of this rank")]
    InvalidRank(Rank),

    #[error("the null-message algorithm requires an end time")]
    MissingEndTime,

    #[error("{0} aborted the run")]
    PeerAborted(Rank),

    #[error(transparent)]
    Engine(#[from] SimError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SyncError {
    /// True for errors caused by a mis-declared lookahead.
    pub fn is_causality_error(&self) -> bool {
        matches!(
            self,
            SyncError::CausalityViolation { .. } | SyncError::LookaheadViolation { .. }
        )
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Which synchronization algorithm to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAlgorithm {
    #[default]
    Conservative,
    NullMessage,
}

impl fmt::Display for SyncAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncAlgorithm::Conservative => "conservative",
            SyncAlgorithm::NullMessage => "null_message",
        })
    }
}

/// Synchronizer settings shared by all ranks of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub algorithm: SyncAlgorithm,
    /// Lookahead towards every destination without an override.
    pub lookahead: VirtualTime,
    /// Lookahead towards specific destinations.
    pub lookahead_overrides: BTreeMap<Rank, VirtualTime>,
    /// Last virtual time to execute. Required by the null-message algorithm.
    pub end_time: Option<VirtualTime>,
    /// How long a blocked rank waits for a peer message before failing.
    pub recv_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            algorithm: SyncAlgorithm::default(),
            lookahead: VirtualTime::from_millis(1),
            lookahead_overrides: BTreeMap::new(),
            end_time: None,
            recv_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Lookahead for events sent to `dest`.
    pub fn lookahead_to(&self, dest: Rank) -> VirtualTime {
        self.lookahead_overrides
            .get(&dest)
            .copied()
            .unwrap_or(self.lookahead)
    }

    /// Check the settings for a run of `size` ranks.
    pub fn validate(&self, size: usize) -> Result<(), SyncError> {
        if self.lookahead <= VirtualTime::ZERO {
            return Err(SyncError::ZeroLookahead(self.lookahead));
        }
        for (rank, lookahead) in &self.lookahead_overrides {
            if rank.index() >= size {
                return Err(SyncError::InvalidRank(*rank));
            }
            if *lookahead <= VirtualTime::ZERO {
                return Err(SyncError::ZeroLookahead(*lookahead));
            }
        }
        if self.algorithm == SyncAlgorithm::NullMessage && self.end_time.is_none() {
            return Err(SyncError::MissingEndTime);
        }
        Ok(())
    }
}

// ============================================================================
// Remote Events
// ============================================================================

/// An event delivered from another rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEvent {
    pub source: Rank,
    pub payload: Bytes,
}

/// Handler invoked on the receiving engine when a remote event fires.
pub type RemoteEventHandler =
    Arc<dyn Fn(&mut SimulationEngine, RemoteEvent) -> HandlerResult + Send + Sync>;

// ============================================================================
// Synchronizer
// ============================================================================

/// Where a rank is in its synchronization cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    /// Exchanging bounds with peers.
    Synchronizing,
    /// Executing a safe window.
    Granted,
    /// Waiting for a peer message.
    Blocked,
}

/// Per-peer channel state.
#[derive(Debug, Clone)]
struct Channel {
    peer: Rank,
    /// Minimum delay of events sent to `peer`.
    lookahead: VirtualTime,
    /// Lower bound on arrivals still to come from `peer`.
    pending_remote_time: VirtualTime,
    /// Highest bound promised to `peer`.
    last_sent_bound: VirtualTime,
    /// `peer` reported that its run completed.
    done: bool,
}

/// Counters for one rank's run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub rank: u32,
    pub rounds: u64,
    pub null_messages_sent: u64,
    pub events_sent: u64,
    pub events_received: u64,
    pub times_blocked: u64,
    pub run: RunStats,
}

/// Builder for [`DistributedSynchronizer`].
pub struct SynchronizerBuilder {
    config: SyncConfig,
    transport: Option<Box<dyn Transport>>,
    handler: Option<RemoteEventHandler>,
}

impl SynchronizerBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SynchronizerBuilder {
            config,
            transport: None,
            handler: None,
        }
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Handler for incoming events. Without one, remote events are dropped
    /// when they fire.
    pub fn on_remote_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut SimulationEngine, RemoteEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<DistributedSynchronizer, SyncError> {
        let transport = self.transport.ok_or(SyncError::MissingTransport)?;
        self.config.validate(transport.size())?;
        let rank = transport.rank();
        let channels = (0..transport.size() as u32)
            .map(Rank::new)
            .filter(|peer| *peer != rank)
            .map(|peer| Channel {
                peer,
                lookahead: self.config.lookahead_to(peer),
                pending_remote_time: VirtualTime::ZERO,
                last_sent_bound: VirtualTime::ZERO,
                done: false,
            })
            .collect();
        let handler: RemoteEventHandler = match self.handler {
            Some(handler) => handler,
            None => Arc::new(|_: &mut SimulationEngine, event: RemoteEvent| {
                trace!(source = %event.source, "remote event without handler");
                Ok(())
            }),
        };
        Ok(DistributedSynchronizer {
            rank,
            rank_label: rank.0.to_string(),
            transport,
            config: self.config,
            handler,
            channels,
            state: SyncState::Synchronizing,
            stats: SyncStats {
                rank: rank.0,
                ..SyncStats::default()
            },
            early_grants: Vec::new(),
        })
    }
}

/// A grant received for a round this rank has not reached yet.
#[derive(Debug, Clone, Copy)]
struct EarlyGrant {
    source: Rank,
    round: u64,
    bound: VirtualTime,
    stop: bool,
}

/// Drives one rank's engine in safe windows.
pub struct DistributedSynchronizer {
    rank: Rank,
    rank_label: String,
    transport: Box<dyn Transport>,
    config: SyncConfig,
    handler: RemoteEventHandler,
    channels: Vec<Channel>,
    state: SyncState,
    stats: SyncStats,
    early_grants: Vec<EarlyGrant>,
}

impl fmt::Debug for DistributedSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedSynchronizer")
            .field("rank", &self.rank)
            .field("algorithm", &self.config.algorithm)
            .field("state", &self.state)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl DistributedSynchronizer {
    pub fn builder(config: SyncConfig) -> SynchronizerBuilder {
        SynchronizerBuilder::new(config)
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Smallest lookahead towards any peer.
    fn min_lookahead(&self) -> VirtualTime {
        self.channels
            .iter()
            .map(|c| c.lookahead)
            .min()
            .unwrap_or(self.config.lookahead)
    }

    fn safe_time(&self) -> VirtualTime {
        self.channels
            .iter()
            .map(|c| c.pending_remote_time)
            .min()
            .unwrap_or(VirtualTime::MAX)
    }

    fn channel_mut(&mut self, peer: Rank) -> Result<&mut Channel, SyncError> {
        self.channels
            .iter_mut()
            .find(|c| c.peer == peer)
            .ok_or(SyncError::InvalidRank(peer))
    }

    /// Run `engine` as this rank until the run ends on every rank.
    ///
    /// The engine is attached for remote sends for the duration of the call.
    /// All ranks meet at a barrier before the first window and after the
    /// last. Before the final barrier each rank sends `Done` and waits for
    /// `Done` from every peer, so a peer that fails late still reaches this
    /// rank as [`SyncError::PeerAborted`].
    pub fn run(&mut self, engine: &mut SimulationEngine) -> Result<SyncStats, SyncError> {
        info!(
            rank = %self.rank,
            size = self.transport.size(),
            algorithm = %self.config.algorithm,
            lookahead = %self.config.lookahead,
            "distributed run starting"
        );
        for channel in &mut self.channels {
            channel.done = false;
        }
        engine.attach_remote(self.rank);
        if let Err(err) = self.transport.barrier() {
            engine.detach_remote();
            return Err(err.into());
        }
        engine.begin_run();

        let result = match self.config.algorithm {
            SyncAlgorithm::Conservative => self.run_conservative(engine),
            SyncAlgorithm::NullMessage => self.run_null_message(engine),
        }
        .and_then(|()| self.finish());
        self.stats.run = engine.end_run();
        let unsent = engine.detach_remote();
        if !unsent.is_empty() {
            debug!(rank = %self.rank, unsent = unsent.len(), "dropping sends past the end of the run");
        }

        if let Err(err) = result {
            warn!(rank = %self.rank, error = %err, "distributed run failed");
            if !matches!(err, SyncError::PeerAborted(_)) {
                self.broadcast_abort();
            }
            return Err(err);
        }
        info!(
            rank = %self.rank,
            now = %engine.now(),
            events_fired = self.stats.run.events_fired,
            rounds = self.stats.rounds,
            null_messages = self.stats.null_messages_sent,
            "distributed run finished"
        );
        Ok(self.stats.clone())
    }

    /// Announce completion, then wait until every peer has completed too.
    fn finish(&mut self) -> Result<(), SyncError> {
        while let Some(message) = self.transport.try_recv() {
            self.handle_after_end(message)?;
        }
        for channel in &self.channels {
            self.transport
                .send(channel.peer, SyncMessage::Done { source: self.rank })?;
        }
        while self.channels.iter().any(|c| !c.done) {
            self.state = SyncState::Blocked;
            let message = self.transport.recv_timeout(self.config.recv_timeout)?;
            self.handle_after_end(message)?;
        }
        self.state = SyncState::Synchronizing;
        // Every peer has completed, so nobody can abort past this point.
        self.transport.barrier()?;
        Ok(())
    }

    /// Apply a message that arrived after this rank's last window.
    fn handle_after_end(&mut self, message: SyncMessage) -> Result<(), SyncError> {
        match message {
            SyncMessage::Done { source } => self.channel_mut(source)?.done = true,
            SyncMessage::Abort { source } => return Err(SyncError::PeerAborted(source)),
            message => {
                trace!(
                    rank = %self.rank,
                    source = %message.source(),
                    "message after the end of the run dropped"
                );
            }
        }
        Ok(())
    }

    fn broadcast_abort(&self) {
        for channel in &self.channels {
            let _ = self
                .transport
                .send(channel.peer, SyncMessage::Abort { source: self.rank });
        }
    }

    // ------------------------------------------------------------------------
    // Conservative rounds
    // ------------------------------------------------------------------------

    fn run_conservative(&mut self, engine: &mut SimulationEngine) -> Result<(), SyncError> {
        let end = self.config.end_time;
        let lookahead = self.min_lookahead();
        let mut sent_min = VirtualTime::MAX;
        let mut round = 0u64;

        loop {
            round += 1;
            self.state = SyncState::Synchronizing;
            let local_next = engine.next_event_time().unwrap_or(VirtualTime::MAX);
            let own_bound = local_next.min(sent_min).saturating_add(lookahead);
            let stop = engine.is_stop_requested();
            for channel in &self.channels {
                self.transport.send(
                    channel.peer,
                    SyncMessage::Grant {
                        source: self.rank,
                        round,
                        bound: own_bound,
                        stop,
                    },
                )?;
            }
            let (lbts, any_stop) = self.collect_grants(engine, round, own_bound, stop)?;
            sent_min = VirtualTime::MAX;
            self.stats.rounds += 1;
            metrics::counter!(metric_defs::SYNC_ROUNDS.name, "rank" => self.rank_label.clone())
                .increment(1);
            trace!(rank = %self.rank, round, lbts = %lbts, "round granted");

            if any_stop {
                debug!(rank = %self.rank, round, "stop requested by a rank");
                return Ok(());
            }
            if lbts == VirtualTime::MAX {
                debug!(rank = %self.rank, round, "all ranks quiescent");
                return Ok(());
            }

            self.state = SyncState::Granted;
            engine.run_while(|key| key.time < lbts && end.map_or(true, |end| key.time <= end))?;
            sent_min = sent_min.min(self.flush_outbox(engine)?);

            if end.is_some_and(|end| lbts > end) {
                return Ok(());
            }
        }
    }

    /// Receive grants for `round` from every peer; returns the LBTS and
    /// whether any rank asked to stop.
    fn collect_grants(
        &mut self,
        engine: &mut SimulationEngine,
        round: u64,
        own_bound: VirtualTime,
        own_stop: bool,
    ) -> Result<(VirtualTime, bool), SyncError> {
        let mut lbts = own_bound;
        let mut any_stop = own_stop;
        let mut waiting: Vec<Rank> = self.channels.iter().map(|c| c.peer).collect();

        let early = std::mem::take(&mut self.early_grants);
        for grant in early {
            if grant.round == round {
                waiting.retain(|peer| *peer != grant.source);
                lbts = lbts.min(grant.bound);
                any_stop |= grant.stop;
            } else {
                self.early_grants.push(grant);
            }
        }

        while !waiting.is_empty() {
            let message = self.receive_blocking(engine, lbts)?;
            if let Some(grant) = self.handle_message(engine, message)? {
                if grant.round == round {
                    waiting.retain(|peer| *peer != grant.source);
                    lbts = lbts.min(grant.bound);
                    any_stop |= grant.stop;
                } else if grant.round > round {
                    self.early_grants.push(grant);
                }
            }
        }
        Ok((lbts, any_stop))
    }

    // ------------------------------------------------------------------------
    // Null messages
    // ------------------------------------------------------------------------

    fn run_null_message(&mut self, engine: &mut SimulationEngine) -> Result<(), SyncError> {
        let end = self.config.end_time.ok_or(SyncError::MissingEndTime)?;

        loop {
            while let Some(message) = self.transport.try_recv() {
                self.handle_message(engine, message)?;
            }
            let safe = self.safe_time();

            self.state = SyncState::Granted;
            engine.run_while(|key| key.time < safe && key.time <= end)?;
            self.flush_outbox(engine)?;

            if engine.is_stop_requested() || safe > end {
                break;
            }

            self.state = SyncState::Synchronizing;
            let local_next = engine.next_event_time().unwrap_or(VirtualTime::MAX);
            let horizon = local_next.min(safe);
            for i in 0..self.channels.len() {
                let bound = horizon.saturating_add(self.channels[i].lookahead);
                if bound > self.channels[i].last_sent_bound {
                    self.send_null(i, bound)?;
                }
            }

            let message = self.receive_blocking(engine, safe)?;
            self.handle_message(engine, message)?;
        }

        // Release peers still waiting on this rank.
        for i in 0..self.channels.len() {
            self.send_null(i, VirtualTime::MAX)?;
        }
        Ok(())
    }

    fn send_null(&mut self, index: usize, bound: VirtualTime) -> Result<(), SyncError> {
        let channel = &mut self.channels[index];
        channel.last_sent_bound = bound;
        let peer = channel.peer;
        self.transport.send(
            peer,
            SyncMessage::Null {
                source: self.rank,
                bound,
            },
        )?;
        self.stats.null_messages_sent += 1;
        metrics::counter!(metric_defs::SYNC_NULL_MESSAGES.name, "rank" => self.rank_label.clone())
            .increment(1);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Message plumbing
    // ------------------------------------------------------------------------

    fn receive_blocking(
        &mut self,
        engine: &mut SimulationEngine,
        safe_until: VirtualTime,
    ) -> Result<SyncMessage, SyncError> {
        if let Some(message) = self.transport.try_recv() {
            return Ok(message);
        }
        self.state = SyncState::Blocked;
        self.stats.times_blocked += 1;
        metrics::counter!(metric_defs::SYNC_BLOCKED.name, "rank" => self.rank_label.clone())
            .increment(1);
        engine.emit(LifecycleEvent::SyncBlocked {
            rank: self.rank,
            now: engine.now(),
            safe_until,
        });
        let message = self.transport.recv_timeout(self.config.recv_timeout)?;
        self.state = SyncState::Synchronizing;
        Ok(message)
    }

    /// Apply one incoming message. Grants are returned to the caller.
    fn handle_message(
        &mut self,
        engine: &mut SimulationEngine,
        message: SyncMessage,
    ) -> Result<Option<EarlyGrant>, SyncError> {
        match message {
            SyncMessage::Event {
                source,
                context,
                arrival,
                bound,
                payload,
            } => {
                self.receive_event(engine, source, context, arrival, bound, payload)?;
                Ok(None)
            }
            SyncMessage::Null { source, bound } => {
                let channel = self.channel_mut(source)?;
                channel.pending_remote_time = channel.pending_remote_time.max(bound);
                Ok(None)
            }
            SyncMessage::Grant {
                source,
                round,
                bound,
                stop,
            } => {
                self.channel_mut(source)?;
                Ok(Some(EarlyGrant {
                    source,
                    round,
                    bound,
                    stop,
                }))
            }
            SyncMessage::Done { source } => {
                self.channel_mut(source)?.done = true;
                Ok(None)
            }
            SyncMessage::Abort { source } => Err(SyncError::PeerAborted(source)),
        }
    }

    fn receive_event(
        &mut self,
        engine: &mut SimulationEngine,
        source: Rank,
        context: ContextId,
        arrival: VirtualTime,
        bound: VirtualTime,
        payload: Bytes,
    ) -> Result<(), SyncError> {
        let rank = self.rank;
        let now = engine.now();
        let channel = self.channel_mut(source)?;
        if arrival < now || arrival < channel.pending_remote_time {
            return Err(SyncError::CausalityViolation {
                rank,
                sender: source,
                arrival,
                bound: channel.pending_remote_time,
                now,
            });
        }
        channel.pending_remote_time = channel.pending_remote_time.max(bound);

        let handler = Arc::clone(&self.handler);
        engine.schedule_at(
            arrival,
            context,
            Callback::new(move |engine| handler(engine, RemoteEvent { source, payload }))
                .with_debug_name("desim::remote_event"),
        )?;
        self.stats.events_received += 1;
        metrics::counter!(metric_defs::SYNC_EVENTS_RECEIVED.name, "rank" => self.rank_label.clone())
            .increment(1);
        trace!(rank = %rank, %source, arrival = %arrival, "remote event queued");
        Ok(())
    }

    /// Send everything the engine queued for other ranks. Returns the
    /// earliest arrival sent, or `MAX` if nothing was sent.
    fn flush_outbox(&mut self, engine: &mut SimulationEngine) -> Result<VirtualTime, SyncError> {
        let mut earliest = VirtualTime::MAX;
        for send in engine.take_remote_sends() {
            let rank = self.rank;
            let channel = self.channel_mut(send.dest)?;
            let delay = send.arrival - send.sent_at;
            if delay < channel.lookahead {
                return Err(SyncError::LookaheadViolation {
                    dest: send.dest,
                    delay,
                    lookahead: channel.lookahead,
                });
            }
            let bound = send.sent_at.saturating_add(channel.lookahead);
            channel.last_sent_bound = channel.last_sent_bound.max(bound);
            earliest = earliest.min(send.arrival);
            self.transport.send(
                send.dest,
                SyncMessage::Event {
                    source: rank,
                    context: send.context,
                    arrival: send.arrival,
                    bound,
                    payload: send.payload,
                },
            )?;
            self.stats.events_sent += 1;
            metrics::counter!(metric_defs::SYNC_EVENTS_SENT.name, "rank" => self.rank_label.clone())
                .increment(1);
        }
        Ok(earliest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_transport() {
        let err = DistributedSynchronizer::builder(SyncConfig::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingTransport));
    }

    #[test]
    fn test_zero_lookahead_rejected() {
        let config = SyncConfig {
            lookahead: VirtualTime::ZERO,
            ..SyncConfig::default()
        };
        let transport = LocalCluster::new(2).remove(0);
        let err = DistributedSynchronizer::builder(config)
            .transport(transport)
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::ZeroLookahead(_)));
    }

    #[test]
    fn test_null_message_requires_end_time() {
        let config = SyncConfig {
            algorithm: SyncAlgorithm::NullMessage,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(2), Err(SyncError::MissingEndTime)));
    }

    #[test]
    fn test_override_for_unknown_rank() {
        let mut config = SyncConfig::default();
        config
            .lookahead_overrides
            .insert(Rank::new(4), VirtualTime::from_millis(2));
        assert!(matches!(
            config.validate(2),
            Err(SyncError::InvalidRank(rank)) if rank == Rank::new(4)
        ));
    }

    #[test]
    fn test_lookahead_overrides() {
        let mut config = SyncConfig::default();
        config
            .lookahead_overrides
            .insert(Rank::new(1), VirtualTime::from_millis(5));
        assert_eq!(config.lookahead_to(Rank::new(1)), VirtualTime::from_millis(5));
        assert_eq!(config.lookahead_to(Rank::new(2)), VirtualTime::from_millis(1));

        let transport = LocalCluster::new(3).remove(0);
        let sync = DistributedSynchronizer::builder(config)
            .transport(transport)
            .build()
            .unwrap();
        assert_eq!(sync.min_lookahead(), VirtualTime::from_millis(1));
        assert_eq!(sync.channels.len(), 2);
        assert_eq!(sync.state(), SyncState::Synchronizing);
    }

    #[test]
    fn test_single_rank_runs_to_end() {
        let transport = LocalCluster::new(1).remove(0);
        let config = SyncConfig {
            algorithm: SyncAlgorithm::NullMessage,
            end_time: Some(VirtualTime::from_millis(10)),
            ..SyncConfig::default()
        };
        let mut sync = DistributedSynchronizer::builder(config)
            .transport(transport)
            .build()
            .unwrap();
        let mut engine = SimulationEngine::new();
        engine.schedule(VirtualTime::from_millis(5), Callback::noop()).unwrap();
        engine.schedule(VirtualTime::from_millis(20), Callback::noop()).unwrap();
        let stats = sync.run(&mut engine).unwrap();
        assert_eq!(stats.run.events_fired, 1);
        assert_eq!(engine.pending_count(), 1);
        assert_eq!(engine.local_rank(), None);
    }

    #[test]
    fn test_causality_errors_are_distinguishable() {
        let err = SyncError::LookaheadViolation {
            dest: Rank::new(1),
            delay: VirtualTime::ZERO,
            lookahead: VirtualTime::from_millis(1),
        };
        assert!(err.is_causality_error());
        assert!(!SyncError::MissingTransport.is_causality_error());
        assert!(!SyncError::Engine(SimError::TimeOverflow).is_causality_error());
    }
}
