//! # desim-engine
//!
//! The single-threaded discrete-event loop.
//!
//! A [`SimulationEngine`] owns a [`Scheduler`] of pending [`EventRecord`]s and
//! a virtual clock. [`run`](SimulationEngine::run) pops records in
//! `(time, id)` order, advances the clock to each one and invokes its
//! [`Callback`], which receives `&mut SimulationEngine` so it can read the
//! clock and schedule more work.
//!
//! ```
//! use desim_common::VirtualTime;
//! use desim_engine::{Callback, SimulationEngine};
//!
//! let mut engine = SimulationEngine::new();
//! engine
//!     .schedule(
//!         VirtualTime::from_millis(5),
//!         Callback::new(|engine| {
//!             assert_eq!(engine.now(), VirtualTime::from_millis(5));
//!             Ok(())
//!         }),
//!     )
//!     .unwrap();
//! let stats = engine.run().unwrap();
//! assert_eq!(stats.events_fired, 1);
//! ```

pub mod callback;
mod injector;
pub mod lifecycle;
pub mod metric_defs;
pub mod realtime;
pub mod scheduler;

pub use callback::{Callback, HandlerResult};
pub use injector::{Injection, Injector};
pub use lifecycle::{LifecycleEvent, LifecycleLog, LifecycleObserver};
pub use realtime::{RealtimeConfig, RealtimeDriver, RealtimeStats};
pub use scheduler::{EventRecord, HeapScheduler, MapScheduler, Scheduler, SchedulerKind};

use bytes::Bytes;
use desim_common::{ContextId, EventHandle, EventId, EventKey, Rank, SimError, VirtualTime};
use desim_sync::Mailbox;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

// ============================================================================
// Engine State
// ============================================================================

/// Run state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Never run.
    Idle,
    /// Inside a run loop.
    Running,
    /// A stop was requested; the loop returns after the current event.
    Stopping,
    /// A run returned.
    Stopped,
}

/// Statistics for one call to a run method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Handlers invoked during the run.
    pub events_fired: u64,
    /// Cancelled records discarded without running.
    pub events_skipped: u64,
    /// Destroy-list callbacks run.
    pub destroy_events: u64,
    /// Engine time when the run returned.
    pub final_time_ns: i64,
    /// Wall clock time in milliseconds.
    pub wall_time_ms: u64,
}

/// An event addressed to another rank, queued by
/// [`send_remote`](SimulationEngine::send_remote).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSend {
    /// Destination rank.
    pub dest: Rank,
    /// Context of the sending handler.
    pub context: ContextId,
    /// Sender time when the send was made.
    pub sent_at: VirtualTime,
    /// Time the event must fire on the destination.
    pub arrival: VirtualTime,
    /// Opaque model payload.
    pub payload: Bytes,
}

#[derive(Debug)]
struct RemoteLink {
    rank: Rank,
    outbox: Vec<RemoteSend>,
}

#[derive(Debug, Clone, Copy)]
struct RunBaseline {
    wall_start: Instant,
    events_fired: u64,
    events_skipped: u64,
    destroy_events: u64,
}

// ============================================================================
// Simulation Engine
// ============================================================================

/// Discrete-event engine.
pub struct SimulationEngine {
    scheduler: Box<dyn Scheduler>,
    now: VirtualTime,
    next_id: u64,
    state: EngineState,
    current_context: ContextId,
    current_event: Option<EventId>,
    /// Ids of events that are queued and neither fired nor cancelled.
    pending: HashSet<EventId>,
    destroy_events: VecDeque<(EventId, Callback)>,
    event_count: u64,
    skipped_count: u64,
    destroy_count: u64,
    baseline: Option<RunBaseline>,
    observers: Vec<Box<dyn LifecycleObserver>>,
    injections: Option<Arc<Mailbox<Injection>>>,
    remote: Option<RemoteLink>,
}

impl Default for SimulationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimulationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationEngine")
            .field("now", &self.now)
            .field("state", &self.state)
            .field("queued", &self.scheduler.len())
            .field("pending", &self.pending.len())
            .field("event_count", &self.event_count)
            .finish_non_exhaustive()
    }
}

impl SimulationEngine {
    /// Create an engine backed by a [`HeapScheduler`].
    pub fn new() -> Self {
        Self::with_scheduler(SchedulerKind::Heap)
    }

    /// Create an engine backed by the given scheduler kind.
    pub fn with_scheduler(kind: SchedulerKind) -> Self {
        Self::with_boxed_scheduler(kind.build())
    }

    /// Create an engine backed by a caller-supplied scheduler. The scheduler
    /// must be empty.
    pub fn with_boxed_scheduler(scheduler: Box<dyn Scheduler>) -> Self {
        SimulationEngine {
            scheduler,
            now: VirtualTime::ZERO,
            next_id: 0,
            state: EngineState::Idle,
            current_context: ContextId::NONE,
            current_event: None,
            pending: HashSet::new(),
            destroy_events: VecDeque::new(),
            event_count: 0,
            skipped_count: 0,
            destroy_count: 0,
            baseline: None,
            observers: Vec::new(),
            injections: None,
            remote: None,
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Current virtual time.
    pub fn now(&self) -> VirtualTime {
        self.now
    }

    /// Current run state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Number of handlers invoked over the engine's lifetime. Cancelled
    /// records and destroy-list callbacks are not counted.
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Events scheduled that have neither fired nor been cancelled, destroy
    /// list included.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Records held by the scheduler, including cancelled ones not yet popped.
    pub fn queued_count(&self) -> usize {
        self.scheduler.len()
    }

    /// Time of the earliest queued record, cancelled or not.
    pub fn next_event_time(&self) -> Option<VirtualTime> {
        self.scheduler.next_time()
    }

    /// Context of the event being executed, or [`ContextId::NONE`] outside
    /// handlers.
    pub fn current_context(&self) -> ContextId {
        self.current_context
    }

    /// True if the event has fired, been cancelled or been removed. Once true
    /// it stays true.
    pub fn is_expired(&self, handle: &EventHandle) -> bool {
        !self.pending.contains(&handle.id())
    }

    /// True while the event's handler is executing.
    pub fn is_running(&self, handle: &EventHandle) -> bool {
        self.current_event == Some(handle.id())
    }

    /// True if [`stop`](SimulationEngine::stop) was called during the current
    /// run.
    pub fn is_stop_requested(&self) -> bool {
        self.state == EngineState::Stopping
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Schedule `callback` `delay` from now in the current context.
    pub fn schedule(
        &mut self,
        delay: VirtualTime,
        callback: Callback,
    ) -> Result<EventHandle, SimError> {
        self.schedule_with_context(self.current_context, delay, callback)
    }

    /// Schedule `callback` `delay` from now in `context`.
    pub fn schedule_with_context(
        &mut self,
        context: ContextId,
        delay: VirtualTime,
        callback: Callback,
    ) -> Result<EventHandle, SimError> {
        if delay.is_negative() {
            return Err(SimError::NegativeDelay {
                delay,
                now: self.now,
            });
        }
        let time = self.now.checked_add(delay).ok_or(SimError::TimeOverflow)?;
        Ok(self.insert(time, context, callback))
    }

    /// Schedule `callback` at the current time, after every event already
    /// queued for it.
    pub fn schedule_now(&mut self, callback: Callback) -> Result<EventHandle, SimError> {
        self.schedule(VirtualTime::ZERO, callback)
    }

    /// Schedule `callback` at an absolute time.
    pub fn schedule_at(
        &mut self,
        time: VirtualTime,
        context: ContextId,
        callback: Callback,
    ) -> Result<EventHandle, SimError> {
        if time < self.now {
            return Err(SimError::NonCausal {
                requested: time,
                now: self.now,
            });
        }
        Ok(self.insert(time, context, callback))
    }

    /// Queue `callback` to run at teardown, after all ordinary events.
    pub fn schedule_destroy(&mut self, callback: Callback) -> EventHandle {
        let id = self.allocate_id();
        let handle = EventHandle::destroy(id);
        trace!(event = %handle, "queued destroy callback");
        self.destroy_events.push_back((id, callback));
        self.pending.insert(id);
        handle
    }

    fn allocate_id(&mut self) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, time: VirtualTime, context: ContextId, payload: Callback) -> EventHandle {
        let key = EventKey::new(time, self.allocate_id());
        let handle = EventHandle::new(key);
        trace!(
            event = %handle,
            %context,
            now = %self.now,
            handler = payload.debug_name().unwrap_or("<anonymous>"),
            "scheduled"
        );
        self.scheduler.insert(EventRecord::new(key, context, payload));
        self.pending.insert(key.id);
        metrics::counter!(metric_defs::EVENTS_SCHEDULED.name).increment(1);
        self.emit(LifecycleEvent::EventScheduled {
            handle,
            context,
            now: self.now,
        });
        handle
    }

    /// Cancel a pending event. The record stays queued but will be discarded
    /// without running when it reaches the head. Cancelling an expired event
    /// does nothing.
    pub fn cancel(&mut self, handle: &EventHandle) {
        let id = handle.id();
        if !self.pending.remove(&id) {
            return;
        }
        if handle.is_destroy() {
            self.destroy_events.retain(|(queued, _)| *queued != id);
        }
        trace!(event = %handle, "cancelled");
        metrics::counter!(metric_defs::EVENTS_CANCELLED.name, "mode" => "cancel").increment(1);
        self.emit(LifecycleEvent::EventCancelled { handle: *handle });
    }

    /// Remove a pending event from the queue immediately.
    ///
    /// Fails with [`SimError::EventNotFound`] if the record is no longer
    /// queued (already fired or removed).
    pub fn remove(&mut self, handle: &EventHandle) -> Result<(), SimError> {
        let id = handle.id();
        if handle.is_destroy() {
            let position = self
                .destroy_events
                .iter()
                .position(|(queued, _)| *queued == id)
                .ok_or(SimError::EventNotFound(id))?;
            self.destroy_events.remove(position);
        } else if self.scheduler.remove(id).is_none() {
            return Err(SimError::EventNotFound(id));
        }
        let was_pending = self.pending.remove(&id);
        trace!(event = %handle, was_pending, "removed");
        if was_pending {
            metrics::counter!(metric_defs::EVENTS_CANCELLED.name, "mode" => "remove")
                .increment(1);
            self.emit(LifecycleEvent::EventCancelled { handle: *handle });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------------

    /// Run until the queue is exhausted or [`stop`](SimulationEngine::stop)
    /// is called.
    ///
    /// Each popped record advances the clock to its time, cancelled records
    /// included; only live records invoke their callback.
    ///
    /// On exhaustion the destroy list is drained and the engine is left in
    /// [`EngineState::Stopped`]. After a stop, queued events and the destroy
    /// list are kept; a later `run` resumes from them.
    pub fn run(&mut self) -> Result<RunStats, SimError> {
        self.begin_run();
        let result = self.run_loop();
        self.finish(result)
    }

    fn run_loop(&mut self) -> Result<(), SimError> {
        self.run_while(|_| true)?;
        if self.state == EngineState::Running {
            self.destroy()?;
        }
        Ok(())
    }

    /// Run every event with a timestamp at or before `limit`, then return
    /// without draining the destroy list. The clock is left at the last
    /// record popped.
    pub fn run_until(&mut self, limit: VirtualTime) -> Result<RunStats, SimError> {
        self.begin_run();
        let result = self.run_while(|key| key.time <= limit).map(|_| ());
        self.finish(result)
    }

    fn finish(&mut self, result: Result<(), SimError>) -> Result<RunStats, SimError> {
        let stats = self.end_run();
        match result {
            Ok(()) => Ok(stats),
            Err(err) => {
                debug!(error = %err, now = %self.now, "run aborted");
                Err(err)
            }
        }
    }

    /// Enter [`EngineState::Running`]. Used by external drivers that call
    /// [`run_while`](SimulationEngine::run_while) or
    /// [`step`](SimulationEngine::step) directly.
    pub fn begin_run(&mut self) {
        self.state = EngineState::Running;
        self.baseline = Some(RunBaseline {
            wall_start: Instant::now(),
            events_fired: self.event_count,
            events_skipped: self.skipped_count,
            destroy_events: self.destroy_count,
        });
        debug!(now = %self.now, queued = self.scheduler.len(), "run started");
        self.emit(LifecycleEvent::RunStarted { at: self.now });
    }

    /// Enter [`EngineState::Stopped`] and report what happened since
    /// [`begin_run`](SimulationEngine::begin_run).
    pub fn end_run(&mut self) -> RunStats {
        self.state = EngineState::Stopped;
        let baseline = self.baseline.take().unwrap_or(RunBaseline {
            wall_start: Instant::now(),
            events_fired: self.event_count,
            events_skipped: self.skipped_count,
            destroy_events: self.destroy_count,
        });
        let wall = baseline.wall_start.elapsed();
        let stats = RunStats {
            events_fired: self.event_count - baseline.events_fired,
            events_skipped: self.skipped_count - baseline.events_skipped,
            destroy_events: self.destroy_count - baseline.destroy_events,
            final_time_ns: self.now.as_nanos(),
            wall_time_ms: wall.as_millis() as u64,
        };
        metrics::histogram!(metric_defs::RUN_WALL_TIME.name).record(wall.as_secs_f64() * 1000.0);
        metrics::gauge!(metric_defs::QUEUE_DEPTH.name).set(self.scheduler.len() as f64);
        debug!(
            now = %self.now,
            events_fired = stats.events_fired,
            events_skipped = stats.events_skipped,
            "run stopped"
        );
        self.emit(LifecycleEvent::RunStopped {
            at: self.now,
            events_fired: stats.events_fired,
        });
        stats
    }

    /// Process queued records while the head record's key satisfies `admit`
    /// and no stop has been requested. Injected work is drained before each
    /// record. Enters `Running` if the engine is not already in a run.
    ///
    /// Returns the number of records popped (fired or skipped).
    pub fn run_while<F>(&mut self, mut admit: F) -> Result<u64, SimError>
    where
        F: FnMut(EventKey) -> bool,
    {
        if matches!(self.state, EngineState::Idle | EngineState::Stopped) {
            self.state = EngineState::Running;
        }
        let mut processed = 0;
        while self.state == EngineState::Running {
            let now = self.now;
            self.drain_injections(now)?;
            if self.state != EngineState::Running {
                break;
            }
            match self.scheduler.peek_next() {
                Some(record) if admit(record.key) => {}
                _ => break,
            }
            self.process_next()?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Drain injected work and process exactly one queued record.
    ///
    /// Returns `false` if the queue was empty.
    pub fn step(&mut self) -> Result<bool, SimError> {
        let now = self.now;
        self.drain_injections(now)?;
        self.process_next()
    }

    pub(crate) fn process_next(&mut self) -> Result<bool, SimError> {
        let Some(record) = self.scheduler.remove_next() else {
            return Ok(false);
        };
        let EventRecord {
            key,
            context,
            payload,
        } = record;
        if key.time < self.now {
            return Err(SimError::NonMonotonicTime {
                from: self.now,
                to: key.time,
            });
        }
        let handle = EventHandle::new(key);
        self.now = key.time;
        if !self.pending.remove(&key.id) {
            // Cancelled: the payload is dropped here.
            self.skipped_count += 1;
            trace!(event = %handle, "skipped cancelled event");
            return Ok(true);
        }

        self.current_context = context;
        self.current_event = Some(key.id);
        trace!(
            event = %handle,
            %context,
            handler = payload.debug_name().unwrap_or("<anonymous>"),
            "firing"
        );
        let result = payload.invoke(self);
        self.current_event = None;
        self.current_context = ContextId::NONE;
        self.event_count += 1;
        metrics::counter!(metric_defs::EVENTS_FIRED.name).increment(1);
        self.emit(LifecycleEvent::EventFired { handle, context });
        result.map(|()| true)
    }

    /// Request that the current run return after the event being executed.
    /// Has no effect outside a run.
    pub fn stop(&mut self) {
        if self.state == EngineState::Running {
            debug!(now = %self.now, "stop requested");
            self.state = EngineState::Stopping;
        }
    }

    /// Schedule a stop `delay` from now. The stop event counts as fired.
    pub fn stop_after(&mut self, delay: VirtualTime) -> Result<EventHandle, SimError> {
        self.schedule_with_context(
            ContextId::NONE,
            delay,
            Callback::new(|engine| {
                engine.stop();
                Ok(())
            })
            .with_debug_name("desim::stop"),
        )
    }

    /// Run the destroy list in FIFO order. Callbacks queued by destroy
    /// callbacks run in the same pass. Returns how many ran.
    pub fn destroy(&mut self) -> Result<u64, SimError> {
        let mut ran = 0;
        while let Some((id, callback)) = self.destroy_events.pop_front() {
            self.pending.remove(&id);
            self.current_event = Some(id);
            trace!(event = %id, "running destroy callback");
            let result = callback.invoke(self);
            self.current_event = None;
            self.destroy_count += 1;
            ran += 1;
            metrics::counter!(metric_defs::DESTROY_EVENTS.name).increment(1);
            result?;
        }
        Ok(ran)
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    /// Subscribe to lifecycle events.
    pub fn add_observer(&mut self, observer: Box<dyn LifecycleObserver>) {
        self.observers.push(observer);
    }

    /// Deliver `event` to every observer.
    pub fn emit(&mut self, event: LifecycleEvent) {
        for observer in &mut self.observers {
            observer.on_lifecycle(&event);
        }
    }

    // ------------------------------------------------------------------------
    // External injection
    // ------------------------------------------------------------------------

    /// Handle for scheduling into this engine from other threads.
    ///
    /// The mailbox behind it is created on first call; engines that never
    /// hand out an injector never lock.
    pub fn injector(&mut self) -> Injector {
        Injector::new(Arc::clone(self.injection_mailbox()))
    }

    pub(crate) fn injection_mailbox(&mut self) -> &Arc<Mailbox<Injection>> {
        self.injections
            .get_or_insert_with(|| Arc::new(Mailbox::new()))
    }

    /// Schedule all injected work relative to `base` (or now, if later).
    /// Returns how many injections were drained.
    pub fn drain_injections(&mut self, base: VirtualTime) -> Result<usize, SimError> {
        let Some(mailbox) = self.injections.as_ref().map(Arc::clone) else {
            return Ok(0);
        };
        if mailbox.is_empty() {
            return Ok(0);
        }
        let base = base.max(self.now);
        let injections = mailbox.drain();
        let drained = injections.len();
        for injection in injections {
            match injection {
                Injection::Schedule {
                    delay,
                    context,
                    callback,
                } => {
                    let time = base.checked_add(delay).ok_or(SimError::TimeOverflow)?;
                    self.schedule_at(time, context, callback)?;
                }
                Injection::Stop => self.stop(),
            }
        }
        trace!(drained, base = %base, "drained injections");
        Ok(drained)
    }

    // ------------------------------------------------------------------------
    // Remote sends
    // ------------------------------------------------------------------------

    /// Attach the engine to a distributed run as `rank`, enabling
    /// [`send_remote`](SimulationEngine::send_remote).
    pub fn attach_remote(&mut self, rank: Rank) {
        self.remote = Some(RemoteLink {
            rank,
            outbox: Vec::new(),
        });
    }

    /// Detach from a distributed run, returning unsent events.
    pub fn detach_remote(&mut self) -> Vec<RemoteSend> {
        self.remote
            .take()
            .map(|link| link.outbox)
            .unwrap_or_default()
    }

    /// Rank this engine runs as, if attached.
    pub fn local_rank(&self) -> Option<Rank> {
        self.remote.as_ref().map(|link| link.rank)
    }

    /// Queue an event for `dest` to fire `delay` from now on the destination.
    ///
    /// The synchronizer validates the delay against the channel lookahead
    /// when it flushes the outbox.
    pub fn send_remote(
        &mut self,
        dest: Rank,
        delay: VirtualTime,
        payload: Bytes,
    ) -> Result<(), SimError> {
        if delay.is_negative() {
            return Err(SimError::NegativeDelay {
                delay,
                now: self.now,
            });
        }
        let arrival = self.now.checked_add(delay).ok_or(SimError::TimeOverflow)?;
        let send = RemoteSend {
            dest,
            context: self.current_context,
            sent_at: self.now,
            arrival,
            payload,
        };
        let link = self.remote.as_mut().ok_or(SimError::RemoteUnavailable)?;
        trace!(%dest, arrival = %arrival, "queued remote send");
        link.outbox.push(send);
        Ok(())
    }

    /// Take every queued remote send.
    pub fn take_remote_sends(&mut self) -> Vec<RemoteSend> {
        self.remote
            .as_mut()
            .map(|link| std::mem::take(&mut link.outbox))
            .unwrap_or_default()
    }
}
