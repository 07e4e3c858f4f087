//! Structured lifecycle notifications.
//!
//! Observers are notified synchronously from the engine thread. They see
//! events but cannot alter scheduling, so an engine behaves the same with or
//! without subscribers.

use desim_common::{ContextId, EventHandle, Rank, VirtualTime};
use desim_sync::SystemMutex;
use serde::Serialize;
use std::sync::Arc;

/// Something that happened inside an engine or synchronizer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum LifecycleEvent {
    /// An event was queued.
    EventScheduled {
        handle: EventHandle,
        context: ContextId,
        now: VirtualTime,
    },
    /// An event handler ran.
    EventFired {
        handle: EventHandle,
        context: ContextId,
    },
    /// A pending event was cancelled or removed.
    EventCancelled { handle: EventHandle },
    /// The engine entered `Running`.
    RunStarted { at: VirtualTime },
    /// The engine entered `Stopped`.
    RunStopped { at: VirtualTime, events_fired: u64 },
    /// A rank is waiting for its peers before it may advance past `now`.
    SyncBlocked {
        rank: Rank,
        now: VirtualTime,
        safe_until: VirtualTime,
    },
}

/// Subscriber to [`LifecycleEvent`]s.
pub trait LifecycleObserver: Send {
    fn on_lifecycle(&mut self, event: &LifecycleEvent);
}

impl<F> LifecycleObserver for F
where
    F: FnMut(&LifecycleEvent) + Send,
{
    fn on_lifecycle(&mut self, event: &LifecycleEvent) {
        self(event)
    }
}

/// Observer that records every event into a shared log.
///
/// Clone it before handing it to the engine to keep a reader.
#[derive(Debug, Clone, Default)]
pub struct LifecycleLog {
    events: Arc<SystemMutex<Vec<LifecycleEvent>>>,
}

impl LifecycleLog {
    pub fn new() -> Self {
        LifecycleLog::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&LifecycleEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl LifecycleObserver for LifecycleLog {
    fn on_lifecycle(&mut self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_records_in_order() {
        let mut log = LifecycleLog::new();
        let reader = log.clone();
        log.on_lifecycle(&LifecycleEvent::RunStarted {
            at: VirtualTime::ZERO,
        });
        log.on_lifecycle(&LifecycleEvent::RunStopped {
            at: VirtualTime::from_secs(1),
            events_fired: 3,
        });
        assert_eq!(reader.events().len(), 2);
        assert_eq!(
            reader.count(|e| matches!(e, LifecycleEvent::RunStopped { events_fired: 3, .. })),
            1
        );
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let json = serde_json::to_value(LifecycleEvent::RunStarted {
            at: VirtualTime::from_nanos(5),
        })
        .unwrap();
        assert_eq!(json["kind"], "RunStarted");
        assert_eq!(json["at"], 5);
    }
}
