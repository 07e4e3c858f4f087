//! End-to-end behavior of the event loop.

use desim_common::{ContextId, EventHandle, SimError, VirtualTime};
use desim_engine::{
    Callback, EngineState, LifecycleEvent, LifecycleLog, SchedulerKind, SimulationEngine,
};
use desim_sync::SystemMutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type Trace = Arc<SystemMutex<Vec<(u32, VirtualTime)>>>;

fn record_into(trace: &Trace, tag: u32) -> Callback {
    let trace = Arc::clone(trace);
    Callback::new(move |engine| {
        trace.lock().push((tag, engine.now()));
        Ok(())
    })
}

#[test]
fn test_cancel_before_fire_never_invokes() {
    let counter = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&counter);
    let mut engine = SimulationEngine::new();
    let handle = engine
        .schedule(
            VirtualTime::from_nanos(10),
            Callback::from_fn(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    engine.cancel(&handle);
    engine.run().unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(engine.event_count(), 0);
}

#[test]
fn test_empty_run_completes_immediately() {
    let mut engine = SimulationEngine::new();
    let stats = engine.run().unwrap();
    assert_eq!(stats.events_fired, 0);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.now(), VirtualTime::ZERO);

    // And again.
    engine.run().unwrap();
    assert_eq!(engine.event_count(), 0);
}

#[test]
fn test_simultaneous_events_fire_in_insertion_order() {
    let trace: Trace = Arc::default();
    let mut engine = SimulationEngine::new();
    for tag in 0..5 {
        engine
            .schedule(VirtualTime::from_micros(3), record_into(&trace, tag))
            .unwrap();
    }
    engine.schedule_now(record_into(&trace, 99)).unwrap();
    engine.run().unwrap();

    let tags: Vec<u32> = trace.lock().iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec![99, 0, 1, 2, 3, 4]);
}

#[test]
fn test_now_is_monotonic_under_random_workload() {
    for kind in [SchedulerKind::Heap, SchedulerKind::Map] {
        let trace: Trace = Arc::default();
        let mut engine = SimulationEngine::with_scheduler(kind);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut handles = Vec::new();
        for tag in 0..300 {
            let delay = VirtualTime::from_nanos(rng.gen_range(0..1_000));
            handles.push(engine.schedule(delay, record_into(&trace, tag)).unwrap());
        }
        // Nested scheduling from handlers.
        for _ in 0..50 {
            let trace = Arc::clone(&trace);
            let delay = VirtualTime::from_nanos(rng.gen_range(0..1_000));
            let nested = VirtualTime::from_nanos(rng.gen_range(0..1_000));
            engine
                .schedule(
                    delay,
                    Callback::new(move |engine| {
                        engine.schedule(nested, record_into(&trace, 1_000))?;
                        Ok(())
                    }),
                )
                .unwrap();
        }
        let mut cancelled = 0;
        for handle in handles.iter().step_by(7) {
            engine.cancel(handle);
            cancelled += 1;
        }

        let stats = engine.run().unwrap();
        let times: Vec<VirtualTime> = trace.lock().iter().map(|(_, t)| *t).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]), "{:?}", kind);
        assert_eq!(times.len(), 300 - cancelled + 50);
        assert_eq!(stats.events_fired, 300 - cancelled as u64 + 100);
        assert_eq!(stats.events_skipped, cancelled as u64);
    }
}

#[test]
fn test_expiry_is_monotone() {
    let mut engine = SimulationEngine::new();
    let fired = engine.schedule(VirtualTime::from_nanos(1), Callback::noop()).unwrap();
    let cancelled = engine.schedule(VirtualTime::from_nanos(2), Callback::noop()).unwrap();
    let removed = engine.schedule(VirtualTime::from_nanos(3), Callback::noop()).unwrap();
    let later = engine.schedule(VirtualTime::from_nanos(50), Callback::noop()).unwrap();

    for handle in [&fired, &cancelled, &removed, &later] {
        assert!(!engine.is_expired(handle));
    }
    engine.cancel(&cancelled);
    engine.remove(&removed).unwrap();
    assert!(engine.is_expired(&cancelled));
    assert!(engine.is_expired(&removed));

    engine.run_until(VirtualTime::from_nanos(10)).unwrap();
    assert!(engine.is_expired(&fired));
    assert!(!engine.is_expired(&later));

    engine.run().unwrap();
    for handle in [&fired, &cancelled, &removed, &later] {
        assert!(engine.is_expired(handle));
    }
    // Cancelling an expired event is a no-op.
    engine.cancel(&fired);
    assert!(engine.is_expired(&fired));
}

#[test]
fn test_remove_after_fire_is_an_error() {
    let mut engine = SimulationEngine::new();
    let handle = engine.schedule(VirtualTime::from_nanos(1), Callback::noop()).unwrap();
    engine.run().unwrap();
    assert_eq!(
        engine.remove(&handle).unwrap_err(),
        SimError::EventNotFound(handle.id())
    );
}

#[test]
fn test_destroy_list_runs_last_in_fifo_order() {
    let trace: Trace = Arc::default();
    let mut engine = SimulationEngine::new();
    engine.schedule_destroy(record_into(&trace, 1));
    let skipped = engine.schedule_destroy(record_into(&trace, 2));
    engine.schedule_destroy(record_into(&trace, 3));
    engine
        .schedule(VirtualTime::from_secs(5), record_into(&trace, 0))
        .unwrap();
    assert!(skipped.is_destroy());
    engine.cancel(&skipped);

    let stats = engine.run().unwrap();
    let tags: Vec<u32> = trace.lock().iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec![0, 1, 3]);
    assert_eq!(stats.destroy_events, 2);
    assert_eq!(stats.events_fired, 1);
    assert_eq!(engine.event_count(), 1);
    assert_eq!(engine.pending_count(), 0);
}

#[test]
fn test_events_at_max_time_are_removable() {
    let trace: Trace = Arc::default();
    let mut engine = SimulationEngine::new();
    let last = engine.schedule(VirtualTime::MAX, record_into(&trace, 1)).unwrap();
    let last_at = engine
        .schedule_at(VirtualTime::MAX, ContextId::new(2), record_into(&trace, 2))
        .unwrap();
    let teardown = engine.schedule_destroy(record_into(&trace, 3));
    assert!(!last.is_destroy());
    assert!(!last_at.is_destroy());
    assert_eq!(engine.queued_count(), 2);

    engine.remove(&last).unwrap();
    engine.remove(&last_at).unwrap();
    assert_eq!(engine.queued_count(), 0);
    assert_eq!(engine.pending_count(), 1);

    engine.run().unwrap();
    let tags: Vec<u32> = trace.lock().iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec![3]);
    assert_eq!(
        engine.remove(&teardown).unwrap_err(),
        SimError::EventNotFound(teardown.id())
    );
}

#[test]
fn test_stop_keeps_queue_and_destroy_list() {
    let trace: Trace = Arc::default();
    let mut engine = SimulationEngine::new();
    engine.schedule_destroy(record_into(&trace, 9));
    engine
        .schedule(VirtualTime::from_secs(1), record_into(&trace, 1))
        .unwrap();
    engine
        .schedule(VirtualTime::from_secs(3), record_into(&trace, 3))
        .unwrap();
    engine.stop_after(VirtualTime::from_secs(2)).unwrap();

    let stats = engine.run().unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.now(), VirtualTime::from_secs(2));
    // The stop sentinel counts as fired.
    assert_eq!(stats.events_fired, 2);
    assert_eq!(stats.destroy_events, 0);
    assert_eq!(engine.next_event_time(), Some(VirtualTime::from_secs(3)));

    // Resuming finishes the queue and then tears down.
    engine.run().unwrap();
    let tags: Vec<u32> = trace.lock().iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec![1, 3, 9]);
}

#[test]
fn test_stop_from_handler_takes_effect_after_it() {
    let trace: Trace = Arc::default();
    let mut engine = SimulationEngine::new();
    let t = Arc::clone(&trace);
    engine
        .schedule(
            VirtualTime::from_nanos(5),
            Callback::new(move |engine| {
                engine.stop();
                t.lock().push((0, engine.now()));
                Ok(())
            }),
        )
        .unwrap();
    engine
        .schedule(VirtualTime::from_nanos(5), record_into(&trace, 1))
        .unwrap();
    engine.run().unwrap();
    assert_eq!(trace.lock().len(), 1);
    assert_eq!(engine.pending_count(), 1);
}

#[test]
fn test_explicit_destroy() {
    let trace: Trace = Arc::default();
    let mut engine = SimulationEngine::new();
    engine.schedule_destroy(record_into(&trace, 7));
    engine.stop_after(VirtualTime::ZERO).unwrap();
    engine.run().unwrap();
    assert!(trace.lock().is_empty());
    assert_eq!(engine.destroy().unwrap(), 1);
    assert_eq!(trace.lock().len(), 1);
    assert_eq!(engine.destroy().unwrap(), 0);
}

#[test]
fn test_step_processes_one_record() {
    let trace: Trace = Arc::default();
    let mut engine = SimulationEngine::new();
    engine
        .schedule(VirtualTime::from_nanos(1), record_into(&trace, 1))
        .unwrap();
    engine
        .schedule(VirtualTime::from_nanos(2), record_into(&trace, 2))
        .unwrap();
    assert!(engine.step().unwrap());
    assert_eq!(engine.now(), VirtualTime::from_nanos(1));
    assert!(engine.step().unwrap());
    assert!(!engine.step().unwrap());
    assert_eq!(trace.lock().len(), 2);
}

#[test]
fn test_run_until_leaves_later_events() {
    let trace: Trace = Arc::default();
    let mut engine = SimulationEngine::new();
    for (tag, ms) in [(1, 10), (2, 20), (3, 30)] {
        engine
            .schedule(VirtualTime::from_millis(ms), record_into(&trace, tag))
            .unwrap();
    }
    let stats = engine.run_until(VirtualTime::from_millis(20)).unwrap();
    assert_eq!(stats.events_fired, 2);
    assert_eq!(engine.now(), VirtualTime::from_millis(20));
    assert_eq!(engine.pending_count(), 1);
}

#[test]
fn test_lifecycle_observer_sees_events() {
    let log = LifecycleLog::new();
    let mut engine = SimulationEngine::new();
    engine.add_observer(Box::new(log.clone()));
    let handle = engine.schedule(VirtualTime::from_nanos(1), Callback::noop()).unwrap();
    let cancelled = engine.schedule(VirtualTime::from_nanos(2), Callback::noop()).unwrap();
    engine.cancel(&cancelled);
    engine.run().unwrap();

    let events = log.events();
    assert!(matches!(events[0], LifecycleEvent::EventScheduled { .. }));
    assert!(events.contains(&LifecycleEvent::EventCancelled { handle: cancelled }));
    assert!(events.contains(&LifecycleEvent::EventFired {
        handle,
        context: ContextId::NONE
    }));
    assert_eq!(log.count(|e| matches!(e, LifecycleEvent::RunStarted { .. })), 1);
    assert!(matches!(
        events.last(),
        Some(LifecycleEvent::RunStopped { events_fired: 1, .. })
    ));
}

#[test]
fn test_observers_do_not_change_behavior() {
    fn run(observe: bool) -> Vec<(u32, VirtualTime)> {
        let trace: Trace = Arc::default();
        let mut engine = SimulationEngine::new();
        if observe {
            engine.add_observer(Box::new(|_: &LifecycleEvent| {}));
        }
        for tag in 0..20u32 {
            let delay = VirtualTime::from_nanos(i64::from(tag % 4));
            engine.schedule(delay, record_into(&trace, tag)).unwrap();
        }
        engine.run().unwrap();
        let out = trace.lock().clone();
        out
    }
    assert_eq!(run(true), run(false));
}

#[test]
fn test_injected_events_from_other_thread() {
    let trace: Trace = Arc::default();
    let mut engine = SimulationEngine::new();
    let injector = engine.injector();

    // Keeps the engine busy until the injector thread is done.
    let gate = Arc::new(AtomicU32::new(0));
    let producer = {
        let trace = Arc::clone(&trace);
        let gate = Arc::clone(&gate);
        thread::spawn(move || {
            for tag in 0..3 {
                injector
                    .schedule_with_context(
                        ContextId::new(tag),
                        VirtualTime::from_nanos(i64::from(tag)),
                        record_into(&trace, tag),
                    )
                    .unwrap();
            }
            assert_eq!(
                injector
                    .schedule(VirtualTime::from_nanos(-5), Callback::noop())
                    .unwrap_err(),
                SimError::NegativeInjectionDelay(VirtualTime::from_nanos(-5))
            );
            gate.store(1, Ordering::SeqCst);
        })
    };

    fn poll(gate: Arc<AtomicU32>) -> Callback {
        Callback::new(move |engine| {
            if gate.load(Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(1));
                engine.schedule(VirtualTime::from_nanos(1), poll(gate))?;
            }
            Ok(())
        })
    }
    engine.schedule_now(poll(Arc::clone(&gate))).unwrap();
    engine.run().unwrap();
    producer.join().unwrap();

    assert_eq!(trace.lock().len(), 3);
}

#[test]
fn test_handles_are_unique_and_ordered() {
    let mut engine = SimulationEngine::new();
    let handles: Vec<EventHandle> = (0..10)
        .map(|_| engine.schedule(VirtualTime::ZERO, Callback::noop()).unwrap())
        .collect();
    assert!(handles.windows(2).all(|w| w[0].id() < w[1].id()));
}
