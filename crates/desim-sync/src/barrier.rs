//! Reusable all-parties rendezvous.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Returned when a [`Barrier`] wait gives up before all parties arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("barrier timed out with {arrived} of {parties} parties arrived")]
pub struct BarrierTimeout {
    /// Parties present when the wait gave up, including the caller.
    pub arrived: usize,
    /// Parties the barrier waits for.
    pub parties: usize,
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// A generation-counted barrier that can be reused for any number of
/// rendezvous rounds.
#[derive(Debug)]
pub struct Barrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cond_var: Condvar,
}

impl Barrier {
    /// Create a barrier for `parties` threads. Zero is treated as one.
    pub fn new(parties: usize) -> Self {
        Barrier {
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            cond_var: Condvar::new(),
        }
    }

    /// Number of parties the barrier waits for.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Block until all parties have called `wait`. Returns `true` for
    /// exactly one caller per round (the last to arrive).
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cond_var.notify_all();
            return true;
        }
        while state.generation == generation {
            self.cond_var.wait(&mut state);
        }
        false
    }

    /// Like [`wait`](Barrier::wait) but withdraws from the round after
    /// `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, BarrierTimeout> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cond_var.notify_all();
            return Ok(true);
        }
        while state.generation == generation {
            match deadline {
                Some(deadline) => {
                    let timed_out = self
                        .cond_var
                        .wait_until(&mut state, deadline)
                        .timed_out();
                    if timed_out && state.generation == generation {
                        let arrived = state.arrived;
                        state.arrived -= 1;
                        return Err(BarrierTimeout {
                            arrived,
                            parties: self.parties,
                        });
                    }
                }
                None => self.cond_var.wait(&mut state),
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_single_party_never_blocks() {
        let barrier = Barrier::new(1);
        assert!(barrier.wait());
        assert!(barrier.wait());
    }

    #[test]
    fn test_exactly_one_leader_per_round() {
        let barrier = Arc::new(Barrier::new(4));
        let leaders = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let leaders = Arc::clone(&leaders);
                thread::spawn(move || {
                    for _ in 0..10 {
                        if barrier.wait() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_wait_timeout_withdraws() {
        let barrier = Barrier::new(2);
        let err = barrier.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err, BarrierTimeout { arrived: 1, parties: 2 });

        // The withdrawn party must not count towards the next round.
        let barrier = Arc::new(barrier);
        let other = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.wait_timeout(Duration::from_secs(10)))
        };
        let mine = barrier.wait_timeout(Duration::from_secs(10)).unwrap();
        let theirs = other.join().unwrap().unwrap();
        assert!(mine ^ theirs);
    }
}
