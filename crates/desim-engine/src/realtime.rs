//! Wall-clock pacing.
//!
//! [`RealtimeDriver`] runs an engine so virtual time tracks wall time scaled
//! by a speed multiplier. Between events it sleeps on the engine's injection
//! mailbox, so work injected from another thread wakes it immediately.

use crate::{metric_defs, EngineState, RunStats, SimulationEngine};
use desim_common::{SimError, VirtualTime};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Pacing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Virtual seconds per wall second.
    pub speed_multiplier: f64,
    /// Lag beyond which a warning is logged.
    pub lag_warning: Duration,
    /// Lag beyond which the run fails with [`SimError::RealtimeLag`].
    pub hard_limit: Option<Duration>,
    /// Return once the queue is empty instead of waiting for injections.
    pub exit_when_idle: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            speed_multiplier: 1.0,
            lag_warning: Duration::from_millis(100),
            hard_limit: None,
            exit_when_idle: true,
        }
    }
}

/// Outcome of a paced run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RealtimeStats {
    #[serde(flatten)]
    pub run: RunStats,
    pub lag_warnings: u64,
    pub max_lag_ms: u64,
}

/// Maps between wall time and virtual time for one run.
#[derive(Debug)]
struct RealtimePacer {
    speed: f64,
    lag_warning: Duration,
    hard_limit: Option<Duration>,
    start_wall: Instant,
    start_sim: VirtualTime,
    lag_warnings: u64,
    max_lag: Duration,
    warned: bool,
}

impl RealtimePacer {
    fn new(config: &RealtimeConfig, start_sim: VirtualTime) -> Self {
        RealtimePacer {
            speed: if config.speed_multiplier > 0.0 {
                config.speed_multiplier
            } else {
                1.0
            },
            lag_warning: config.lag_warning,
            hard_limit: config.hard_limit,
            start_wall: Instant::now(),
            start_sim,
            lag_warnings: 0,
            max_lag: Duration::ZERO,
            warned: false,
        }
    }

    /// Virtual time corresponding to the current wall time.
    fn target_sim_time(&self) -> VirtualTime {
        let elapsed = self.start_wall.elapsed().as_secs_f64() * self.speed;
        self.start_sim
            .saturating_add(VirtualTime::from_secs_f64(elapsed))
    }

    /// Wall time left until virtual time `at` is due.
    fn sleep_until(&self, at: VirtualTime) -> Duration {
        let offset = (at - self.start_sim).as_secs_f64().max(0.0) / self.speed;
        match Duration::try_from_secs_f64(offset)
            .ok()
            .and_then(|offset| self.start_wall.checked_add(offset))
        {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Record how late an event due at `at` is running.
    fn check_lag(&mut self, at: VirtualTime) -> Result<(), SimError> {
        let behind = (self.target_sim_time() - at).as_secs_f64();
        if behind <= 0.0 {
            self.warned = false;
            return Ok(());
        }
        let lag = Duration::from_secs_f64(behind / self.speed);
        self.max_lag = self.max_lag.max(lag);
        metrics::histogram!(metric_defs::REALTIME_LAG.name).record(lag.as_secs_f64() * 1000.0);

        if let Some(limit) = self.hard_limit {
            if lag > limit {
                return Err(SimError::RealtimeLag {
                    lag_ms: lag.as_millis() as u64,
                    limit_ms: limit.as_millis() as u64,
                });
            }
        }
        if lag > self.lag_warning {
            // One warning per stretch of lag.
            if !self.warned {
                self.lag_warnings += 1;
                warn!(
                    lag_ms = lag.as_millis() as u64,
                    speed = self.speed,
                    "simulation lagging behind wall clock"
                );
            }
            self.warned = true;
        } else {
            self.warned = false;
        }
        Ok(())
    }
}

/// Runs an engine paced against the wall clock.
#[derive(Debug, Clone, Default)]
pub struct RealtimeDriver {
    config: RealtimeConfig,
}

impl RealtimeDriver {
    pub fn new(config: RealtimeConfig) -> Self {
        RealtimeDriver { config }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Run `engine` until it stops or, with `exit_when_idle`, runs out of
    /// events.
    ///
    /// Injected events are scheduled relative to the later of the engine's
    /// clock and the wall-derived virtual time. When the run ends because the
    /// queue emptied, the destroy list is drained as in
    /// [`SimulationEngine::run`].
    pub fn run(&self, engine: &mut SimulationEngine) -> Result<RealtimeStats, SimError> {
        let mailbox = std::sync::Arc::clone(engine.injection_mailbox());
        engine.begin_run();
        let mut pacer = RealtimePacer::new(&self.config, engine.now());
        debug!(speed = pacer.speed, "real-time run started");

        let result = loop {
            if engine.state() != EngineState::Running {
                break Ok(());
            }
            if let Err(err) = engine.drain_injections(pacer.target_sim_time()) {
                break Err(err);
            }
            if engine.state() != EngineState::Running {
                break Ok(());
            }
            match engine.next_event_time() {
                Some(at) if at <= pacer.target_sim_time() => {
                    if let Err(err) = pacer.check_lag(at).and_then(|()| engine.process_next()) {
                        break Err(err);
                    }
                }
                Some(at) => {
                    mailbox.wait_timeout(pacer.sleep_until(at));
                }
                None if self.config.exit_when_idle => match engine.destroy() {
                    Ok(_) => break Ok(()),
                    Err(err) => break Err(err),
                },
                None => {
                    mailbox.wait_timeout(Duration::MAX);
                }
            }
        };

        let run = engine.end_run();
        result?;
        if pacer.lag_warnings > 0 {
            debug!(
                lag_warnings = pacer.lag_warnings,
                max_lag_ms = pacer.max_lag.as_millis() as u64,
                "real-time run finished with lag"
            );
        }
        Ok(RealtimeStats {
            run,
            lag_warnings: pacer.lag_warnings,
            max_lag_ms: pacer.max_lag.as_millis() as u64,
        })
    }
}
