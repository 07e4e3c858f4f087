//! # desim-runner library
//!
//! Drives a token ring workload over the desim kernel in one of three modes:
//!
//! - **Single**: every node of the ring lives in one [`SimulationEngine`].
//! - **Realtime**: like single, paced against the wall clock by a
//!   [`RealtimeDriver`].
//! - **Distributed**: one engine per node, each on its own thread, kept
//!   consistent by a [`DistributedSynchronizer`] over a [`LocalCluster`].
//!
//! The ring has `distributed.ranks` nodes in every mode, so a single-engine
//! run is the reference for the distributed one. Node 0 sends a token at time
//! zero; each receiving node passes it on after `workload.hop_delay` until
//! `workload.hops` hops were delivered. Every node also fires
//! `workload.ticks` local background ticks with seeded jitter.

use bytes::{Buf, Bytes};
use desim_common::{ContextId, Rank, SimError, VirtualTime};
use desim_distributed::{
    DistributedSynchronizer, LocalCluster, SyncAlgorithm, SyncError, SyncStats, TransportError,
};
use desim_engine::{Callback, HandlerResult, RealtimeDriver, RunStats, SimulationEngine};
use desim_model::{ConfigError, SimulationConfig, TransportKind, WorkloadSection};
use desim_sync::SystemMutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during a run.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimError),

    /// Synchronization error.
    #[error("Synchronization error: {0}")]
    Sync(#[from] SyncError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A rank thread panicked.
    #[error("Rank {0} panicked")]
    RankPanicked(u32),
}

// ============================================================================
// Report
// ============================================================================

/// How the run was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Single,
    Realtime,
    Distributed,
}

/// Per-node counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub node: u32,
    pub hops_received: u64,
    /// Virtual time of the last token this node received.
    pub last_hop_ns: Option<i64>,
    pub ticks_fired: u64,
}

/// Outcome of [`run_simulation`], printed as JSON by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<SyncAlgorithm>,
    pub seed: u64,
    /// Events fired, summed over all engines.
    pub events_fired: u64,
    /// Latest final clock over all engines.
    pub final_time_ns: i64,
    pub wall_time_ms: u64,
    pub hops_delivered: u64,
    pub last_hop_ns: Option<i64>,
    pub nodes: Vec<NodeReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ranks: Vec<SyncStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lag_warnings: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lag_ms: Option<u64>,
}

impl RunReport {
    fn new(mode: RunMode, config: &SimulationConfig, nodes: Vec<NodeReport>) -> Self {
        let hops_delivered = nodes.iter().map(|n| n.hops_received).sum();
        let last_hop_ns = nodes.iter().filter_map(|n| n.last_hop_ns).max();
        RunReport {
            mode,
            algorithm: None,
            seed: config.workload.seed,
            events_fired: 0,
            final_time_ns: 0,
            wall_time_ms: 0,
            hops_delivered,
            last_hop_ns,
            nodes,
            ranks: Vec::new(),
            lag_warnings: None,
            max_lag_ms: None,
        }
    }

    fn with_run(mut self, run: &RunStats) -> Self {
        self.events_fired = run.events_fired;
        self.final_time_ns = run.final_time_ns;
        self.wall_time_ms = run.wall_time_ms;
        self
    }
}

// ============================================================================
// Ring Workload
// ============================================================================

fn encode_hop(hop: u64) -> Bytes {
    Bytes::copy_from_slice(&hop.to_be_bytes())
}

fn decode_hop(mut payload: Bytes, context: ContextId) -> Result<u64, SimError> {
    if payload.len() != 8 {
        return Err(SimError::handler(
            context,
            format!("ring token must be 8 bytes, got {}", payload.len()),
        ));
    }
    Ok(payload.get_u64())
}

/// Token ring shared by every engine of a run.
#[derive(Debug, Clone)]
struct Ring {
    nodes: u32,
    hops: u64,
    hop_delay: VirtualTime,
    /// Tokens cross engines through `send_remote` instead of local events.
    distributed: bool,
    reports: Arc<SystemMutex<Vec<NodeReport>>>,
}

impl Ring {
    fn new(nodes: u32, workload: &WorkloadSection, distributed: bool) -> Self {
        let reports = (0..nodes)
            .map(|node| NodeReport {
                node,
                ..NodeReport::default()
            })
            .collect();
        Ring {
            nodes,
            hops: u64::from(workload.hops),
            hop_delay: workload.hop_delay,
            distributed,
            reports: Arc::new(SystemMutex::new(reports)),
        }
    }

    fn with_report<R>(&self, node: u32, f: impl FnOnce(&mut NodeReport) -> R) -> Option<R> {
        self.reports.lock().get_mut(node as usize).map(f)
    }

    /// Schedule node-local work: the token start on node 0 and the
    /// background ticks.
    fn populate(
        &self,
        engine: &mut SimulationEngine,
        node: u32,
        workload: &WorkloadSection,
    ) -> Result<(), SimError> {
        if node == 0 && self.hops > 0 {
            let ring = self.clone();
            engine.schedule_at(
                VirtualTime::ZERO,
                ContextId::new(0),
                Callback::new(move |engine| ring.forward(engine, 0, 1))
                    .with_debug_name("ring_start"),
            )?;
        }

        let mut rng = ChaCha8Rng::seed_from_u64(workload.seed.wrapping_add(u64::from(node)));
        let mean = workload.tick_interval.as_nanos() as f64;
        let mut at = VirtualTime::ZERO;
        for _ in 0..workload.ticks {
            let jitter: f64 = rng.gen_range(0.5..1.5);
            let step = VirtualTime::from_nanos(((mean * jitter).round() as i64).max(1));
            at = at.checked_add(step).ok_or(SimError::TimeOverflow)?;
            let ring = self.clone();
            engine.schedule_at(
                at,
                ContextId::new(node),
                Callback::new(move |_| {
                    ring.with_report(node, |r| r.ticks_fired += 1);
                    Ok(())
                })
                .with_debug_name("ring_tick"),
            )?;
        }
        Ok(())
    }

    fn forward(&self, engine: &mut SimulationEngine, from: u32, hop: u64) -> HandlerResult {
        let next = (from + 1) % self.nodes;
        if self.distributed && next != from {
            return engine.send_remote(Rank::new(next), self.hop_delay, encode_hop(hop));
        }
        let ring = self.clone();
        engine.schedule_with_context(
            ContextId::new(next),
            self.hop_delay,
            Callback::new(move |engine| ring.deliver(engine, next, hop))
                .with_debug_name("ring_hop"),
        )?;
        Ok(())
    }

    fn deliver(&self, engine: &mut SimulationEngine, node: u32, hop: u64) -> HandlerResult {
        let now = engine.now();
        trace!(node, hop, %now, "token received");
        self.with_report(node, |r| {
            r.hops_received += 1;
            r.last_hop_ns = Some(now.as_nanos());
        });
        if hop < self.hops {
            self.forward(engine, node, hop + 1)?;
        }
        Ok(())
    }

    fn reports(&self) -> Vec<NodeReport> {
        self.reports.lock().clone()
    }
}

// ============================================================================
// Runs
// ============================================================================

/// Run the ring workload described by `config`.
pub fn run_simulation(config: &SimulationConfig) -> Result<RunReport, RunnerError> {
    config.validate()?;
    info!(
        nodes = config.distributed.ranks,
        hops = config.workload.hops,
        seed = config.workload.seed,
        distributed = config.distributed.enabled,
        realtime = config.realtime.enabled,
        "starting simulation"
    );
    let report = if config.distributed.enabled {
        run_distributed(config)?
    } else if config.realtime.enabled {
        run_realtime(config)?
    } else {
        run_single(config)?
    };
    info!(
        events_fired = report.events_fired,
        hops_delivered = report.hops_delivered,
        wall_time_ms = report.wall_time_ms,
        "simulation complete"
    );
    Ok(report)
}

fn single_engine(config: &SimulationConfig) -> Result<(SimulationEngine, Ring), SimError> {
    let nodes = config.distributed.ranks.max(1);
    let ring = Ring::new(nodes, &config.workload, false);
    let mut engine = SimulationEngine::with_scheduler(config.engine.scheduler);
    for node in 0..nodes {
        ring.populate(&mut engine, node, &config.workload)?;
    }
    Ok((engine, ring))
}

fn run_single(config: &SimulationConfig) -> Result<RunReport, RunnerError> {
    let (mut engine, ring) = single_engine(config)?;
    let run = match config.engine.stop_at {
        Some(limit) => engine.run_until(limit)?,
        None => engine.run()?,
    };
    Ok(RunReport::new(RunMode::Single, config, ring.reports()).with_run(&run))
}

fn run_realtime(config: &SimulationConfig) -> Result<RunReport, RunnerError> {
    let (mut engine, ring) = single_engine(config)?;
    if let Some(limit) = config.engine.stop_at {
        engine.stop_after(limit)?;
    }
    let driver = RealtimeDriver::new(config.to_realtime_config());
    let stats = driver.run(&mut engine)?;
    let mut report = RunReport::new(RunMode::Realtime, config, ring.reports()).with_run(&stats.run);
    report.lag_warnings = Some(stats.lag_warnings);
    report.max_lag_ms = Some(stats.max_lag_ms);
    Ok(report)
}

fn run_distributed(config: &SimulationConfig) -> Result<RunReport, RunnerError> {
    if config.distributed.transport == TransportKind::None {
        return Err(ConfigError::MissingTransport.into());
    }
    let nodes = config.distributed.ranks.max(1);
    let ring = Ring::new(nodes, &config.workload, true);
    let mut sync_config = config.to_sync_config();
    if sync_config.end_time.is_none() {
        sync_config.end_time = config.engine.stop_at;
    }

    let transports =
        LocalCluster::with_barrier_timeout(nodes as usize, config.distributed.barrier_timeout);
    let mut handles = Vec::with_capacity(transports.len());
    for (node, transport) in (0u32..).zip(transports) {
        let ring = ring.clone();
        let sync_config = sync_config.clone();
        let workload = config.workload.clone();
        let scheduler = config.engine.scheduler;
        let handle = thread::Builder::new()
            .name(format!("desim-rank-{node}"))
            .spawn(move || {
                let mut engine = SimulationEngine::with_scheduler(scheduler);
                if let Err(err) = ring.populate(&mut engine, node, &workload) {
                    return (Err(SyncError::from(err)), None);
                }
                let handler_ring = ring.clone();
                let built = DistributedSynchronizer::builder(sync_config)
                    .transport(transport)
                    .on_remote_event(move |engine, event| {
                        let hop = decode_hop(event.payload, engine.current_context())?;
                        handler_ring.deliver(engine, node, hop)
                    })
                    .build();
                match built {
                    Ok(mut sync) => {
                        let result = sync.run(&mut engine);
                        // The synchronizer owns this rank's transport; keep it
                        // until every rank has finished.
                        (result, Some(sync))
                    }
                    Err(err) => (Err(err), None),
                }
            })?;
        handles.push(handle);
    }

    let mut results = Vec::with_capacity(handles.len());
    let mut synchronizers = Vec::with_capacity(handles.len());
    for (node, handle) in (0u32..).zip(handles) {
        let (result, sync) = handle.join().map_err(|_| RunnerError::RankPanicked(node))?;
        results.push(result);
        synchronizers.push(sync);
    }
    drop(synchronizers);

    let mut stats = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(rank_stats) => stats.push(rank_stats),
            Err(err) => errors.push(err),
        }
    }
    if let Some(err) = root_cause(errors) {
        warn!(error = %err, "distributed run failed");
        return Err(err.into());
    }

    let mut report = RunReport::new(RunMode::Distributed, config, ring.reports());
    report.algorithm = Some(sync_config.algorithm);
    report.events_fired = stats.iter().map(|s| s.run.events_fired).sum();
    report.final_time_ns = stats.iter().map(|s| s.run.final_time_ns).max().unwrap_or(0);
    report.wall_time_ms = stats.iter().map(|s| s.run.wall_time_ms).max().unwrap_or(0);
    debug!(ranks = stats.len(), "collected rank statistics");
    report.ranks = stats;
    Ok(report)
}

/// Pick the error that started a failed run over the ones it caused on
/// other ranks.
fn root_cause(errors: Vec<SyncError>) -> Option<SyncError> {
    let is_secondary = |err: &SyncError| {
        matches!(
            err,
            SyncError::PeerAborted(_)
                | SyncError::Transport(
                    TransportError::Disconnected(_)
                        | TransportError::Timeout(_)
                        | TransportError::Barrier(_)
                )
        )
    };
    let mut fallback = None;
    for err in errors {
        if !is_secondary(&err) {
            return Some(err);
        }
        fallback.get_or_insert(err);
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use desim_model::load_config_from_str;
    use desim_sync::BarrierTimeout;
    use std::time::Duration;

    fn config(yaml: &str) -> SimulationConfig {
        load_config_from_str(yaml).unwrap()
    }

    #[test]
    fn test_single_ring() {
        let report = run_simulation(&config(
            "distributed:\n  ranks: 3\nworkload:\n  hops: 7\n  hop_delay: 2ms\n",
        ))
        .unwrap();
        assert_eq!(report.mode, RunMode::Single);
        assert_eq!(report.hops_delivered, 7);
        assert_eq!(report.last_hop_ns, Some(VirtualTime::from_millis(14).as_nanos()));
        // Hop n lands on node n % 3.
        let received: Vec<u64> = report.nodes.iter().map(|n| n.hops_received).collect();
        assert_eq!(received, vec![2, 3, 2]);
        // Start event plus one event per hop.
        assert_eq!(report.events_fired, 8);
    }

    #[test]
    fn test_ticks_are_seeded() {
        let yaml = "workload:\n  hops: 3\n  ticks: 20\n  seed: 11\n";
        let a = run_simulation(&config(yaml)).unwrap();
        let b = run_simulation(&config(yaml)).unwrap();
        assert_eq!(a.nodes, b.nodes);
        assert_eq!(a.final_time_ns, b.final_time_ns);
        assert!(a.nodes.iter().all(|n| n.ticks_fired == 20));
    }

    #[test]
    fn test_stop_at_bounds_single_run() {
        let report = run_simulation(&config(
            "engine:\n  stop_at: 10ms\nworkload:\n  hops: 100\n  hop_delay: 3ms\n",
        ))
        .unwrap();
        assert_eq!(report.hops_delivered, 3);
        assert_eq!(report.final_time_ns, VirtualTime::from_millis(9).as_nanos());
    }

    #[test]
    fn test_distributed_matches_single() {
        let ring = |algorithm: &str, enabled: bool| {
            config(&format!(
                "distributed:\n  enabled: {enabled}\n  ranks: 3\n  algorithm: {algorithm}\n  \
                 lookahead: 2ms\n  end_time: 1s\n  recv_timeout: 20s\n\
                 workload:\n  hops: 30\n  ticks: 10\n  seed: 5\n"
            ))
        };
        for algorithm in ["conservative", "null_message"] {
            let single = run_simulation(&ring(algorithm, false)).unwrap();
            let distributed = run_simulation(&ring(algorithm, true)).unwrap();
            assert_eq!(distributed.mode, RunMode::Distributed);
            assert_eq!(distributed.ranks.len(), 3);
            assert_eq!(distributed.nodes, single.nodes, "{algorithm}");
            assert_eq!(distributed.last_hop_ns, single.last_hop_ns);
            assert_eq!(distributed.events_fired, single.events_fired);
        }
    }

    #[test]
    fn test_lookahead_violation_reported_from_its_rank() {
        let err = run_simulation(&config(
            "distributed:\n  enabled: true\n  ranks: 2\n  lookahead: 5ms\n  recv_timeout: 20s\n\
             workload:\n  hops: 4\n  hop_delay: 1ms\n",
        ))
        .unwrap_err();
        match err {
            RunnerError::Sync(err) => assert!(err.is_causality_error(), "{err}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_single_node_distributed_ring_stays_local() {
        let report = run_simulation(&config(
            "distributed:\n  enabled: true\n  ranks: 1\nworkload:\n  hops: 5\n",
        ))
        .unwrap();
        assert_eq!(report.hops_delivered, 5);
        assert_eq!(report.ranks[0].events_sent, 0);
    }

    #[test]
    fn test_decode_hop_rejects_short_payload() {
        let err = decode_hop(Bytes::from_static(&[1, 2]), ContextId::new(4)).unwrap_err();
        assert!(matches!(err, SimError::Handler { context, .. } if context == ContextId::new(4)));
        assert_eq!(decode_hop(encode_hop(9), ContextId::NONE).unwrap(), 9);
    }

    #[test]
    fn test_root_cause_prefers_originating_error() {
        let picked = root_cause(vec![
            SyncError::PeerAborted(Rank::new(1)),
            SyncError::MissingEndTime,
        ]);
        assert!(matches!(picked, Some(SyncError::MissingEndTime)));
        assert!(root_cause(Vec::new()).is_none());
    }

    #[test]
    fn test_root_cause_skips_waiting_ranks() {
        let picked = root_cause(vec![
            SyncError::Transport(TransportError::Barrier(BarrierTimeout {
                arrived: 1,
                parties: 2,
            })),
            SyncError::Transport(TransportError::Timeout(Duration::from_secs(1))),
            SyncError::Engine(SimError::handler(ContextId::new(1), "boom")),
        ]);
        assert!(matches!(picked, Some(SyncError::Engine(SimError::Handler { .. }))));
    }
}
