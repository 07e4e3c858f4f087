//! # desim-model
//!
//! Run configuration for desim, loaded from one or more YAML documents.
//!
//! Documents are applied in order on top of built-in defaults. A later document
//! only overrides the fields it names, so a base file can be refined by small
//! overlays:
//!
//! ```yaml
//! engine:
//!   scheduler: heap
//!   stop_at: 10s
//! distributed:
//!   enabled: true
//!   ranks: 3
//!   algorithm: null_message
//!   lookahead: 2ms
//!   end_time: 1s
//! workload:
//!   hops: 40
//!   hop_delay: 3ms
//! ```
//!
//! Times are either integers (nanoseconds) or strings with units
//! (`250us`, `5ms`, `1h30m`), see [`desim_common::parse_time`].
//! Validation runs once, on the merged result.

use desim_common::{parse_time, ParseTimeError, Rank, VirtualTime};
use desim_distributed::{SyncAlgorithm, SyncConfig};
use desim_engine::{RealtimeConfig, SchedulerKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A time field could not be parsed.
    #[error("Invalid time for '{field}': {source}")]
    InvalidTime {
        /// Dotted path of the field.
        field: &'static str,
        /// Parser error.
        source: ParseTimeError,
    },

    /// Distributed mode without a transport to run it over.
    #[error("Distributed mode is enabled but transport is 'none'")]
    MissingTransport,

    /// A lookahead of zero or less.
    #[error("Lookahead must be positive, got {0}")]
    ZeroLookahead(VirtualTime),
}

// ============================================================================
// Resolved Configuration
// ============================================================================

/// Fully merged run configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationConfig {
    pub engine: EngineSection,
    pub realtime: RealtimeSection,
    pub distributed: DistributedSection,
    pub workload: WorkloadSection,
}

/// Engine settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSection {
    pub scheduler: SchedulerKind,
    /// Virtual time at which the run is stopped, if any.
    pub stop_at: Option<VirtualTime>,
}

/// Wall-clock pacing. Only used by single-engine runs.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeSection {
    pub enabled: bool,
    pub speed_multiplier: f64,
    pub lag_warning: Duration,
    pub hard_limit: Option<Duration>,
    pub exit_when_idle: bool,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        let defaults = RealtimeConfig::default();
        RealtimeSection {
            enabled: false,
            speed_multiplier: defaults.speed_multiplier,
            lag_warning: defaults.lag_warning,
            hard_limit: defaults.hard_limit,
            exit_when_idle: defaults.exit_when_idle,
        }
    }
}

/// How ranks talk to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    None,
    /// Threads in this process, see `desim_distributed::LocalCluster`.
    #[default]
    Local,
}

/// Multi-rank settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedSection {
    pub enabled: bool,
    pub ranks: u32,
    pub transport: TransportKind,
    pub algorithm: SyncAlgorithm,
    pub lookahead: VirtualTime,
    pub lookahead_overrides: BTreeMap<u32, VirtualTime>,
    pub end_time: Option<VirtualTime>,
    pub recv_timeout: Duration,
    pub barrier_timeout: Option<Duration>,
}

impl Default for DistributedSection {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        DistributedSection {
            enabled: false,
            ranks: 2,
            transport: TransportKind::Local,
            algorithm: defaults.algorithm,
            lookahead: defaults.lookahead,
            lookahead_overrides: BTreeMap::new(),
            end_time: defaults.end_time,
            recv_timeout: defaults.recv_timeout,
            barrier_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Ping-ring demo workload.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSection {
    /// Seed for per-rank tick jitter.
    pub seed: u64,
    /// Number of times the token is passed on.
    pub hops: u32,
    /// Delay between receiving the token and it arriving at the next node.
    pub hop_delay: VirtualTime,
    /// Mean interval of local background ticks.
    pub tick_interval: VirtualTime,
    /// Background ticks per node.
    pub ticks: u32,
}

impl Default for WorkloadSection {
    fn default() -> Self {
        WorkloadSection {
            seed: 0,
            hops: 40,
            hop_delay: VirtualTime::from_millis(3),
            tick_interval: VirtualTime::from_millis(10),
            ticks: 0,
        }
    }
}

impl SimulationConfig {
    /// Check the merged configuration for invalid combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(stop_at) = self.engine.stop_at {
            if stop_at.is_negative() {
                return Err(ConfigError::InvalidConfig(format!(
                    "engine.stop_at must not be negative, got {stop_at}"
                )));
            }
        }

        let rt = &self.realtime;
        if !(rt.speed_multiplier.is_finite() && rt.speed_multiplier > 0.0) {
            return Err(ConfigError::InvalidConfig(format!(
                "realtime.speed_multiplier must be positive, got {}",
                rt.speed_multiplier
            )));
        }

        let dist = &self.distributed;
        if dist.enabled {
            if dist.transport == TransportKind::None {
                return Err(ConfigError::MissingTransport);
            }
            if dist.ranks == 0 {
                return Err(ConfigError::InvalidConfig(
                    "distributed.ranks must be at least 1".to_string(),
                ));
            }
            if rt.enabled {
                return Err(ConfigError::InvalidConfig(
                    "realtime pacing cannot be combined with distributed mode".to_string(),
                ));
            }
            if dist.lookahead <= VirtualTime::ZERO {
                return Err(ConfigError::ZeroLookahead(dist.lookahead));
            }
            for (rank, lookahead) in &dist.lookahead_overrides {
                if *rank >= dist.ranks {
                    return Err(ConfigError::InvalidConfig(format!(
                        "lookahead override for rank {rank}, but only {} ranks are configured",
                        dist.ranks
                    )));
                }
                if *lookahead <= VirtualTime::ZERO {
                    return Err(ConfigError::ZeroLookahead(*lookahead));
                }
            }
            if dist.algorithm == SyncAlgorithm::NullMessage && dist.end_time.is_none() {
                return Err(ConfigError::InvalidConfig(
                    "the null_message algorithm requires distributed.end_time".to_string(),
                ));
            }
        }

        let work = &self.workload;
        if work.hop_delay <= VirtualTime::ZERO {
            return Err(ConfigError::InvalidConfig(format!(
                "workload.hop_delay must be positive, got {}",
                work.hop_delay
            )));
        }
        if work.ticks > 0 && work.tick_interval <= VirtualTime::ZERO {
            return Err(ConfigError::InvalidConfig(format!(
                "workload.tick_interval must be positive, got {}",
                work.tick_interval
            )));
        }
        Ok(())
    }

    /// Synchronizer settings for a distributed run.
    pub fn to_sync_config(&self) -> SyncConfig {
        let dist = &self.distributed;
        SyncConfig {
            algorithm: dist.algorithm,
            lookahead: dist.lookahead,
            lookahead_overrides: dist
                .lookahead_overrides
                .iter()
                .map(|(rank, lookahead)| (Rank::new(*rank), *lookahead))
                .collect(),
            end_time: dist.end_time,
            recv_timeout: dist.recv_timeout,
        }
    }

    /// Pacing settings for a real-time run.
    pub fn to_realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            speed_multiplier: self.realtime.speed_multiplier,
            lag_warning: self.realtime.lag_warning,
            hard_limit: self.realtime.hard_limit,
            exit_when_idle: self.realtime.exit_when_idle,
        }
    }

    /// Render the configuration as a YAML document that loads back to `self`.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(&ConfigYaml::from(self))?)
    }

    fn apply(&mut self, layer: ConfigYaml) -> Result<(), ConfigError> {
        if let Some(engine) = layer.engine {
            set(&mut self.engine.scheduler, engine.scheduler);
            if let Some(t) = engine.stop_at {
                self.engine.stop_at = Some(t.resolve("engine.stop_at")?);
            }
        }

        if let Some(rt) = layer.realtime {
            set(&mut self.realtime.enabled, rt.enabled);
            set(&mut self.realtime.speed_multiplier, rt.speed_multiplier);
            set(&mut self.realtime.exit_when_idle, rt.exit_when_idle);
            if let Some(t) = rt.lag_warning {
                self.realtime.lag_warning = t.resolve_wall("realtime.lag_warning")?;
            }
            if let Some(t) = rt.hard_limit {
                self.realtime.hard_limit = Some(t.resolve_wall("realtime.hard_limit")?);
            }
        }

        if let Some(dist) = layer.distributed {
            set(&mut self.distributed.enabled, dist.enabled);
            set(&mut self.distributed.ranks, dist.ranks);
            set(&mut self.distributed.transport, dist.transport);
            set(&mut self.distributed.algorithm, dist.algorithm);
            if let Some(t) = dist.lookahead {
                self.distributed.lookahead = t.resolve("distributed.lookahead")?;
            }
            for (rank, t) in dist.lookahead_overrides {
                let lookahead = t.resolve("distributed.lookahead_overrides")?;
                self.distributed.lookahead_overrides.insert(rank, lookahead);
            }
            if let Some(t) = dist.end_time {
                self.distributed.end_time = Some(t.resolve("distributed.end_time")?);
            }
            if let Some(t) = dist.recv_timeout {
                self.distributed.recv_timeout = t.resolve_wall("distributed.recv_timeout")?;
            }
            if let Some(t) = dist.barrier_timeout {
                self.distributed.barrier_timeout =
                    Some(t.resolve_wall("distributed.barrier_timeout")?);
            }
        }

        if let Some(work) = layer.workload {
            set(&mut self.workload.seed, work.seed);
            set(&mut self.workload.hops, work.hops);
            set(&mut self.workload.ticks, work.ticks);
            if let Some(t) = work.hop_delay {
                self.workload.hop_delay = t.resolve("workload.hop_delay")?;
            }
            if let Some(t) = work.tick_interval {
                self.workload.tick_interval = t.resolve("workload.tick_interval")?;
            }
        }
        Ok(())
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

// ============================================================================
// YAML Schema
// ============================================================================

/// A time field: integer nanoseconds or a string with units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum TimeYaml {
    Nanos(i64),
    Text(String),
}

impl TimeYaml {
    fn resolve(&self, field: &'static str) -> Result<VirtualTime, ConfigError> {
        match self {
            TimeYaml::Nanos(ns) => Ok(VirtualTime::from_nanos(*ns)),
            TimeYaml::Text(text) => {
                parse_time(text).map_err(|source| ConfigError::InvalidTime { field, source })
            }
        }
    }

    fn resolve_wall(&self, field: &'static str) -> Result<Duration, ConfigError> {
        let t = self.resolve(field)?;
        if t.is_negative() {
            return Err(ConfigError::InvalidConfig(format!(
                "{field} must not be negative, got {t}"
            )));
        }
        Ok(Duration::from_nanos(t.as_nanos() as u64))
    }

    fn from_time(t: VirtualTime) -> Self {
        TimeYaml::Text(format_time(t))
    }

    fn from_wall(d: Duration) -> Self {
        let nanos = i64::try_from(d.as_nanos()).unwrap_or(i64::MAX);
        TimeYaml::from_time(VirtualTime::from_nanos(nanos))
    }
}

/// Shortest exact unit form, e.g. `3ms` or `1500us`.
fn format_time(t: VirtualTime) -> String {
    const UNITS: [(i64, &str); 4] = [
        (1_000_000_000, "s"),
        (1_000_000, "ms"),
        (1_000, "us"),
        (1, "ns"),
    ];
    let nanos = t.as_nanos();
    if nanos == 0 {
        return "0ns".to_string();
    }
    for (scale, unit) in UNITS {
        if nanos % scale == 0 {
            return format!("{}{unit}", nanos / scale);
        }
    }
    format!("{nanos}ns")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigYaml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    engine: Option<EngineYaml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    realtime: Option<RealtimeYaml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    distributed: Option<DistributedYaml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workload: Option<WorkloadYaml>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct EngineYaml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scheduler: Option<SchedulerKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop_at: Option<TimeYaml>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RealtimeYaml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    speed_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lag_warning: Option<TimeYaml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hard_limit: Option<TimeYaml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exit_when_idle: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DistributedYaml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ranks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transport: Option<TransportKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    algorithm: Option<SyncAlgorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lookahead: Option<TimeYaml>,
    /// Merged per rank across documents.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    lookahead_overrides: BTreeMap<u32, TimeYaml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time: Option<TimeYaml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recv_timeout: Option<TimeYaml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    barrier_timeout: Option<TimeYaml>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkloadYaml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hops: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hop_delay: Option<TimeYaml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tick_interval: Option<TimeYaml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ticks: Option<u32>,
}

impl From<&SimulationConfig> for ConfigYaml {
    fn from(config: &SimulationConfig) -> Self {
        let engine = &config.engine;
        let rt = &config.realtime;
        let dist = &config.distributed;
        let work = &config.workload;
        ConfigYaml {
            engine: Some(EngineYaml {
                scheduler: Some(engine.scheduler),
                stop_at: engine.stop_at.map(TimeYaml::from_time),
            }),
            realtime: Some(RealtimeYaml {
                enabled: Some(rt.enabled),
                speed_multiplier: Some(rt.speed_multiplier),
                lag_warning: Some(TimeYaml::from_wall(rt.lag_warning)),
                hard_limit: rt.hard_limit.map(TimeYaml::from_wall),
                exit_when_idle: Some(rt.exit_when_idle),
            }),
            distributed: Some(DistributedYaml {
                enabled: Some(dist.enabled),
                ranks: Some(dist.ranks),
                transport: Some(dist.transport),
                algorithm: Some(dist.algorithm),
                lookahead: Some(TimeYaml::from_time(dist.lookahead)),
                lookahead_overrides: dist
                    .lookahead_overrides
                    .iter()
                    .map(|(rank, t)| (*rank, TimeYaml::from_time(*t)))
                    .collect(),
                end_time: dist.end_time.map(TimeYaml::from_time),
                recv_timeout: Some(TimeYaml::from_wall(dist.recv_timeout)),
                barrier_timeout: dist.barrier_timeout.map(TimeYaml::from_wall),
            }),
            workload: Some(WorkloadYaml {
                seed: Some(work.seed),
                hops: Some(work.hops),
                hop_delay: Some(TimeYaml::from_time(work.hop_delay)),
                tick_interval: Some(TimeYaml::from_time(work.tick_interval)),
                ticks: Some(work.ticks),
            }),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Load a configuration from a file.
pub fn load_config(path: &Path) -> Result<SimulationConfig, ConfigError> {
    load_configs(&[path])
}

/// Parse a configuration from a YAML string.
pub fn load_config_from_str(yaml_str: &str) -> Result<SimulationConfig, ConfigError> {
    load_configs_from_str(&[yaml_str])
}

/// Load and merge configuration files. Later files override earlier ones.
pub fn load_configs(paths: &[&Path]) -> Result<SimulationConfig, ConfigError> {
    if paths.is_empty() {
        return Err(ConfigError::InvalidConfig(
            "No configuration files provided".to_string(),
        ));
    }

    let yaml_strings = paths
        .iter()
        .map(std::fs::read_to_string)
        .collect::<Result<Vec<String>, std::io::Error>>()?;
    let yaml_strs: Vec<&str> = yaml_strings.iter().map(|s| s.as_str()).collect();

    load_configs_from_str(&yaml_strs)
}

/// Merge YAML documents over the built-in defaults, in order.
///
/// Validation is performed only on the final merged configuration, so an
/// overlay may complete settings an earlier document left inconsistent.
pub fn load_configs_from_str(yaml_strs: &[&str]) -> Result<SimulationConfig, ConfigError> {
    if yaml_strs.is_empty() {
        return Err(ConfigError::InvalidConfig(
            "No configuration strings provided".to_string(),
        ));
    }

    let mut config = SimulationConfig::default();
    for yaml_str in yaml_strs {
        // An empty file is a valid no-op overlay.
        if yaml_str.trim().is_empty() {
            continue;
        }
        let layer: ConfigYaml = serde_yaml::from_str(yaml_str)?;
        config.apply(layer)?;
    }
    config.validate()?;

    debug!(
        documents = yaml_strs.len(),
        distributed = config.distributed.enabled,
        realtime = config.realtime.enabled,
        "configuration loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config, SimulationConfig::default());
        assert_eq!(config.engine.scheduler, SchedulerKind::Heap);
        assert!(!config.distributed.enabled);
        assert_eq!(config.workload.hop_delay, VirtualTime::from_millis(3));
    }

    #[test]
    fn test_time_formats() {
        let config = load_config_from_str(
            r#"
engine:
  stop_at: 1500000
workload:
  hop_delay: 250us
  tick_interval: "1s500ms"
"#,
        )
        .unwrap();
        assert_eq!(config.engine.stop_at, Some(VirtualTime::from_nanos(1_500_000)));
        assert_eq!(config.workload.hop_delay, VirtualTime::from_micros(250));
        assert_eq!(config.workload.tick_interval, VirtualTime::from_millis(1500));
    }

    #[test]
    fn test_invalid_time_names_field() {
        let err = load_config_from_str("workload:\n  hop_delay: 3 parsecs\n").unwrap_err();
        match err {
            ConfigError::InvalidTime { field, .. } => assert_eq!(field, "workload.hop_delay"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_later_documents_override() {
        let base = r#"
distributed:
  enabled: true
  ranks: 3
  lookahead: 2ms
  lookahead_overrides:
    1: 5ms
workload:
  hops: 10
"#;
        let overlay = r#"
distributed:
  algorithm: null_message
  end_time: 1s
  lookahead_overrides:
    2: 4ms
workload:
  seed: 7
"#;
        let config = load_configs_from_str(&[base, overlay]).unwrap();
        assert_eq!(config.distributed.ranks, 3);
        assert_eq!(config.distributed.algorithm, SyncAlgorithm::NullMessage);
        assert_eq!(config.distributed.lookahead, VirtualTime::from_millis(2));
        assert_eq!(config.distributed.lookahead_overrides.len(), 2);
        assert_eq!(config.workload.hops, 10);
        assert_eq!(config.workload.seed, 7);

        let sync = config.to_sync_config();
        assert_eq!(sync.lookahead_to(Rank::new(1)), VirtualTime::from_millis(5));
        assert_eq!(sync.lookahead_to(Rank::new(2)), VirtualTime::from_millis(4));
        assert_eq!(sync.lookahead_to(Rank::new(0)), VirtualTime::from_millis(2));
        assert_eq!(sync.end_time, Some(VirtualTime::from_secs(1)));
        assert!(sync.validate(3).is_ok());
    }

    #[test]
    fn test_validation_only_on_merged_result() {
        // The first document alone is invalid; the overlay fixes it.
        let base = "distributed:\n  enabled: true\n  algorithm: null_message\n";
        assert!(load_config_from_str(base).is_err());
        let config = load_configs_from_str(&[base, "distributed:\n  end_time: 2s\n"]).unwrap();
        assert_eq!(config.distributed.end_time, Some(VirtualTime::from_secs(2)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = load_config_from_str("engine:\n  schedular: heap\n").unwrap_err();
        assert!(matches!(err, ConfigError::YamlError(_)));
        let err = load_config_from_str("network:\n  nodes: 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::YamlError(_)));
    }

    #[test]
    fn test_missing_transport() {
        let err =
            load_config_from_str("distributed:\n  enabled: true\n  transport: none\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingTransport));

        // Irrelevant while distributed mode is off.
        assert!(load_config_from_str("distributed:\n  transport: none\n").is_ok());
    }

    #[test]
    fn test_zero_lookahead() {
        let err =
            load_config_from_str("distributed:\n  enabled: true\n  lookahead: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ZeroLookahead(t) if t == VirtualTime::ZERO));

        let err = load_config_from_str(
            "distributed:\n  enabled: true\n  lookahead_overrides:\n    1: -1ms\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroLookahead(_)));
    }

    #[test]
    fn test_invalid_combinations() {
        for yaml in [
            "distributed:\n  enabled: true\n  ranks: 0\n",
            "distributed:\n  enabled: true\n  lookahead_overrides:\n    5: 1ms\n",
            "distributed:\n  enabled: true\nrealtime:\n  enabled: true\n",
            "realtime:\n  speed_multiplier: 0.0\n",
            "realtime:\n  lag_warning: -5ms\n",
            "workload:\n  hop_delay: 0\n",
            "engine:\n  stop_at: -1s\n",
        ] {
            let err = load_config_from_str(yaml).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidConfig(_)),
                "{yaml:?} gave {err}"
            );
        }
    }

    #[test]
    fn test_realtime_conversion() {
        let config = load_config_from_str(
            "realtime:\n  enabled: true\n  speed_multiplier: 10.0\n  hard_limit: 2s\n",
        )
        .unwrap();
        let rt = config.to_realtime_config();
        assert_eq!(rt.speed_multiplier, 10.0);
        assert_eq!(rt.hard_limit, Some(Duration::from_secs(2)));
        assert_eq!(rt.lag_warning, RealtimeConfig::default().lag_warning);
    }

    #[test]
    fn test_yaml_output_loads_back() {
        let config = load_config_from_str(
            r#"
engine:
  scheduler: map
  stop_at: 750us
distributed:
  enabled: true
  ranks: 4
  algorithm: null_message
  lookahead: 1500ns
  lookahead_overrides:
    3: 2ms
  end_time: 1s
"#,
        )
        .unwrap();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("750us"));
        assert_eq!(load_config_from_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_yaml_output_keeps_large_times_exact() {
        let config = load_config_from_str(
            "distributed:\n  end_time: 9007199254740993\nengine:\n  stop_at: 9007199254740993ns\n",
        )
        .unwrap();
        let exact = VirtualTime::from_nanos(9_007_199_254_740_993);
        assert_eq!(config.distributed.end_time, Some(exact));
        assert_eq!(config.engine.stop_at, Some(exact));

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("9007199254740993ns"), "{yaml}");
        let reloaded = load_config_from_str(&yaml).unwrap();
        assert_eq!(reloaded.distributed.end_time, Some(exact));
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(VirtualTime::ZERO), "0ns");
        assert_eq!(format_time(VirtualTime::from_secs(2)), "2s");
        assert_eq!(format_time(VirtualTime::from_micros(1500)), "1500us");
        assert_eq!(format_time(VirtualTime::from_nanos(-3_000_000)), "-3ms");
    }

    #[test]
    fn test_load_configs_from_files() {
        let mut base = tempfile::NamedTempFile::new().unwrap();
        writeln!(base, "workload:\n  hops: 12\n  ticks: 3").unwrap();
        let mut overlay = tempfile::NamedTempFile::new().unwrap();
        writeln!(overlay, "workload:\n  hops: 20").unwrap();

        let config = load_configs(&[base.path(), overlay.path()]).unwrap();
        assert_eq!(config.workload.hops, 20);
        assert_eq!(config.workload.ticks, 3);

        assert!(matches!(
            load_config(Path::new("/nonexistent/desim.yaml")),
            Err(ConfigError::IoError(_))
        ));
        assert!(matches!(
            load_configs(&[]),
            Err(ConfigError::InvalidConfig(_))
        ));
    }
}
