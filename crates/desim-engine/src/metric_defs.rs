//! Metric names, kinds and descriptions emitted by the kernel.
//!
//! Emission sites refer to `metric_defs::X.name` so the names live in one
//! place; [`describe_metrics`] registers the descriptions with whatever
//! recorder is installed.

use metrics::Unit;
use std::fmt;

/// Kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        })
    }
}

/// Static description of one metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub kind: MetricKind,
    pub unit: Option<Unit>,
    pub description: &'static str,
    /// Labels attached at emission sites.
    pub labels: &'static [&'static str],
}

impl MetricDef {
    /// Unit as a display string, empty when unitless.
    pub fn unit_str(&self) -> &'static str {
        self.unit.map(|u| u.as_str()).unwrap_or("")
    }
}

// Engine

pub const EVENTS_SCHEDULED: MetricDef = MetricDef {
    name: "desim.engine.events_scheduled",
    kind: MetricKind::Counter,
    unit: Some(Unit::Count),
    description: "Events inserted into the scheduler",
    labels: &[],
};

pub const EVENTS_FIRED: MetricDef = MetricDef {
    name: "desim.engine.events_fired",
    kind: MetricKind::Counter,
    unit: Some(Unit::Count),
    description: "Event handlers invoked",
    labels: &[],
};

pub const EVENTS_CANCELLED: MetricDef = MetricDef {
    name: "desim.engine.events_cancelled",
    kind: MetricKind::Counter,
    unit: Some(Unit::Count),
    description: "Pending events cancelled or removed before firing",
    labels: &["mode"],
};

pub const DESTROY_EVENTS: MetricDef = MetricDef {
    name: "desim.engine.destroy_events",
    kind: MetricKind::Counter,
    unit: Some(Unit::Count),
    description: "Destroy-list callbacks run at teardown",
    labels: &[],
};

pub const QUEUE_DEPTH: MetricDef = MetricDef {
    name: "desim.engine.queue_depth",
    kind: MetricKind::Gauge,
    unit: Some(Unit::Count),
    description: "Records held by the scheduler, inert ones included",
    labels: &[],
};

pub const RUN_WALL_TIME: MetricDef = MetricDef {
    name: "desim.engine.run_wall_time",
    kind: MetricKind::Histogram,
    unit: Some(Unit::Milliseconds),
    description: "Wall-clock duration of a run",
    labels: &[],
};

// Real-time pacing

pub const REALTIME_LAG: MetricDef = MetricDef {
    name: "desim.realtime.lag",
    kind: MetricKind::Histogram,
    unit: Some(Unit::Milliseconds),
    description: "How far behind the wall clock an event fired",
    labels: &[],
};

// Distributed synchronization

pub const SYNC_EVENTS_SENT: MetricDef = MetricDef {
    name: "desim.sync.events_sent",
    kind: MetricKind::Counter,
    unit: Some(Unit::Count),
    description: "Cross-rank events sent",
    labels: &["rank"],
};

pub const SYNC_EVENTS_RECEIVED: MetricDef = MetricDef {
    name: "desim.sync.events_received",
    kind: MetricKind::Counter,
    unit: Some(Unit::Count),
    description: "Cross-rank events received and scheduled",
    labels: &["rank"],
};

pub const SYNC_NULL_MESSAGES: MetricDef = MetricDef {
    name: "desim.sync.null_messages",
    kind: MetricKind::Counter,
    unit: Some(Unit::Count),
    description: "Null messages sent to advance peer bounds",
    labels: &["rank"],
};

pub const SYNC_ROUNDS: MetricDef = MetricDef {
    name: "desim.sync.rounds",
    kind: MetricKind::Counter,
    unit: Some(Unit::Count),
    description: "Conservative grant rounds completed",
    labels: &["rank"],
};

pub const SYNC_BLOCKED: MetricDef = MetricDef {
    name: "desim.sync.blocked",
    kind: MetricKind::Counter,
    unit: Some(Unit::Count),
    description: "Times a rank blocked waiting for peers",
    labels: &["rank"],
};

/// Every metric the kernel can emit.
pub const ALL: &[MetricDef] = &[
    EVENTS_SCHEDULED,
    EVENTS_FIRED,
    EVENTS_CANCELLED,
    DESTROY_EVENTS,
    QUEUE_DEPTH,
    RUN_WALL_TIME,
    REALTIME_LAG,
    SYNC_EVENTS_SENT,
    SYNC_EVENTS_RECEIVED,
    SYNC_NULL_MESSAGES,
    SYNC_ROUNDS,
    SYNC_BLOCKED,
];

/// Register descriptions for all metrics with the installed recorder.
pub fn describe_metrics() {
    for def in ALL {
        match (def.kind, def.unit) {
            (MetricKind::Counter, Some(unit)) => {
                metrics::describe_counter!(def.name, unit, def.description)
            }
            (MetricKind::Counter, None) => metrics::describe_counter!(def.name, def.description),
            (MetricKind::Gauge, Some(unit)) => {
                metrics::describe_gauge!(def.name, unit, def.description)
            }
            (MetricKind::Gauge, None) => metrics::describe_gauge!(def.name, def.description),
            (MetricKind::Histogram, Some(unit)) => {
                metrics::describe_histogram!(def.name, unit, def.description)
            }
            (MetricKind::Histogram, None) => {
                metrics::describe_histogram!(def.name, def.description)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_are_unique_and_prefixed() {
        let mut seen = HashSet::new();
        for def in ALL {
            assert!(def.name.starts_with("desim."), "{}", def.name);
            assert!(seen.insert(def.name), "duplicate {}", def.name);
            assert!(!def.description.is_empty());
        }
    }

    #[test]
    fn test_unit_str() {
        assert_eq!(RUN_WALL_TIME.unit_str(), "milliseconds");
        assert_eq!(MetricKind::Histogram.to_string(), "histogram");
    }

    #[test]
    fn test_describe_without_recorder_is_harmless() {
        describe_metrics();
    }
}
