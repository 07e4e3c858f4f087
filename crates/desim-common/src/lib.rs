//! # desim-common
//!
//! Common types for the desim discrete-event simulation kernel.
//!
//! This crate provides the leaf primitives every other desim crate builds on:
//! - Virtual time ([`VirtualTime`]) and its text form ([`parse_time`])
//! - Event identification ([`EventId`], [`EventKey`], [`EventHandle`])
//! - Execution contexts and ranks ([`ContextId`], [`Rank`])
//! - The kernel error taxonomy ([`SimError`])

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Kernel errors.
///
/// Every variant is a contract violation: a run that hits one of them is
/// aborted and the error is returned to the caller of `run`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// An event was scheduled with a negative delay.
    #[error("negative delay {delay} scheduled at {now}")]
    NegativeDelay {
        /// Requested delay.
        delay: VirtualTime,
        /// Engine time when the request was made.
        now: VirtualTime,
    },

    /// Work was injected from another thread with a negative delay.
    #[error("negative delay {0} injected")]
    NegativeInjectionDelay(VirtualTime),

    /// An event was scheduled at an absolute time in the past.
    #[error("cannot schedule at {requested}, current time is {now}")]
    NonCausal {
        /// Requested absolute time.
        requested: VirtualTime,
        /// Engine time when the request was made.
        now: VirtualTime,
    },

    /// `now + delay` does not fit in a [`VirtualTime`].
    #[error("virtual time overflow")]
    TimeOverflow,

    /// The event is not queued (already fired, removed, or never issued).
    #[error("event {0} is not queued")]
    EventNotFound(EventId),

    /// The scheduler returned an event earlier than the current time.
    #[error("virtual time moved backwards from {from} to {to}")]
    NonMonotonicTime {
        /// Time before the step.
        from: VirtualTime,
        /// Timestamp of the offending event.
        to: VirtualTime,
    },

    /// A cross-rank send was attempted on an engine that is not attached to a
    /// synchronizer.
    #[error("engine is not attached to a distributed synchronizer")]
    RemoteUnavailable,

    /// Real-time pacing fell further behind the wall clock than allowed.
    #[error("real-time lag of {lag_ms}ms exceeds hard limit of {limit_ms}ms")]
    RealtimeLag {
        /// Observed lag.
        lag_ms: u64,
        /// Configured hard limit.
        limit_ms: u64,
    },

    /// An event handler failed.
    #[error("event handler error in context {context}: {message}")]
    Handler {
        /// Context the failing event ran in.
        context: ContextId,
        /// Error message.
        message: String,
    },
}

impl SimError {
    /// Build a [`SimError::Handler`] from any displayable error.
    pub fn handler(context: ContextId, message: impl fmt::Display) -> Self {
        SimError::Handler {
            context,
            message: message.to_string(),
        }
    }
}

// ============================================================================
// Time Types
// ============================================================================

const NANOS_PER_MICRO: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Simulation time in nanoseconds since epoch 0.
///
/// Signed so that deltas can be expressed in the same type; the engine
/// rejects negative delays at scheduling time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct VirtualTime(i64);

impl VirtualTime {
    /// Zero time.
    pub const ZERO: VirtualTime = VirtualTime(0);

    /// Largest representable time. Used as "never" by the synchronizer.
    pub const MAX: VirtualTime = VirtualTime(i64::MAX);

    /// Create from nanoseconds.
    pub const fn from_nanos(ns: i64) -> Self {
        VirtualTime(ns)
    }

    /// Create from microseconds.
    pub const fn from_micros(us: i64) -> Self {
        VirtualTime(us * NANOS_PER_MICRO)
    }

    /// Create from milliseconds.
    pub const fn from_millis(ms: i64) -> Self {
        VirtualTime(ms * NANOS_PER_MILLI)
    }

    /// Create from whole seconds.
    pub const fn from_secs(s: i64) -> Self {
        VirtualTime(s * NANOS_PER_SEC)
    }

    /// Create from seconds (float), rounded to the nearest nanosecond.
    pub fn from_secs_f64(s: f64) -> Self {
        VirtualTime((s * NANOS_PER_SEC as f64).round() as i64)
    }

    /// Get as nanoseconds.
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Get as microseconds (truncated).
    pub const fn as_micros(&self) -> i64 {
        self.0 / NANOS_PER_MICRO
    }

    /// Get as milliseconds (truncated).
    pub const fn as_millis(&self) -> i64 {
        self.0 / NANOS_PER_MILLI
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC as f64
    }

    /// True for times before epoch 0. Only deltas should ever be negative.
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Add a delta, returning `None` on overflow.
    pub fn checked_add(&self, delta: VirtualTime) -> Option<VirtualTime> {
        self.0.checked_add(delta.0).map(VirtualTime)
    }

    /// Subtract a delta, returning `None` on overflow.
    pub fn checked_sub(&self, delta: VirtualTime) -> Option<VirtualTime> {
        self.0.checked_sub(delta.0).map(VirtualTime)
    }

    /// Add a delta, clamping at [`VirtualTime::MAX`].
    pub fn saturating_add(&self, delta: VirtualTime) -> VirtualTime {
        VirtualTime(self.0.saturating_add(delta.0))
    }
}

impl std::ops::Add for VirtualTime {
    type Output = VirtualTime;

    fn add(self, rhs: Self) -> Self::Output {
        VirtualTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for VirtualTime {
    type Output = VirtualTime;

    fn sub(self, rhs: Self) -> Self::Output {
        VirtualTime(self.0 - rhs.0)
    }
}

impl fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 0 {
            write!(f, "+{}ns", self.0)
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

impl FromStr for VirtualTime {
    type Err = ParseTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_time(s)
    }
}

// ============================================================================
// Time Parsing
// ============================================================================

/// Errors produced by [`parse_time`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseTimeError {
    /// The input was empty.
    #[error("empty time string")]
    Empty,

    /// A character that is neither a digit, a dot nor a unit letter.
    #[error("unexpected '{ch}' in '{input}'")]
    UnexpectedChar {
        /// Offending character.
        ch: char,
        /// Whole input.
        input: String,
    },

    /// A numeric component could not be parsed.
    #[error("invalid number '{number}' in '{input}'")]
    InvalidNumber {
        /// Offending component.
        number: String,
        /// Whole input.
        input: String,
    },

    /// Unit suffix is not one of ns, us, ms, s, m, h, d.
    #[error("unknown time unit '{unit}' in '{input}'. Use ns, us, ms, s, m, h, or d.")]
    UnknownUnit {
        /// Offending unit.
        unit: String,
        /// Whole input.
        input: String,
    },

    /// The value does not fit in a [`VirtualTime`].
    #[error("time '{0}' is out of range")]
    OutOfRange(String),
}

/// Parse a time string with units into a [`VirtualTime`].
///
/// Supported formats:
/// - Plain number: `60` or `0.5` (interpreted as seconds)
/// - With unit suffix: `250ns`, `10us`, `5ms`, `60s`, `10m`, `2h`, `1d`
/// - Combined units: `1h30m`, `1s500ms`
/// - A leading `-` negates the whole value (useful for deltas in tests)
pub fn parse_time(s: &str) -> Result<VirtualTime, ParseTimeError> {
    let input = s.trim();
    if input.is_empty() {
        return Err(ParseTimeError::Empty);
    }

    let (negative, body) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input.strip_prefix('+').unwrap_or(input)),
    };

    let out_of_range = || ParseTimeError::OutOfRange(input.to_string());
    let mut total: i64 = 0;
    let mut number = String::new();
    let mut unit = String::new();

    for c in body.chars() {
        if c.is_ascii_digit() || c == '.' {
            if !unit.is_empty() {
                let nanos = component_nanos(&number, &unit, input)?;
                total = total.checked_add(nanos).ok_or_else(out_of_range)?;
                number.clear();
                unit.clear();
            }
            number.push(c);
        } else if c.is_ascii_alphabetic() {
            if number.is_empty() {
                return Err(ParseTimeError::UnexpectedChar {
                    ch: c,
                    input: input.to_string(),
                });
            }
            unit.push(c);
        } else {
            return Err(ParseTimeError::UnexpectedChar {
                ch: c,
                input: input.to_string(),
            });
        }
    }

    // A trailing number without unit counts as seconds.
    if !number.is_empty() {
        let unit = if unit.is_empty() { "s" } else { unit.as_str() };
        let nanos = component_nanos(&number, unit, input)?;
        total = total.checked_add(nanos).ok_or_else(out_of_range)?;
    }

    Ok(VirtualTime(if negative { -total } else { total }))
}

/// Nanoseconds in one `<number><unit>` component. Whole numbers are exact;
/// fractions are rounded to the nearest nanosecond.
fn component_nanos(number: &str, unit: &str, input: &str) -> Result<i64, ParseTimeError> {
    let multiplier: i128 = match unit {
        "ns" => 1,
        "us" => NANOS_PER_MICRO as i128,
        "ms" => NANOS_PER_MILLI as i128,
        "s" => NANOS_PER_SEC as i128,
        "m" => 60 * NANOS_PER_SEC as i128,
        "h" => 3600 * NANOS_PER_SEC as i128,
        "d" => 86400 * NANOS_PER_SEC as i128,
        _ => {
            return Err(ParseTimeError::UnknownUnit {
                unit: unit.to_string(),
                input: input.to_string(),
            })
        }
    };
    let invalid = || ParseTimeError::InvalidNumber {
        number: number.to_string(),
        input: input.to_string(),
    };
    let out_of_range = || ParseTimeError::OutOfRange(input.to_string());

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return Err(invalid());
    }
    // Only digits remain, so a failed parse is an overflow.
    let whole: i128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| out_of_range())?
    };
    let mut nanos = whole.checked_mul(multiplier).ok_or_else(out_of_range)?;
    if !fraction.is_empty() {
        let digits = &fraction[..fraction.len().min(18)];
        let scale = 10i128.pow(digits.len() as u32);
        let numerator: i128 = digits.parse().map_err(|_| invalid())?;
        let rounded = (numerator * multiplier + scale / 2) / scale;
        nanos = nanos.checked_add(rounded).ok_or_else(out_of_range)?;
    }
    i64::try_from(nanos).map_err(|_| out_of_range())
}

// ============================================================================
// Context Types
// ============================================================================

/// Execution context of an event, usually the node or rank it belongs to.
///
/// Propagated from the scheduling event to the scheduled one so that nested
/// scheduling can report who scheduled what.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextId(pub u32);

impl ContextId {
    /// No context (events scheduled from outside any handler).
    pub const NONE: ContextId = ContextId(u32::MAX);

    /// Create a new context ID.
    pub fn new(id: u32) -> Self {
        ContextId(id)
    }

    /// True unless this is [`ContextId::NONE`].
    pub fn is_some(&self) -> bool {
        *self != ContextId::NONE
    }
}

impl Default for ContextId {
    fn default() -> Self {
        ContextId::NONE
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_some() {
            write!(f, "ctx{}", self.0)
        } else {
            f.write_str("ctx-none")
        }
    }
}

/// Index of one participating process in a distributed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rank(pub u32);

impl Rank {
    /// Create a new rank.
    pub fn new(rank: u32) -> Self {
        Rank(rank)
    }

    /// Rank as a vector index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank{}", self.0)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Insertion sequence number of an event, unique per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Priority key of an event: timestamp first, insertion sequence second.
///
/// The derived ordering compares fields in declaration order, which gives
/// FIFO order among events sharing a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    /// When the event fires.
    pub time: VirtualTime,
    /// Tie-breaker.
    pub id: EventId,
}

impl EventKey {
    /// Create a new key.
    pub fn new(time: VirtualTime, id: EventId) -> Self {
        EventKey { time, id }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.time, self.id)
    }
}

/// Opaque token naming a scheduled event.
///
/// Returned by every `schedule*` call. Destroy-list events are flagged
/// and carry [`VirtualTime::MAX`] as their time; an ordinary event may be
/// scheduled at `MAX` too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventHandle {
    key: EventKey,
    destroy: bool,
}

impl EventHandle {
    /// Wrap a key. Only engines should mint handles.
    pub fn new(key: EventKey) -> Self {
        EventHandle {
            key,
            destroy: false,
        }
    }

    /// Handle of a destroy-list callback.
    pub fn destroy(id: EventId) -> Self {
        EventHandle {
            key: EventKey::new(VirtualTime::MAX, id),
            destroy: true,
        }
    }

    /// The event's priority key.
    pub fn key(&self) -> EventKey {
        self.key
    }

    /// The event's sequence number.
    pub fn id(&self) -> EventId {
        self.key.id
    }

    /// The time the event was scheduled for.
    pub fn time(&self) -> VirtualTime {
        self.key.time
    }

    /// True for handles returned by `schedule_destroy`.
    pub fn is_destroy(&self) -> bool {
        self.destroy
    }
}

impl fmt::Display for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key.id, self.key.time)
    }
}
