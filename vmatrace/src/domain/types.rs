//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a thread ID where
//! a process (thread group) ID is expected, and make function signatures
//! more expressive.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Thread ID as printed in the `<task>-<pid>` prefix and `pid=` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread group ID (the user-visible process ID)
///
/// All per-process state is keyed by this. Distinct from [`Pid`]: a
/// multithreaded process has many pids but one tgid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Tgid(pub u32);

impl fmt::Display for Tgid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Pid> for Tgid {
    fn from(pid: Pid) -> Self {
        Tgid(pid.0)
    }
}

/// CPU ID
///
/// Represents a CPU core ID (0, 1, 2, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

/// Trace timestamp in nanoseconds
///
/// The tracer prints seconds with a fractional part (`1234.567890`). Parsing
/// keeps every printed digit up to nanosecond resolution so timestamps compare
/// exactly; no floating point is involved. Serialized as nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    /// Convert to seconds (f64)
    #[allow(clippy::cast_precision_loss)]
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Build from seconds, rounding to the nearest nanosecond
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_seconds(secs: f64) -> Self {
        Timestamp((secs.max(0.0) * 1_000_000_000.0).round() as u64)
    }

    /// Nanoseconds elapsed since `earlier` (zero if `earlier` is later)
    pub fn saturating_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

impl FromStr for Timestamp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
        if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid timestamp '{s}'"));
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid timestamp '{s}'"));
        }

        let secs: u64 = secs.parse().map_err(|e| format!("invalid timestamp '{s}': {e}"))?;

        // Right-pad (or truncate) the fraction to nanoseconds
        let mut nanos: u64 = 0;
        for digit in frac.bytes().chain(std::iter::repeat(b'0')).take(9) {
            nanos = nanos * 10 + u64::from(digit - b'0');
        }

        secs.checked_mul(1_000_000_000)
            .and_then(|ns| ns.checked_add(nanos))
            .map(Timestamp)
            .ok_or_else(|| format!("timestamp '{s}' out of range"))
    }
}
