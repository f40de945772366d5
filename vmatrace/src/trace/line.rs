//! Trace line recognition
//!
//! Five line shapes matter:
//!
//! ```text
//! <task>-<pid> [<cpu>] <flags> <timestamp>: <event_name>: <payload>
//! <task>-<pid> [<cpu>] <flags> <timestamp>: <user stack trace> tgid=<tgid>
//!  [<cpu>] => 0x<hex> | ??
//!  [<cpu>] reason <k>
//! # comment
//! ```
//!
//! `tracing_mark_write` lines are ordinary event lines whose payload is free
//! text. The optional `( tgid)` column added by `record-tgid` is accepted
//! and ignored.

use regex::Regex;

use crate::domain::{CpuId, ParseError, Pid, Tgid, Timestamp};

const EVENT_PATTERN: &str = concat!(
    r"^\s*(?P<task>.+?)-(?P<pid>\d+)",
    r"\s+(?:\(\s*(?:\d+|-+)\)\s+)?",
    r"\[(?P<cpu>\d+)\]",
    r"\s+(?:(?P<flags>\S+)\s+)?",
    r"(?P<ts>\d+(?:\.\d+)?):",
    r"\s+(?P<event>\w+):",
    r"\s?(?P<payload>.*)$"
);

const STACK_BEGIN_PATTERN: &str = concat!(
    r"^\s*(?P<task>.+?)-(?P<pid>\d+)",
    r"\s+(?:\(\s*(?:\d+|-+)\)\s+)?",
    r"\[(?P<cpu>\d+)\]",
    r"\s+(?:(?P<flags>\S+)\s+)?",
    r"(?P<ts>\d+(?:\.\d+)?):",
    r"\s+<user stack trace>",
    r"(?:\s+tgid=(?P<tgid>\d+))?\s*$"
);

const STACK_ENTRY_PATTERN: &str =
    r"^\s*\[(?P<cpu>\d+)\]\s+=>\s+(?:<?(?:0x)?(?P<ip>[0-9a-fA-F]+)>?|\?\?)\s*$";

const STACK_REASON_PATTERN: &str = r"^\s*\[(?P<cpu>\d+)\]\s+reason\s+(?P<reason>\S+)\s*$";

/// A kernel event line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLine {
    pub task: String,
    pub pid: Pid,
    pub cpu: CpuId,
    pub flags: String,
    pub timestamp: Timestamp,
    pub name: String,
    pub payload: String,
}

/// Header of a user stack dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackBegin {
    pub task: String,
    pub pid: Pid,
    pub cpu: CpuId,
    pub timestamp: Timestamp,
    pub tgid: Option<Tgid>,
}

/// One frame of a user stack dump; `ip` is `None` for `??`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEntry {
    pub cpu: CpuId,
    pub ip: Option<u64>,
}

/// A recognized line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceLine {
    Event(EventLine),
    StackBegin(StackBegin),
    StackEntry(StackEntry),
    StackReason { cpu: CpuId, reason: String },
    Comment,
    Blank,
    Unknown,
}

impl TraceLine {
    /// CPU the line was recorded on, if the shape carries one
    #[must_use]
    pub fn cpu(&self) -> Option<CpuId> {
        match self {
            TraceLine::Event(e) => Some(e.cpu),
            TraceLine::StackBegin(b) => Some(b.cpu),
            TraceLine::StackEntry(e) => Some(e.cpu),
            TraceLine::StackReason { cpu, .. } => Some(*cpu),
            TraceLine::Comment | TraceLine::Blank | TraceLine::Unknown => None,
        }
    }

    #[must_use]
    pub fn is_stack(&self) -> bool {
        matches!(
            self,
            TraceLine::StackBegin(_) | TraceLine::StackEntry(_) | TraceLine::StackReason { .. }
        )
    }
}

/// Compiled line grammar. Build once and share; matching is pure.
#[derive(Debug, Clone)]
pub struct LineParser {
    event: Regex,
    stack_begin: Regex,
    stack_entry: Regex,
    stack_reason: Regex,
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            event: builtin(EVENT_PATTERN),
            stack_begin: builtin(STACK_BEGIN_PATTERN),
            stack_entry: builtin(STACK_ENTRY_PATTERN),
            stack_reason: builtin(STACK_REASON_PATTERN),
        }
    }

    /// Classify one line.
    ///
    /// Lines of no known shape come back as `TraceLine::Unknown`; lines that
    /// have a known shape but an unparsable field are a `ParseError`.
    ///
    /// # Errors
    /// Returns `ParseError::BadField` for out-of-range numbers or timestamps.
    pub fn parse_line(&self, line: &str) -> Result<TraceLine, ParseError> {
        let trimmed = line.trim_start();
        if trimmed.trim_end().is_empty() {
            return Ok(TraceLine::Blank);
        }
        if trimmed.starts_with('#') {
            return Ok(TraceLine::Comment);
        }

        if trimmed.starts_with('[') {
            if let Some(caps) = self.stack_entry.captures(line) {
                let cpu = CpuId(parse_dec(&caps["cpu"], "cpu")?);
                let ip = match caps.name("ip") {
                    Some(m) => Some(parse_hex(m.as_str(), "ip")?),
                    None => None,
                };
                return Ok(TraceLine::StackEntry(StackEntry { cpu, ip }));
            }
            if let Some(caps) = self.stack_reason.captures(line) {
                let cpu = CpuId(parse_dec(&caps["cpu"], "cpu")?);
                return Ok(TraceLine::StackReason { cpu, reason: caps["reason"].to_string() });
            }
            return Ok(TraceLine::Unknown);
        }

        // Stack headers first: `<user stack trace>` never matches `\w+:`
        if let Some(caps) = self.stack_begin.captures(line) {
            let tgid = match caps.name("tgid") {
                Some(m) => Some(Tgid(parse_dec(m.as_str(), "tgid")?)),
                None => None,
            };
            return Ok(TraceLine::StackBegin(StackBegin {
                task: caps["task"].to_string(),
                pid: Pid(parse_dec(&caps["pid"], "pid")?),
                cpu: CpuId(parse_dec(&caps["cpu"], "cpu")?),
                timestamp: parse_timestamp(&caps["ts"])?,
                tgid,
            }));
        }

        if let Some(caps) = self.event.captures(line) {
            return Ok(TraceLine::Event(EventLine {
                task: caps["task"].to_string(),
                pid: Pid(parse_dec(&caps["pid"], "pid")?),
                cpu: CpuId(parse_dec(&caps["cpu"], "cpu")?),
                flags: caps.name("flags").map_or_else(String::new, |m| m.as_str().to_string()),
                timestamp: parse_timestamp(&caps["ts"])?,
                name: caps["event"].to_string(),
                payload: caps["payload"].trim_end().to_string(),
            }));
        }

        Ok(TraceLine::Unknown)
    }
}

pub(crate) fn builtin(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("built-in pattern failed to compile: {e}"))
}

pub(crate) fn parse_dec<T: std::str::FromStr>(s: &str, field: &'static str) -> Result<T, ParseError> {
    s.parse().map_err(|_| ParseError::BadField { field, value: s.to_string() })
}

pub(crate) fn parse_hex(s: &str, field: &'static str) -> Result<u64, ParseError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|_| ParseError::BadField { field, value: s.to_string() })
}

fn parse_timestamp(s: &str) -> Result<Timestamp, ParseError> {
    s.parse().map_err(|_| ParseError::BadField { field: "timestamp", value: s.to_string() })
}
