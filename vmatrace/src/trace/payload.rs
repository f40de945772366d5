//! Event payload grammars and event-name classification
//!
//! # Payloads
//!
//! ```text
//! mmap_vma_*:  pid=P tgid=T ptgid=PT [kfn]: <vma> @ <start>-<end> <perms> <offset> <maj>:<min> <inode> [<file>]
//! pte_mapped:  <mmap payload> file=[<f>] faultaddr=<a> is_major=<0|1> old_pte_pfn=<n> old_pte_flags=<x> new_pte_pfn=<n> new_pte_flags=<x>
//! sched_switch: prev_comm=.. prev_pid=.. prev_tgid=.. prev_prio=.. prev_state=.. ==> next_comm=.. next_pid=.. next_tgid=.. next_prio=..
//! rss_stat:    mm_id=<n> curr=<0|1> type=MM_* size=<n>B
//! ```
//!
//! Hex fields are accepted with or without `0x`. The `[kfn]` field is
//! optional.

use regex::Regex;
use vmatrace_common::{RssType, kernel_fn, mmap, pte};

use super::line::{parse_dec, parse_hex};
use crate::domain::{ParseError, Pid, Tgid};
use crate::vma::{Backing, PairOp, PermsKey};

const MMAP_PATTERN: &str = concat!(
    r"^pid=(?P<pid>\d+)\s+tgid=(?P<tgid>\d+)\s+ptgid=(?P<ptgid>\d+)",
    r"(?:\s+\[(?P<kfn>[^\]]*)\])?:",
    r"\s+(?:0x)?(?P<vma>[0-9a-fA-F]+)",
    r"\s+@\s+(?:0x)?(?P<start>[0-9a-fA-F]+)-(?:0x)?(?P<end>[0-9a-fA-F]+)",
    r"\s+(?P<perms>\S{4})",
    r"\s+(?:0x)?(?P<offset>[0-9a-fA-F]+)",
    r"\s+(?P<major>[0-9a-fA-F]+):(?P<minor>[0-9a-fA-F]+)",
    r"\s+(?P<inode>\d+)",
    r"(?:\s+(?P<filename>.*?))?\s*$"
);

const PTE_TAIL_PATTERN: &str = concat!(
    r"^file=\[(?P<file>[^\]]*)\]",
    r"\s+faultaddr=(?:0x)?(?P<fault>[0-9a-fA-F]+)",
    r"\s+is_major=(?P<major>[01])",
    r"\s+old_pte_pfn=(?P<old_pfn>\d+)",
    r"\s+old_pte_flags=(?:0x)?(?P<old_flags>[0-9a-fA-F]+)",
    r"\s+new_pte_pfn=(?P<new_pfn>\d+)",
    r"\s+new_pte_flags=(?:0x)?(?P<new_flags>[0-9a-fA-F]+)\s*$"
);

const SCHED_SWITCH_PATTERN: &str = concat!(
    r"^prev_comm=(?P<prev_comm>.*?)\s+prev_pid=(?P<prev_pid>\d+)",
    r"(?:\s+prev_tgid=(?P<prev_tgid>\d+))?",
    r"\s+prev_prio=(?P<prev_prio>-?\d+)\s+prev_state=(?P<prev_state>\S+)",
    r"\s+==>\s+next_comm=(?P<next_comm>.*?)\s+next_pid=(?P<next_pid>\d+)",
    r"(?:\s+next_tgid=(?P<next_tgid>\d+))?",
    r"\s+next_prio=(?P<next_prio>-?\d+)\s*$"
);

const RSS_STAT_PATTERN: &str =
    r"^(?:mm_id=(?P<mm>\d+)\s+)?curr=(?P<curr>[01])\s+type=(?P<type>\w+)\s+size=(?P<size>\d+)B\s*$";

const SIM_TOGGLE_PATTERN: &str = r"tgid=(?P<tgid>\d+)";

// =============================================================================
// EVENT CLASSIFICATION
// =============================================================================

/// What an `mmap_vma_*` event does to the VMA set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapEvent {
    Alloc { dup: bool },
    Free,
    Unmap(PairOp),
    Remap(PairOp),
}

/// Event families the engine dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFamily {
    Mmap(MmapEvent),
    /// `mmap_disable_sim` (`false`) / `mmap_enable_sim` (`true`)
    SimToggle(bool),
    PteMapped,
    /// Any other `pte_*` event; carries no semantics
    PteOther,
    SchedSwitch,
    Checkpoint,
    RssStat,
    Other,
}

/// Map an event name onto its family
#[must_use]
pub fn classify_event(name: &str) -> EventFamily {
    let mmap_event = match name {
        mmap::ALLOC => Some(MmapEvent::Alloc { dup: false }),
        mmap::ALLOC_DUP_MMAP => Some(MmapEvent::Alloc { dup: true }),
        mmap::FREE => Some(MmapEvent::Free),
        mmap::RESIZE_UNMAP => Some(MmapEvent::Unmap(PairOp::Resize)),
        mmap::RESIZE_REMAP => Some(MmapEvent::Remap(PairOp::Resize)),
        mmap::RELOC_UNMAP => Some(MmapEvent::Unmap(PairOp::Relocation)),
        mmap::RELOC_REMAP => Some(MmapEvent::Remap(PairOp::Relocation)),
        mmap::ACCESS_UNMAP => Some(MmapEvent::Unmap(PairOp::AccessChange)),
        mmap::ACCESS_REMAP => Some(MmapEvent::Remap(PairOp::AccessChange)),
        mmap::FLAGS_UNMAP => Some(MmapEvent::Unmap(PairOp::FlagChange)),
        mmap::FLAGS_REMAP => Some(MmapEvent::Remap(PairOp::FlagChange)),
        _ => None,
    };
    if let Some(event) = mmap_event {
        return EventFamily::Mmap(event);
    }

    match name {
        mmap::DISABLE_SIM => EventFamily::SimToggle(false),
        mmap::ENABLE_SIM => EventFamily::SimToggle(true),
        pte::MAPPED => EventFamily::PteMapped,
        n if n.starts_with(pte::PREFIX) => EventFamily::PteOther,
        vmatrace_common::SCHED_SWITCH => EventFamily::SchedSwitch,
        vmatrace_common::TRACING_MARK_WRITE => EventFamily::Checkpoint,
        vmatrace_common::RSS_STAT => EventFamily::RssStat,
        _ => EventFamily::Other,
    }
}

// =============================================================================
// PAYLOAD TYPES
// =============================================================================

/// Parsed `mmap_vma_*` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapPayload {
    pub pid: Pid,
    pub tgid: Tgid,
    pub ptgid: Tgid,
    pub kernel_fn: String,
    /// Kernel address of the `vm_area_struct`; stable across an unmap/remap pair
    pub vma_addr: u64,
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub backing: Backing,
}

impl MmapPayload {
    #[must_use]
    pub fn length(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// A mapping is file-backed when it has an inode or a filename
    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        self.backing.inode != 0 || !self.backing.filename.is_empty()
    }

    /// # Errors
    /// Returns `ParseError::BadPerms` for a malformed permissions field.
    pub fn perms_key(&self) -> Result<PermsKey, ParseError> {
        PermsKey::from_perms(&self.perms, self.is_file_backed())
    }

    #[must_use]
    pub fn is_dup_mmap(&self) -> bool {
        self.kernel_fn == kernel_fn::DUP_MMAP
    }
}

/// Parsed `pte_mapped` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PteMappedPayload {
    pub mmap: MmapPayload,
    pub file: String,
    pub fault_addr: u64,
    pub is_major: bool,
    pub old_pfn: u64,
    pub old_flags: u64,
    pub new_pfn: u64,
    pub new_flags: u64,
}

impl PteMappedPayload {
    /// A new physical page was installed where none was before
    #[must_use]
    pub fn is_new_page(&self) -> bool {
        self.old_pfn == 0 && self.new_pfn != 0
    }
}

/// Parsed `sched_switch` payload. Without `prev_tgid`/`next_tgid` the tgid
/// fields fall back to the pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedSwitchPayload {
    pub prev_comm: String,
    pub prev_pid: Pid,
    pub prev_tgid: Tgid,
    pub prev_prio: i32,
    pub prev_state: String,
    pub next_comm: String,
    pub next_pid: Pid,
    pub next_tgid: Tgid,
    pub next_prio: i32,
}

/// Parsed `rss_stat` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssStatPayload {
    pub mm_id: Option<u64>,
    /// Counter belongs to the mm of the current task
    pub curr: bool,
    pub rss_type: RssType,
    pub size_bytes: u64,
}

// =============================================================================
// PARSER
// =============================================================================

/// Compiled payload grammars
#[derive(Debug, Clone)]
pub struct PayloadParser {
    mmap: Regex,
    pte_tail: Regex,
    sched_switch: Regex,
    rss_stat: Regex,
    sim_toggle: Regex,
}

impl Default for PayloadParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadParser {
    #[must_use]
    pub fn new() -> Self {
        let compile = |p: &str| {
            Regex::new(p).unwrap_or_else(|e| panic!("built-in pattern failed to compile: {e}"))
        };
        Self {
            mmap: compile(MMAP_PATTERN),
            pte_tail: compile(PTE_TAIL_PATTERN),
            sched_switch: compile(SCHED_SWITCH_PATTERN),
            rss_stat: compile(RSS_STAT_PATTERN),
            sim_toggle: compile(SIM_TOGGLE_PATTERN),
        }
    }

    /// # Errors
    /// `ParseError::BadPayload` when the payload does not match the grammar,
    /// `ParseError::BadField` for unparsable numbers.
    pub fn parse_mmap(&self, payload: &str) -> Result<MmapPayload, ParseError> {
        let caps = self
            .mmap
            .captures(payload)
            .ok_or_else(|| ParseError::BadPayload { family: "mmap", payload: payload.to_string() })?;

        let start = parse_hex(&caps["start"], "start")?;
        let end = parse_hex(&caps["end"], "end")?;
        if end < start {
            return Err(ParseError::BadField { field: "end", value: caps["end"].to_string() });
        }

        Ok(MmapPayload {
            pid: Pid(parse_dec(&caps["pid"], "pid")?),
            tgid: Tgid(parse_dec(&caps["tgid"], "tgid")?),
            ptgid: Tgid(parse_dec(&caps["ptgid"], "ptgid")?),
            kernel_fn: caps.name("kfn").map_or_else(String::new, |m| m.as_str().trim().to_string()),
            vma_addr: parse_hex(&caps["vma"], "vma")?,
            start,
            end,
            perms: caps["perms"].to_string(),
            backing: Backing {
                offset: parse_hex(&caps["offset"], "offset")?,
                dev_major: u32::try_from(parse_hex(&caps["major"], "major")?).map_err(|_| {
                    ParseError::BadField { field: "major", value: caps["major"].to_string() }
                })?,
                dev_minor: u32::try_from(parse_hex(&caps["minor"], "minor")?).map_err(|_| {
                    ParseError::BadField { field: "minor", value: caps["minor"].to_string() }
                })?,
                inode: parse_dec(&caps["inode"], "inode")?,
                filename: caps.name("filename").map_or_else(String::new, |m| m.as_str().to_string()),
            },
        })
    }

    /// Split at the last ` file=[` and parse each half.
    ///
    /// # Errors
    /// `ParseError::BadPayload` when either half does not match.
    pub fn parse_pte_mapped(&self, payload: &str) -> Result<PteMappedPayload, ParseError> {
        let bad = || ParseError::BadPayload { family: "pte", payload: payload.to_string() };
        let split = payload.rfind(" file=[").ok_or_else(bad)?;
        let (head, tail) = payload.split_at(split);

        let mmap = self.parse_mmap(head.trim_end()).map_err(|_| bad())?;
        let caps = self.pte_tail.captures(tail.trim_start()).ok_or_else(bad)?;

        Ok(PteMappedPayload {
            mmap,
            file: caps["file"].to_string(),
            fault_addr: parse_hex(&caps["fault"], "faultaddr")?,
            is_major: &caps["major"] == "1",
            old_pfn: parse_dec(&caps["old_pfn"], "old_pte_pfn")?,
            old_flags: parse_hex(&caps["old_flags"], "old_pte_flags")?,
            new_pfn: parse_dec(&caps["new_pfn"], "new_pte_pfn")?,
            new_flags: parse_hex(&caps["new_flags"], "new_pte_flags")?,
        })
    }

    /// # Errors
    /// `ParseError::BadPayload` when the payload does not match.
    pub fn parse_sched_switch(&self, payload: &str) -> Result<SchedSwitchPayload, ParseError> {
        let caps = self.sched_switch.captures(payload).ok_or_else(|| ParseError::BadPayload {
            family: "sched_switch",
            payload: payload.to_string(),
        })?;

        let prev_pid: u32 = parse_dec(&caps["prev_pid"], "prev_pid")?;
        let next_pid: u32 = parse_dec(&caps["next_pid"], "next_pid")?;
        let prev_tgid = match caps.name("prev_tgid") {
            Some(m) => parse_dec(m.as_str(), "prev_tgid")?,
            None => prev_pid,
        };
        let next_tgid = match caps.name("next_tgid") {
            Some(m) => parse_dec(m.as_str(), "next_tgid")?,
            None => next_pid,
        };

        Ok(SchedSwitchPayload {
            prev_comm: caps["prev_comm"].to_string(),
            prev_pid: Pid(prev_pid),
            prev_tgid: Tgid(prev_tgid),
            prev_prio: parse_dec(&caps["prev_prio"], "prev_prio")?,
            prev_state: caps["prev_state"].to_string(),
            next_comm: caps["next_comm"].to_string(),
            next_pid: Pid(next_pid),
            next_tgid: Tgid(next_tgid),
            next_prio: parse_dec(&caps["next_prio"], "next_prio")?,
        })
    }

    /// # Errors
    /// `ParseError::BadPayload` for a non-matching payload,
    /// `ParseError::BadField` for an unknown counter type.
    pub fn parse_rss_stat(&self, payload: &str) -> Result<RssStatPayload, ParseError> {
        let caps = self.rss_stat.captures(payload).ok_or_else(|| ParseError::BadPayload {
            family: "rss_stat",
            payload: payload.to_string(),
        })?;
        let rss_type = RssType::from_kernel_name(&caps["type"])
            .ok_or_else(|| ParseError::BadField { field: "type", value: caps["type"].to_string() })?;
        let mm_id = match caps.name("mm") {
            Some(m) => Some(parse_dec(m.as_str(), "mm_id")?),
            None => None,
        };

        Ok(RssStatPayload {
            mm_id,
            curr: &caps["curr"] == "1",
            rss_type,
            size_bytes: parse_dec(&caps["size"], "size")?,
        })
    }

    /// `tgid=` of a sim toggle payload, if present
    #[must_use]
    pub fn parse_sim_toggle(&self, payload: &str) -> Option<Tgid> {
        self.sim_toggle
            .captures(payload)
            .and_then(|caps| caps["tgid"].parse().ok())
            .map(Tgid)
    }
}
