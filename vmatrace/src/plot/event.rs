use vmatrace_common::RSS_TYPE_COUNT;

use crate::classification::VmaKind;
use crate::domain::{CpuId, Timestamp};
use crate::vma::{UnmapOp, VmaOp};

/// Something plot-worthy that happened during replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlotEvent {
    /// Live VMAs of the process that are not ignored
    VmaCount { timestamp: Timestamp, count: usize },
    /// Total VM size of the process in bytes
    VmSize { timestamp: Timestamp, bytes: u64 },
    /// A VMA record was created
    Operation { timestamp: Timestamp, op: VmaOp, kind: VmaKind, length: u64, module: String },
    /// A VMA record left the live table
    Unmapped { timestamp: Timestamp, op: UnmapOp, kind: VmaKind, length: u64, lifetime_ns: u64 },
    PageMapped { timestamp: Timestamp, kind: VmaKind, major: bool },
    /// Resident pages per counter
    Rss { timestamp: Timestamp, pages: [u64; RSS_TYPE_COUNT] },
    /// The process was switched out after running since `start`
    Quantum { cpu: CpuId, start: Timestamp, end: Timestamp, pages_mapped: u64 },
    Checkpoint { timestamp: Timestamp, name: String },
}

impl PlotEvent {
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        match self {
            PlotEvent::VmaCount { timestamp, .. }
            | PlotEvent::VmSize { timestamp, .. }
            | PlotEvent::Operation { timestamp, .. }
            | PlotEvent::Unmapped { timestamp, .. }
            | PlotEvent::PageMapped { timestamp, .. }
            | PlotEvent::Rss { timestamp, .. }
            | PlotEvent::Checkpoint { timestamp, .. } => *timestamp,
            PlotEvent::Quantum { end, .. } => *end,
        }
    }
}
