//! Per-group summary of a finished replay
//!
//! # Architecture
//!
//! - **`ModuleStats`** - aggregates operations and bytes per creator module
//! - **`GroupSummary`** - peaks, operation counts and the module ranking of
//!   one process group
//! - **`Summary`** - every group plus replay counters; rendered as text
//!   (`summary.txt`) and serialized as JSON (`summary.json`)
//!
//! ## Group Peaks
//!
//! A single process already tracks its own peaks while replaying. For a
//! group the peaks of its members need not coincide, so VM size and VMA
//! count are recomputed by sweeping the members' histories in time order:
//!
//! ```text
//! +length on entering the live table, -length at unmap
//! unmaps sort before creations at equal timestamps
//! ```
//!
//! Peak RSS is the sum of the members' individual peaks, an upper bound.

// Percentages and seconds are for display
#![allow(clippy::cast_precision_loss)]

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use serde::Serialize;

use crate::domain::{Tgid, Timestamp};
use crate::process::{ProcessGroup, ProcessState, ProcessTracker};
use crate::replay::{Analysis, ReplayStats};
use crate::vma::{UnmapOp, Vma};

/// Module label of VMAs created without stack attribution
pub const UNATTRIBUTED: &str = "-";

// =============================================================================
// MODULE RANKING
// =============================================================================

/// Share of a group's VMA operations attributed to one creator module
#[derive(Debug, Clone, Serialize)]
pub struct ModuleShare {
    pub module: String,
    pub operations: u64,
    pub bytes: u64,
    /// Percentage of the group's operations (0.0 - 100.0)
    pub percentage: f64,
}

/// Operation counts per creator module
#[derive(Debug, Default)]
pub struct ModuleStats {
    modules: HashMap<String, (u64, u64)>,
    total_operations: u64,
}

impl ModuleStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count the operation that created `vma`
    pub fn record(&mut self, vma: &Vma) {
        self.total_operations += 1;
        let module = if vma.creator_module.is_empty() { UNATTRIBUTED } else { vma.creator_module.as_str() };
        let entry = self.modules.entry(module.to_string()).or_default();
        entry.0 += 1;
        entry.1 += vma.length;
    }

    #[must_use]
    pub fn total_operations(&self) -> u64 {
        self.total_operations
    }

    /// Modules by operation count, most active first; ties by name
    #[must_use]
    pub fn to_shares(&self) -> Vec<ModuleShare> {
        let mut shares: Vec<ModuleShare> = self
            .modules
            .iter()
            .map(|(module, &(operations, bytes))| {
                let percentage = if self.total_operations > 0 {
                    (operations as f64 / self.total_operations as f64) * 100.0
                } else {
                    0.0
                };
                ModuleShare { module: module.clone(), operations, bytes, percentage }
            })
            .collect();
        shares.sort_by(|a, b| b.operations.cmp(&a.operations).then_with(|| a.module.cmp(&b.module)));
        shares
    }
}

// =============================================================================
// GROUP SUMMARY
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Peaks {
    pub vm_size: u64,
    pub vm_size_at: Timestamp,
    pub vma_count: usize,
    pub vma_count_at: Timestamp,
}

impl Peaks {
    fn of_process(process: &ProcessState) -> Self {
        Self {
            vm_size: process.stats.max_vm_size,
            vm_size_at: process.stats.max_vm_size_ts,
            vma_count: process.stats.max_vma_count,
            vma_count_at: process.stats.max_vma_count_ts,
        }
    }
}

/// Sweep VMA lifetimes for the peak mapped size and count
#[must_use]
pub fn sweep_peaks<'a>(vmas: impl IntoIterator<Item = &'a Vma>) -> Peaks {
    // (timestamp, 0 = unmap / 1 = map, length)
    let mut edges: Vec<(Timestamp, u8, u64)> = Vec::new();
    for vma in vmas {
        let Some(mapped_at) = vma.mapped_at else { continue };
        edges.push((mapped_at, 1, vma.length));
        if let Some(unmap) = vma.unmap {
            edges.push((unmap.timestamp, 0, vma.length));
        }
    }
    edges.sort_unstable_by_key(|&(ts, kind, _)| (ts, kind));

    let mut peaks = Peaks::default();
    let (mut size, mut count) = (0u64, 0usize);
    for (ts, kind, length) in edges {
        if kind == 1 {
            size += length;
            count += 1;
        } else {
            size = size.saturating_sub(length);
            count = count.saturating_sub(1);
        }
        if size > peaks.vm_size {
            peaks.vm_size = size;
            peaks.vm_size_at = ts;
        }
        if count > peaks.vma_count {
            peaks.vma_count = count;
            peaks.vma_count_at = ts;
        }
    }
    peaks
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub root: Tgid,
    pub label: String,
    /// Member labels, root first
    pub members: Vec<String>,
    pub peaks: Peaks,
    pub max_rss_pages: u64,
    pub pages_mapped: u64,
    pub cpu_time_ns: u64,
    /// VMA records by creating operation
    pub operations: BTreeMap<String, u64>,
    pub frees: u64,
    /// VMA events dropped by fork/exec elision or a disabled sim
    pub elided_events: u64,
    pub modules: Vec<ModuleShare>,
}

impl GroupSummary {
    #[must_use]
    pub fn build(tracker: &ProcessTracker, group: &ProcessGroup) -> Self {
        let members: Vec<&ProcessState> = group.members.iter().filter_map(|&tgid| tracker.get(tgid)).collect();
        let history = || members.iter().flat_map(|p| p.history().iter());

        let peaks = match members.as_slice() {
            [single] => Peaks::of_process(single),
            _ => sweep_peaks(history()),
        };

        let mut operations: BTreeMap<String, u64> = BTreeMap::new();
        let mut modules = ModuleStats::new();
        let mut frees = 0;
        for vma in history() {
            *operations.entry(vma.op.as_str().to_string()).or_default() += 1;
            modules.record(vma);
            if vma.unmap.is_some_and(|u| u.op == UnmapOp::Free) {
                frees += 1;
            }
        }

        Self {
            root: group.root,
            label: tracker.label(group.root),
            members: group.members.iter().map(|&tgid| tracker.label(tgid)).collect(),
            peaks,
            max_rss_pages: members.iter().map(|p| p.stats.max_rss).sum(),
            pages_mapped: members.iter().map(|p| p.stats.pages_mapped).sum(),
            cpu_time_ns: members.iter().map(|p| p.stats.cpu_time_ns).sum(),
            operations,
            frees,
            elided_events: members.iter().map(|p| p.stats.elided_events).sum(),
            modules: modules.to_shares(),
        }
    }
}

// =============================================================================
// WHOLE-RUN SUMMARY
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    /// Latest trace timestamp
    pub end: Timestamp,
    pub groups: Vec<GroupSummary>,
    pub checkpoints: Vec<String>,
    pub stats: ReplayStats,
    /// Diagnostic counts by kind
    pub diagnostics: BTreeMap<String, usize>,
}

impl Summary {
    #[must_use]
    pub fn build<K>(analysis: &Analysis<K>) -> Self {
        let mut diagnostics: BTreeMap<String, usize> = BTreeMap::new();
        for diagnostic in &analysis.diagnostics {
            *diagnostics.entry(diagnostic.kind.as_str().to_string()).or_default() += 1;
        }
        Self {
            end: analysis.end,
            groups: analysis
                .groups
                .iter()
                .map(|group| GroupSummary::build(&analysis.processes, group))
                .collect(),
            checkpoints: analysis.checkpoints.iter().map(|cp| cp.name.clone()).collect(),
            stats: analysis.stats,
            diagnostics,
        }
    }

    /// Plain-text report
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "trace end: {}", self.end);
        for group in &self.groups {
            let _ = writeln!(out);
            let _ = writeln!(out, "group {} ({} processes)", group.label, group.members.len());
            let _ = writeln!(out, "  members        {}", group.members.join(" "));
            let _ = writeln!(
                out,
                "  max vm size    {} bytes at {}",
                group.peaks.vm_size, group.peaks.vm_size_at
            );
            let _ = writeln!(
                out,
                "  max vma count  {} at {}",
                group.peaks.vma_count, group.peaks.vma_count_at
            );
            let _ = writeln!(out, "  max rss        {} pages", group.max_rss_pages);
            let _ = writeln!(out, "  pages mapped   {}", group.pages_mapped);
            let _ = writeln!(out, "  cpu time       {:.6} s", group.cpu_time_ns as f64 / 1e9);
            let ops: Vec<String> = group.operations.iter().map(|(op, n)| format!("{op} {n}")).collect();
            let _ = writeln!(out, "  operations     {}", ops.join(", "));
            let _ = writeln!(out, "  frees          {}", group.frees);
            if group.elided_events > 0 {
                let _ = writeln!(out, "  elided events  {}", group.elided_events);
            }
            if !group.modules.is_empty() {
                let _ = writeln!(out, "  modules");
                for share in &group.modules {
                    let _ = writeln!(
                        out,
                        "    {:>6.2}%  {:>8} ops  {:>14} bytes  {}",
                        share.percentage, share.operations, share.bytes, share.module
                    );
                }
            }
        }

        if !self.checkpoints.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "checkpoints: {}", self.checkpoints.join(" "));
        }
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "replay: {} lines, {} events ({} vma, {} filtered, {} elided, {} while sim disabled)",
            self.stats.lines,
            self.stats.events,
            self.stats.vma_events,
            self.stats.filtered,
            self.stats.elided,
            self.stats.sim_disabled
        );
        if !self.diagnostics.is_empty() {
            let counts: Vec<String> = self.diagnostics.iter().map(|(kind, n)| format!("{kind} {n}")).collect();
            let _ = writeln!(out, "diagnostics: {}", counts.join(", "));
        }
        out
    }
}
