// Counters are reported for humans; precision loss is irrelevant
#![allow(clippy::cast_precision_loss)]

use log::info;
use serde::Serialize;

use crate::symbolization::ResolverStats;

/// Counters of one replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub lines: u64,
    pub events: u64,
    pub vma_events: u64,
    pub stack_lines: u64,
    /// VMA events of processes outside the target set
    pub filtered: u64,
    /// VMA events dropped by fork/exec gating
    pub elided: u64,
    /// VMA events dropped while a process had the sim disabled
    pub sim_disabled: u64,
    pub pte_events: u64,
    pub sched_switches: u64,
    pub checkpoints: u64,
    pub other_events: u64,
    pub stacks_attributed: u64,
}

/// Log end-of-replay counters
pub fn display_statistics(stats: &ReplayStats, resolver: ResolverStats) {
    info!(
        "replayed {} lines: {} events ({} VMA, {} PTE, {} sched_switch, {} checkpoints, {} other)",
        stats.lines,
        stats.events,
        stats.vma_events,
        stats.pte_events,
        stats.sched_switches,
        stats.checkpoints,
        stats.other_events
    );
    info!(
        "VMA events skipped: {} filtered, {} elided by fork/exec, {} while sim disabled",
        stats.filtered, stats.elided, stats.sim_disabled
    );
    if stats.stacks_attributed > 0 || resolver.lookups > 0 {
        let hit_rate = if resolver.lookups == 0 {
            0.0
        } else {
            resolver.cache_hits as f64 * 100.0 / resolver.lookups as f64
        };
        info!(
            "stacks attributed: {}, symbol lookups: {} ({hit_rate:.1}% cached), failed modules: {}",
            stats.stacks_attributed, resolver.lookups, resolver.failed_modules
        );
    }
}
