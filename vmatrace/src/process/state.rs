//! Per-process replay state
//!
//! # Storage
//!
//! Every VMA record of a process lives in one arena (`history`), in creation
//! order. The live table, the per-permissions index and the checkpoint
//! interval list hold indices into it, so the same record is shared by all
//! views and a record is only ever appended, never removed.
//!
//! # Invariants
//!
//! - the live table holds at most one VMA per start address
//! - every VMA in the live table has no unmap record
//! - the current VM size equals the sum of live lengths once no unmap/remap
//!   pair is outstanding

use std::collections::{BTreeMap, HashMap, VecDeque};

use vmatrace_common::{RSS_TYPE_COUNT, RssType};

use crate::classification::ignore_vma;
use crate::domain::{Tgid, Timestamp};
use crate::replay::fork_exec::ForkExecFlags;
use crate::vma::{PairOp, PermsKey, UnmapOp, Vma};

/// Where the VMA named by an outstanding unmap lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingTarget {
    Live,
    /// The out-of-band stack VMA of an exec in progress
    Bprm,
}

/// An unmap waiting for its remap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingUnmap {
    pub op: PairOp,
    pub start: u64,
    pub length: u64,
    /// Kernel address of the VMA struct, kept by its remap
    pub vma_addr: u64,
    pub line: u64,
    pub target: PendingTarget,
}

/// Counters and high-water marks of one process
#[derive(Debug, Clone, Default)]
pub struct ProcessStats {
    pub total_vm_size: u64,
    pub max_vm_size: u64,
    pub max_vm_size_ts: Timestamp,
    pub max_vma_count: usize,
    pub max_vma_count_ts: Timestamp,
    /// Resident pages per counter
    pub rss: [u64; RSS_TYPE_COUNT],
    pub max_rss: u64,
    pub max_rss_ts: Timestamp,
    /// Set once an `rss_stat` event was seen; those replace PTE-derived counts
    pub rss_from_stat: bool,
    pub pages_mapped: u64,
    pub cpu_time_ns: u64,
    pub quanta: u64,
    /// VMA events dropped by fork/exec gating or a disabled sim
    pub elided_events: u64,
}

/// Replay state of one process (thread group)
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub tgid: Tgid,
    pub progname: Option<String>,
    /// Name inherited from the parent until the process names itself
    pub speculative_name: Option<String>,
    pub ptgid: Option<Tgid>,
    pub children: Vec<Tgid>,
    pub is_root: bool,
    /// Group root whose statistics this process contributes to
    pub tgid_for_stats: Tgid,
    pub flags: ForkExecFlags,
    /// First user IP of the exec that created the current image
    pub exec_ip: Option<u64>,
    pub sim_disabled: bool,
    /// Current program break, from the heap VMA
    pub brk: Option<u64>,
    pub stats: ProcessStats,
    pub pending: VecDeque<PendingUnmap>,
    /// VM size change held back while pairs are outstanding
    pub deferred_delta: i64,

    history: Vec<Vma>,
    live: BTreeMap<u64, usize>,
    by_perms: HashMap<PermsKey, Vec<usize>>,
    checkpoint: Vec<usize>,
    /// Versions of the out-of-band exec stack VMA; the last one is current
    bprm_chain: Vec<Vma>,
    bprm_kaddr: Option<u64>,
    counted_vmas: usize,
    /// Cumulative mapped pages per VMA start
    vma_pages: HashMap<u64, u64>,
    quantum_pages: HashMap<u64, u64>,
}

impl ProcessState {
    #[must_use]
    pub fn new(tgid: Tgid) -> Self {
        Self {
            tgid,
            progname: None,
            speculative_name: None,
            ptgid: None,
            children: Vec::new(),
            is_root: true,
            tgid_for_stats: tgid,
            flags: ForkExecFlags::default(),
            exec_ip: None,
            sim_disabled: false,
            brk: None,
            stats: ProcessStats::default(),
            pending: VecDeque::new(),
            deferred_delta: 0,
            history: Vec::new(),
            live: BTreeMap::new(),
            by_perms: HashMap::new(),
            checkpoint: Vec::new(),
            bprm_chain: Vec::new(),
            bprm_kaddr: None,
            counted_vmas: 0,
            vma_pages: HashMap::new(),
            quantum_pages: HashMap::new(),
        }
    }

    /// Program name, the inherited name, or `unknown`
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.progname
            .as_deref()
            .or(self.speculative_name.as_deref())
            .unwrap_or("unknown")
    }

    /// `<name>-<tgid>`, used for file names and plot labels
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}-{}", self.display_name(), self.tgid)
    }

    /// Neither a fork nor an exec of this process was observed
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.flags.saw_fork && !self.flags.saw_exec
    }

    // =========================================================================
    // LIVE TABLE
    // =========================================================================

    #[must_use]
    pub fn live_vma(&self, start: u64) -> Option<&Vma> {
        self.live.get(&start).map(|&idx| &self.history[idx])
    }

    /// Live VMA whose range holds `addr`
    #[must_use]
    pub fn find_live_containing(&self, addr: u64) -> Option<&Vma> {
        self.live
            .range(..=addr)
            .next_back()
            .map(|(_, &idx)| &self.history[idx])
            .filter(|vma| vma.contains(addr))
    }

    pub fn live_vmas(&self) -> impl Iterator<Item = &Vma> {
        self.live.values().map(|&idx| &self.history[idx])
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Live VMAs that are not filtered out by [`ignore_vma`]
    #[must_use]
    pub fn counted_vma_count(&self) -> usize {
        self.counted_vmas
    }

    /// Put a VMA into history and the live table.
    ///
    /// Returns `false` without inserting when the start is already live; the
    /// caller decides whether that is fatal.
    pub fn insert_live(&mut self, mut vma: Vma) -> bool {
        if self.live.contains_key(&vma.start) {
            return false;
        }
        let start = vma.start;
        let timestamp = *vma.mapped_at.get_or_insert(vma.timestamp);
        if !ignore_vma(&vma) {
            self.counted_vmas += 1;
        }
        let idx = self.push_history(vma);
        self.live.insert(start, idx);

        if self.live.len() > self.stats.max_vma_count {
            self.stats.max_vma_count = self.live.len();
            self.stats.max_vma_count_ts = timestamp;
        }
        true
    }

    /// Take the VMA at `start` out of the live table and record its unmap.
    pub fn remove_live(&mut self, start: u64, timestamp: Timestamp, op: UnmapOp) -> Option<&Vma> {
        let idx = self.live.remove(&start)?;
        let vma = &mut self.history[idx];
        vma.mark_unmapped(timestamp, op);
        if !ignore_vma(vma) {
            self.counted_vmas = self.counted_vmas.saturating_sub(1);
        }
        self.vma_pages.remove(&start);
        self.quantum_pages.remove(&start);
        Some(&self.history[idx])
    }

    fn push_history(&mut self, vma: Vma) -> usize {
        let idx = self.history.len();
        self.by_perms.entry(vma.perms).or_default().push(idx);
        self.checkpoint.push(idx);
        self.history.push(vma);
        idx
    }

    /// Index of the open pair a `op` remap of the VMA struct at `vma_addr`
    /// closes: the pair of that struct, else the oldest pair of that kind
    #[must_use]
    pub fn matching_pending(&self, op: PairOp, vma_addr: u64) -> Option<usize> {
        self.pending
            .iter()
            .position(|p| p.op == op && p.vma_addr == vma_addr)
            .or_else(|| self.pending.iter().position(|p| p.op == op))
    }

    // =========================================================================
    // HISTORY AND CHECKPOINT INTERVALS
    // =========================================================================

    /// Every VMA record ever created for this process, in creation order
    #[must_use]
    pub fn history(&self) -> &[Vma] {
        &self.history
    }

    pub fn history_by_perms(&self, key: PermsKey) -> impl Iterator<Item = &Vma> {
        self.by_perms
            .get(&key)
            .into_iter()
            .flatten()
            .map(|&idx| &self.history[idx])
    }

    /// VMAs created since the last checkpoint
    pub fn checkpoint_vmas(&self) -> impl Iterator<Item = &Vma> {
        self.checkpoint.iter().map(|&idx| &self.history[idx])
    }

    pub fn reset_checkpoint(&mut self) {
        self.checkpoint.clear();
    }

    // =========================================================================
    // OUT-OF-BAND EXEC STACK
    // =========================================================================

    /// Current out-of-band stack VMA, if an exec is in progress
    #[must_use]
    pub fn bprm_vma(&self) -> Option<&Vma> {
        self.bprm_chain.last()
    }

    /// Does an event at `start` (kernel struct `vma_addr`) refer to the
    /// out-of-band stack VMA?
    #[must_use]
    pub fn touches_bprm(&self, start: u64, vma_addr: u64) -> bool {
        self.bprm_vma()
            .is_some_and(|bprm| bprm.start == start || self.bprm_kaddr == Some(vma_addr))
    }

    pub fn hold_bprm(&mut self, vma: Vma, vma_addr: u64) {
        self.bprm_chain.clear();
        self.bprm_chain.push(vma);
        self.bprm_kaddr = Some(vma_addr);
    }

    /// Replace the current out-of-band VMA with `next`, closing the old one
    pub fn replace_bprm(&mut self, next: Vma, timestamp: Timestamp, op: UnmapOp) {
        if let Some(current) = self.bprm_chain.last_mut() {
            current.mark_unmapped(timestamp, op);
        }
        self.bprm_chain.push(next);
    }

    /// Move the out-of-band chain into history and make its last VMA live
    /// as of `timestamp`. Returns the length of the installed VMA.
    pub fn install_bprm(&mut self, timestamp: Timestamp) -> Option<u64> {
        let mut chain = std::mem::take(&mut self.bprm_chain);
        self.bprm_kaddr = None;
        let mut current = chain.pop()?;
        current.mapped_at = Some(timestamp);
        for superseded in chain {
            self.push_history(superseded);
        }
        for pending in &mut self.pending {
            if pending.target == PendingTarget::Bprm {
                pending.target = PendingTarget::Live;
            }
        }
        let length = current.length;
        self.insert_live(current).then_some(length)
    }

    /// The out-of-band chain goes to history without ever going live; its
    /// current version is closed as discarded. Returns whether a chain was held.
    pub fn discard_bprm(&mut self, timestamp: Timestamp) -> bool {
        let chain = std::mem::take(&mut self.bprm_chain);
        self.bprm_kaddr = None;
        self.flags.use_bprm = false;
        self.pending.retain(|p| p.target != PendingTarget::Bprm);
        let held = !chain.is_empty();
        for mut vma in chain {
            vma.mark_unmapped(timestamp, UnmapOp::Discarded);
            self.push_history(vma);
        }
        held
    }

    // =========================================================================
    // STATISTICS
    // =========================================================================

    /// Apply a VM size change, or hold it back while pairs are outstanding
    pub fn adjust_vm_size(&mut self, delta: i64, timestamp: Timestamp) {
        if !self.pending.is_empty() {
            self.deferred_delta += delta;
            return;
        }
        let total = delta + std::mem::take(&mut self.deferred_delta);
        let size = i128::from(self.stats.total_vm_size) + i128::from(total);
        self.stats.total_vm_size = u64::try_from(size.max(0)).unwrap_or(u64::MAX);
        if self.stats.total_vm_size > self.stats.max_vm_size {
            self.stats.max_vm_size = self.stats.total_vm_size;
            self.stats.max_vm_size_ts = timestamp;
        }
    }

    pub fn set_rss(&mut self, rss_type: RssType, pages: u64, timestamp: Timestamp) {
        self.stats.rss_from_stat = true;
        self.stats.rss[rss_type.index()] = pages;
        self.update_rss_max(timestamp);
    }

    /// Count a newly mapped page against the VMA at `start`
    pub fn record_page_mapped(&mut self, start: u64, rss_type: RssType, timestamp: Timestamp) {
        self.stats.pages_mapped += 1;
        *self.vma_pages.entry(start).or_default() += 1;
        *self.quantum_pages.entry(start).or_default() += 1;
        if !self.stats.rss_from_stat {
            self.stats.rss[rss_type.index()] += 1;
            self.update_rss_max(timestamp);
        }
    }

    #[must_use]
    pub fn rss_total(&self) -> u64 {
        self.stats.rss.iter().sum()
    }

    fn update_rss_max(&mut self, timestamp: Timestamp) {
        let total = self.rss_total();
        if total > self.stats.max_rss {
            self.stats.max_rss = total;
            self.stats.max_rss_ts = timestamp;
        }
    }

    #[must_use]
    pub fn pages_of(&self, start: u64) -> u64 {
        self.vma_pages.get(&start).copied().unwrap_or(0)
    }

    /// Close a scheduling quantum: add CPU time and return the pages mapped
    /// during it.
    pub fn flush_quantum(&mut self, duration_ns: u64) -> u64 {
        self.stats.cpu_time_ns += duration_ns;
        self.stats.quanta += 1;
        self.quantum_pages.drain().map(|(_, pages)| pages).sum()
    }
}
