//! Replay engine
//!
//! # Architecture
//!
//! [`Engine`] owns every piece of mutable replay state: the process table,
//! per-CPU quanta, the symbol resolver, collected diagnostics and
//! checkpoints. It consumes one [`TraceStream`] in file order and reports
//! plot-worthy changes to a [`PlotEventSink`].
//!
//! ## Data Flow
//!
//! ```text
//! trace line
//!     │
//!     ├──► LineParser ──► EventFamily
//!     │                      │
//!     │      mmap_vma_* ─────┼──► fork/exec gate ──► stack attribution ──► VMA tables
//!     │      pte / rss ──────┼──► page and RSS counters
//!     │      sched_switch ───┼──► CPU quanta
//!     │      marker ─────────┴──► checkpoint snapshots
//!     │
//!     └──► PlotEventSink.consume()
//! ```
//!
//! VMA event semantics live in `vma_events`; this file holds dispatch and
//! the other event families.

use std::time::Instant;

use log::{debug, error, info};
use vmatrace_common::{RssType, PAGE_SIZE};

use super::checkpoint::{checkpoint_name, Checkpoint, GroupSnapshot};
use super::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use super::stats::{display_statistics, ReplayStats};
use crate::classification::classify_vma;
use crate::config::{AnalyzerConfig, Strictness};
use crate::domain::{CpuId, ParseError, ReplayError, Tgid, Timestamp};
use crate::plot::{PlotEvent, PlotEventSink};
use crate::process::{CpuTracker, ProcessGroup, ProcessTracker, RunningTask};
use crate::symbolization::{ResolverStats, SymbolResolver};
use crate::trace::{
    classify_event, EventFamily, EventLine, LineParser, PayloadParser, TraceLine, TraceStream,
};

pub(super) const EMITTER: &str = "engine";
const PARSER: &str = "parser";
const FORK_EXEC: &str = "forkexec";

/// Everything a finished replay produced
#[derive(Debug)]
pub struct Analysis<K> {
    pub processes: ProcessTracker,
    /// Groups with at least one relevant member, by root tgid
    pub groups: Vec<ProcessGroup>,
    pub checkpoints: Vec<Checkpoint>,
    pub diagnostics: Vec<Diagnostic>,
    pub stats: ReplayStats,
    pub resolver_stats: ResolverStats,
    /// Latest timestamp seen in the trace
    pub end: Timestamp,
    pub sink: K,
}

pub struct Engine<K: PlotEventSink> {
    pub(super) config: AnalyzerConfig,
    pub(super) lines: LineParser,
    pub(super) payloads: PayloadParser,
    pub(super) processes: ProcessTracker,
    pub(super) cpus: CpuTracker,
    pub(super) resolver: SymbolResolver,
    pub(super) sink: K,
    pub(super) diagnostics: Diagnostics,
    pub(super) checkpoints: Vec<Checkpoint>,
    pub(super) stats: ReplayStats,
    pub(super) last_timestamp: Timestamp,
    started: Instant,
}

impl<K: PlotEventSink> Engine<K> {
    pub fn new(config: AnalyzerConfig, sink: K) -> Self {
        let resolver = SymbolResolver::new(config.effective_resolver(), config.addr2line.clone());
        Self {
            config,
            lines: LineParser::new(),
            payloads: PayloadParser::new(),
            processes: ProcessTracker::new(),
            cpus: CpuTracker::new(),
            resolver,
            sink,
            diagnostics: Diagnostics::new(),
            checkpoints: Vec::new(),
            stats: ReplayStats::default(),
            last_timestamp: Timestamp::ZERO,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Register symbol sources before the replay starts
    pub fn resolver_mut(&mut self) -> &mut SymbolResolver {
        &mut self.resolver
    }

    #[must_use]
    pub fn processes(&self) -> &ProcessTracker {
        &self.processes
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.diagnostics.entries()
    }

    #[must_use]
    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    /// Replay every line of `stream`.
    ///
    /// # Errors
    /// Returns `ReplayError::Io` when the stream cannot be read or rewound
    /// and `ReplayError::Inconsistent` when a strict-mode invariant breaks.
    pub fn run<S: TraceStream>(&mut self, stream: &mut S) -> Result<(), ReplayError> {
        while let Some((line_no, text)) = stream.next_line()? {
            self.stats.lines += 1;
            match self.lines.parse_line(&text) {
                Ok(TraceLine::Event(event)) => self.handle_event(stream, line_no, &event)?,
                Ok(TraceLine::Unknown) => {
                    let shown: String = text.chars().take(80).collect();
                    self.diagnostics.record(
                        line_no,
                        PARSER,
                        None,
                        DiagnosticKind::UnknownLine,
                        format!("unrecognized line: {shown}"),
                    );
                }
                Ok(line) if line.is_stack() => self.stats.stack_lines += 1,
                Ok(_) => {}
                Err(e) => self.malformed(line_no, None, &e),
            }
        }
        Ok(())
    }

    fn handle_event<S: TraceStream>(
        &mut self,
        stream: &mut S,
        line_no: u64,
        event: &EventLine,
    ) -> Result<(), ReplayError> {
        self.stats.events += 1;
        self.last_timestamp = self.last_timestamp.max(event.timestamp);

        match classify_event(&event.name) {
            EventFamily::Mmap(kind) => {
                self.stats.vma_events += 1;
                self.handle_mmap(stream, line_no, event, kind)?;
            }
            EventFamily::SimToggle(enable) => self.handle_sim_toggle(event, enable),
            EventFamily::PteMapped => {
                self.stats.pte_events += 1;
                if self.config.pages {
                    self.handle_pte_mapped(line_no, event);
                }
            }
            EventFamily::PteOther => self.stats.pte_events += 1,
            EventFamily::SchedSwitch => {
                self.stats.sched_switches += 1;
                self.handle_sched_switch(line_no, event);
            }
            EventFamily::Checkpoint => {
                self.stats.checkpoints += 1;
                self.handle_checkpoint(event);
            }
            EventFamily::RssStat => self.handle_rss_stat(line_no, event),
            EventFamily::Other => self.stats.other_events += 1,
        }
        Ok(())
    }

    // =========================================================================
    // SHARED HELPERS
    // =========================================================================

    /// Is `tgid` a target or descended from one?
    pub(super) fn is_relevant(&self, tgid: Tgid) -> bool {
        self.config
            .targets
            .as_ref()
            .map_or(true, |targets| self.processes.is_descendant_of_any(tgid, targets))
    }

    pub(super) fn emit(&mut self, tgid: Tgid, event: PlotEvent) {
        let appname = match &self.config.app {
            Some(app) => app.clone(),
            None => self.processes.label(self.processes.root_of(tgid)),
        };
        self.sink.consume(&event, tgid, &appname);
    }

    /// Emit the VMA count and VM size of `tgid`
    pub(super) fn emit_sizes(&mut self, tgid: Tgid, timestamp: Timestamp) {
        let Some(process) = self.processes.get(tgid) else { return };
        let count = process.counted_vma_count();
        let bytes = process.stats.total_vm_size;
        self.emit(tgid, PlotEvent::VmaCount { timestamp, count });
        self.emit(tgid, PlotEvent::VmSize { timestamp, bytes });
    }

    /// Handle state that contradicts an event.
    ///
    /// Fatal for fully observed processes in strict mode; otherwise a
    /// diagnostic is recorded and the caller skips the event. Either way
    /// the diagnostic list names it.
    pub(super) fn inconsistency(&mut self, line_no: u64, tgid: Tgid, message: String) -> Result<(), ReplayError> {
        let fully_observed = self.processes.get(tgid).is_some_and(|p| !p.is_partial());
        if fully_observed && self.config.strictness == Strictness::Strict {
            // kept so the diagnostics file of an aborted run names the cause
            self.diagnostics.push(Diagnostic {
                line: line_no,
                emitter: EMITTER,
                tgid: Some(tgid),
                kind: DiagnosticKind::InconsistentState,
                message: message.clone(),
            });
            let err = ReplayError::Inconsistent { line: line_no, tgid, emitter: EMITTER, message };
            error!("{err}");
            return Err(err);
        }
        self.diagnostics.record(line_no, EMITTER, Some(tgid), DiagnosticKind::InconsistentState, message);
        Ok(())
    }

    pub(super) fn malformed(&mut self, line_no: u64, tgid: Option<Tgid>, err: &ParseError) {
        self.diagnostics.record(line_no, PARSER, tgid, DiagnosticKind::MalformedLine, err.to_string());
    }

    // =========================================================================
    // NON-VMA EVENTS
    // =========================================================================

    fn handle_sim_toggle(&mut self, event: &EventLine, enable: bool) {
        let tgid = self
            .payloads
            .parse_sim_toggle(&event.payload)
            .unwrap_or_else(|| self.processes.tgid_of(event.pid));
        let process = self.processes.get_or_create(tgid);
        process.sim_disabled = !enable;
        debug!("tgid {tgid}: VMA simulation {}", if enable { "enabled" } else { "disabled" });
    }

    fn handle_pte_mapped(&mut self, line_no: u64, event: &EventLine) {
        let payload = match self.payloads.parse_pte_mapped(&event.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.malformed(line_no, None, &e);
                return;
            }
        };
        let tgid = payload.mmap.tgid;
        if !self.processes.contains(tgid) || !self.is_relevant(tgid) {
            return;
        }
        let Some(process) = self.processes.get_mut(tgid) else { return };
        if process.sim_disabled || !payload.is_new_page() {
            return;
        }

        let start = payload.mmap.start;
        let owner = process
            .live_vma(start)
            .or_else(|| process.bprm_vma().filter(|bprm| bprm.start == start));
        let Some(vma) = owner else {
            self.diagnostics.record(
                line_no,
                EMITTER,
                Some(tgid),
                DiagnosticKind::InconsistentState,
                format!("page mapped in unknown VMA at 0x{start:x}"),
            );
            return;
        };

        let kind = classify_vma(vma.perms, vma.filename());
        let rss_type = match (vma.perms.file_backed, vma.perms.shared) {
            (true, _) => RssType::File,
            (false, true) => RssType::Shmem,
            (false, false) => RssType::Anon,
        };
        process.record_page_mapped(start, rss_type, event.timestamp);
        let rss = (!process.stats.rss_from_stat).then_some(process.stats.rss);

        let timestamp = event.timestamp;
        self.emit(tgid, PlotEvent::PageMapped { timestamp, kind, major: payload.is_major });
        if let Some(pages) = rss {
            self.emit(tgid, PlotEvent::Rss { timestamp, pages });
        }
    }

    fn handle_rss_stat(&mut self, line_no: u64, event: &EventLine) {
        let payload = match self.payloads.parse_rss_stat(&event.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.malformed(line_no, None, &e);
                return;
            }
        };
        if !payload.curr {
            return;
        }
        let tgid = self.processes.tgid_of(event.pid);
        if !self.processes.contains(tgid) || !self.is_relevant(tgid) {
            return;
        }
        let Some(process) = self.processes.get_mut(tgid) else { return };
        process.set_rss(payload.rss_type, payload.size_bytes / PAGE_SIZE, event.timestamp);
        let pages = process.stats.rss;
        self.emit(tgid, PlotEvent::Rss { timestamp: event.timestamp, pages });
    }

    fn handle_sched_switch(&mut self, line_no: u64, event: &EventLine) {
        let payload = match self.payloads.parse_sched_switch(&event.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.malformed(line_no, None, &e);
                return;
            }
        };

        // Without tgid fields the parser falls back to the pid
        let next_tgid = if payload.next_tgid == Tgid::from(payload.next_pid) {
            self.processes.tgid_of(payload.next_pid)
        } else {
            self.processes.note_thread(payload.next_pid, payload.next_tgid);
            payload.next_tgid
        };

        let next = RunningTask { pid: payload.next_pid, tgid: next_tgid, since: event.timestamp };
        if let Some(prev) = self.cpus.switch(event.cpu, next) {
            if prev.pid != payload.prev_pid {
                debug!(
                    "{}: switched out pid {} but pid {} was running",
                    event.cpu, payload.prev_pid, prev.pid
                );
            }
            self.end_quantum(event.cpu, prev, event.timestamp);
        }
    }

    fn end_quantum(&mut self, cpu: CpuId, task: RunningTask, end: Timestamp) {
        if task.pid.0 == 0 || !self.processes.contains(task.tgid) || !self.is_relevant(task.tgid) {
            return;
        }
        let Some(process) = self.processes.get_mut(task.tgid) else { return };
        let pages_mapped = process.flush_quantum(end.saturating_since(task.since));
        self.emit(task.tgid, PlotEvent::Quantum { cpu, start: task.since, end, pages_mapped });
    }

    fn handle_checkpoint(&mut self, event: &EventLine) {
        let timestamp = event.timestamp;
        let name = checkpoint_name(&event.payload, self.checkpoints.len() + 1, &self.checkpoints);
        let appname = self.config.app.clone().unwrap_or_else(|| event.task.clone());

        let groups = self.relevant_groups();
        let snapshots: Vec<GroupSnapshot> = groups
            .iter()
            .map(|group| {
                let mut snapshot = GroupSnapshot::take(&self.processes, group, timestamp);
                snapshot.interval = group
                    .members
                    .iter()
                    .filter_map(|&tgid| self.processes.get(tgid))
                    .flat_map(|p| p.checkpoint_vmas().cloned())
                    .collect();
                snapshot
            })
            .collect();

        for process in self.processes.iter_mut() {
            process.reset_checkpoint();
        }
        for group in &groups {
            self.emit(group.root, PlotEvent::Checkpoint { timestamp, name: name.clone() });
        }

        info!("checkpoint '{name}' at {timestamp}: {} groups", snapshots.len());
        self.checkpoints.push(Checkpoint { timestamp, appname, name, groups: snapshots });
    }

    fn relevant_groups(&self) -> Vec<ProcessGroup> {
        self.processes
            .groups()
            .into_iter()
            .filter(|group| group.members.iter().any(|&tgid| self.is_relevant(tgid)))
            .collect()
    }

    // =========================================================================
    // END OF TRACE
    // =========================================================================

    /// Close open quanta, report unbalanced pairs, shut resolvers down and
    /// hand over the results.
    pub fn finish(mut self) -> Analysis<K> {
        let end = self.last_timestamp;

        let running: Vec<(CpuId, RunningTask)> = self.cpus.drain().collect();
        for (cpu, task) in running {
            self.end_quantum(cpu, task, end);
        }

        let mut unbalanced = Vec::new();
        for process in self.processes.iter_mut() {
            let Some(first) = process.pending.front().copied() else { continue };
            unbalanced.push((process.tgid, first, process.pending.len()));
            process.pending.clear();
            // releases any deferred size change
            process.adjust_vm_size(0, end);
        }
        for (tgid, first, count) in unbalanced {
            self.diagnostics.record(
                first.line,
                EMITTER,
                Some(tgid),
                DiagnosticKind::UnbalancedPair,
                format!(
                    "{count} unmap(s) without remap at end of trace, first: {:?} of 0x{:x}",
                    first.op, first.start
                ),
            );
        }

        let mut incomplete = Vec::new();
        for process in self.processes.iter_mut() {
            let Some(bprm) = process.bprm_vma().map(|vma| vma.start) else { continue };
            process.discard_bprm(end);
            // releases any size change held behind the dropped pairs
            process.adjust_vm_size(0, end);
            incomplete.push((process.tgid, bprm));
        }
        for (tgid, start) in incomplete {
            self.diagnostics.record(
                self.stats.lines,
                FORK_EXEC,
                Some(tgid),
                DiagnosticKind::ExecIncomplete,
                format!("trace ends while the exec stack VMA at 0x{start:x} is held; recorded as discarded"),
            );
        }

        self.resolver.close();
        let resolver_stats = self.resolver.stats();
        display_statistics(&self.stats, resolver_stats);
        info!(
            "{} processes, {} checkpoints, {} diagnostics in {:.2}s",
            self.processes.len(),
            self.checkpoints.len(),
            self.diagnostics.entries().len(),
            self.started.elapsed().as_secs_f64()
        );

        let groups = self.relevant_groups();
        Analysis {
            processes: self.processes,
            groups,
            checkpoints: self.checkpoints,
            diagnostics: self.diagnostics.into_entries(),
            stats: self.stats,
            resolver_stats,
            end,
            sink: self.sink,
        }
    }
}

/// Replay `stream` to the end with a fresh engine.
///
/// # Errors
/// See [`Engine::run`].
pub fn replay<S: TraceStream, K: PlotEventSink>(
    config: AnalyzerConfig,
    stream: &mut S,
    sink: K,
) -> Result<Analysis<K>, ReplayError> {
    let mut engine = Engine::new(config, sink);
    engine.run(stream)?;
    Ok(engine.finish())
}
