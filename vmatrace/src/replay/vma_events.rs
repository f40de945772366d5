//! `mmap_vma_*` event semantics
//!
//! | Event | Effect |
//! |---|---|
//! | alloc, alloc_dup_mmap | insert a new VMA in the live table |
//! | free | remove the VMA at the start address (`unmap_op = free`) |
//! | `*_unmap` | remember the pair; the live table is untouched |
//! | `*_remap` | close the open pair of the same kind and VMA struct (else the oldest of that kind): old VMA out, new VMA in |
//!
//! Resize and relocation pairs may move the VMA; access and flag changes
//! must not. VM size changes are held back while any pair is open.

use log::debug;
use vmatrace_common::kernel_fn;

use super::diagnostics::DiagnosticKind;
use super::engine::Engine;
use super::fork_exec::{exec_follows_fork, is_dup_event, Gate, GateInput, Lookahead};
use super::stack_attributor::{collect_user_stack, Creator, StackAttributor, StackScan};
use crate::classification::classify_vma;
use crate::domain::{ReplayError, Tgid, Timestamp};
use crate::plot::{PlotEvent, PlotEventSink};
use crate::process::{PendingTarget, PendingUnmap};
use crate::trace::{EventLine, MmapEvent, MmapPayload, TraceStream};
use crate::vma::{PairOp, UnmapOp, Vma, VmaOp};

const STACKS: &str = "stacks";
const RESOLVER: &str = "resolver";
const FORK_EXEC: &str = "forkexec";

fn signed(length: u64) -> i64 {
    i64::try_from(length).unwrap_or(i64::MAX)
}

fn operation_event(vma: &Vma) -> PlotEvent {
    PlotEvent::Operation {
        timestamp: vma.timestamp,
        op: vma.op,
        kind: classify_vma(vma.perms, vma.filename()),
        length: vma.length,
        module: vma.creator_module.clone(),
    }
}

impl<K: PlotEventSink> Engine<K> {
    pub(super) fn handle_mmap<S: TraceStream>(
        &mut self,
        stream: &mut S,
        line_no: u64,
        event: &EventLine,
        kind: MmapEvent,
    ) -> Result<(), ReplayError> {
        let payload = match self.payloads.parse_mmap(&event.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.malformed(line_no, None, &e);
                return Ok(());
            }
        };
        let perms = match payload.perms_key() {
            Ok(perms) => perms,
            Err(e) => {
                self.malformed(line_no, Some(payload.tgid), &e);
                return Ok(());
            }
        };

        let tgid = payload.tgid;
        self.processes.note_thread(payload.pid, tgid);
        let process = self.processes.get_or_create(tgid);
        // Messages of other threads may carry a stale comm
        if event.pid == payload.pid && process.progname.as_deref() != Some(event.task.as_str()) {
            process.progname = Some(event.task.clone());
        }

        let is_dup = is_dup_event(&event.name, &payload);
        if is_dup && !process.flags.saw_fork {
            self.note_fork(stream, line_no, &payload)?;
        }

        if !self.is_relevant(tgid) {
            self.stats.filtered += 1;
            return Ok(());
        }

        let Some(process) = self.processes.get_mut(tgid) else { return Ok(()) };
        if process.sim_disabled {
            process.stats.elided_events += 1;
            self.stats.sim_disabled += 1;
            return Ok(());
        }

        let touches_bprm = match kind {
            MmapEvent::Remap(op) => process
                .matching_pending(op, payload.vma_addr)
                .and_then(|idx| process.pending.get(idx))
                .is_some_and(|p| p.target == PendingTarget::Bprm),
            _ => process.touches_bprm(payload.start, payload.vma_addr),
        };
        let gate = process.flags.gate(GateInput {
            kernel_fn: &payload.kernel_fn,
            is_dup,
            live_empty: process.live_count() == 0,
            touches_bprm,
        });
        if gate == Gate::Suppress {
            process.stats.elided_events += 1;
            self.stats.elided += 1;
            return Ok(());
        }

        let creates_vma = matches!(kind, MmapEvent::Alloc { .. } | MmapEvent::Remap(_));
        let creator = if self.config.userstacks && creates_vma {
            self.attribute_stack(stream, line_no, event, &payload)?
        } else {
            Creator::default()
        };

        if gate == Gate::InstallBprmThenApply {
            self.install_bprm(tgid, event.timestamp);
        }

        let vma = Vma {
            tgid,
            start: payload.start,
            length: payload.length(),
            perms,
            backing: payload.backing.clone(),
            op: VmaOp::Alloc,
            timestamp: event.timestamp,
            creator_module: creator.module,
            creator_fn: creator.function,
            kernel_fn: payload.kernel_fn.clone(),
            mapped_at: None,
            unmap: None,
        };
        let to_bprm = gate == Gate::ApplyToBprm;
        match kind {
            MmapEvent::Alloc { .. } => self.apply_alloc(line_no, vma, payload.vma_addr),
            MmapEvent::Free => self.apply_free(line_no, &vma, to_bprm),
            MmapEvent::Unmap(op) => self.apply_unmap(line_no, &vma, op, payload.vma_addr, to_bprm),
            MmapEvent::Remap(op) => self.apply_remap(line_no, vma, op, payload.vma_addr),
        }
    }

    /// First `dup_mmap` of a child: link it to its parent and look ahead
    /// for an exec
    fn note_fork<S: TraceStream>(
        &mut self,
        stream: &mut S,
        line_no: u64,
        payload: &MmapPayload,
    ) -> Result<(), ReplayError> {
        let child = payload.tgid;
        self.processes.link_child(payload.ptgid, child, self.config.group);
        if let Some(process) = self.processes.get_mut(child) {
            process.flags.saw_fork = true;
        }
        if !self.is_relevant(child) {
            return Ok(());
        }

        let lookahead = exec_follows_fork(stream, &self.lines, &self.payloads, child)?;
        if lookahead == Lookahead::EndOfTrace {
            self.diagnostics.record(
                line_no,
                FORK_EXEC,
                Some(child),
                DiagnosticKind::LookaheadEof,
                "trace ends inside the fork copy; assuming no exec follows",
            );
        }
        debug!("tgid {child}: forked from {}, exec follows: {}", payload.ptgid, lookahead.exec_follows());
        if let Some(process) = self.processes.get_mut(child) {
            process.flags.exec_follows_fork = lookahead.exec_follows();
        }
        Ok(())
    }

    fn attribute_stack<S: TraceStream>(
        &mut self,
        stream: &mut S,
        line_no: u64,
        event: &EventLine,
        payload: &MmapPayload,
    ) -> Result<Creator, ReplayError> {
        let tgid = payload.tgid;
        let stack = match collect_user_stack(stream, &self.lines, event)? {
            StackScan::Found(stack) => stack,
            StackScan::Missing => {
                self.diagnostics.record(
                    line_no,
                    STACKS,
                    Some(tgid),
                    DiagnosticKind::StackMismatch,
                    format!("no user stack follows {}", event.name),
                );
                return Ok(Creator::default());
            }
            StackScan::TaskMismatch { found } => {
                self.diagnostics.record(
                    line_no,
                    STACKS,
                    Some(tgid),
                    DiagnosticKind::StackMismatch,
                    format!("stack after {} belongs to {found}, not {}", event.name, event.task),
                );
                return Ok(Creator::default());
            }
        };

        let Some(process) = self.processes.get_mut(tgid) else { return Ok(Creator::default()) };
        if payload.kernel_fn == kernel_fn::BPRM_MM_INIT {
            process.exec_ip = stack.top_ip();
        }

        let attribution = StackAttributor::new(&mut self.resolver, self.config.functions).attribute(&stack, process);
        for failure in attribution.failures {
            self.diagnostics.record(line_no, RESOLVER, Some(tgid), DiagnosticKind::ResolverFailure, failure.to_string());
        }
        self.stats.stacks_attributed += 1;
        Ok(attribution.creator)
    }

    // =========================================================================
    // LIVE TABLE EDITS
    // =========================================================================

    fn map_live(&mut self, vma: Vma) -> bool {
        let tgid = vma.tgid;
        let event = operation_event(&vma);
        let heap_end = vma.kernel_fn.contains("brk").then(|| vma.end());
        let process = self.processes.get_or_create(tgid);
        if !process.insert_live(vma) {
            return false;
        }
        if heap_end.is_some() {
            process.brk = heap_end;
        }
        self.emit(tgid, event);
        true
    }

    /// Remove a live VMA, emitting its unmap. Returns its length.
    fn unmap_live(&mut self, tgid: Tgid, start: u64, timestamp: Timestamp, op: UnmapOp) -> Option<u64> {
        let vma = self.processes.get_mut(tgid)?.remove_live(start, timestamp, op)?;
        let length = vma.length;
        let event = PlotEvent::Unmapped {
            timestamp,
            op,
            kind: classify_vma(vma.perms, vma.filename()),
            length,
            lifetime_ns: timestamp.saturating_since(vma.timestamp),
        };
        self.emit(tgid, event);
        Some(length)
    }

    fn adjust_size(&mut self, tgid: Tgid, delta: i64, timestamp: Timestamp) {
        if let Some(process) = self.processes.get_mut(tgid) {
            process.adjust_vm_size(delta, timestamp);
        }
    }

    fn live_length(&self, tgid: Tgid, start: u64) -> Option<u64> {
        self.processes.get(tgid)?.live_vma(start).map(|vma| vma.length)
    }

    fn install_bprm(&mut self, tgid: Tgid, timestamp: Timestamp) {
        let Some(process) = self.processes.get_mut(tgid) else { return };
        match process.install_bprm(timestamp) {
            Some(length) => {
                process.adjust_vm_size(signed(length), timestamp);
                debug!("tgid {tgid}: old image gone, exec stack VMA installed");
            }
            None => debug!("tgid {tgid}: no exec stack VMA to install"),
        }
    }

    // =========================================================================
    // EVENT SEMANTICS
    // =========================================================================

    fn apply_alloc(&mut self, line_no: u64, vma: Vma, vma_addr: u64) -> Result<(), ReplayError> {
        let (tgid, start, timestamp) = (vma.tgid, vma.start, vma.timestamp);

        if vma.kernel_fn == kernel_fn::BPRM_MM_INIT {
            let Some(process) = self.processes.get_mut(tgid) else { return Ok(()) };
            process.flags.saw_exec = true;
            if process.live_count() > 0 {
                debug!("tgid {tgid}: holding exec stack VMA at 0x{start:x} until the old image is gone");
                process.flags.use_bprm = true;
                let event = operation_event(&vma);
                process.hold_bprm(vma, vma_addr);
                self.emit(tgid, event);
                return Ok(());
            }
        }

        if self.live_length(tgid, start).is_some() {
            self.inconsistency(line_no, tgid, format!("alloc over live VMA at 0x{start:x}"))?;
            if let Some(length) = self.unmap_live(tgid, start, timestamp, UnmapOp::Free) {
                self.adjust_size(tgid, -signed(length), timestamp);
            }
        }

        let length = vma.length;
        if self.map_live(vma) {
            self.adjust_size(tgid, signed(length), timestamp);
        }
        self.emit_sizes(tgid, timestamp);
        Ok(())
    }

    fn apply_free(&mut self, line_no: u64, vma: &Vma, to_bprm: bool) -> Result<(), ReplayError> {
        let (tgid, start, timestamp) = (vma.tgid, vma.start, vma.timestamp);

        if to_bprm {
            if let Some(process) = self.processes.get_mut(tgid) {
                process.discard_bprm(timestamp);
            }
            debug!("tgid {tgid}: exec stack VMA at 0x{start:x} freed before it was installed");
            return Ok(());
        }

        let Some(live_length) = self.live_length(tgid, start) else {
            return self.inconsistency(line_no, tgid, format!("free of unknown VMA at 0x{start:x}"));
        };
        if live_length != vma.length {
            debug!(
                "tgid {tgid}: free of 0x{start:x} names length 0x{:x}, live VMA has 0x{live_length:x}",
                vma.length
            );
        }
        self.unmap_live(tgid, start, timestamp, UnmapOp::Free);
        self.adjust_size(tgid, -signed(live_length), timestamp);
        self.emit_sizes(tgid, timestamp);
        Ok(())
    }

    fn apply_unmap(
        &mut self,
        line_no: u64,
        vma: &Vma,
        op: PairOp,
        vma_addr: u64,
        to_bprm: bool,
    ) -> Result<(), ReplayError> {
        let (tgid, start) = (vma.tgid, vma.start);
        let target = if to_bprm {
            PendingTarget::Bprm
        } else if self.live_length(tgid, start).is_some() {
            PendingTarget::Live
        } else {
            return self.inconsistency(
                line_no,
                tgid,
                format!("{} unmap of unknown VMA at 0x{start:x}", VmaOp::from(op)),
            );
        };

        if let Some(process) = self.processes.get_mut(tgid) {
            process.pending.push_back(PendingUnmap { op, start, length: vma.length, vma_addr, line: line_no, target });
        }
        Ok(())
    }

    fn apply_remap(&mut self, line_no: u64, mut vma: Vma, op: PairOp, vma_addr: u64) -> Result<(), ReplayError> {
        let (tgid, timestamp) = (vma.tgid, vma.timestamp);
        vma.op = VmaOp::from(op);

        let Some(process) = self.processes.get_mut(tgid) else { return Ok(()) };
        let Some(pending) = process
            .matching_pending(op, vma_addr)
            .and_then(|idx| process.pending.remove(idx))
        else {
            return self.inconsistency(
                line_no,
                tgid,
                format!("{} remap at 0x{:x} without a matching unmap", vma.op, vma.start),
            );
        };

        if !op.may_move() && vma.start != pending.start {
            return self.inconsistency(
                line_no,
                tgid,
                format!("{} moved VMA from 0x{:x} to 0x{:x}", vma.op, pending.start, vma.start),
            );
        }

        if pending.target == PendingTarget::Bprm {
            let event = operation_event(&vma);
            if let Some(process) = self.processes.get_mut(tgid) {
                process.replace_bprm(vma, timestamp, UnmapOp::from(op));
            }
            self.emit(tgid, event);
            return Ok(());
        }

        let Some(old_length) = self.live_length(tgid, pending.start) else {
            return self.inconsistency(
                line_no,
                tgid,
                format!("VMA at 0x{:x} vanished before its {} remap", pending.start, vma.op),
            );
        };
        self.unmap_live(tgid, pending.start, timestamp, UnmapOp::from(op));

        if self.live_length(tgid, vma.start).is_some() {
            self.inconsistency(line_no, tgid, format!("{} remap onto live VMA at 0x{:x}", vma.op, vma.start))?;
            if let Some(length) = self.unmap_live(tgid, vma.start, timestamp, UnmapOp::Free) {
                self.adjust_size(tgid, -signed(length), timestamp);
            }
        }

        let new_length = vma.length;
        if self.map_live(vma) {
            self.adjust_size(tgid, signed(new_length) - signed(old_length), timestamp);
        } else {
            self.adjust_size(tgid, -signed(old_length), timestamp);
        }
        self.emit_sizes(tgid, timestamp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalyzerConfig, Strictness};
    use crate::plot::EventLog;
    use crate::replay::diagnostics::Diagnostic;
    use crate::replay::engine::{replay, Analysis};
    use crate::trace::MemoryStream;

    /// `mmap_vma_*` line at `100 s + us` for a process whose parent is 1.
    /// The kernel struct address is derived from the start.
    fn mmap(us: u32, event: &str, tgid: u32, kfn: &str, range: (u64, u64), perms: &str, file: &str) -> String {
        let inode = if file.is_empty() { 0 } else { 42 };
        format!(
            "app-{tgid} [000] .... 100.{us:06}: {event}: pid={tgid} tgid={tgid} ptgid=1 [{kfn}]: ffff8800{:08x} @ {:x}-{:x} {perms} 0 00:00 {inode} {file}",
            range.0 >> 12,
            range.0,
            range.1
        )
    }

    fn run(config: AnalyzerConfig, lines: &[String]) -> Result<Analysis<EventLog>, ReplayError> {
        let mut stream = MemoryStream::new(&lines.join("\n"));
        replay(config, &mut stream, EventLog::new())
    }

    fn run_ok(lines: &[String]) -> Analysis<EventLog> {
        run(AnalyzerConfig::default(), lines).unwrap()
    }

    fn lenient() -> AnalyzerConfig {
        AnalyzerConfig { strictness: Strictness::Lenient, ..AnalyzerConfig::default() }
    }

    /// A process that has exec'd, so strict mode applies to it
    fn exec_prologue(tgid: u32) -> String {
        mmap(1, "mmap_vma_alloc", tgid, "__bprm_mm_init", (0x7ffd_0000, 0x7ffe_0000), "rw-p", "")
    }

    #[test]
    fn test_alloc_then_free() {
        let a = run_ok(&[
            mmap(1, "mmap_vma_alloc_dup_mmap", 100, "dup_mmap", (0x40_0000, 0x40_1000), "r-xp", "/bin/hello"),
            mmap(2, "mmap_vma_free", 100, "unmap_region", (0x40_0000, 0x40_1000), "r-xp", "/bin/hello"),
        ]);
        let p = a.processes.get(Tgid(100)).unwrap();
        assert_eq!(p.live_count(), 0);
        assert_eq!(p.history().len(), 1);
        assert_eq!(p.history()[0].unmap.unwrap().op, UnmapOp::Free);
        assert_eq!(p.stats.max_vma_count, 1);
        assert_eq!(p.stats.total_vm_size, 0);
        assert!(p.flags.saw_fork);
    }

    #[test]
    fn test_resize_pair() {
        let a = run_ok(&[
            exec_prologue(100),
            mmap(2, "mmap_vma_alloc", 100, "mmap_region", (0x1000, 0x2000), "rw-p", ""),
            mmap(3, "mmap_vma_resize_unmap", 100, "vma_expand", (0x1000, 0x2000), "rw-p", ""),
            mmap(4, "mmap_vma_resize_remap", 100, "vma_expand", (0x1000, 0x3000), "rw-p", ""),
        ]);
        let p = a.processes.get(Tgid(100)).unwrap();
        assert_eq!(p.live_count(), 2);
        let resized = p.live_vma(0x1000).unwrap();
        assert_eq!(resized.length, 0x2000);
        assert_eq!(resized.op, VmaOp::Resize);
        assert_eq!(p.history()[1].unmap.unwrap().op, UnmapOp::Resize);
        assert_eq!(p.stats.total_vm_size, 0x1_0000 + 0x2000);
        assert!(p.pending.is_empty());
    }

    #[test]
    fn test_size_change_waits_for_open_pairs() {
        let a = run_ok(&[
            exec_prologue(100),
            mmap(2, "mmap_vma_alloc", 100, "mmap_region", (0x1000, 0x2000), "rw-p", ""),
            mmap(3, "mmap_vma_alloc", 100, "mmap_region", (0x8000, 0x9000), "rw-p", ""),
            mmap(4, "mmap_vma_resize_unmap", 100, "vma_expand", (0x1000, 0x2000), "rw-p", ""),
            mmap(5, "mmap_vma_resize_unmap", 100, "vma_expand", (0x8000, 0x9000), "rw-p", ""),
            mmap(6, "mmap_vma_resize_remap", 100, "vma_expand", (0x1000, 0x4000), "rw-p", ""),
            mmap(7, "mmap_vma_resize_remap", 100, "vma_expand", (0x8000, 0xa000), "rw-p", ""),
        ]);
        let sizes: Vec<u64> = a
            .sink
            .for_tgid(Tgid(100))
            .filter_map(|e| match e {
                PlotEvent::VmSize { bytes, .. } => Some(*bytes),
                _ => None,
            })
            .collect();
        let base = 0x1_0000;
        // the first remap leaves a pair open, so its growth is reported with the second
        assert_eq!(sizes, vec![base, base + 0x1000, base + 0x2000, base + 0x2000, base + 0x5000]);
    }

    #[test]
    fn test_fork_then_exec_elides_copies() {
        let mut lines: Vec<String> = (0..10u64)
            .map(|i| {
                let start = 0x1000 * (i + 1) * 16;
                mmap(1, "mmap_vma_alloc_dup_mmap", 200, "dup_mmap", (start, start + 0x1000), "r--p", "/lib/libc.so.6")
            })
            .collect();
        lines.push(mmap(2, "mmap_vma_alloc", 200, "__bprm_mm_init", (0x7ffd_0000, 0x7ffe_0000), "rw-p", ""));
        let a = run_ok(&lines);

        let p = a.processes.get(Tgid(200)).unwrap();
        assert!(p.flags.saw_fork && p.flags.saw_exec);
        assert_eq!(p.live_count(), 1);
        assert_eq!(p.history().len(), 1);
        assert_eq!(p.live_vma(0x7ffd_0000).unwrap().kernel_fn, "__bprm_mm_init");
        assert_eq!(p.stats.elided_events, 10);
        assert_eq!(a.stats.elided, 10);
    }

    #[test]
    fn test_fork_without_exec_keeps_copies() {
        let a = run_ok(&[
            mmap(1, "mmap_vma_alloc_dup_mmap", 200, "dup_mmap", (0x1000, 0x2000), "rw-p", ""),
            mmap(1, "mmap_vma_alloc_dup_mmap", 200, "dup_mmap", (0x4000, 0x5000), "rw-p", ""),
            mmap(2, "mmap_vma_alloc", 200, "mmap_region", (0x9000, 0xa000), "rw-p", ""),
        ]);
        let p = a.processes.get(Tgid(200)).unwrap();
        assert!(!p.flags.exec_follows_fork);
        assert_eq!(p.live_count(), 3);
    }

    #[test]
    fn test_exec_holds_stack_until_old_image_is_gone() {
        let a = run(lenient(), &[
            mmap(1, "mmap_vma_alloc", 300, "mmap_region", (0x1000, 0x2000), "rw-p", ""),
            mmap(2, "mmap_vma_alloc", 300, "__bprm_mm_init", (0x7ffd_0000, 0x7ffe_0000), "rw-p", ""),
            mmap(3, "mmap_vma_reloc_unmap", 300, "shift_arg_pages", (0x7ffd_0000, 0x7ffe_0000), "rw-p", ""),
            mmap(4, "mmap_vma_reloc_remap", 300, "shift_arg_pages", (0x7ff0_0000, 0x7ff1_0000), "rw-p", ""),
            mmap(5, "mmap_vma_free", 300, "exit_mmap", (0x1000, 0x2000), "rw-p", ""),
            mmap(6, "mmap_vma_alloc", 300, "mmap_region", (0x40_0000, 0x40_1000), "r-xp", "/bin/app"),
        ])
        .unwrap();

        let p = a.processes.get(Tgid(300)).unwrap();
        assert!(p.bprm_vma().is_none());
        assert!(!p.flags.use_bprm);
        let live: Vec<u64> = p.live_vmas().map(|v| v.start).collect();
        assert_eq!(live, vec![0x40_0000, 0x7ff0_0000]);
        assert_eq!(p.live_vma(0x7ff0_0000).unwrap().op, VmaOp::Relocation);
        // old heap, both stack versions, the new text
        assert_eq!(p.history().len(), 4);
        assert_eq!(p.stats.total_vm_size, 0x1_0000 + 0x1000);
        assert!(a.diagnostics.is_empty());
    }

    #[test]
    fn test_exec_stack_freed_before_install_is_discarded() {
        let a = run(lenient(), &[
            mmap(1, "mmap_vma_alloc", 300, "mmap_region", (0x1000, 0x2000), "rw-p", ""),
            mmap(2, "mmap_vma_alloc", 300, "__bprm_mm_init", (0x7ffd_0000, 0x7ffe_0000), "rw-p", ""),
            mmap(3, "mmap_vma_free", 300, "exit_mmap", (0x7ffd_0000, 0x7ffe_0000), "rw-p", ""),
        ])
        .unwrap();

        let p = a.processes.get(Tgid(300)).unwrap();
        assert!(p.bprm_vma().is_none());
        assert!(!p.flags.use_bprm);
        let stack = p.history().iter().find(|v| v.start == 0x7ffd_0000).unwrap();
        assert!(!stack.was_live());
        assert_eq!(stack.unmap.unwrap().op, UnmapOp::Discarded);
        assert!(p.history().iter().filter(|v| v.unmap.is_some_and(|u| u.op == UnmapOp::Free)).all(Vma::was_live));
        let live: Vec<u64> = p.live_vmas().map(|v| v.start).collect();
        assert_eq!(live, vec![0x1000]);
        assert!(a.diagnostics.is_empty(), "{:?}", a.diagnostics);
    }

    #[test]
    fn test_exec_stack_held_at_end_of_trace_reaches_history() {
        let a = run(lenient(), &[
            mmap(1, "mmap_vma_alloc", 300, "mmap_region", (0x1000, 0x2000), "rw-p", ""),
            mmap(2, "mmap_vma_alloc", 300, "__bprm_mm_init", (0x7ffd_0000, 0x7ffe_0000), "rw-p", ""),
            mmap(3, "mmap_vma_free", 300, "exit_mmap", (0x1000, 0x2000), "rw-p", ""),
        ])
        .unwrap();

        let p = a.processes.get(Tgid(300)).unwrap();
        assert!(p.bprm_vma().is_none());
        assert_eq!(p.history().len(), 2);
        let stack = &p.history()[1];
        assert_eq!(stack.start, 0x7ffd_0000);
        assert_eq!(stack.unmap.unwrap().op, UnmapOp::Discarded);
        assert_eq!(stack.unmap.unwrap().timestamp, a.end);
        assert_eq!(p.live_count(), 0);

        let incomplete: Vec<&Diagnostic> =
            a.diagnostics.iter().filter(|d| d.kind == DiagnosticKind::ExecIncomplete).collect();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].tgid, Some(Tgid(300)));
        assert_eq!(a.diagnostics.len(), 1);
    }

    #[test]
    fn test_nested_pairs_close_by_vma_struct() {
        let a = run_ok(&[
            exec_prologue(100),
            mmap(2, "mmap_vma_alloc", 100, "mmap_region", (0x1000, 0x2000), "rw-p", ""),
            mmap(3, "mmap_vma_alloc", 100, "mmap_region", (0x8000, 0x9000), "rw-p", ""),
            mmap(4, "mmap_vma_resize_unmap", 100, "vma_expand", (0x1000, 0x2000), "rw-p", ""),
            mmap(5, "mmap_vma_resize_unmap", 100, "vma_expand", (0x8000, 0x9000), "rw-p", ""),
            mmap(6, "mmap_vma_resize_remap", 100, "vma_expand", (0x8000, 0xa000), "rw-p", ""),
            mmap(7, "mmap_vma_resize_remap", 100, "vma_expand", (0x1000, 0x3000), "rw-p", ""),
        ]);
        let p = a.processes.get(Tgid(100)).unwrap();
        assert!(p.pending.is_empty());
        assert_eq!(p.live_vma(0x1000).unwrap().length, 0x2000);
        assert_eq!(p.live_vma(0x8000).unwrap().length, 0x2000);
        assert_eq!(p.live_count(), 3);
        assert_eq!(p.stats.total_vm_size, 0x1_0000 + 0x4000);
        assert!(a.diagnostics.is_empty(), "{:?}", a.diagnostics);
    }

    #[test]
    fn test_access_change_round_trip() {
        let a = run_ok(&[
            exec_prologue(100),
            mmap(2, "mmap_vma_alloc", 100, "mmap_region", (0x1000, 0x2000), "rw-p", ""),
            mmap(3, "mmap_vma_access_unmap", 100, "mprotect_fixup", (0x1000, 0x2000), "rw-p", ""),
            mmap(4, "mmap_vma_access_remap", 100, "mprotect_fixup", (0x1000, 0x2000), "r--p", ""),
            mmap(5, "mmap_vma_access_unmap", 100, "mprotect_fixup", (0x1000, 0x2000), "r--p", ""),
            mmap(6, "mmap_vma_access_remap", 100, "mprotect_fixup", (0x1000, 0x2000), "rw-p", ""),
        ]);
        let p = a.processes.get(Tgid(100)).unwrap();
        let records: Vec<&Vma> = p.history().iter().filter(|v| v.start == 0x1000).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].perms.to_string(), "r--pa");
        assert_eq!(records[2].op, VmaOp::AccessChange);
        assert_eq!(p.live_count(), 2);
        assert!(p.live_vma(0x1000).unwrap().perms.is_writable());
    }

    #[test]
    fn test_access_change_must_not_move() {
        let lines = [
            exec_prologue(100),
            mmap(2, "mmap_vma_alloc", 100, "mmap_region", (0x1000, 0x2000), "rw-p", ""),
            mmap(3, "mmap_vma_access_unmap", 100, "mprotect_fixup", (0x1000, 0x2000), "rw-p", ""),
            mmap(4, "mmap_vma_access_remap", 100, "mprotect_fixup", (0x5000, 0x6000), "r--p", ""),
        ];
        let err = run(AnalyzerConfig::default(), &lines).unwrap_err();
        assert!(matches!(err, ReplayError::Inconsistent { line: 4, tgid: Tgid(100), .. }));
    }

    #[test]
    fn test_strict_abort_on_unknown_free() {
        let lines = [exec_prologue(100), mmap(2, "mmap_vma_free", 100, "unmap_region", (0x1000, 0x2000), "rw-p", "")];
        let err = run(AnalyzerConfig::default(), &lines).unwrap_err();
        assert!(matches!(err, ReplayError::Inconsistent { line: 2, .. }));

        let a = run(lenient(), &lines).unwrap();
        assert_eq!(a.diagnostics.len(), 1);
        assert_eq!(a.diagnostics[0].kind, DiagnosticKind::InconsistentState);
        assert_eq!(a.diagnostics[0].line, 2);
    }

    #[test]
    fn test_partial_process_only_warns() {
        let a = run_ok(&[
            mmap(1, "mmap_vma_free", 100, "unmap_region", (0x1000, 0x2000), "rw-p", ""),
            mmap(2, "mmap_vma_resize_remap", 100, "vma_expand", (0x1000, 0x3000), "rw-p", ""),
            mmap(3, "mmap_vma_access_unmap", 100, "mprotect_fixup", (0x9000, 0xa000), "rw-p", ""),
        ]);
        let kinds: Vec<DiagnosticKind> = a.diagnostics.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DiagnosticKind::InconsistentState; 3]);
        assert_eq!(a.processes.get(Tgid(100)).unwrap().live_count(), 0);
    }

    #[test]
    fn test_unbalanced_pair_reported_once() {
        let a = run_ok(&[
            exec_prologue(100),
            mmap(2, "mmap_vma_alloc", 100, "mmap_region", (0x1000, 0x2000), "rw-p", ""),
            mmap(3, "mmap_vma_alloc", 100, "mmap_region", (0x4000, 0x5000), "rw-p", ""),
            mmap(4, "mmap_vma_resize_unmap", 100, "vma_expand", (0x1000, 0x2000), "rw-p", ""),
            mmap(5, "mmap_vma_reloc_unmap", 100, "move_vma", (0x4000, 0x5000), "rw-p", ""),
        ]);
        let unbalanced: Vec<&Diagnostic> =
            a.diagnostics.iter().filter(|d| d.kind == DiagnosticKind::UnbalancedPair).collect();
        assert_eq!(unbalanced.len(), 1);
        assert_eq!(unbalanced[0].line, 4);
        let p = a.processes.get(Tgid(100)).unwrap();
        assert!(p.pending.is_empty());
        assert_eq!(p.live_count(), 3);
    }

    #[test]
    fn test_disabled_sim_ignores_vma_events() {
        let a = run_ok(&[
            "app-100 [000] .... 100.000001: mmap_disable_sim: tgid=100".to_string(),
            mmap(2, "mmap_vma_alloc", 100, "mmap_region", (0x1000, 0x2000), "rw-p", ""),
            "app-100 [000] .... 100.000003: mmap_enable_sim: tgid=100".to_string(),
            mmap(4, "mmap_vma_alloc", 100, "mmap_region", (0x4000, 0x5000), "rw-p", ""),
        ]);
        let p = a.processes.get(Tgid(100)).unwrap();
        assert_eq!(p.live_count(), 1);
        assert!(p.live_vma(0x4000).is_some());
        assert_eq!(a.stats.sim_disabled, 1);
    }

    #[test]
    fn test_targets_filter_unrelated_processes() {
        let config = AnalyzerConfig {
            targets: Some([Tgid(100)].into_iter().collect()),
            ..AnalyzerConfig::default()
        };
        let a = run(config, &[
            mmap(1, "mmap_vma_alloc", 100, "mmap_region", (0x1000, 0x2000), "rw-p", ""),
            mmap(2, "mmap_vma_alloc", 555, "mmap_region", (0x1000, 0x2000), "rw-p", ""),
        ])
        .unwrap();
        assert_eq!(a.processes.get(Tgid(100)).unwrap().live_count(), 1);
        assert_eq!(a.processes.get(Tgid(555)).unwrap().live_count(), 0);
        assert_eq!(a.stats.filtered, 1);
        assert_eq!(a.groups.len(), 1);
    }

    #[test]
    fn test_progname_only_from_own_thread() {
        let mut line = mmap(1, "mmap_vma_alloc", 100, "mmap_region", (0x1000, 0x2000), "rw-p", "");
        line = line.replacen("app-100", "kworker-7", 1);
        let a = run_ok(&[line, mmap(2, "mmap_vma_alloc", 100, "mmap_region", (0x4000, 0x5000), "rw-p", "")]);
        assert_eq!(a.processes.get(Tgid(100)).unwrap().progname.as_deref(), Some("app"));
    }

    #[test]
    fn test_user_stack_names_creator_module() {
        let config = AnalyzerConfig { userstacks: true, ..AnalyzerConfig::default() };
        let a = run(config, &[
            mmap(1, "mmap_vma_alloc", 100, "mmap_region", (0x40_0000, 0x40_2000), "r-xp", "/bin/app"),
            mmap(2, "mmap_vma_alloc", 100, "mmap_region", (0x9000, 0xa000), "rw-p", ""),
            "app-100 [000] .... 100.000002: <user stack trace> tgid=100".to_string(),
            " [000] => 0x401234".to_string(),
            " [000] => ??".to_string(),
            mmap(3, "mmap_vma_alloc", 100, "mmap_region", (0xb000, 0xc000), "rw-p", ""),
        ])
        .unwrap();
        let p = a.processes.get(Tgid(100)).unwrap();
        assert_eq!(p.live_vma(0x9000).unwrap().creator_module, "app");
        // no stack follows the third alloc on its CPU
        assert_eq!(p.live_vma(0xb000).unwrap().creator_module, "");
        assert_eq!(a.stats.stacks_attributed, 1);
        let mismatches = a.diagnostics.iter().filter(|d| d.kind == DiagnosticKind::StackMismatch).count();
        assert_eq!(mismatches, 2);
    }
}
