//! Fork/exec recognition
//!
//! # The Problem
//!
//! A `fork()` copies the parent's VMAs into the child (`dup_mmap`). When the
//! child then calls `execve()`, the kernel builds the new image's stack VMA
//! (`__bprm_mm_init`) while the copied mm still exists, tears the copy down
//! (`exit_mmap`) and finally moves the stack into place. Replayed naively
//! the child would briefly own two address spaces.
//!
//! # The Approach
//!
//! 1. On the first `dup_mmap` of a child, look ahead past the rest of its
//!    `dup_mmap` run: if the next VMA event of the child is `__bprm_mm_init`
//!    the fork is followed by an exec (`exec_follows_fork`)
//! 2. While `exec_follows_fork` holds, copied and torn-down VMAs are
//!    suppressed
//! 3. A stack VMA created while the process still has live VMAs is held out
//!    of band (`use_bprm`) and installed as soon as the old image is gone
//!
//! # Gating Order
//!
//! For every VMA event of a process, [`ForkExecFlags::gate`] decides:
//!
//! 1. `exec_follows_fork` and the kernel function is `dup_mmap` or
//!    `exit_mmap`: suppress
//! 2. `use_bprm`, the live map is empty and the kernel function is neither
//!    `expand_downwards` nor `__bprm_mm_init`: install the held stack VMA,
//!    then apply the event
//! 3. `use_bprm` and the event names the held stack VMA: apply it out of band
//! 4. otherwise apply; the first event past the exec setup clears
//!    `exec_follows_fork`

use std::io;

use vmatrace_common::kernel_fn;

use crate::domain::Tgid;
use crate::trace::{LineParser, MmapPayload, PayloadParser, TraceLine, TraceStream};

/// Fork/exec state of one process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForkExecFlags {
    pub saw_fork: bool,
    pub saw_exec: bool,
    pub exec_follows_fork: bool,
    /// A stack VMA is held out of band until the old image is gone
    pub use_bprm: bool,
}

/// What to do with one VMA event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Suppress,
    InstallBprmThenApply,
    ApplyToBprm,
    Apply,
}

/// Facts about the event being gated
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub kernel_fn: &'a str,
    /// `mmap_vma_alloc_dup_mmap` or a `dup_mmap` kernel function
    pub is_dup: bool,
    pub live_empty: bool,
    pub touches_bprm: bool,
}

impl ForkExecFlags {
    pub fn gate(&mut self, input: GateInput<'_>) -> Gate {
        let kfn = input.kernel_fn;
        if self.exec_follows_fork && (input.is_dup || kfn == kernel_fn::EXIT_MMAP) {
            return Gate::Suppress;
        }

        let exec_setup = kfn == kernel_fn::BPRM_MM_INIT || kfn == kernel_fn::EXPAND_DOWNWARDS;

        if self.use_bprm {
            if !exec_setup && input.live_empty {
                self.use_bprm = false;
                self.exec_follows_fork = false;
                return Gate::InstallBprmThenApply;
            }
            if input.touches_bprm {
                return Gate::ApplyToBprm;
            }
            return Gate::Apply;
        }

        if self.exec_follows_fork && self.saw_exec && !exec_setup && kfn != kernel_fn::EXIT_MMAP {
            self.exec_follows_fork = false;
        }
        Gate::Apply
    }
}

/// Outcome of looking ahead from a child's first `dup_mmap`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookahead {
    ExecFollows,
    NoExec,
    /// The trace ended before the child's next VMA event
    EndOfTrace,
}

impl Lookahead {
    #[must_use]
    pub fn exec_follows(self) -> bool {
        self == Lookahead::ExecFollows
    }
}

/// Scan forward for the next VMA event of `child` after its `dup_mmap` run
/// and rewind the stream to where it was.
///
/// # Errors
/// Propagates stream read and seek errors.
pub fn exec_follows_fork<S: TraceStream>(
    stream: &mut S,
    lines: &LineParser,
    payloads: &PayloadParser,
    child: Tgid,
) -> io::Result<Lookahead> {
    let mark = stream.position();
    let result = scan(stream, lines, payloads, child);
    stream.seek(mark)?;
    result
}

fn scan<S: TraceStream>(
    stream: &mut S,
    lines: &LineParser,
    payloads: &PayloadParser,
    child: Tgid,
) -> io::Result<Lookahead> {
    while let Some((_, text)) = stream.next_line()? {
        let Ok(TraceLine::Event(event)) = lines.parse_line(&text) else { continue };
        if !event.name.starts_with(vmatrace_common::mmap::PREFIX) {
            continue;
        }
        let Ok(payload) = payloads.parse_mmap(&event.payload) else { continue };
        if payload.tgid != child {
            continue;
        }
        if is_dup_event(&event.name, &payload) {
            continue;
        }
        return Ok(if payload.kernel_fn == kernel_fn::BPRM_MM_INIT {
            Lookahead::ExecFollows
        } else {
            Lookahead::NoExec
        });
    }
    Ok(Lookahead::EndOfTrace)
}

/// Is this VMA event part of a `fork()` copy?
#[must_use]
pub fn is_dup_event(event_name: &str, payload: &MmapPayload) -> bool {
    event_name == vmatrace_common::mmap::ALLOC_DUP_MMAP || payload.is_dup_mmap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::MemoryStream;

    fn input(kernel_fn: &str, live_empty: bool) -> GateInput<'_> {
        GateInput { kernel_fn, is_dup: kernel_fn == "dup_mmap", live_empty, touches_bprm: false }
    }

    fn mmap_line(ts: &str, event: &str, tgid: u32, kfn: &str, start: u64) -> String {
        format!(
            "t-{tgid} [000] .... {ts}: {event}: pid={tgid} tgid={tgid} ptgid=1 [{kfn}]: ffff @ {start:x}-{:x} rw-p 0 00:00 0",
            start + 0x1000
        )
    }

    #[test]
    fn test_exec_follows_fork_suppresses_copies_and_teardown() {
        let mut flags = ForkExecFlags { saw_fork: true, exec_follows_fork: true, ..Default::default() };
        assert_eq!(flags.gate(input("dup_mmap", false)), Gate::Suppress);
        assert_eq!(flags.gate(input("exit_mmap", false)), Gate::Suppress);
        assert!(flags.exec_follows_fork);
    }

    #[test]
    fn test_exec_follows_fork_clears_after_setup() {
        let mut flags = ForkExecFlags {
            saw_fork: true,
            saw_exec: true,
            exec_follows_fork: true,
            ..Default::default()
        };
        assert_eq!(flags.gate(input("expand_downwards", false)), Gate::Apply);
        assert!(flags.exec_follows_fork);
        assert_eq!(flags.gate(input("shift_arg_pages", false)), Gate::Apply);
        assert!(!flags.exec_follows_fork);
        assert_eq!(flags.gate(input("exit_mmap", false)), Gate::Apply);
    }

    #[test]
    fn test_bprm_installs_once_old_image_is_gone() {
        let mut flags = ForkExecFlags { saw_exec: true, use_bprm: true, ..Default::default() };
        assert_eq!(flags.gate(input("exit_mmap", false)), Gate::Apply);
        assert_eq!(flags.gate(input("expand_downwards", true)), Gate::Apply);
        assert!(flags.use_bprm);
        assert_eq!(flags.gate(input("shift_arg_pages", true)), Gate::InstallBprmThenApply);
        assert!(!flags.use_bprm);
    }

    #[test]
    fn test_events_on_held_bprm_go_out_of_band() {
        let mut flags = ForkExecFlags { saw_exec: true, use_bprm: true, ..Default::default() };
        let mut gate_input = input("expand_downwards", false);
        gate_input.touches_bprm = true;
        assert_eq!(flags.gate(gate_input), Gate::ApplyToBprm);
    }

    #[test]
    fn test_lookahead_finds_exec_and_rewinds() {
        let text = [
            mmap_line("1.0", "mmap_vma_alloc_dup_mmap", 200, "dup_mmap", 0x1000),
            mmap_line("1.1", "mmap_vma_alloc_dup_mmap", 200, "dup_mmap", 0x3000),
            mmap_line("1.2", "mmap_vma_alloc", 100, "mmap_region", 0x9000),
            mmap_line("1.3", "mmap_vma_alloc", 200, "__bprm_mm_init", 0x7ff0_0000),
        ]
        .join("\n");
        let mut stream = MemoryStream::new(&text);
        stream.next_line().unwrap();
        let before = stream.position();

        let result =
            exec_follows_fork(&mut stream, &LineParser::new(), &PayloadParser::new(), Tgid(200)).unwrap();
        assert_eq!(result, Lookahead::ExecFollows);
        assert_eq!(stream.position(), before);
    }

    #[test]
    fn test_lookahead_plain_fork_and_eof() {
        let text = [
            mmap_line("1.0", "mmap_vma_alloc_dup_mmap", 200, "dup_mmap", 0x1000),
            mmap_line("1.1", "mmap_vma_alloc", 200, "mmap_region", 0x5000),
        ]
        .join("\n");
        let parsers = (LineParser::new(), PayloadParser::new());

        let mut stream = MemoryStream::new(&text);
        stream.next_line().unwrap();
        assert_eq!(
            exec_follows_fork(&mut stream, &parsers.0, &parsers.1, Tgid(200)).unwrap(),
            Lookahead::NoExec
        );

        let mut stream = MemoryStream::new(&text);
        stream.next_line().unwrap();
        assert_eq!(
            exec_follows_fork(&mut stream, &parsers.0, &parsers.1, Tgid(300)).unwrap(),
            Lookahead::EndOfTrace
        );
        assert!(!Lookahead::EndOfTrace.exec_follows());
    }
}
