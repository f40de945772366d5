//! User stack attribution
//!
//! Consolidates what it takes to name the code that caused a VMA event:
//! - Reading the `<user stack trace>` dump that follows the event on its CPU
//! - Mapping each IP to the VMA (and so the module) that holds it
//! - Resolving function names when requested
//! - Compressing the stack into module and function chains

use std::io;

use log::trace;

use crate::classification::basename;
use crate::domain::{CpuId, ResolverError, Tgid};
use crate::process::ProcessState;
use crate::symbolization::SymbolResolver;
use crate::trace::{EventLine, LineParser, TraceLine, TraceStream};

pub const ANON_MODULE: &str = "[anon]";
pub const KERNEL_SETUP_MODULE: &str = "[kernel-setup]";
pub const UNKNOWN_MODULE: &str = "[unknown]";
pub const UNRESOLVED_MODULE: &str = "[unresolved]";

/// Separator of compressed module and function chains
pub const CHAIN_SEPARATOR: &str = "->";

/// A user stack dump, top (innermost) frame first; `None` for `??` entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStack {
    pub tgid: Option<Tgid>,
    pub ips: Vec<Option<u64>>,
}

impl UserStack {
    /// Innermost known IP
    #[must_use]
    pub fn top_ip(&self) -> Option<u64> {
        self.ips.iter().flatten().copied().next()
    }
}

/// Result of looking for the stack of an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackScan {
    Found(UserStack),
    /// The next line on the CPU is not a stack dump
    Missing,
    /// A stack dump follows, but for another task
    TaskMismatch { found: String },
}

/// Read the stack dump following `event` and rewind the stream.
///
/// The stream must be positioned right after the event line. Lines of other
/// CPUs are skipped; the first line on the event's CPU decides.
///
/// # Errors
/// Propagates stream read and seek errors.
pub fn collect_user_stack<S: TraceStream>(
    stream: &mut S,
    parser: &LineParser,
    event: &EventLine,
) -> io::Result<StackScan> {
    let mark = stream.position();
    let result = scan_stack(stream, parser, event);
    stream.seek(mark)?;
    result
}

fn scan_stack<S: TraceStream>(
    stream: &mut S,
    parser: &LineParser,
    event: &EventLine,
) -> io::Result<StackScan> {
    let Some(first) = next_on_cpu(stream, parser, event.cpu)? else {
        return Ok(StackScan::Missing);
    };
    let TraceLine::StackBegin(begin) = first else {
        return Ok(StackScan::Missing);
    };
    if begin.task != event.task {
        return Ok(StackScan::TaskMismatch { found: begin.task });
    }

    let mut stack = UserStack { tgid: begin.tgid, ips: Vec::new() };
    while let Some(line) = next_on_cpu(stream, parser, event.cpu)? {
        match line {
            TraceLine::StackEntry(entry) => stack.ips.push(entry.ip),
            _ => break,
        }
    }
    Ok(StackScan::Found(stack))
}

fn next_on_cpu<S: TraceStream>(
    stream: &mut S,
    parser: &LineParser,
    cpu: CpuId,
) -> io::Result<Option<TraceLine>> {
    while let Some((_, text)) = stream.next_line()? {
        let Ok(line) = parser.parse_line(&text) else { continue };
        if line.cpu() == Some(cpu) {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

/// Module and function chains of a stack, outermost caller first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Creator {
    pub module: String,
    pub function: String,
}

/// One attributed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub module: String,
    pub function: String,
}

/// Outcome of attributing one stack
#[derive(Debug, Default)]
pub struct Attribution {
    pub creator: Creator,
    /// Symbol sources that failed during this attribution
    pub failures: Vec<ResolverError>,
}

/// Maps stack IPs to modules and (optionally) function names
pub struct StackAttributor<'a> {
    resolver: &'a mut SymbolResolver,
    functions: bool,
}

impl<'a> StackAttributor<'a> {
    pub fn new(resolver: &'a mut SymbolResolver, functions: bool) -> Self {
        Self { resolver, functions }
    }

    pub fn attribute(&mut self, stack: &UserStack, process: &ProcessState) -> Attribution {
        let mut failures = Vec::new();
        let frames: Vec<Frame> = stack
            .ips
            .iter()
            .flatten()
            .map(|&ip| self.frame_for(ip, process, &mut failures))
            .collect();
        Attribution { creator: compress(&frames), failures }
    }

    fn frame_for(&mut self, ip: u64, process: &ProcessState, failures: &mut Vec<ResolverError>) -> Frame {
        let vma = process
            .find_live_containing(ip)
            .or_else(|| process.bprm_vma().filter(|bprm| bprm.contains(ip)));

        let Some(vma) = vma else {
            let module = if process.exec_ip == Some(ip) {
                KERNEL_SETUP_MODULE
            } else if process.is_partial() {
                UNKNOWN_MODULE
            } else {
                UNRESOLVED_MODULE
            };
            return Frame { module: module.to_string(), function: String::new() };
        };

        if !vma.perms.file_backed {
            return Frame { module: ANON_MODULE.to_string(), function: String::new() };
        }

        let module = basename(vma.filename()).to_string();
        let function = if self.functions && vma.perms.is_executable() {
            self.resolver.resolve(vma, ip).unwrap_or_else(|e| {
                trace!("resolution of 0x{ip:x} in {module} failed: {e}");
                failures.push(e);
                String::new()
            })
        } else {
            String::new()
        };
        Frame { module, function }
    }
}

/// Compress top-first frames into outermost-first chains.
///
/// Modules keep only their last occurrence (the one nearest the top of the
/// stack); functions keep every frame, with `?` for unknown names.
#[must_use]
pub fn compress(frames: &[Frame]) -> Creator {
    let bottom_first: Vec<&Frame> = frames.iter().rev().collect();

    let mut modules: Vec<&str> = Vec::new();
    for frame in &bottom_first {
        modules.retain(|m| *m != frame.module);
        modules.push(&frame.module);
    }

    let functions: Vec<&str> = bottom_first
        .iter()
        .map(|f| if f.function.is_empty() { "?" } else { f.function.as_str() })
        .collect();

    Creator { module: modules.join(CHAIN_SEPARATOR), function: functions.join(CHAIN_SEPARATOR) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolization::ResolverKind;
    use crate::trace::MemoryStream;
    use crate::vma::record::test_vma;

    fn frame(module: &str, function: &str) -> Frame {
        Frame { module: module.to_string(), function: function.to_string() }
    }

    fn event_and_stream(text: &str) -> (EventLine, MemoryStream) {
        let parser = LineParser::new();
        let mut stream = MemoryStream::new(text);
        let (_, first) = stream.next_line().unwrap().unwrap();
        let TraceLine::Event(event) = parser.parse_line(&first).unwrap() else { panic!("event") };
        (event, stream)
    }

    #[test]
    fn test_compress_keeps_last_module_occurrence() {
        // top first: libc <- app <- libc <- app(main)
        let frames = [
            frame("libc.so.6", "malloc"),
            frame("app", "helper"),
            frame("libc.so.6", ""),
            frame("app", "main"),
        ];
        let creator = compress(&frames);
        assert_eq!(creator.module, "app->libc.so.6");
        assert_eq!(creator.function, "main->?->helper->malloc");
    }

    #[test]
    fn test_compress_empty() {
        assert_eq!(compress(&[]), Creator::default());
    }

    #[test]
    fn test_collect_skips_other_cpus_and_rewinds() {
        let text = "\
app-10 [001] .... 1.0: mmap_vma_alloc: x
other-11 [002] .... 1.0: sched_switch: y
app-10 [001] .... 1.0: <user stack trace> tgid=10
 [002] => 0xdead
 [001] => 0x401000
 [001] => ??
 [001] => 0x402000
app-10 [001] .... 1.1: mmap_vma_free: z";
        let (event, mut stream) = event_and_stream(text);
        let mark = stream.position();
        let scan = collect_user_stack(&mut stream, &LineParser::new(), &event).unwrap();
        assert_eq!(
            scan,
            StackScan::Found(UserStack {
                tgid: Some(Tgid(10)),
                ips: vec![Some(0x40_1000), None, Some(0x40_2000)]
            })
        );
        assert_eq!(stream.position(), mark);
    }

    #[test]
    fn test_collect_missing_and_mismatch() {
        let missing = "app-10 [001] .... 1.0: mmap_vma_alloc: x\napp-10 [001] .... 1.1: mmap_vma_free: z";
        let (event, mut stream) = event_and_stream(missing);
        assert_eq!(collect_user_stack(&mut stream, &LineParser::new(), &event).unwrap(), StackScan::Missing);

        let mismatch = "app-10 [001] .... 1.0: mmap_vma_alloc: x\nzsh-12 [001] .... 1.0: <user stack trace> tgid=12";
        let (event, mut stream) = event_and_stream(mismatch);
        assert_eq!(
            collect_user_stack(&mut stream, &LineParser::new(), &event).unwrap(),
            StackScan::TaskMismatch { found: "zsh".to_string() }
        );
    }

    #[test]
    fn test_attribute_modules() {
        let mut process = ProcessState::new(Tgid(100));
        process.flags.saw_fork = true;
        process.insert_live(test_vma(0x40_0000, 0x1000, "r-xpf", "/usr/bin/app"));
        process.insert_live(test_vma(0x7f00_0000_0000, 0x1000, "rwxpa", ""));
        process.exec_ip = Some(0x7fff_0000_0010);

        let mut resolver = SymbolResolver::new(ResolverKind::Disabled, "addr2line");
        let mut attributor = StackAttributor::new(&mut resolver, false);
        let stack = UserStack {
            tgid: Some(Tgid(100)),
            ips: vec![Some(0x7f00_0000_0010), Some(0x40_0010), Some(0x7fff_0000_0010), Some(0x1)],
        };
        let attribution = attributor.attribute(&stack, &process);
        assert_eq!(attribution.creator.module, "[unresolved]->[kernel-setup]->app->[anon]");
        assert_eq!(attribution.creator.function, "?->?->?->?");
        assert!(attribution.failures.is_empty());
    }

    #[test]
    fn test_partial_process_uses_unknown_label() {
        let process = ProcessState::new(Tgid(100));
        let mut resolver = SymbolResolver::new(ResolverKind::Disabled, "addr2line");
        let mut attributor = StackAttributor::new(&mut resolver, true);
        let stack = UserStack { tgid: None, ips: vec![Some(0x1234)] };
        assert_eq!(attributor.attribute(&stack, &process).creator.module, UNKNOWN_MODULE);
        assert_eq!(stack.top_ip(), Some(0x1234));
    }
}
