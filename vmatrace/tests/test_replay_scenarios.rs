use std::path::PathBuf;

use vmatrace::analysis::{active_in_group, active_vmas, QueryFilter, Summary};
use vmatrace::config::{AnalyzerConfig, Strictness};
use vmatrace::domain::{ReplayError, Tgid, Timestamp};
use vmatrace::plot::{EventLog, PlotEvent};
use vmatrace::replay::{replay, Analysis, DiagnosticKind};
use vmatrace::trace::{FileStream, MemoryStream};
use vmatrace::vma::{PermsKey, UnmapOp};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

fn replay_fixture(name: &str, config: AnalyzerConfig) -> Result<Analysis<EventLog>, ReplayError> {
    let mut stream = FileStream::open(&fixture(name)).expect("fixture should open");
    replay(config, &mut stream, EventLog::new())
}

fn replay_text(text: &str) -> Analysis<EventLog> {
    replay(AnalyzerConfig::default(), &mut MemoryStream::new(text), EventLog::new()).expect("replay should succeed")
}

#[test]
fn test_hello_world_alloc_free() {
    let analysis = replay_text(
        "\
hello-100 [000] .... 1.000001: mmap_vma_alloc_dup_mmap: pid=100 tgid=100 ptgid=1 [dup_mmap]: ffff88800000a000 @ 400000-401000 r-xp 00000000 08:01 12 /bin/hello
hello-100 [000] .... 1.000002: mmap_vma_free: pid=100 tgid=100 ptgid=1 [unmap_region]: ffff88800000a000 @ 400000-401000 r-xp 00000000 08:01 12 /bin/hello",
    );

    let process = analysis.processes.get(Tgid(100)).expect("process is tracked");
    assert_eq!(process.live_count(), 0);
    assert_eq!(process.history().len(), 1);
    assert_eq!(process.history()[0].perms.to_string(), "r-xpf");
    assert_eq!(process.stats.max_vma_count, 1);
    assert!(analysis.diagnostics.is_empty(), "{:?}", analysis.diagnostics);
}

#[test]
fn test_resize_pair_counts_growth_once() {
    let analysis = replay_text(
        "\
app-100 [000] .... 1.000001: mmap_vma_alloc: pid=100 tgid=100 ptgid=1 [__bprm_mm_init]: ffff888000001000 @ 7ffd0000-7ffe0000 rw-p 0 00:00 0
app-100 [000] .... 1.000002: mmap_vma_alloc: pid=100 tgid=100 ptgid=1 [do_brk_flags]: ffff888000002000 @ 600000-601000 rw-p 0 00:00 0
app-100 [000] .... 1.000003: mmap_vma_resize_unmap: pid=100 tgid=100 ptgid=1 [do_brk_flags]: ffff888000002000 @ 600000-601000 rw-p 0 00:00 0
app-100 [000] .... 1.000004: mmap_vma_resize_remap: pid=100 tgid=100 ptgid=1 [do_brk_flags]: ffff888000002000 @ 600000-602000 rw-p 0 00:00 0",
    );

    let process = analysis.processes.get(Tgid(100)).unwrap();
    let heap: Vec<_> = process.live_vmas().filter(|v| v.start == 0x60_0000).collect();
    assert_eq!(heap.len(), 1);
    assert_eq!(heap[0].length, 0x2000);
    assert_eq!(process.brk, Some(0x60_2000));

    let sizes: Vec<u64> = analysis
        .sink
        .for_tgid(Tgid(100))
        .filter_map(|e| match e {
            PlotEvent::VmSize { bytes, .. } => Some(*bytes),
            _ => None,
        })
        .collect();
    let before = sizes[sizes.len() - 2];
    let after = sizes[sizes.len() - 1];
    assert_eq!(after - before, 0x1000);
    assert_eq!(process.stats.total_vm_size, 0x1_0000 + 0x2000);
}

#[test]
fn test_fork_then_exec_elision() {
    let analysis = replay_fixture("fork_exec.trace", AnalyzerConfig::default()).unwrap();

    let child = analysis.processes.get(Tgid(200)).unwrap();
    assert!(child.flags.saw_fork && child.flags.saw_exec);
    assert_eq!(child.stats.elided_events, 10);
    assert!(child.history().iter().all(|v| v.filename() != "/lib/libc.so.6"));
    assert_eq!(child.history()[0].kernel_fn, "__bprm_mm_init");
    assert_eq!(child.live_count(), 2);
    assert_eq!(child.progname.as_deref(), Some("ls"));

    // the child reports to its parent's group
    assert_eq!(analysis.groups.len(), 1);
    assert_eq!(analysis.groups[0].root, Tgid(100));
    assert_eq!(analysis.groups[0].members, vec![Tgid(100), Tgid(200)]);
    assert_eq!(analysis.processes.label(Tgid(200)), "ls-200");
}

#[test]
fn test_access_change_both_directions() {
    let analysis = replay_text(
        "\
app-100 [000] .... 1.000001: mmap_vma_alloc: pid=100 tgid=100 ptgid=1 [mmap_region]: ffff888000001000 @ 10000-11000 rw-p 0 00:00 0
app-100 [000] .... 1.000002: mmap_vma_access_unmap: pid=100 tgid=100 ptgid=1 [mprotect_fixup]: ffff888000001000 @ 10000-11000 rw-p 0 00:00 0
app-100 [000] .... 1.000003: mmap_vma_access_remap: pid=100 tgid=100 ptgid=1 [mprotect_fixup]: ffff888000001000 @ 10000-11000 r--p 0 00:00 0
app-100 [000] .... 1.000004: mmap_vma_access_unmap: pid=100 tgid=100 ptgid=1 [mprotect_fixup]: ffff888000001000 @ 10000-11000 r--p 0 00:00 0
app-100 [000] .... 1.000005: mmap_vma_access_remap: pid=100 tgid=100 ptgid=1 [mprotect_fixup]: ffff888000001000 @ 10000-11000 rw-p 0 00:00 0",
    );

    let process = analysis.processes.get(Tgid(100)).unwrap();
    let keys: Vec<String> = process.history().iter().map(|v| v.perms.to_string()).collect();
    assert_eq!(keys, vec!["rw-pa", "r--pa", "rw-pa"]);
    assert_eq!(process.history()[0].unmap.unwrap().op, UnmapOp::AccessChange);
    assert_eq!(process.live_count(), 1);

    let counts: Vec<usize> = analysis
        .sink
        .for_tgid(Tgid(100))
        .filter_map(|e| match e {
            PlotEvent::VmaCount { count, .. } => Some(*count),
            _ => None,
        })
        .collect();
    assert_eq!(counts, vec![1, 1, 1]);
}

#[test]
fn test_checkpoints_snapshot_and_reset() {
    let analysis = replay_fixture("checkpoints.trace", AnalyzerConfig::default()).unwrap();
    assert_eq!(analysis.checkpoints.len(), 2);

    let cp1 = &analysis.checkpoints[0];
    assert_eq!(cp1.name, "cp1");
    assert_eq!(cp1.groups.len(), 1);
    assert_eq!(cp1.groups[0].label, "app-100");
    assert_eq!(cp1.groups[0].active.len(), 2);
    assert_eq!(cp1.groups[0].interval.len(), 2);

    let cp2 = &analysis.checkpoints[1];
    assert_eq!(cp2.name, "cp2");
    let remaining: Vec<u64> = cp2.groups[0].active.iter().map(|v| v.start).collect();
    assert_eq!(remaining, vec![0x7f00_0001_0000]);
    // nothing was created between the two markers
    assert!(cp2.groups[0].interval.is_empty());
}

#[test]
fn test_grouped_active_set_dedups_cow_copies() {
    let analysis = replay_fixture("dedup.trace", AnalyzerConfig::default()).unwrap();
    assert!(analysis.diagnostics.is_empty(), "{:?}", analysis.diagnostics);
    assert_eq!(analysis.groups.len(), 1);

    let group = &analysis.groups[0];
    assert_eq!(group.members, vec![Tgid(100), Tgid(201), Tgid(202)]);

    let active = active_in_group(&analysis.processes, group, analysis.end, QueryFilter::ALL);
    let libc = active.iter().filter(|v| v.filename() == "/lib/libc.so.6").count();
    assert_eq!(libc, 1);
    // writable copies are never merged
    let anon = active.iter().filter(|v| v.start == 0x5600_0000_0000).count();
    assert_eq!(anon, 2);
    assert_eq!(active.len(), 5);

    // repeated queries agree
    let again = active_in_group(&analysis.processes, group, analysis.end, QueryFilter::ALL);
    assert_eq!(active, again);

    let summary = Summary::build(&analysis);
    assert_eq!(summary.groups[0].peaks.vma_count, 7);
}

#[test]
fn test_query_before_and_after_free() {
    let analysis = replay_fixture("checkpoints.trace", AnalyzerConfig::default()).unwrap();
    let group = &analysis.groups[0];
    let at = |ts| active_in_group(&analysis.processes, group, Timestamp(ts), QueryFilter::ALL).len();

    assert_eq!(at(10_000_000_000), 0);
    assert_eq!(at(10_000_002_000), 2);
    assert_eq!(at(10_000_004_000), 1);
}

#[test]
fn test_strict_and_lenient_inconsistency() {
    let err = replay_fixture("inconsistent.trace", AnalyzerConfig::default()).unwrap_err();
    assert!(matches!(err, ReplayError::Inconsistent { line: 2, tgid: Tgid(300), .. }), "{err}");

    let config = AnalyzerConfig { strictness: Strictness::Lenient, ..AnalyzerConfig::default() };
    let analysis = replay_fixture("inconsistent.trace", config).unwrap();
    assert_eq!(analysis.diagnostics.len(), 1);
    assert_eq!(analysis.diagnostics[0].kind, DiagnosticKind::InconsistentState);
    assert_eq!(analysis.processes.get(Tgid(300)).unwrap().live_count(), 2);
}

#[test]
fn test_malformed_lines_are_reported_not_fatal() {
    let analysis = replay_text(
        "\
app-100 [000] .... 1.000001: mmap_vma_alloc: pid=100 tgid=100 ptgid=1 [mmap_region]: garbage
app-100 [000] .... 1.000002: mmap_vma_alloc: pid=100 tgid=100 ptgid=1 [mmap_region]: ffff888000001000 @ 10000-11000 rwzp 0 00:00 0
this is not a trace line
app-100 [000] .... 1.000003: mmap_vma_alloc: pid=100 tgid=100 ptgid=1 [mmap_region]: ffff888000001000 @ 10000-11000 rw-p 0 00:00 0",
    );

    let kinds: Vec<DiagnosticKind> = analysis.diagnostics.iter().map(|d| d.kind).collect();
    assert_eq!(
        kinds,
        vec![DiagnosticKind::MalformedLine, DiagnosticKind::MalformedLine, DiagnosticKind::UnknownLine]
    );
    assert_eq!(analysis.processes.get(Tgid(100)).unwrap().live_count(), 1);
}

#[test]
fn test_perms_keys_round_trip() {
    for key in PermsKey::all() {
        let text = key.to_string();
        assert_eq!(text.parse::<PermsKey>().unwrap(), key);
        assert_eq!(text.len(), 5);
    }
    assert!("rwxqa".parse::<PermsKey>().is_err());
}

/// `mmap_vma_*` line at `1 s + us`; the kernel struct address follows the start
fn vma_line(us: u32, event: &str, (tgid, ptgid): (u32, u32), kfn: &str, range: (u64, u64), perms: &str) -> String {
    format!(
        "app-{tgid} [000] .... 1.{us:06}: {event}: pid={tgid} tgid={tgid} ptgid={ptgid} [{kfn}]: ffff8800{:08x} @ {:x}-{:x} {perms} 0 00:00 0",
        range.0 >> 12,
        range.0,
        range.1
    )
}

/// Pairs, frees, a fork followed by exec, and a fork whose later exec has
/// to wait for the old image
fn mixed_trace() -> Vec<String> {
    let (parent, exec_child, late_exec) = ((100, 1), (200, 100), (300, 100));
    let stack = (0x7ffd_0000, 0x7ffe_0000);
    vec![
        vma_line(1, "mmap_vma_alloc", parent, "mmap_region", (0x1000, 0x2000), "rw-p"),
        vma_line(2, "mmap_vma_alloc", parent, "mmap_region", (0x8000, 0x9000), "rw-p"),
        vma_line(3, "mmap_vma_resize_unmap", parent, "vma_expand", (0x1000, 0x2000), "rw-p"),
        vma_line(4, "mmap_vma_resize_unmap", parent, "vma_expand", (0x8000, 0x9000), "rw-p"),
        vma_line(5, "mmap_vma_resize_remap", parent, "vma_expand", (0x8000, 0xa000), "rw-p"),
        vma_line(6, "mmap_vma_resize_remap", parent, "vma_expand", (0x1000, 0x3000), "rw-p"),
        vma_line(7, "mmap_vma_access_unmap", parent, "mprotect_fixup", (0x8000, 0xa000), "rw-p"),
        vma_line(8, "mmap_vma_access_remap", parent, "mprotect_fixup", (0x8000, 0xa000), "r--p"),
        vma_line(9, "mmap_vma_free", parent, "unmap_region", (0x1000, 0x3000), "rw-p"),
        vma_line(10, "mmap_vma_alloc_dup_mmap", exec_child, "dup_mmap", (0x8000, 0xa000), "r--p"),
        vma_line(11, "mmap_vma_alloc_dup_mmap", exec_child, "dup_mmap", (0x1_0000, 0x1_1000), "rw-p"),
        vma_line(12, "mmap_vma_alloc", exec_child, "__bprm_mm_init", stack, "rw-p"),
        vma_line(13, "mmap_vma_alloc_dup_mmap", late_exec, "dup_mmap", (0x2000, 0x3000), "rw-p"),
        vma_line(14, "mmap_vma_alloc", late_exec, "mmap_region", (0x5000, 0x6000), "rw-p"),
        vma_line(15, "mmap_vma_alloc", late_exec, "__bprm_mm_init", stack, "rw-p"),
        vma_line(16, "mmap_vma_reloc_unmap", late_exec, "shift_arg_pages", stack, "rw-p"),
        vma_line(17, "mmap_vma_reloc_remap", late_exec, "shift_arg_pages", (0x7ff0_0000, 0x7ff1_0000), "rw-p"),
        vma_line(18, "mmap_vma_free", late_exec, "exit_mmap", (0x2000, 0x3000), "rw-p"),
        vma_line(19, "mmap_vma_free", late_exec, "exit_mmap", (0x5000, 0x6000), "rw-p"),
        vma_line(20, "mmap_vma_alloc", late_exec, "mmap_region", (0x40_0000, 0x40_1000), "r-xp"),
        vma_line(21, "mmap_vma_alloc", exec_child, "mmap_region", (0x9000_0000, 0x9000_1000), "rw-p"),
        vma_line(22, "mmap_vma_free", parent, "unmap_region", (0x8000, 0xa000), "r--p"),
    ]
}

fn assert_history_agrees_with_live_table(analysis: &Analysis<EventLog>, events: usize) {
    for process in analysis.processes.iter() {
        let active = active_vmas(process, analysis.end, QueryFilter::ALL).count();
        assert_eq!(process.live_count(), active, "tgid {} after {events} events", process.tgid);

        for vma in process.history() {
            let Some(unmap) = vma.unmap else { continue };
            if unmap.op == UnmapOp::Free {
                assert!(vma.was_live(), "tgid {}: freed 0x{:x} was never live", process.tgid, vma.start);
            }
            if let Some(mapped_at) = vma.mapped_at {
                assert!(unmap.timestamp >= mapped_at);
            }
        }
    }
}

#[test]
fn test_live_table_matches_history_after_every_event() {
    let lines = mixed_trace();
    let lenient = || AnalyzerConfig { strictness: Strictness::Lenient, ..AnalyzerConfig::default() };

    for events in 1..=lines.len() {
        let mut stream = MemoryStream::new(&lines[..events].join("\n"));
        let analysis = replay(lenient(), &mut stream, EventLog::new()).expect("lenient replay completes");
        assert_history_agrees_with_live_table(&analysis, events);
    }

    let analysis = replay(lenient(), &mut MemoryStream::new(&lines.join("\n")), EventLog::new()).unwrap();
    assert!(
        analysis.diagnostics.iter().all(|d| d.kind != DiagnosticKind::InconsistentState),
        "{:?}",
        analysis.diagnostics
    );
    let frees: usize = analysis
        .processes
        .iter()
        .flat_map(|p| p.history())
        .filter(|v| v.unmap.is_some_and(|u| u.op == UnmapOp::Free))
        .count();
    assert_eq!(frees, 4);

    let late = analysis.processes.get(Tgid(300)).unwrap();
    let stack = late.live_vma(0x7ff0_0000).expect("exec stack installed");
    assert_eq!(stack.mapped_at, Some(Timestamp(1_000_020_000)));
    assert!(stack.timestamp < stack.mapped_at.unwrap());
    assert_eq!(analysis.processes.get(Tgid(200)).unwrap().stats.elided_events, 2);
}
