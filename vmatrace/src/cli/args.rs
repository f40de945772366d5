//! CLI argument definitions

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::domain::Timestamp;

#[derive(Parser, Debug)]
#[command(
    name = "vmatrace",
    version,
    about = "Replay a kernel VMA trace and report how processes use their address space",
    after_help = "\
EXAMPLES:
    vmatrace trace.txt out/                               VMA history and plots for every process
    vmatrace trace.txt out/ -p pids --app firefox         Only the listed pids and their children
    vmatrace trace.txt out/ --userstacks --functions      Attribute VMAs to the code that created them
    vmatrace trace.txt out/ --at 12.5 --at 30             Extra address-space snapshots

Set RUST_LOG=info (or debug) for progress and diagnostics."
)]
pub struct Args {
    /// Trace file recorded with the VMA tracepoints enabled
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Directory that receives every output file
    #[arg(value_name = "OUTDIR")]
    pub outdir: PathBuf,

    /// Label used for plots (default: program name and pid of each group root)
    #[arg(long, value_name = "NAME")]
    pub app: Option<String>,

    /// File listing target pids; other processes are skipped unless descended from one
    #[arg(short = 'p', long = "pids", value_name = "FILE")]
    pub pids: Option<PathBuf>,

    /// Keep forked children out of their parent's group
    #[arg(long)]
    pub no_group: bool,

    /// Attribute VMA operations to the user stack that caused them
    #[arg(long)]
    pub userstacks: bool,

    /// Resolve function names in user stacks (requires --userstacks)
    #[arg(long)]
    pub functions: bool,

    /// Ignore page-table events
    #[arg(long)]
    pub no_page: bool,

    /// Record inconsistencies as diagnostics instead of aborting
    #[arg(long)]
    pub lenient: bool,

    /// Symbol resolution backend
    #[arg(long, value_enum, default_value_t = ResolverChoice::Addr2line)]
    pub resolver: ResolverChoice,

    /// addr2line binary used by the addr2line backend
    #[arg(long, value_name = "PATH", default_value = "addr2line")]
    pub addr2line: String,

    /// Also snapshot the address space at this trace time (repeatable)
    #[arg(long = "at", value_name = "SECONDS")]
    pub at: Vec<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResolverChoice {
    /// One addr2line child process per module
    Addr2line,
    /// In-process DWARF lookup
    Dwarf,
}
