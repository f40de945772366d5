//! # vmatrace - Offline VMA Trace Analyzer
//!
//! vmatrace replays a kernel trace recorded with the `mmap_vma_*`, `pte_*`,
//! `rss_stat` and `sched_switch` tracepoints and reconstructs how the
//! address spaces of the traced processes evolved: which VMAs existed when,
//! which operation created and removed each of them, which code created
//! them, and how forked children group under their root process.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  trace file (ftrace text)                    │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ lines, with look-ahead
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        replay::Engine                        │
//! │                                                              │
//! │  trace ──▶ fork/exec gate ──▶ stack attributor ──▶ process   │
//! │  parser                          │                 tables    │
//! │                                  ▼                           │
//! │                          symbolization                       │
//! └───────────┬──────────────────────────────────┬───────────────┘
//!             │ PlotEvent                        │ history, checkpoints
//!             ▼                                  ▼
//!     ┌──────────────┐                  ┌──────────────────┐
//!     │ plot series  │                  │ analysis, export │
//!     └──────────────┘                  └──────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`trace`]: line grammar, payload grammars and seekable streams
//! - [`vma`]: VMA records and permissions keys
//! - [`classification`]: anon / file / guard / shared-library predicates
//! - [`process`]: per-process state, the process tree and per-CPU quanta
//! - [`replay`]: the engine, fork/exec gating, stack attribution,
//!   checkpoints and diagnostics
//! - [`symbolization`]: addr2line children and in-process DWARF lookup
//! - [`analysis`]: point-in-time queries and the per-group summary
//! - [`plot`]: plot events and the series collector
//! - [`export`]: the output directory layout
//! - [`cli`], [`config`]: arguments and the validated configuration
//! - [`domain`]: newtypes and error types
//!
//! ## Typical Usage
//!
//! ```bash
//! # Replay a trace, attributing VMAs to the modules and functions that created them
//! vmatrace --userstacks --functions trace.txt out/
//!
//! # Only follow pid 1234 and its descendants, tolerating a truncated trace
//! echo 1234 > pids && vmatrace -p pids --lenient trace.txt out/
//! ```

pub mod analysis;
pub mod classification;
pub mod cli;
pub mod config;
pub mod domain;
pub mod export;
pub mod plot;
pub mod process;
pub mod replay;
pub mod symbolization;
pub mod trace;
pub mod vma;
