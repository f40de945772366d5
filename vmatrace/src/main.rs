//! # vmatrace - Main Entry Point
//!
//! Replays one trace file and writes every analysis output into one
//! directory. Exit codes:
//!
//! - `0` success (also `--help` and `--version`)
//! - `1` bad arguments, unreadable input or unwritable output
//! - `2` the replay aborted on an inconsistency (`diagnostics.tsv` is still
//!   written)

use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use vmatrace::cli::Args;
use vmatrace::config::AnalyzerConfig;
use vmatrace::domain::ReplayError;
use vmatrace::export::{diagnostics_text, write_analysis, DIAGNOSTICS_TSV};
use vmatrace::plot::SeriesCollector;
use vmatrace::replay::Engine;
use vmatrace::trace::FileStream;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_ABORTED: i32 = 2;

fn main() {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // --help and --version come back as errors printed to stdout
            let code = if e.use_stderr() { EXIT_ERROR } else { EXIT_SUCCESS };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    std::process::exit(match run(&args) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let aborted = err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<ReplayError>(), Some(ReplayError::Inconsistent { .. })));
    if aborted {
        EXIT_ABORTED
    } else {
        EXIT_ERROR
    }
}

fn run(args: &Args) -> Result<()> {
    let config = AnalyzerConfig::from_args(args)?;
    let snapshots = config.snapshots.clone();

    let mut stream = FileStream::open(&args.trace)
        .with_context(|| format!("failed to open trace {}", args.trace.display()))?;
    fs::create_dir_all(&args.outdir)
        .with_context(|| format!("failed to create output directory {}", args.outdir.display()))?;

    info!("vmatrace v{}: replaying {}", env!("CARGO_PKG_VERSION"), args.trace.display());
    let mut engine = Engine::new(config, SeriesCollector::new());

    if let Err(e) = engine.run(&mut stream) {
        if matches!(e, ReplayError::Inconsistent { .. }) {
            let path = args.outdir.join(DIAGNOSTICS_TSV);
            fs::write(&path, diagnostics_text(engine.diagnostics()))
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        return Err(e).with_context(|| format!("replay of {} aborted", args.trace.display()));
    }

    let analysis = engine.finish();
    let written = write_analysis(&args.outdir, &analysis, &snapshots)
        .with_context(|| format!("failed to write results to {}", args.outdir.display()))?;

    println!(
        "{} processes in {} groups, {} checkpoints, {} diagnostics; {} files in {}",
        analysis.processes.len(),
        analysis.groups.len(),
        analysis.checkpoints.len(),
        analysis.diagnostics.len(),
        written.len(),
        args.outdir.display()
    );
    Ok(())
}
