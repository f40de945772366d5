//! Analysis output
//!
//! Everything a replay produces is written below one output directory:
//!
//! ```text
//! <outdir>/process_groups                       one group per line, root first
//! <outdir>/vmas/<name>-<tgid>.tsv               marshalled VMA history per group
//! <outdir>/series/<plot>-<app>.tsv              plot data
//! <outdir>/<checkpoint>/<name>-<tgid>.maps      VMAs mapped at the checkpoint
//! <outdir>/<checkpoint>/<name>-<tgid>.interval.tsv
//! <outdir>/at-<secs>/<name>-<tgid>.maps         --at snapshots
//! <outdir>/summary.txt, summary.json, diagnostics.tsv
//! ```

pub mod maps;

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

pub use maps::{maps_text, parse_maps_line, MapsEntry};

use crate::analysis::query::{active_in_group, QueryFilter};
use crate::analysis::summary::Summary;
use crate::domain::{ExportError, Timestamp};
use crate::plot::SeriesCollector;
use crate::process::{ProcessGroup, ProcessTracker};
use crate::replay::{Analysis, Checkpoint, Diagnostic};
use crate::vma::Vma;

pub const PROCESS_GROUPS: &str = "process_groups";
pub const VMAS_DIR: &str = "vmas";
pub const SERIES_DIR: &str = "series";
pub const SUMMARY_TXT: &str = "summary.txt";
pub const SUMMARY_JSON: &str = "summary.json";
pub const DIAGNOSTICS_TSV: &str = "diagnostics.tsv";

/// Prefix of `--at` snapshot directories, followed by the timestamp
pub const SNAPSHOT_PREFIX: &str = "at-";

/// Top-level entries a checkpoint directory must not shadow
pub const RESERVED_NAMES: [&str; 6] =
    [PROCESS_GROUPS, VMAS_DIR, SERIES_DIR, SUMMARY_TXT, SUMMARY_JSON, DIAGNOSTICS_TSV];

/// Make `raw` safe as a single path component.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`. A result made only of
/// dots and underscores (`.`, `..`, `_/_`) is returned as the empty string
/// so callers can substitute a generated name.
#[must_use]
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    if cleaned.chars().all(|c| c == '.' || c == '_') {
        String::new()
    } else {
        cleaned
    }
}

/// Write `text` to `path`, creating parent directories
pub(crate) fn write_text(path: &Path, text: &str) -> Result<(), ExportError> {
    let failed = |error| ExportError::WriteFailed { path: path.display().to_string(), error };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(failed)?;
    }
    fs::write(path, text).map_err(failed)
}

/// Tab-separated labels of each group's members, root first
#[must_use]
pub fn process_groups_text(tracker: &ProcessTracker, groups: &[ProcessGroup]) -> String {
    let mut text = String::new();
    for group in groups {
        let labels: Vec<String> = group.members.iter().map(|&tgid| tracker.label(tgid)).collect();
        let _ = writeln!(text, "{}", labels.join("\t"));
    }
    text
}

/// Marshalled history of every member, ordered by creation time
#[must_use]
pub fn group_history_text(tracker: &ProcessTracker, group: &ProcessGroup) -> String {
    let mut vmas: Vec<&Vma> = group
        .members
        .iter()
        .filter_map(|&tgid| tracker.get(tgid))
        .flat_map(|p| p.history().iter())
        .collect();
    vmas.sort_by_key(|vma| vma.timestamp);
    let mut text = String::new();
    for vma in vmas {
        let _ = writeln!(text, "{}", vma.marshal());
    }
    text
}

#[must_use]
pub fn diagnostics_text(diagnostics: &[Diagnostic]) -> String {
    let mut text = String::from("line\temitter\ttgid\tkind\tmessage\n");
    for diagnostic in diagnostics {
        let _ = writeln!(text, "{}", diagnostic.to_tsv());
    }
    text
}

/// Directory name of a `--at` snapshot
#[must_use]
pub fn snapshot_dir_name(at: Timestamp) -> String {
    format!("{SNAPSHOT_PREFIX}{at}")
}

/// Whether `name` has the shape of a [`snapshot_dir_name`]
#[must_use]
pub fn is_snapshot_dir_name(name: &str) -> bool {
    name.strip_prefix(SNAPSHOT_PREFIX)
        .is_some_and(|secs| !secs.is_empty() && secs.bytes().all(|b| b.is_ascii_digit() || b == b'.'))
}

/// Writes the files of one analysis below an output directory
pub struct OutputWriter<'a> {
    outdir: &'a Path,
    written: Vec<PathBuf>,
}

impl<'a> OutputWriter<'a> {
    #[must_use]
    pub fn new(outdir: &'a Path) -> Self {
        Self { outdir, written: Vec::new() }
    }

    fn write(&mut self, relative: impl AsRef<Path>, text: &str) -> Result<(), ExportError> {
        let path = self.outdir.join(relative);
        write_text(&path, text)?;
        debug!("wrote {}", path.display());
        self.written.push(path);
        Ok(())
    }

    pub fn process_groups(&mut self, tracker: &ProcessTracker, groups: &[ProcessGroup]) -> Result<(), ExportError> {
        self.write(PROCESS_GROUPS, &process_groups_text(tracker, groups))
    }

    pub fn histories(&mut self, tracker: &ProcessTracker, groups: &[ProcessGroup]) -> Result<(), ExportError> {
        for group in groups {
            let name = format!("{}.tsv", sanitize_component(&tracker.label(group.root)));
            self.write(Path::new(VMAS_DIR).join(name), &group_history_text(tracker, group))?;
        }
        Ok(())
    }

    pub fn checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), ExportError> {
        let dir = PathBuf::from(&checkpoint.name);
        for snapshot in &checkpoint.groups {
            let label = sanitize_component(&snapshot.label);
            self.write(dir.join(format!("{label}.maps")), &maps_text(&snapshot.active))?;

            let mut interval = String::new();
            for vma in &snapshot.interval {
                let _ = writeln!(interval, "{}", vma.marshal());
            }
            self.write(dir.join(format!("{label}.interval.tsv")), &interval)?;
        }
        Ok(())
    }

    /// Maps files for a point in time that is not a checkpoint
    pub fn snapshot(
        &mut self,
        tracker: &ProcessTracker,
        groups: &[ProcessGroup],
        at: Timestamp,
    ) -> Result<(), ExportError> {
        let dir = PathBuf::from(snapshot_dir_name(at));
        for group in groups {
            let label = sanitize_component(&tracker.label(group.root));
            let active = active_in_group(tracker, group, at, QueryFilter::ALL);
            self.write(dir.join(format!("{label}.maps")), &maps_text(active))?;
        }
        Ok(())
    }

    pub fn series(&mut self, series: &SeriesCollector) -> Result<(), ExportError> {
        let written = series.write_to(&self.outdir.join(SERIES_DIR))?;
        self.written.extend(written);
        Ok(())
    }

    pub fn summary(&mut self, summary: &Summary) -> Result<(), ExportError> {
        self.write(SUMMARY_TXT, &summary.render_text())?;
        let json = serde_json::to_string_pretty(summary)?;
        self.write(SUMMARY_JSON, &json)
    }

    pub fn diagnostics(&mut self, diagnostics: &[Diagnostic]) -> Result<(), ExportError> {
        self.write(DIAGNOSTICS_TSV, &diagnostics_text(diagnostics))
    }

    /// Every file written so far
    #[must_use]
    pub fn into_written(self) -> Vec<PathBuf> {
        self.written
    }
}

/// Write every output of a finished replay.
///
/// # Errors
/// Returns the first write failure; files written before it stay in place.
pub fn write_analysis(
    outdir: &Path,
    analysis: &Analysis<SeriesCollector>,
    snapshots: &[Timestamp],
) -> Result<Vec<PathBuf>, ExportError> {
    let mut out = OutputWriter::new(outdir);
    let tracker = &analysis.processes;

    out.process_groups(tracker, &analysis.groups)?;
    out.histories(tracker, &analysis.groups)?;
    for checkpoint in &analysis.checkpoints {
        out.checkpoint(checkpoint)?;
    }
    for &at in snapshots {
        out.snapshot(tracker, &analysis.groups, at)?;
    }
    out.series(&analysis.sink)?;
    out.summary(&Summary::build(analysis))?;
    out.diagnostics(&analysis.diagnostics)?;

    let written = out.into_written();
    info!("wrote {} files to {}", written.len(), outdir.display());
    Ok(written)
}
