//! Checkpoints written through `tracing_mark_write`

use crate::analysis::query::{active_in_group, QueryFilter};
use crate::domain::{Tgid, Timestamp};
use crate::export::{is_snapshot_dir_name, sanitize_component, RESERVED_NAMES};
use crate::process::{ProcessGroup, ProcessTracker};
use crate::vma::Vma;

/// What one group looked like when a checkpoint was taken
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub root: Tgid,
    /// `<name>-<tgid>` of the root at snapshot time
    pub label: String,
    /// Mapped VMAs, group-deduplicated, by start address
    pub active: Vec<Vma>,
    /// VMAs created since the previous checkpoint
    pub interval: Vec<Vma>,
}

impl GroupSnapshot {
    /// Mapped VMAs of `group` at `at`; the interval list is left empty
    #[must_use]
    pub fn take(tracker: &ProcessTracker, group: &ProcessGroup, at: Timestamp) -> Self {
        let active = active_in_group(tracker, group, at, QueryFilter::ALL)
            .into_iter()
            .cloned()
            .collect();
        Self { root: group.root, label: tracker.label(group.root), active, interval: Vec::new() }
    }
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub timestamp: Timestamp,
    /// Task that wrote the marker
    pub appname: String,
    /// Unique, path-safe name
    pub name: String,
    pub groups: Vec<GroupSnapshot>,
}

/// Path-safe, unique name for the `ordinal`-th checkpoint (1-based).
///
/// Empty names become `checkpoint-<ordinal>`; a name already taken (one of
/// the fixed output entries, or shaped like a `--at` snapshot directory)
/// gets the first free `-<n>` suffix, starting at 2.
#[must_use]
pub fn checkpoint_name(raw: &str, ordinal: usize, taken: &[Checkpoint]) -> String {
    let mut base = sanitize_component(raw.trim());
    if base.is_empty() {
        base = format!("checkpoint-{ordinal}");
    }
    let is_taken = |name: &str| {
        RESERVED_NAMES.contains(&name) || is_snapshot_dir_name(name) || taken.iter().any(|cp| cp.name == name)
    };
    if !is_taken(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if !is_taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
