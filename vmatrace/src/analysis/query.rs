//! Point-in-time queries over VMA history
//!
//! History is append-only and every record carries its creation and unmap
//! timestamps, so "what was mapped at t" is a pure filter over it. Querying
//! the same timestamp twice always yields the same set.

use std::collections::HashSet;

use crate::classification::ignore_vma;
use crate::domain::Timestamp;
use crate::process::{ProcessGroup, ProcessState, ProcessTracker};
use crate::vma::Vma;

/// Which VMAs a query leaves out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryFilter {
    /// Drop shared libraries, shared data files and guard regions
    pub skip_ignored: bool,
}

impl QueryFilter {
    pub const ALL: QueryFilter = QueryFilter { skip_ignored: false };
    pub const APPLICATION: QueryFilter = QueryFilter { skip_ignored: true };

    fn keeps(self, vma: &Vma) -> bool {
        !(self.skip_ignored && ignore_vma(vma))
    }
}

/// VMAs of one process mapped at `at`, in creation order
pub fn active_vmas(process: &ProcessState, at: Timestamp, filter: QueryFilter) -> impl Iterator<Item = &Vma> {
    process
        .history()
        .iter()
        .filter(move |vma| vma.is_active_at(at) && filter.keeps(vma))
}

/// VMAs of a whole group mapped at `at`, with copy-on-write duplicates
/// collapsed (see [`dedup_shared`]). Ordered by start address, then tgid.
#[must_use]
pub fn active_in_group<'a>(
    tracker: &'a ProcessTracker,
    group: &ProcessGroup,
    at: Timestamp,
    filter: QueryFilter,
) -> Vec<&'a Vma> {
    let members = group.members.iter().filter_map(|&tgid| tracker.get(tgid));
    let mut vmas = dedup_shared(members.flat_map(|p| active_vmas(p, at, filter)));
    vmas.sort_by_key(|vma| (vma.start, vma.tgid));
    vmas
}

/// Collapse non-writable VMAs that are equal on start, length, permissions
/// key, filename and offset to their first occurrence. Writable VMAs are
/// always kept.
pub fn dedup_shared<'a>(vmas: impl IntoIterator<Item = &'a Vma>) -> Vec<&'a Vma> {
    let mut seen = HashSet::new();
    vmas.into_iter()
        .filter(|&vma| vma.perms.is_writable() || seen.insert(vma.dedup_key()))
        .collect()
}
