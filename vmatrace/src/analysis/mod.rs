//! Analysis over replayed VMA history
//!
//! Everything here is a pure function of the state a replay left behind:
//! point-in-time queries and the per-group summary.

pub mod query;
pub mod summary;

pub use query::{active_in_group, active_vmas, dedup_shared, QueryFilter};
pub use summary::{GroupSummary, ModuleShare, ModuleStats, Peaks, Summary};
