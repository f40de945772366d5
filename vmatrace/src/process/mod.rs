//! Process and CPU tracking

pub mod cpu;
pub mod state;
pub mod tracker;

pub use cpu::{CpuTracker, RunningTask};
pub use state::{PendingTarget, PendingUnmap, ProcessState, ProcessStats};
pub use tracker::{ProcessGroup, ProcessTracker};
