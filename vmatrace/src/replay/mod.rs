//! Trace replay: event semantics, fork/exec handling, stack attribution,
//! checkpoints and diagnostics

pub mod checkpoint;
pub mod diagnostics;
pub mod engine;
pub mod fork_exec;
pub mod stack_attributor;
pub mod stats;
mod vma_events;

pub use checkpoint::{checkpoint_name, Checkpoint, GroupSnapshot};
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
pub use engine::{replay, Analysis, Engine};
pub use fork_exec::{ForkExecFlags, Gate, Lookahead};
pub use stack_attributor::{Creator, StackAttributor, UserStack};
pub use stats::{display_statistics, ReplayStats};
