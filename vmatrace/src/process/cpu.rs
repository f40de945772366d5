//! Which task runs on which CPU, from `sched_switch`

use std::collections::BTreeMap;

use crate::domain::{CpuId, Pid, Tgid, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningTask {
    pub pid: Pid,
    pub tgid: Tgid,
    pub since: Timestamp,
}

#[derive(Debug, Default)]
pub struct CpuTracker {
    cpus: BTreeMap<CpuId, RunningTask>,
}

impl CpuTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `next` on `cpu`; returns the task it replaces
    pub fn switch(&mut self, cpu: CpuId, next: RunningTask) -> Option<RunningTask> {
        self.cpus.insert(cpu, next)
    }

    #[must_use]
    pub fn current(&self, cpu: CpuId) -> Option<&RunningTask> {
        self.cpus.get(&cpu)
    }

    /// Remove every running task, e.g. to close quanta at end of trace
    pub fn drain(&mut self) -> impl Iterator<Item = (CpuId, RunningTask)> + '_ {
        std::mem::take(&mut self.cpus).into_iter()
    }
}
