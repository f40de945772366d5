//! Process table, parent/child links and groups
//!
//! A group is a root process plus every descendant whose `tgid_for_stats`
//! points at it. Without grouping every process is its own root.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use super::state::ProcessState;
use crate::domain::{Pid, Tgid};

/// A root and its members, root first, then breadth-first order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGroup {
    pub root: Tgid,
    pub members: Vec<Tgid>,
}

#[derive(Debug, Default)]
pub struct ProcessTracker {
    processes: BTreeMap<Tgid, ProcessState>,
    thread_tgid: HashMap<Pid, Tgid>,
}

impl ProcessTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, tgid: Tgid) -> Option<&ProcessState> {
        self.processes.get(&tgid)
    }

    pub fn get_mut(&mut self, tgid: Tgid) -> Option<&mut ProcessState> {
        self.processes.get_mut(&tgid)
    }

    /// State for `tgid`, created as a partial root on first sighting
    pub fn get_or_create(&mut self, tgid: Tgid) -> &mut ProcessState {
        self.processes.entry(tgid).or_insert_with(|| {
            log::debug!("tracking new process {tgid}");
            ProcessState::new(tgid)
        })
    }

    #[must_use]
    pub fn contains(&self, tgid: Tgid) -> bool {
        self.processes.contains_key(&tgid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessState> {
        self.processes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProcessState> {
        self.processes.values_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn note_thread(&mut self, pid: Pid, tgid: Tgid) {
        self.thread_tgid.insert(pid, tgid);
    }

    /// Thread group of a thread id; a thread never seen is its own group
    #[must_use]
    pub fn tgid_of(&self, pid: Pid) -> Tgid {
        self.thread_tgid.get(&pid).copied().unwrap_or(Tgid::from(pid))
    }

    /// Record that `child` was forked from `parent`.
    ///
    /// With grouping the child joins the parent's group and inherits its
    /// name until it names itself; without grouping it stays a root. A
    /// parent that is not tracked is remembered but keeps the child a root.
    pub fn link_child(&mut self, parent: Tgid, child: Tgid, grouping: bool) {
        if parent == child {
            return;
        }
        let parent_info = self.processes.get_mut(&parent).map(|p| {
            if !p.children.contains(&child) {
                p.children.push(child);
            }
            (p.progname.clone().or_else(|| p.speculative_name.clone()), p.tgid_for_stats)
        });

        let c = self.get_or_create(child);
        c.ptgid = Some(parent);
        let Some((parent_name, parent_stats)) = parent_info else { return };
        if c.speculative_name.is_none() {
            c.speculative_name = parent_name;
        }
        if grouping {
            c.is_root = false;
            c.tgid_for_stats = parent_stats;
        }
    }

    /// Is `tgid`, or any ancestor of it, in `targets`?
    #[must_use]
    pub fn is_descendant_of_any(&self, tgid: Tgid, targets: &BTreeSet<Tgid>) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(tgid);
        while let Some(t) = current {
            if targets.contains(&t) {
                return true;
            }
            if !seen.insert(t) {
                return false;
            }
            current = self.processes.get(&t).and_then(|p| p.ptgid);
        }
        false
    }

    /// Group root `tgid` reports to
    #[must_use]
    pub fn root_of(&self, tgid: Tgid) -> Tgid {
        self.processes.get(&tgid).map_or(tgid, |p| p.tgid_for_stats)
    }

    /// Every group, ordered by root tgid
    #[must_use]
    pub fn groups(&self) -> Vec<ProcessGroup> {
        self.processes
            .values()
            .filter(|p| p.tgid_for_stats == p.tgid)
            .map(|root| self.group_of_root(root.tgid))
            .collect()
    }

    /// Root plus breadth-first descendants that report to it
    #[must_use]
    pub fn group_of_root(&self, root: Tgid) -> ProcessGroup {
        let mut members = vec![root];
        let mut seen: HashSet<Tgid> = HashSet::from([root]);
        let mut queue: VecDeque<Tgid> = VecDeque::from([root]);

        while let Some(tgid) = queue.pop_front() {
            let Some(process) = self.processes.get(&tgid) else { continue };
            for &child in &process.children {
                let reports_here = self.processes.get(&child).is_some_and(|c| c.tgid_for_stats == root);
                if reports_here && seen.insert(child) {
                    members.push(child);
                    queue.push_back(child);
                }
            }
        }
        ProcessGroup { root, members }
    }

    /// `<name>-<tgid>` of a tracked process, or `unknown-<tgid>`
    #[must_use]
    pub fn label(&self, tgid: Tgid) -> String {
        self.processes.get(&tgid).map_or_else(|| format!("unknown-{tgid}"), ProcessState::label)
    }
}
