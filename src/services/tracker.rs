use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, trace};
use regex::Regex;
use thiserror::Error;

use crate::models::{ParentPid, ProcessEvent, ProcessNode, TreeSnapshot};
use crate::services::clock::monotonic_ns;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerFault {
    #[error("linking pid {child} under {parent} would make it its own ancestor")]
    Cycle { parent: u32, child: u32 },
}

/// Command names whose direct children are retired to history as soon as
/// their subtree terminates, even though the boundary process stays alive.
#[derive(Debug, Clone, Default)]
pub struct ReapBoundaries {
    patterns: Vec<Regex>,
}

impl ReapBoundaries {
    /// Each pattern must match the whole `comm`.
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(&format!("^(?:{})$", p.as_ref())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn matches(&self, comm: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(comm))
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub max_history: usize,
    pub boundaries: ReapBoundaries,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_history: 10,
            boundaries: ReapBoundaries::none(),
        }
    }
}

#[derive(Debug)]
struct TrackedProcess {
    ppid: ParentPid,
    comm: String,
    filename: Option<String>,
    creation_time: Option<u64>,
    exit_time: Option<u64>,
    is_active: bool,
    is_bootstrapped: bool,
    /// children not yet subtree-terminated
    active_children: usize,
    /// the live node whose `children` holds this pid; `None` for roots
    parent: Option<u32>,
    children: BTreeSet<u32>,
}

impl TrackedProcess {
    fn new(ppid: ParentPid, comm: String) -> Self {
        Self {
            ppid,
            comm,
            filename: None,
            creation_time: None,
            exit_time: None,
            is_active: true,
            is_bootstrapped: false,
            active_children: 0,
            parent: None,
            children: BTreeSet::new(),
        }
    }

    fn is_terminated(&self) -> bool {
        !self.is_active && self.active_children == 0
    }

    fn to_node(&self, pid: u32) -> ProcessNode {
        ProcessNode {
            pid,
            ppid: self.ppid,
            comm: self.comm.clone(),
            filename: self.filename.clone(),
            creation_time: self.creation_time,
            exit_time: self.exit_time,
            is_active: self.is_active,
            is_bootstrapped: self.is_bootstrapped,
            active_descendant_count: self.active_children,
            children: BTreeMap::new(),
        }
    }
}

/// Live process tree rebuilt from fork/exec/exit events.
///
/// Every node keeps the number of its children that are not yet
/// subtree-terminated. An exit walks upward decrementing these counters and
/// stops at the first node that is still alive, so detecting that a whole
/// subtree is gone costs O(depth) instead of a walk over the subtree.
pub struct ProcessTreeTracker {
    nodes: HashMap<u32, TrackedProcess>,
    roots: BTreeSet<u32>,
    history: VecDeque<Arc<ProcessNode>>,
    max_history: usize,
    boundaries: ReapBoundaries,
    clock: fn() -> u64,
}

impl ProcessTreeTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            nodes: HashMap::new(),
            roots: BTreeSet::new(),
            history: VecDeque::with_capacity(config.max_history),
            max_history: config.max_history,
            boundaries: config.boundaries,
            clock: monotonic_ns,
        }
    }

    /// Seeds the tracker with the trees returned by the bootstrap scan.
    pub fn from_bootstrap(roots: BTreeMap<u32, ProcessNode>, config: TrackerConfig) -> Self {
        let mut tracker = Self::new(config);
        for root in roots.into_values() {
            tracker.insert_subtree(root, None);
        }
        debug!(
            "bootstrapped {} processes under {} roots",
            tracker.nodes.len(),
            tracker.roots.len()
        );
        tracker
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Applies one event. Returns the subtree retired to history, if any.
    pub fn apply(&mut self, event: ProcessEvent) -> Result<Option<Arc<ProcessNode>>, TrackerFault> {
        trace!("apply {:?}", event);
        match event {
            ProcessEvent::Fork {
                ts,
                ppid,
                pid,
                parent_comm,
                comm,
            } => self.fork(ts, ppid, pid, parent_comm, comm),
            ProcessEvent::Exec { pid, comm, filename } => {
                self.exec(pid, comm, filename);
                Ok(None)
            }
            ProcessEvent::Exit { ts, pid, .. } => Ok(self.exit(ts, pid)),
        }
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            roots: self
                .roots
                .iter()
                .filter_map(|pid| self.materialize(*pid))
                .collect(),
            history: self.history.iter().cloned().collect(),
            live_count: self.nodes.len(),
        }
    }

    pub fn live_len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub fn contains(&self, pid: u32) -> bool {
        self.nodes.contains_key(&pid)
    }

    /// Owned copy of the live subtree rooted at `pid`.
    pub fn subtree(&self, pid: u32) -> Option<ProcessNode> {
        self.materialize(pid)
    }

    fn fork(
        &mut self,
        ts: u64,
        ppid: u32,
        pid: u32,
        parent_comm: String,
        comm: String,
    ) -> Result<Option<Arc<ProcessNode>>, TrackerFault> {
        if self.is_ancestor(pid, ppid) {
            return Err(TrackerFault::Cycle { parent: ppid, child: pid });
        }
        if !self.nodes.contains_key(&ppid) {
            self.insert_placeholder(ppid, parent_comm);
        }

        let Some(existing) = self.nodes.get_mut(&pid) else {
            let mut node = TrackedProcess::new(ParentPid::Known(ppid), comm);
            node.creation_time = Some(ts);
            self.nodes.insert(pid, node);
            self.attach(pid, ppid);
            return Ok(None);
        };

        // 重复的 fork：覆盖字段，不重复计数
        let was_terminated = existing.is_terminated();
        let old_parent = existing.parent;
        existing.ppid = ParentPid::Known(ppid);
        existing.comm = comm;
        existing.creation_time = Some(ts);
        existing.exit_time = None;
        existing.is_active = true;
        existing.is_bootstrapped = false;

        if old_parent == Some(ppid) {
            if was_terminated {
                self.bump(ppid);
            }
            return Ok(None);
        }

        let mut orphaned_parent = None;
        match old_parent {
            Some(old) => {
                if let Some(node) = self.nodes.get_mut(&old) {
                    node.children.remove(&pid);
                    if !was_terminated && !node.is_terminated() {
                        node.active_children = node.active_children.saturating_sub(1);
                        if node.is_terminated() {
                            orphaned_parent = Some(old);
                        }
                    }
                }
            }
            None => {
                self.roots.remove(&pid);
            }
        }
        self.attach(pid, ppid);

        Ok(orphaned_parent.and_then(|old| self.settle(old)))
    }

    fn exec(&mut self, pid: u32, comm: String, filename: String) {
        if let Some(node) = self.nodes.get_mut(&pid) {
            node.comm = comm;
            node.filename = Some(filename);
            node.is_bootstrapped = false;
            return;
        }

        let mut node = TrackedProcess::new(ParentPid::Unknown, comm);
        node.filename = Some(filename);
        node.creation_time = Some((self.clock)());
        self.nodes.insert(pid, node);
        self.roots.insert(pid);
    }

    fn exit(&mut self, ts: u64, pid: u32) -> Option<Arc<ProcessNode>> {
        let node = self.nodes.get_mut(&pid)?;
        if !node.is_active {
            return None;
        }
        node.is_active = false;
        node.exit_time = Some(ts);

        if node.is_terminated() {
            self.settle(pid)
        } else {
            None
        }
    }

    /// Propagates a node that just became subtree-terminated towards the
    /// root, reaping the first prunable subtree found on the way. A child of
    /// a boundary that has itself terminated is not reaped on its own: the
    /// walk continues so the whole subtree goes to history in one piece.
    fn settle(&mut self, pid: u32) -> Option<Arc<ProcessNode>> {
        let mut current = pid;
        loop {
            let node = self.nodes.get(&current)?;
            if !node.is_terminated() {
                return None;
            }
            let parent = node.parent;
            if let Some(parent) = parent {
                if let Some(parent_node) = self.nodes.get_mut(&parent) {
                    parent_node.active_children = parent_node.active_children.saturating_sub(1);
                }
            }
            if self.is_prunable_root(current) {
                let boundary_terminated = parent
                    .and_then(|p| self.nodes.get(&p))
                    .is_some_and(TrackedProcess::is_terminated);
                if !boundary_terminated {
                    return self.reap(current);
                }
            }
            current = parent?;
        }
    }

    /// Counts a child that is (again) not subtree-terminated, reviving
    /// ancestors that had already been counted as terminated.
    fn bump(&mut self, pid: u32) {
        let mut current = pid;
        while let Some(node) = self.nodes.get_mut(&current) {
            let was_terminated = node.is_terminated();
            node.active_children += 1;
            match (was_terminated, node.parent) {
                (true, Some(parent)) => current = parent,
                _ => return,
            }
        }
    }

    fn attach(&mut self, child: u32, parent: u32) {
        let child_terminated = match self.nodes.get_mut(&child) {
            Some(node) => {
                node.parent = Some(parent);
                node.is_terminated()
            }
            None => return,
        };
        self.roots.remove(&child);
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.insert(child);
        }
        if !child_terminated {
            self.bump(parent);
        }
    }

    /// Stands in for a parent the tracer never saw, and adopts the roots
    /// that report it as their parent.
    fn insert_placeholder(&mut self, pid: u32, comm: String) {
        let mut node = TrackedProcess::new(ParentPid::Unknown, comm);
        node.is_bootstrapped = true;
        self.nodes.insert(pid, node);
        self.roots.insert(pid);

        let orphans: Vec<u32> = self
            .roots
            .iter()
            .copied()
            .filter(|root| {
                *root != pid
                    && self
                        .nodes
                        .get(root)
                        .is_some_and(|n| n.ppid == ParentPid::Known(pid))
            })
            .collect();
        for orphan in orphans {
            trace!("placeholder {} adopts {}", pid, orphan);
            self.attach(orphan, pid);
        }
    }

    fn insert_subtree(&mut self, root: ProcessNode, parent: Option<u32>) {
        let pid = root.pid;
        let mut node = TrackedProcess::new(root.ppid, root.comm);
        node.filename = root.filename;
        node.creation_time = root.creation_time;
        node.exit_time = root.exit_time;
        node.is_active = root.is_active;
        node.is_bootstrapped = root.is_bootstrapped;
        self.nodes.insert(pid, node);

        match parent {
            Some(parent) => self.attach(pid, parent),
            None => {
                self.roots.insert(pid);
            }
        }
        for child in root.children.into_values() {
            self.insert_subtree(child, Some(pid));
        }
    }

    fn is_prunable_root(&self, pid: u32) -> bool {
        match self.nodes.get(&pid).and_then(|n| n.parent) {
            None => true,
            Some(parent) => self
                .nodes
                .get(&parent)
                .is_some_and(|p| self.boundaries.matches(&p.comm)),
        }
    }

    /// True when `ancestor` is `pid` itself or lies on its parent chain.
    fn is_ancestor(&self, ancestor: u32, pid: u32) -> bool {
        let mut current = Some(pid);
        // 防御损坏数据导致的环
        for _ in 0..=self.nodes.len() {
            match current {
                Some(p) if p == ancestor => return true,
                Some(p) => current = self.nodes.get(&p).and_then(|n| n.parent),
                None => return false,
            }
        }
        false
    }

    fn reap(&mut self, pid: u32) -> Option<Arc<ProcessNode>> {
        match self.nodes.get(&pid)?.parent {
            Some(parent) => {
                if let Some(node) = self.nodes.get_mut(&parent) {
                    node.children.remove(&pid);
                }
            }
            None => {
                self.roots.remove(&pid);
            }
        }

        let subtree = Arc::new(self.remove_subtree(pid)?);
        debug!(
            "reaped subtree rooted at {} ({}, {} nodes)",
            pid,
            subtree.comm,
            subtree.subtree_len()
        );

        self.history.push_front(subtree.clone());
        self.history.truncate(self.max_history);
        Some(subtree)
    }

    fn remove_subtree(&mut self, pid: u32) -> Option<ProcessNode> {
        let tracked = self.nodes.remove(&pid)?;
        let mut node = tracked.to_node(pid);
        for child in tracked.children {
            if let Some(child_node) = self.remove_subtree(child) {
                node.children.insert(child, child_node);
            }
        }
        Some(node)
    }

    fn materialize(&self, pid: u32) -> Option<ProcessNode> {
        let tracked = self.nodes.get(&pid)?;
        let mut node = tracked.to_node(pid);
        for child in &tracked.children {
            if let Some(child_node) = self.materialize(*child) {
                node.children.insert(*child, child_node);
            }
        }
        Some(node)
    }
}
