use std::collections::{BTreeMap, HashMap};

use sysinfo::{ProcessesToUpdate, System};

use crate::models::{ParentPid, ProcessNode};
use crate::services::clock::monotonic_ns;

/// One row of the process table as seen by the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub comm: String,
}

/// 扫描当前进程表，返回隐式根节点（各自持有已链接的子树）
///
/// Processes that exit while the table is being read are simply missing from
/// the result; unreadable entries are skipped by sysinfo itself.
pub fn scan() -> BTreeMap<u32, ProcessNode> {
    let t0 = monotonic_ns();

    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let entries: Vec<ProcEntry> = sys
        .processes()
        .iter()
        // 跳过线程，只保留进程
        .filter(|(_, process)| process.thread_kind().is_none())
        .map(|(pid, process)| ProcEntry {
            pid: pid.as_u32(),
            ppid: process.parent().map(|p| p.as_u32()),
            comm: process.name().to_string_lossy().into_owned(),
        })
        .collect();

    log::info!("Bootstrap scan found {} processes", entries.len());
    link_snapshot(entries, t0)
}

/// Links scanned entries into trees. Entries whose parent is missing from the
/// snapshot become roots; every node gets `creation_time = t0` and is flagged
/// as bootstrapped.
pub fn link_snapshot(entries: Vec<ProcEntry>, t0: u64) -> BTreeMap<u32, ProcessNode> {
    let mut nodes: HashMap<u32, ProcessNode> = HashMap::with_capacity(entries.len());
    for entry in entries {
        let ppid = entry.ppid.map(ParentPid::Known).unwrap_or(ParentPid::Unknown);
        let mut node = ProcessNode::new(entry.pid, ppid, entry.comm);
        node.creation_time = Some(t0);
        node.is_bootstrapped = true;
        nodes.insert(entry.pid, node);
    }

    let mut children_of: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut root_pids = Vec::new();
    for node in nodes.values() {
        match node.ppid.known() {
            Some(ppid) if ppid != node.pid && nodes.contains_key(&ppid) => {
                children_of.entry(ppid).or_default().push(node.pid);
            }
            _ => root_pids.push(node.pid),
        }
    }

    let total = nodes.len();
    let mut roots = BTreeMap::new();
    for pid in root_pids {
        if let Some(root) = build_subtree(pid, &mut nodes, &children_of) {
            roots.insert(pid, root);
        }
    }

    if !nodes.is_empty() {
        log::debug!(
            "Dropped {} of {} scanned processes caught in a parent cycle",
            nodes.len(),
            total
        );
    }
    roots
}

fn build_subtree(
    pid: u32,
    nodes: &mut HashMap<u32, ProcessNode>,
    children_of: &HashMap<u32, Vec<u32>>,
) -> Option<ProcessNode> {
    let mut node = nodes.remove(&pid)?;
    for child in children_of.get(&pid).into_iter().flatten() {
        if let Some(child_node) = build_subtree(*child, nodes, children_of) {
            node.children.insert(*child, child_node);
        }
    }
    node.active_descendant_count = node.children.len();
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: u32, ppid: Option<u32>, comm: &str) -> ProcEntry {
        ProcEntry {
            pid,
            ppid,
            comm: comm.to_string(),
        }
    }

    #[test]
    fn missing_parent_makes_a_bootstrapped_root() {
        let roots = link_snapshot(vec![entry(50, Some(1), "sshd")], 99);

        assert_eq!(roots.len(), 1);
        let node = &roots[&50];
        assert_eq!(node.ppid, ParentPid::Known(1));
        assert!(node.is_bootstrapped);
        assert_eq!(node.creation_time, Some(99));
    }

    #[test]
    fn links_children_under_present_parents() {
        let roots = link_snapshot(
            vec![
                entry(1, Some(0), "systemd"),
                entry(2, Some(0), "kthreadd"),
                entry(300, Some(1), "sshd"),
                entry(301, Some(300), "bash"),
                entry(42, Some(2), "kworker/0:1"),
            ],
            5,
        );

        assert_eq!(roots.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(roots[&1].pids(), vec![1, 300, 301]);
        assert_eq!(roots[&2].pids(), vec![2, 42]);
        assert_eq!(roots[&1].active_descendant_count, 1);
        assert!(roots[&1].children[&300].children[&301].is_bootstrapped);
    }

    #[test]
    fn parent_cycles_and_self_parents_do_not_hang() {
        let roots = link_snapshot(
            vec![
                entry(10, Some(11), "a"),
                entry(11, Some(10), "b"),
                entry(12, Some(12), "c"),
                entry(13, None, "d"),
            ],
            0,
        );

        assert_eq!(roots.keys().copied().collect::<Vec<_>>(), vec![12, 13]);
        assert_eq!(roots[&13].ppid, ParentPid::Unknown);
    }

    #[test]
    fn scan_sees_the_current_process() {
        let roots = scan();
        let me = std::process::id();
        assert!(roots.values().any(|root| root.pids().contains(&me)));
    }
}
