use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;

/// 父进程 ID：可能从未被观测到
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParentPid {
    Known(u32),
    Unknown,
}

impl ParentPid {
    pub fn known(self) -> Option<u32> {
        match self {
            ParentPid::Known(ppid) => Some(ppid),
            ParentPid::Unknown => None,
        }
    }
}

impl Serialize for ParentPid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParentPid::Known(ppid) => serializer.serialize_u32(*ppid),
            ParentPid::Unknown => serializer.serialize_none(),
        }
    }
}

/// 进程树中的一个节点（存活或已进入历史）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessNode {
    pub pid: u32,
    pub ppid: ParentPid,
    /// 短命令名，exec 时更新
    pub comm: String,
    /// 最近一次 exec 的文件路径
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// 单调时钟纳秒；占位节点未知
    pub creation_time: Option<u64>,
    pub exit_time: Option<u64>,
    pub is_active: bool,
    /// 由启动扫描或占位合成，祖先关系不可靠
    pub is_bootstrapped: bool,
    /// 未完全终止的直接子节点数
    pub active_descendant_count: usize,
    #[serde(serialize_with = "children_as_list")]
    pub children: BTreeMap<u32, ProcessNode>,
}

fn children_as_list<S: Serializer>(
    children: &BTreeMap<u32, ProcessNode>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(children.values())
}

impl ProcessNode {
    pub fn new(pid: u32, ppid: ParentPid, comm: impl Into<String>) -> Self {
        Self {
            pid,
            ppid,
            comm: comm.into(),
            filename: None,
            creation_time: None,
            exit_time: None,
            is_active: true,
            is_bootstrapped: false,
            active_descendant_count: 0,
            children: BTreeMap::new(),
        }
    }

    /// Lifetime in seconds: until exit for exited nodes, until `now_ns` otherwise.
    /// `None` when the creation time was never observed.
    pub fn execution_time_s(&self, now_ns: u64) -> Option<f64> {
        let created = self.creation_time?;
        let end = self.exit_time.unwrap_or(now_ns);
        Some(end.saturating_sub(created) as f64 / 1_000_000_000.0)
    }

    /// Number of nodes in this subtree, itself included.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.values().map(ProcessNode::subtree_len).sum::<usize>()
    }

    /// Every pid in the subtree, depth first in ascending pid order.
    #[cfg(test)]
    pub fn pids(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.subtree_len());
        self.collect_pids(&mut out);
        out
    }

    #[cfg(test)]
    fn collect_pids(&self, out: &mut Vec<u32>) {
        out.push(self.pid);
        for child in self.children.values() {
            child.collect_pids(out);
        }
    }
}

/// 追踪器的只读快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TreeSnapshot {
    /// 存活根节点，按 pid 升序
    pub roots: Vec<ProcessNode>,
    /// 最近终止的子树，最新在前
    pub history: Vec<Arc<ProcessNode>>,
    pub live_count: usize,
}
