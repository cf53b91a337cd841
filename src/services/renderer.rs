use std::fmt::Write as _;
use std::io;

use console::Term;

use crate::models::{ProcessNode, TreeSnapshot};

/// Renders a snapshot as an indented tree followed by the recently
/// terminated subtrees. `now_ns` is the monotonic time used for running
/// processes.
pub fn render(snapshot: &TreeSnapshot, now_ns: u64) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<6} {:<20} {:<25} NOTES", "PID", "COMMAND", "LIFETIME (s)");
    out.push_str(&"-".repeat(70));
    out.push('\n');

    for root in &snapshot.roots {
        render_subtree(&mut out, root, 0, now_ns);
    }

    out.push_str("\n--- Recently Terminated Process Trees ---\n");
    if snapshot.history.is_empty() {
        out.push_str("(None)\n");
    } else {
        for (i, root) in snapshot.history.iter().enumerate() {
            if i > 0 {
                out.push_str(&"-".repeat(25));
                out.push('\n');
            }
            render_subtree(&mut out, root, 0, now_ns);
        }
    }

    out.push('\n');
    out.push_str(&"=".repeat(80));
    out.push('\n');
    let _ = writeln!(
        out,
        "Tracking {} total nodes in live trees.",
        snapshot.live_count
    );
    out
}

fn render_subtree(out: &mut String, node: &ProcessNode, depth: usize, now_ns: u64) {
    let indent = "  ".repeat(depth);
    let prefix = if depth > 0 { "|- " } else { "" };

    let lifetime = match node.execution_time_s(now_ns) {
        Some(secs) => format!("{:.3}", secs),
        None => "N/A".to_string(),
    };
    let status = if node.is_active {
        format!("Running for {}s", lifetime)
    } else {
        format!("[EXITED after {}s]", lifetime)
    };
    let note = if node.is_bootstrapped { "*" } else { "" };

    let _ = writeln!(
        out,
        "{}{}{:<6} {:<20} {:<28} {}",
        indent, prefix, node.pid, node.comm, status, note
    );

    // BTreeMap 已按 pid 升序
    for child in node.children.values() {
        render_subtree(out, child, depth + 1, now_ns);
    }
}

/// 在终端中原地重绘
pub struct ConsoleRenderer {
    term: Term,
}

impl ConsoleRenderer {
    pub fn new() -> Self {
        Self {
            term: Term::stdout(),
        }
    }

    pub fn paint(&self, text: &str) -> io::Result<()> {
        self.term.clear_screen()?;
        self.term.write_str(text)?;
        self.term.flush()
    }
}

impl Default for ConsoleRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParentPid;
    use std::sync::Arc;

    fn node(pid: u32, comm: &str, created: Option<u64>) -> ProcessNode {
        let mut n = ProcessNode::new(pid, ParentPid::Known(1), comm);
        n.creation_time = created;
        n
    }

    #[test]
    fn empty_snapshot() {
        let text = render(&TreeSnapshot::default(), 0);
        assert!(text.starts_with("PID"));
        assert!(text.contains("--- Recently Terminated Process Trees ---\n(None)\n"));
        assert!(text.ends_with("Tracking 0 total nodes in live trees.\n"));
    }

    #[test]
    fn children_are_indented_in_pid_order() {
        let mut root = node(1, "systemd", None);
        root.is_bootstrapped = true;
        root.children.insert(30, node(30, "cron", Some(0)));
        root.children.insert(20, node(20, "sshd", Some(1_000_000_000)));

        let snapshot = TreeSnapshot {
            roots: vec![root],
            history: Vec::new(),
            live_count: 3,
        };
        let text = render(&snapshot, 3_000_000_000);
        let lines: Vec<&str> = text.lines().collect();

        assert!(lines[2].starts_with("1      systemd"));
        assert!(lines[2].contains("Running for N/As"));
        assert!(lines[2].trim_end().ends_with('*'));
        assert!(lines[3].starts_with("  |- 20     sshd"));
        assert!(lines[3].contains("Running for 2.000s"));
        assert!(lines[4].starts_with("  |- 30     cron"));
        assert!(text.contains("Tracking 3 total nodes"));
    }

    #[test]
    fn history_is_rendered_newest_first_with_separators() {
        let mut newest = node(200, "make", Some(0));
        newest.is_active = false;
        newest.exit_time = Some(1_500_000_000);
        let mut oldest = node(100, "ls", Some(0));
        oldest.is_active = false;
        oldest.exit_time = Some(250_000_000);

        let snapshot = TreeSnapshot {
            roots: Vec::new(),
            history: vec![Arc::new(newest), Arc::new(oldest)],
            live_count: 0,
        };
        let text = render(&snapshot, 9_000_000_000);

        let make = text.find("[EXITED after 1.500s]").unwrap();
        let sep = text.find(&format!("\n{}\n", "-".repeat(25))).unwrap();
        let ls = text.find("[EXITED after 0.250s]").unwrap();
        assert!(make < sep && sep < ls);
        assert!(!text.contains("(None)"));
    }
}
