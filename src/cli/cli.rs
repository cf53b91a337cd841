use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(debug_assertions)]
const DEFAULT_PROBE_OBJECT: &str = "ebpf/target/bpfel-unknown-none/debug/proc-tree-probes";
#[cfg(not(debug_assertions))]
const DEFAULT_PROBE_OBJECT: &str = "ebpf/target/bpfel-unknown-none/release/proc-tree-probes";

/// Proc Tree Tracer - 基于 eBPF 的实时进程树
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CommandArgs {
    /// 每秒重绘次数
    #[arg(long, env = "REFRESH_HZ", default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub refresh_hz: u32,

    /// 保留的已终止子树数量
    #[arg(long, env = "MAX_HISTORY", default_value_t = 10)]
    pub max_history: usize,

    /// 长期存活的进程名（正则，完整匹配）；其已终止的子树会被立即回收
    #[arg(long = "reap-boundary", env = "REAP_BOUNDARY", value_delimiter = ',', default_value = "systemd")]
    pub reap_boundaries: Vec<String>,

    /// 远程收集器地址 host:port
    #[arg(long = "sink", env = "SINK_ADDR")]
    pub sink_addr: Option<String>,

    /// eBPF 目标文件路径
    #[arg(long, env = "PROBE_OBJECT", default_value = DEFAULT_PROBE_OBJECT)]
    pub probe_object: PathBuf,

    /// 不在终端绘制进程树
    #[arg(long, env = "HEADLESS")]
    pub headless: bool,

    /// 开启 /metrics 与 /api/tree 的监听端口
    #[arg(short = 'p', long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// 监听地址
    #[arg(short = 'a', long, env = "ADDRESS", default_value = "127.0.0.1")]
    pub address: String,
}

impl CommandArgs {
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(1) / self.refresh_hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CommandArgs::parse_from(["proc-tree-tracer"]);
        assert_eq!(args.refresh_hz, 5);
        assert_eq!(args.refresh_period(), Duration::from_millis(200));
        assert_eq!(args.max_history, 10);
        assert_eq!(args.reap_boundaries, vec!["systemd".to_string()]);
        assert!(args.sink_addr.is_none());
        assert!(args.http_port.is_none());
        assert!(!args.headless);
    }

    #[test]
    fn boundaries_accept_a_comma_list() {
        let args = CommandArgs::parse_from([
            "proc-tree-tracer",
            "--reap-boundary",
            "systemd,tmux: server",
            "--sink",
            "127.0.0.1:9090",
            "--refresh-hz",
            "10",
        ]);
        assert_eq!(args.reap_boundaries, vec!["systemd", "tmux: server"]);
        assert_eq!(args.sink_addr.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(args.refresh_period(), Duration::from_millis(100));
    }

    #[test]
    fn zero_refresh_rate_is_rejected() {
        assert!(CommandArgs::try_parse_from(["proc-tree-tracer", "--refresh-hz", "0"]).is_err());
    }
}
