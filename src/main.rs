use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};

mod models;
mod services;
mod state;
mod api;
mod cli;
mod metrics;

use api::{get_metrics, get_subtree, get_tree, health};
use cli::CommandArgs;
use services::bootstrap;
use services::ebpf_loader::EbpfLoader;
use services::renderer::ConsoleRenderer;
use services::{spawn_forwarder, EventLoop, ProcessTreeTracker, ReapBoundaries, RemoteSink, TrackerConfig};
use state::new_state;

// 内核到用户态的事件队列
const EVENT_QUEUE: usize = 8192;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CommandArgs::parse();

    if !nix::unistd::geteuid().is_root() {
        log::error!("❌ proc-tree-tracer must run as root to attach eBPF probes");
        log::error!("   Tip: Run with 'sudo'");
        std::process::exit(1);
    }

    let boundaries = ReapBoundaries::new(&args.reap_boundaries)
        .context("invalid --reap-boundary pattern")?;
    let config = TrackerConfig {
        max_history: args.max_history,
        boundaries,
    };

    // 先挂载探针再扫描，扫描期间的事件排队等待合并
    log::info!("🔄 Loading eBPF programs from {}...", args.probe_object.display());
    let mut ebpf_loader = match EbpfLoader::load(&args.probe_object) {
        Ok(loader) => loader,
        Err(e) => {
            log::error!("❌ Failed to load eBPF program: {}", e);
            log::error!("   Full error chain:");
            for cause in e.chain() {
                log::error!("     - {}", cause);
            }
            if !args.probe_object.exists() {
                log::error!("   ✗ eBPF file NOT found at: {}", args.probe_object.display());
                log::error!("   Please run: cd ebpf && cargo +nightly build --release");
            }
            std::process::exit(1);
        }
    };

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let readers = ebpf_loader.spawn_readers(event_tx, shutdown_rx)?;

    let snapshot = bootstrap::scan();
    let tracker = ProcessTreeTracker::from_bootstrap(snapshot, config);
    log::info!("Tracking {} processes from the initial scan", tracker.live_len());
    let tracker = new_state(tracker);

    let server = match args.http_port {
        Some(port) => {
            let bind_address = format!("{}:{}", args.address, port);
            let http_state = tracker.clone();
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(http_state.clone()))
                    .route("/api/tree", web::get().to(get_tree))
                    .route("/api/tree/{pid}", web::get().to(get_subtree))
                    .route("/metrics", web::get().to(get_metrics))
                    .route("/health", web::get().to(health))
            })
                .workers(1)
                .bind(&bind_address)
                .with_context(|| format!("failed to bind {}", bind_address))?
                .disable_signals()
                .run();
            log::info!("🚀 Serving /api/tree and /metrics on http://{}", bind_address);
            let handle = server.handle();
            tokio::spawn(server);
            Some(handle)
        }
        None => None,
    };

    let mut event_loop = EventLoop::new(tracker, args.refresh_period());
    if !args.headless {
        event_loop = event_loop.with_renderer(ConsoleRenderer::new());
    }
    let mut forwarder_task = None;
    if let Some(addr) = &args.sink_addr {
        let (tx, task) = spawn_forwarder(RemoteSink::new(addr.clone()));
        event_loop = event_loop.with_forwarder(tx);
        forwarder_task = Some(task);
    }

    log::info!("Tracing process events... Ctrl+C to quit.");
    event_loop
        .run(event_rx, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    // 通知读取任务退出并释放探针
    let _ = shutdown_tx.send(true);
    for reader in readers {
        let _ = reader.await;
    }
    drop(ebpf_loader);

    if let Some(task) = forwarder_task {
        let _ = task.await;
    }
    if let Some(handle) = server {
        handle.stop(true).await;
    }

    log::info!("Detached.");
    Ok(())
}
