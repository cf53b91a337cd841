use aya::{
    maps::perf::AsyncPerfEventArray,
    programs::TracePoint,
    util::online_cpus,
    Ebpf,
};
use aya_log::EbpfLogger;
use bytes::BytesMut;
use log::{info, trace, warn};
use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};
use std::path::Path;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::metrics::METRICS;
use crate::models::event::{decode_exec, decode_exit, decode_fork, FILENAME_LEN};
use crate::models::ProcessEvent;

type Decoder = fn(&[u8]) -> Option<ProcessEvent>;

/// (program, category, tracepoint)
const TRACEPOINTS: [(&str, &str, &str); 4] = [
    ("handle_execve", "syscalls", "sys_enter_execve"),
    ("handle_execveat", "syscalls", "sys_enter_execveat"),
    ("handle_fork", "sched", "sched_process_fork"),
    ("handle_exit", "sched", "sched_process_exit"),
];

// 每次 read_events 最多取出的样本数
const BATCH_SIZE: usize = 10;

/// Owns the loaded probes. Dropping it detaches every program.
pub struct EbpfLoader {
    ebpf: Ebpf,
}

impl EbpfLoader {
    /// Loads the probe object and attaches all tracepoints. Any failure here
    /// is fatal for the tracer.
    pub fn load(object: &Path) -> anyhow::Result<Self> {
        bump_memlock_rlimit();

        let mut ebpf = Ebpf::load_file(object).map_err(|e| {
            anyhow::anyhow!("Failed to load eBPF object {}: {:?}", object.display(), e)
        })?;

        if let Err(e) = EbpfLogger::init(&mut ebpf) {
            warn!("Failed to init eBPF logger: {}", e);
        } else {
            info!("✓ eBPF logger initialized");
        }

        for (name, category, tracepoint) in TRACEPOINTS {
            info!("Attaching {} to {}:{}...", name, category, tracepoint);
            let program: &mut TracePoint = ebpf
                .program_mut(name)
                .ok_or_else(|| anyhow::anyhow!("{} program not found", name))?
                .try_into()
                .map_err(|e| anyhow::anyhow!("Failed to convert {} to TracePoint: {:?}", name, e))?;

            program
                .load()
                .map_err(|e| anyhow::anyhow!("Failed to load {}: {:?}", name, e))?;

            program
                .attach(category, tracepoint)
                .map_err(|e| anyhow::anyhow!("Failed to attach {}: {:?}", name, e))?;
            info!("✓ Attached tracepoint: {}:{}", category, tracepoint);
        }

        info!("🎉 All eBPF programs loaded and attached successfully");
        Ok(Self { ebpf })
    }

    /// Spawns one reader task per perf buffer and CPU. Each task decodes the
    /// samples it reads and forwards them to `tx` until `shutdown` fires or
    /// the receiver goes away.
    pub fn spawn_readers(
        &mut self,
        tx: mpsc::Sender<ProcessEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let cpus = online_cpus()
            .map_err(|(path, e)| anyhow::anyhow!("Failed to read online CPUs from {}: {}", path, e))?;

        let buffers: [(&'static str, Decoder); 3] = [
            ("EXEC_EVENTS", decode_exec as Decoder),
            ("FORK_EVENTS", decode_fork as Decoder),
            ("EXIT_EVENTS", decode_exit as Decoder),
        ];

        let mut handles = Vec::with_capacity(buffers.len() * cpus.len());
        for (map_name, decode) in buffers {
            let map = self
                .ebpf
                .take_map(map_name)
                .ok_or_else(|| anyhow::anyhow!("{} map not found", map_name))?;
            let mut perf_array = AsyncPerfEventArray::try_from(map)
                .map_err(|e| anyhow::anyhow!("Failed to open {} as perf array: {:?}", map_name, e))?;

            for cpu_id in cpus.iter().copied() {
                let mut buf = perf_array
                    .open(cpu_id, None)
                    .map_err(|e| anyhow::anyhow!("Failed to open {} on CPU {}: {:?}", map_name, cpu_id, e))?;
                let tx = tx.clone();
                let mut shutdown = shutdown.clone();

                handles.push(tokio::spawn(async move {
                    let mut samples = (0..BATCH_SIZE)
                        .map(|_| BytesMut::with_capacity(FILENAME_LEN * 2))
                        .collect::<Vec<_>>();
                    loop {
                        let events = tokio::select! {
                            _ = shutdown.changed() => return,
                            events = buf.read_events(&mut samples) => events,
                        };
                        let events = match events {
                            Ok(events) => events,
                            Err(e) => {
                                warn!("{}: read failed on CPU {}: {}", map_name, cpu_id, e);
                                return;
                            }
                        };

                        if events.lost > 0 {
                            warn!("{}: Lost {} events (read {})", map_name, events.lost, events.read);
                            METRICS
                                .events_lost_total
                                .with_label_values(&[map_name])
                                .inc_by(events.lost as f64);
                        }

                        for sample in samples.iter_mut().take(events.read) {
                            match decode(&sample[..]) {
                                Some(event) => {
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                                None => trace!("{}: short sample of {} bytes", map_name, sample.len()),
                            }
                            sample.clear();
                        }
                    }
                }));
            }
        }

        info!("Reading {} perf buffers on {} CPUs", buffers.len(), cpus.len());
        Ok(handles)
    }
}

/// Kernels before 5.11 charge BPF maps against RLIMIT_MEMLOCK.
fn bump_memlock_rlimit() {
    if let Err(e) = setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY) {
        warn!("Failed to remove limit on locked memory: {}", e);
    }
}
