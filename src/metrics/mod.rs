use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_gauge_with_registry,
};
use lazy_static::lazy_static;
use std::sync::Arc;

use crate::models::TreeSnapshot;

pub struct MetricsRegistry {
    registry: Registry,

    // Counter metrics
    pub events_total: CounterVec,
    pub events_lost_total: CounterVec,
    pub subtrees_reaped_total: Counter,
    pub integrity_faults_total: Counter,
    pub sink_failures_total: Counter,

    // Gauge metrics
    pub live_nodes: Gauge,
    pub history_entries: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_total = register_counter_vec_with_registry!(
            Opts::new("tracer_events_total", "Process events applied to the tree"),
            &["kind"],
            registry
        ).unwrap();

        let events_lost_total = register_counter_vec_with_registry!(
            Opts::new("tracer_events_lost_total", "Samples dropped by the kernel perf buffers"),
            &["buffer"],
            registry
        ).unwrap();

        let subtrees_reaped_total = register_counter_with_registry!(
            Opts::new("tracer_subtrees_reaped_total", "Terminated subtrees moved to history"),
            registry
        ).unwrap();

        let integrity_faults_total = register_counter_with_registry!(
            Opts::new("tracer_integrity_faults_total", "Events dropped because they would corrupt the tree"),
            registry
        ).unwrap();

        let sink_failures_total = register_counter_with_registry!(
            Opts::new("tracer_sink_failures_total", "Records the remote sink failed to deliver"),
            registry
        ).unwrap();

        let live_nodes = register_gauge_with_registry!(
            Opts::new("tracer_live_nodes", "Processes currently tracked in live trees"),
            registry
        ).unwrap();

        let history_entries = register_gauge_with_registry!(
            Opts::new("tracer_history_entries", "Terminated subtrees kept in history"),
            registry
        ).unwrap();

        Self {
            registry,
            events_total,
            events_lost_total,
            subtrees_reaped_total,
            integrity_faults_total,
            sink_failures_total,
            live_nodes,
            history_entries,
        }
    }

    pub fn render(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn observe_snapshot(&self, snapshot: &TreeSnapshot) {
        self.live_nodes.set(snapshot.live_count as f64);
        self.history_entries.set(snapshot.history.len() as f64);
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    pub static ref METRICS: Arc<MetricsRegistry> = Arc::new(MetricsRegistry::new());
}
