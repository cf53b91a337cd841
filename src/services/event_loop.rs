use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, MissedTickBehavior};

use crate::metrics::METRICS;
use crate::models::{ProcessEvent, ProcessNode};
use crate::services::clock::monotonic_ns;
use crate::services::renderer::{render, ConsoleRenderer};
use crate::state::{lock_tracker, SharedTracker};

/// Single consumer of decoded events. Applies them to the tracker one at a
/// time and repaints on its own cadence.
pub struct EventLoop {
    tracker: SharedTracker,
    renderer: Option<ConsoleRenderer>,
    forwarder: Option<mpsc::Sender<Arc<ProcessNode>>>,
    refresh: Duration,
}

impl EventLoop {
    pub fn new(tracker: SharedTracker, refresh: Duration) -> Self {
        Self {
            tracker,
            renderer: None,
            forwarder: None,
            refresh,
        }
    }

    pub fn with_renderer(mut self, renderer: ConsoleRenderer) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_forwarder(mut self, forwarder: mpsc::Sender<Arc<ProcessNode>>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Runs until `shutdown` resolves or every event sender is gone, then
    /// paints one last frame. Dropping the loop releases the forwarder.
    pub async fn run(mut self, mut events: mpsc::Receiver<ProcessEvent>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut ticker = time::interval(self.refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Interrupted, detaching...");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        warn!("Event source closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.repaint(),
            }
        }

        self.repaint();
    }

    fn handle(&mut self, event: ProcessEvent) {
        let kind = event.kind();
        let pid = event.pid();
        let result = lock_tracker(&self.tracker).apply(event);
        METRICS.events_total.with_label_values(&[kind]).inc();

        match result {
            Ok(Some(subtree)) => {
                METRICS.subtrees_reaped_total.inc();
                self.forward(subtree);
            }
            Ok(None) => {}
            Err(fault) => {
                warn!("Dropped {} event for pid {}: {}", kind, pid, fault);
                METRICS.integrity_faults_total.inc();
            }
        }
    }

    fn forward(&mut self, subtree: Arc<ProcessNode>) {
        let Some(forwarder) = &self.forwarder else {
            return;
        };
        match forwarder.try_send(subtree) {
            Ok(()) => {}
            Err(TrySendError::Full(subtree)) => {
                warn!("Forward queue full, dropping subtree {}", subtree.pid);
                METRICS.sink_failures_total.inc();
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Forwarder stopped, no longer forwarding subtrees");
                self.forwarder = None;
            }
        }
    }

    fn repaint(&self) {
        // 渲染在锁外进行
        let snapshot = lock_tracker(&self.tracker).snapshot();
        METRICS.observe_snapshot(&snapshot);

        if let Some(renderer) = &self.renderer {
            let text = render(&snapshot, monotonic_ns());
            if let Err(e) = renderer.paint(&text) {
                warn!("Failed to repaint: {}", e);
            }
        }
    }
}
