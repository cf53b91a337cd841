use crate::services::tracker::ProcessTreeTracker;
use std::sync::{Arc, Mutex, MutexGuard};

/// The tracker is the only state shared between ingestion, rendering and
/// the HTTP handlers.
pub type SharedTracker = Arc<Mutex<ProcessTreeTracker>>;

pub fn new_state(tracker: ProcessTreeTracker) -> SharedTracker {
    Arc::new(Mutex::new(tracker))
}

/// 锁中毒时继续使用内部数据
pub fn lock_tracker(state: &SharedTracker) -> MutexGuard<'_, ProcessTreeTracker> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
