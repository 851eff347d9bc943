//! Per-intent single-shot reservation timers.
//!
//! Each armed timer is a spawned task sleeping until the confirmation window
//! closes, then running its expire future. `cancel` aborts the task and is an
//! idempotent no-op once the timer has fired or was already canceled; a fire
//! racing a cancel is absorbed by the engine's single-winner intent
//! transition.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::model::IntentId;

/// Cheaply clonable handle over the live timer tasks.
#[derive(Debug, Clone, Default)]
pub struct ReservationTimer {
    tasks: Arc<DashMap<IntentId, JoinHandle<()>>>,
}

impl ReservationTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `intent`. Re-arming the same id replaces the old task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(&self, intent: IntentId, after: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tasks = Arc::clone(&self.tasks);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // drop our own entry before expiring so is_armed reads false
            tasks.remove(&intent);
            on_expire.await;
        });
        if let Some(previous) = self.tasks.insert(intent, handle) {
            previous.abort();
        }
    }

    /// Disarm the timer for `intent`, if still armed.
    pub fn cancel(&self, intent: IntentId) {
        if let Some((_, handle)) = self.tasks.remove(&intent) {
            handle.abort();
        }
    }

    pub fn is_armed(&self, intent: IntentId) -> bool {
        self.tasks.contains_key(&intent)
    }
}
