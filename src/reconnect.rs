//! Reconnection coordinator
//!
//! Rebuilds channel bindings without touching subscription identity. Every
//! path ends in [`SubscriptionRegistry::rebind`], which keeps the key, the
//! holders and the route tags, and swaps only the channel underneath.
//!
//! # Paths
//!
//! - `reconnect_one`: immediate rebind of one key; a failed rebind schedules
//!   a retry after `retry_delay`
//! - `reconnect_all`: sequential pass over a snapshot of every key, high
//!   priority first (network recovery, staleness)
//! - `schedule_reconnect`: delayed single-key rebind for channel errors;
//!   at most one pending per key

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::registry::{BindOutcome, SubscriptionRegistry};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::subscription::SubscriptionKey;

/// Tally of one reconnection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconnectSummary {
    /// Keys the pass tried
    pub attempted: usize,
    /// Rebinds that ended with a live channel
    pub rebound: usize,
    /// Rebinds the transport refused (retry scheduled)
    pub failed: usize,
    /// Keys already being rebound by someone else
    pub coalesced: usize,
    /// Keys removed before or during their rebind
    pub gone: usize,
}

impl ReconnectSummary {
    fn record(&mut self, outcome: &BindOutcome) {
        self.attempted += 1;
        match outcome {
            BindOutcome::Bound | BindOutcome::Joined => self.rebound += 1,
            BindOutcome::Failed(_) => self.failed += 1,
            BindOutcome::Coalesced => self.coalesced += 1,
            BindOutcome::Cancelled | BindOutcome::Missing => self.gone += 1,
        }
    }
}

/// Counters for the coordinator's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconnectStats {
    pub passes: u64,
    pub attempts: u64,
    pub failures: u64,
    pub pending: usize,
}

/// Coordinates rebinds for the registry
pub struct ReconnectionCoordinator {
    registry: Arc<SubscriptionRegistry>,
    scheduler: Arc<Scheduler>,
    /// Delay before retrying a rebind the transport refused
    retry_delay: Duration,
    /// Delayed reconnects by key
    pending: Mutex<HashMap<SubscriptionKey, TaskHandle>>,
    passes: AtomicU64,
    attempts: AtomicU64,
    failures: AtomicU64,
    me: Weak<ReconnectionCoordinator>,
}

impl ReconnectionCoordinator {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        scheduler: Arc<Scheduler>,
        retry_delay: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            registry,
            scheduler,
            retry_delay,
            pending: Mutex::new(HashMap::new()),
            passes: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    /// Rebind one subscription now
    pub async fn reconnect_one(&self, key: &SubscriptionKey) -> BindOutcome {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let outcome = self.registry.rebind(key).await;

        match &outcome {
            BindOutcome::Bound => {
                tracing::info!("[RECONNECT] {} reconnected", key);
            }
            BindOutcome::Failed(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "[RECONNECT] {} failed ({}), retrying in {:?}",
                    key,
                    e,
                    self.retry_delay
                );
                self.schedule_reconnect(key.clone(), self.retry_delay);
            }
            BindOutcome::Coalesced => {
                tracing::debug!("[RECONNECT] {} already rebinding, coalesced", key);
            }
            BindOutcome::Cancelled | BindOutcome::Missing | BindOutcome::Joined => {
                tracing::debug!("[RECONNECT] {} no longer subscribed", key);
            }
        }
        outcome
    }

    /// Rebind every subscription, high priority first
    pub async fn reconnect_all(&self) -> ReconnectSummary {
        let keys = self.registry.keys_by_priority();
        tracing::info!("[RECONNECT] Reconnection pass over {} subscriptions", keys.len());
        let summary = self.reconnect_keys(keys).await;
        tracing::info!(
            "[RECONNECT] Pass done: {} rebound, {} failed, {} coalesced, {} gone",
            summary.rebound,
            summary.failed,
            summary.coalesced,
            summary.gone
        );
        summary
    }

    /// Rebind a snapshot of keys one after another
    pub async fn reconnect_keys(&self, keys: Vec<SubscriptionKey>) -> ReconnectSummary {
        self.passes.fetch_add(1, Ordering::Relaxed);
        let mut summary = ReconnectSummary::default();
        for key in keys {
            let outcome = self.reconnect_one(&key).await;
            summary.record(&outcome);
        }
        summary
    }

    /// Rebind `key` once after `delay`
    ///
    /// Returns false if a reconnect for the key is already pending or the
    /// scheduler has stopped.
    pub fn schedule_reconnect(&self, key: SubscriptionKey, delay: Duration) -> bool {
        let mut pending = self.pending.lock();
        if pending.get(&key).is_some_and(|task| !task.is_finished()) {
            tracing::debug!("[RECONNECT] Reconnect for {} already pending", key);
            return false;
        }

        let me = self.me.clone();
        let task_key = key.clone();
        let task = self.scheduler.after("reconnect", delay, async move {
            let Some(this) = me.upgrade() else {
                return;
            };
            // Our own handle: detach so dropping it does not cancel us
            if let Some(handle) = this.pending.lock().remove(&task_key) {
                handle.detach();
            }
            this.reconnect_one(&task_key).await;
        });

        match task {
            Some(task) => {
                tracing::debug!("[RECONNECT] Reconnect for {} in {:?}", key, delay);
                pending.insert(key, task);
                true
            }
            None => false,
        }
    }

    /// Keys with a delayed reconnect still waiting to fire
    pub fn pending(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self
            .pending
            .lock()
            .iter()
            .filter(|(_, task)| !task.is_finished())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drop every pending reconnect
    pub fn cancel_all(&self) -> usize {
        let tasks: Vec<TaskHandle> = self.pending.lock().drain().map(|(_, task)| task).collect();
        let count = tasks.len();
        if count > 0 {
            tracing::debug!("[RECONNECT] Cancelling {} pending reconnects", count);
        }
        count
    }

    pub fn stats(&self) -> ReconnectStats {
        ReconnectStats {
            passes: self.passes.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            pending: self.pending().len(),
        }
    }
}
