//! Real-time subscription manager
//!
//! The explicitly constructed service that owns every component. Build one
//! per application (or per test) with [`RealtimeManager::start`] and hand
//! references to the code that needs them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           RealtimeManager                             │
//! │                                                                       │
//! │   subscribe / unsubscribe / routes / force_refresh / status           │
//! │            │                                                          │
//! │            ▼                                                          │
//! │   SubscriptionRegistry ──open/close──► ChangeFeed                     │
//! │      ▲      │                              │ EventSink                │
//! │      │      └──► CacheInvalidationBridge   ▼                          │
//! │      │                     ▲         mpsc ──► event loop              │
//! │      │                     └──────────────────┤ apply_event           │
//! │      │                                        │ channel error ──┐     │
//! │   ReconnectionCoordinator ◄───────────────────────────────────────┘   │
//! │      ▲                                                               │
//! │   ConnectionHealthMonitor ◄── Scheduler (probe, sweep, settle)        │
//! │      ▲                                                               │
//! │   LivenessSignals (host)                                             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{CacheInvalidationBridge, CacheLayer};
use crate::config::RealtimeConfig;
use crate::error::Result;
use crate::health::{ConnectionHealthMonitor, HealthSnapshot, LivenessSignals};
use crate::reconnect::{ReconnectStats, ReconnectSummary, ReconnectionCoordinator};
use crate::registry::{
    BindOutcome, CompositeHandle, EventDisposition, RegistryStats, Release, SubscriptionHandle,
    SubscriptionRegistry,
};
use crate::scheduler::Scheduler;
use crate::subscription::{
    CacheKeyDescriptor, ConnectionStatus, SubscriptionKey, SubscriptionSpec, SubscriptionStatus,
};
use crate::transport::{ChangeFeed, ChannelEvent};

/// Snapshot of the whole manager
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub status: ConnectionStatus,
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub reconnect: ReconnectStats,
    pub health: HealthSnapshot,
    pub invalidations_issued: u64,
    pub invalidations_failed: u64,
}

/// Real-time subscription manager
pub struct RealtimeManager {
    config: RealtimeConfig,
    registry: Arc<SubscriptionRegistry>,
    bridge: Arc<CacheInvalidationBridge>,
    coordinator: Arc<ReconnectionCoordinator>,
    monitor: Arc<ConnectionHealthMonitor>,
    scheduler: Arc<Scheduler>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeManager {
    /// Build and start a manager
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: RealtimeConfig,
        feed: Arc<dyn ChangeFeed>,
        cache: Arc<dyn CacheLayer>,
    ) -> Result<Self> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(CacheInvalidationBridge::new(cache));
        let registry = SubscriptionRegistry::new(feed.clone(), bridge.clone(), events_tx);
        let scheduler = Arc::new(Scheduler::new());
        let coordinator = ReconnectionCoordinator::new(
            registry.clone(),
            scheduler.clone(),
            config.reconnect.retry_delay(),
        );
        let monitor = ConnectionHealthMonitor::new(
            registry.clone(),
            coordinator.clone(),
            bridge.clone(),
            feed,
            scheduler.clone(),
            config.health.clone(),
        );

        let event_loop = tokio::spawn(run_event_loop(
            events_rx,
            registry.clone(),
            coordinator.clone(),
            config.reconnect.channel_error_delay(),
        ));
        monitor.start();

        tracing::info!("[MANAGER] Realtime manager started");
        Ok(Self {
            config,
            registry,
            bridge,
            coordinator,
            monitor,
            scheduler,
            event_loop: Mutex::new(Some(event_loop)),
        })
    }

    /// Subscribe to a table; joins an existing subscription for the same key
    ///
    /// A transport failure still returns a handle; the bind is retried in
    /// the background.
    pub async fn subscribe(&self, spec: SubscriptionSpec) -> Result<SubscriptionHandle> {
        let (handle, outcome) = self.registry.subscribe(spec).await?;
        self.retry_if_failed(handle.key(), &outcome);
        Ok(handle)
    }

    /// Subscribe to several tables at once
    pub async fn subscribe_many(&self, specs: Vec<SubscriptionSpec>) -> Result<CompositeHandle> {
        let (composite, outcomes) = self.registry.subscribe_many(specs).await?;
        for (handle, outcome) in composite.handles().iter().zip(&outcomes) {
            self.retry_if_failed(handle.key(), outcome);
        }
        Ok(composite)
    }

    fn retry_if_failed(&self, key: &SubscriptionKey, outcome: &BindOutcome) {
        if let BindOutcome::Failed(_) = outcome {
            self.coordinator
                .schedule_reconnect(key.clone(), self.config.reconnect.retry_delay());
        }
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Release {
        self.registry.unsubscribe(handle).await
    }

    pub fn register_for_route(&self, route: &str, handle: &SubscriptionHandle) -> bool {
        self.registry.register_for_route(route, handle.key())
    }

    /// Destroy every subscription tagged for `route`
    pub async fn teardown_route(&self, route: &str) -> usize {
        self.registry.teardown_route(route).await
    }

    /// Invalidate everything cached for `tables` and rebind their subscriptions
    pub async fn force_refresh(&self, tables: &[String]) -> ReconnectSummary {
        self.bridge.on_force_refresh(tables);
        let keys = self.registry.keys_for_tables(tables);
        // Cached entries go stale now, whether or not the rebind succeeds
        for key in &keys {
            self.bridge.invalidate(key.descriptor());
        }
        tracing::info!(
            "[RECONNECT] Force refresh of {} tables, {} subscriptions",
            tables.len(),
            keys.len()
        );
        self.coordinator.reconnect_keys(keys).await
    }

    pub fn status(
        &self,
        table: &str,
        descriptor: impl Into<CacheKeyDescriptor>,
    ) -> Option<SubscriptionStatus> {
        self.registry.status(&SubscriptionKey::new(table, descriptor))
    }

    pub fn global_connection_status(&self) -> ConnectionStatus {
        self.monitor.global_status()
    }

    pub fn subscriptions_by_table(&self) -> BTreeMap<String, Vec<SubscriptionKey>> {
        self.registry.subscriptions_by_table()
    }

    /// Entry point for host environment events
    pub fn signals(&self) -> Arc<dyn LivenessSignals> {
        self.monitor.clone()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<ReconnectionCoordinator> {
        &self.coordinator
    }

    pub fn monitor(&self) -> &Arc<ConnectionHealthMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            status: self.monitor.global_status(),
            registry: self.registry.stats(),
            reconnect: self.coordinator.stats(),
            health: self.monitor.snapshot(),
            invalidations_issued: self.bridge.issued_count(),
            invalidations_failed: self.bridge.failed_count(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.scheduler.is_shut_down()
    }

    /// Global teardown
    ///
    /// Stops every timer and the event loop, then closes every channel.
    /// Later `subscribe` calls fail with [`RealtimeError::ShutDown`].
    ///
    /// [`RealtimeError::ShutDown`]: crate::error::RealtimeError::ShutDown
    pub async fn shutdown(&self) {
        if self.scheduler.is_shut_down() {
            return;
        }
        tracing::info!("[MANAGER] Shutting down realtime manager");
        self.scheduler.shutdown();
        self.monitor.cancel_settle();
        self.coordinator.cancel_all();
        if let Some(event_loop) = self.event_loop.lock().take() {
            event_loop.abort();
        }
        self.registry.teardown_all().await;
    }
}

impl Drop for RealtimeManager {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        self.coordinator.cancel_all();
        if let Some(event_loop) = self.event_loop.lock().take() {
            event_loop.abort();
        }
    }
}

/// Drain transport events in delivery order
async fn run_event_loop(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    registry: Arc<SubscriptionRegistry>,
    coordinator: Arc<ReconnectionCoordinator>,
    channel_error_delay: Duration,
) {
    while let Some(event) = events.recv().await {
        if let EventDisposition::ChannelError(key) = registry.apply_event(event) {
            coordinator.schedule_reconnect(key, channel_error_delay);
        }
    }
    tracing::debug!("[MANAGER] Event loop stopped");
}
