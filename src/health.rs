//! Connection health monitor
//!
//! Decides when the subscription pool needs rebuilding. Transport
//! "still connected" signals are not trusted on their own: silence on a
//! high-priority subscription is treated as a suspected failure.
//!
//! # Triggers
//!
//! ```text
//!  host signals ──► LivenessSignals ─┐
//!   (network up/down, foreground,    │  network up: settle delay, then pass
//!    user activity)                  │  network down: mark all disconnected
//!                                    ▼
//!  probe task (every 60s) ──► ConnectionHealthMonitor ──► ReconnectionCoordinator
//!  sweep task (every 60s) ──►        │                         ::reconnect_all
//!                                    ▼
//!                         CacheInvalidationBridge::invalidate_all
//!                         (foreground gap over threshold)
//! ```
//!
//! Global status is computed from the registry on demand; the monitor only
//! remembers the last status it observed explicitly, which is reported when
//! there are no subscriptions.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::cache::CacheInvalidationBridge;
use crate::config::HealthConfig;
use crate::reconnect::{ReconnectSummary, ReconnectionCoordinator};
use crate::registry::SubscriptionRegistry;
use crate::scheduler::{Scheduler, TaskHandle};
use crate::subscription::{millis, ConnectionStatus, Priority, SubscriptionKey};
use crate::transport::ChangeFeed;

/// Host environment events, adapted from whatever the runtime provides
pub trait LivenessSignals: Send + Sync {
    /// The host regained network connectivity
    fn on_network_up(&self);

    /// The host lost network connectivity
    fn on_network_down(&self);

    /// The application came back to the foreground after `idle`
    fn on_foreground_regained(&self, idle: Duration);

    /// Any user interaction
    fn on_user_activity(&self);
}

/// Result of one reachability probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Reachable, nothing changed
    Reachable,
    /// Unreachable; `failures` consecutive so far
    Failing { failures: u32 },
    /// Failure threshold reached: every subscription marked disconnected
    WentDown,
    /// Reachable again after an outage; `successes` consecutive so far
    Recovering { successes: u32 },
    /// Success threshold reached: status restored and a pass ran
    Recovered(ReconnectSummary),
}

/// Result of one staleness sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// High-priority subscriptions past the staleness bound
    pub stale: Vec<SubscriptionKey>,
    /// No user activity within the inactivity bound
    pub inactive: bool,
    /// The host reported the network down, so no pass was started
    pub skipped_offline: bool,
    /// The pass that ran, if any
    pub reconnect: Option<ReconnectSummary>,
}

/// Monitor state snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub observed: ConnectionStatus,
    pub network_down: bool,
    pub probe_down: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub settle_pending: bool,
    pub idle_ms: u64,
}

struct HealthState {
    /// Last explicitly observed status
    observed: ConnectionStatus,
    /// Host said offline and has not said online since
    network_down: bool,
    /// Probe failures flipped the status to disconnected
    probe_down: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_global_activity: Instant,
    /// Pending post-online pass and the generation that owns it
    settle: Option<(u64, TaskHandle)>,
    settle_generation: u64,
}

/// Evaluates liveness and triggers reconnection passes
pub struct ConnectionHealthMonitor {
    registry: Arc<SubscriptionRegistry>,
    coordinator: Arc<ReconnectionCoordinator>,
    bridge: Arc<CacheInvalidationBridge>,
    feed: Arc<dyn ChangeFeed>,
    scheduler: Arc<Scheduler>,
    config: HealthConfig,
    state: Mutex<HealthState>,
    me: Weak<ConnectionHealthMonitor>,
}

impl ConnectionHealthMonitor {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        coordinator: Arc<ReconnectionCoordinator>,
        bridge: Arc<CacheInvalidationBridge>,
        feed: Arc<dyn ChangeFeed>,
        scheduler: Arc<Scheduler>,
        config: HealthConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            registry,
            coordinator,
            bridge,
            feed,
            scheduler,
            config,
            state: Mutex::new(HealthState {
                observed: ConnectionStatus::Connecting,
                network_down: false,
                probe_down: false,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_global_activity: Instant::now(),
                settle: None,
                settle_generation: 0,
            }),
            me: me.clone(),
        })
    }

    /// Schedule the periodic probe and sweep
    pub fn start(&self) {
        let me = self.me.clone();
        self.scheduler
            .every("health-probe", self.config.probe_interval(), move || {
                let me = me.clone();
                async move {
                    if let Some(monitor) = me.upgrade() {
                        monitor.probe_once().await;
                    }
                }
            });

        let me = self.me.clone();
        self.scheduler
            .every("staleness-sweep", self.config.sweep_interval(), move || {
                let me = me.clone();
                async move {
                    if let Some(monitor) = me.upgrade() {
                        monitor.sweep_once().await;
                    }
                }
            });

        tracing::info!(
            "[HEALTH] Monitoring started (probe every {:?}, sweep every {:?})",
            self.config.probe_interval(),
            self.config.sweep_interval()
        );
    }

    /// Run one reachability probe and apply the thresholds
    pub async fn probe_once(&self) -> ProbeOutcome {
        let result = self.feed.reachability_probe().await;

        let recovered = {
            let mut state = self.state.lock();
            match result {
                Err(e) => {
                    state.consecutive_successes = 0;
                    state.consecutive_failures += 1;
                    let failures = state.consecutive_failures;
                    if state.probe_down || failures < self.config.probe_failure_threshold {
                        tracing::debug!("[HEALTH] Probe failed ({} in a row): {}", failures, e);
                        return ProbeOutcome::Failing { failures };
                    }
                    state.probe_down = true;
                    state.observed = ConnectionStatus::Disconnected;
                    tracing::warn!(
                        "[HEALTH] Backend unreachable after {} probes, marking disconnected",
                        failures
                    );
                    false
                }
                Ok(()) => {
                    state.consecutive_failures = 0;
                    if !state.probe_down {
                        if !state.network_down {
                            state.observed = ConnectionStatus::Connected;
                        }
                        return ProbeOutcome::Reachable;
                    }
                    state.consecutive_successes += 1;
                    let successes = state.consecutive_successes;
                    if successes < self.config.probe_success_threshold {
                        tracing::debug!("[HEALTH] Probe succeeded ({} in a row)", successes);
                        return ProbeOutcome::Recovering { successes };
                    }
                    state.probe_down = false;
                    state.consecutive_successes = 0;
                    state.observed = ConnectionStatus::Connected;
                    tracing::info!("[HEALTH] Backend reachable again after {} probes", successes);
                    true
                }
            }
        };

        if recovered {
            ProbeOutcome::Recovered(self.coordinator.reconnect_all().await)
        } else {
            self.registry.mark_all_disconnected();
            ProbeOutcome::WentDown
        }
    }

    /// Run one staleness sweep
    pub async fn sweep_once(&self) -> SweepReport {
        let now = Instant::now();
        let stale = self.registry.stale_keys(
            Priority::High,
            self.config.high_priority_stale_after(),
            now,
        );

        let (inactive, network_down) = {
            let mut state = self.state.lock();
            let inactive = now.saturating_duration_since(state.last_global_activity)
                > self.config.global_inactivity_after();
            if inactive && !state.network_down {
                // Restart the idle clock so an idle session reconnects once per window
                state.last_global_activity = now;
            }
            (inactive, state.network_down)
        };

        let mut report = SweepReport {
            stale,
            inactive,
            ..SweepReport::default()
        };
        if report.stale.is_empty() && !report.inactive {
            return report;
        }

        if network_down {
            tracing::info!(
                "[HEALTH] {} stale subscriptions, waiting for network",
                report.stale.len()
            );
            report.skipped_offline = true;
            return report;
        }

        for key in &report.stale {
            tracing::info!("[HEALTH] {} is stale, reconnecting", key);
        }
        if report.inactive {
            tracing::info!(
                "[HEALTH] No user activity for {:?}, reconnecting",
                self.config.global_inactivity_after()
            );
        }
        report.reconnect = Some(self.coordinator.reconnect_all().await);
        report
    }

    /// Computed global status
    ///
    /// Connected if any subscription is connected, disconnected if there
    /// are subscriptions and none is, otherwise the last observed status.
    pub fn global_status(&self) -> ConnectionStatus {
        let summary = self.registry.connection_summary();
        if summary.high_priority_connected > 0 || summary.connected > 0 {
            ConnectionStatus::Connected
        } else if summary.total > 0 {
            ConnectionStatus::Disconnected
        } else {
            self.state.lock().observed
        }
    }

    pub fn last_global_activity(&self) -> Instant {
        self.state.lock().last_global_activity
    }

    pub fn is_network_down(&self) -> bool {
        self.state.lock().network_down
    }

    pub fn settle_pending(&self) -> bool {
        self.state
            .lock()
            .settle
            .as_ref()
            .is_some_and(|(_, task)| !task.is_finished())
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let now = Instant::now();
        let state = self.state.lock();
        HealthSnapshot {
            observed: state.observed,
            network_down: state.network_down,
            probe_down: state.probe_down,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            settle_pending: state
                .settle
                .as_ref()
                .is_some_and(|(_, task)| !task.is_finished()),
            idle_ms: millis(now.saturating_duration_since(state.last_global_activity)),
        }
    }

    /// Drop a pending post-online pass
    pub fn cancel_settle(&self) {
        self.state.lock().settle.take();
    }

    async fn finish_settle(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            match state.settle.take() {
                Some((owner, task)) if owner == generation => task.detach(),
                other => {
                    // Superseded by a later network-up signal
                    state.settle = other;
                    return;
                }
            }
            if state.network_down {
                return;
            }
        }

        tracing::info!("[HEALTH] Network settled, reconnecting");
        self.coordinator.reconnect_all().await;

        let summary = self.registry.connection_summary();
        let mut state = self.state.lock();
        if !state.network_down {
            state.observed = if summary.total == 0 || summary.connected > 0 {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            };
        }
    }
}

impl LivenessSignals for ConnectionHealthMonitor {
    fn on_network_up(&self) {
        let mut state = self.state.lock();
        state.network_down = false;
        state.observed = ConnectionStatus::Connecting;
        state.settle_generation += 1;
        let generation = state.settle_generation;

        let me = self.me.clone();
        let task = self
            .scheduler
            .after("network-settle", self.config.settle_delay(), async move {
                if let Some(monitor) = me.upgrade() {
                    monitor.finish_settle(generation).await;
                }
            });

        // Replacing the handle aborts an earlier pending pass
        if state.settle.is_some() {
            tracing::debug!("[HEALTH] Network flapped, restarting settle delay");
        }
        state.settle = task.map(|task| (generation, task));
        tracing::info!(
            "[HEALTH] Network up, reconnecting in {:?}",
            self.config.settle_delay()
        );
    }

    fn on_network_down(&self) {
        {
            let mut state = self.state.lock();
            state.network_down = true;
            state.observed = ConnectionStatus::Disconnected;
            state.settle.take();
        }
        let flipped = self.registry.mark_all_disconnected();
        tracing::warn!(
            "[HEALTH] Network down, {} subscriptions marked disconnected",
            flipped
        );
    }

    fn on_foreground_regained(&self, idle: Duration) {
        self.state.lock().last_global_activity = Instant::now();
        if idle > self.config.foreground_refresh_after() {
            tracing::info!(
                "[HEALTH] Back in foreground after {:?}, invalidating all cached queries",
                idle
            );
            self.bridge.invalidate_all();
        }
    }

    fn on_user_activity(&self) {
        self.state.lock().last_global_activity = Instant::now();
    }
}
