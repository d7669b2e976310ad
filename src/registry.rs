//! Subscription registry
//!
//! Owns every live subscription and the two derived indices over them.
//! Multiple callers share one subscription when they ask for the same key.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                 SubscriptionRegistry (Mutex<RegistryState>)        │
//! │                                                                    │
//! │  entries:  key ──► Entry { channel, connected, last_activity,      │
//! │                            leases, routes, incarnation }           │
//! │  by_table: table ──► {key}      (bulk refresh)                     │
//! │  by_route: route ──► {key}      (bulk teardown on navigation)      │
//! │  channels: ChannelId ──► (key, incarnation)  (routes events)      │
//! │  binding:  key ──► incarnation  (opens in flight)                  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Locking
//!
//! One lock covers the map and every index, so they never disagree. The
//! lock is never held across an `.await`: state is read under the lock,
//! the lock is released, the transport is called, and the lock is taken
//! again to record the result.
//!
//! # Stale completions
//!
//! Each subscription gets a fresh incarnation number when it is created.
//! A bind that finishes after its subscription was removed (or removed and
//! created again) sees a different incarnation, closes the channel it just
//! opened and reports [`BindOutcome::Cancelled`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cache::CacheInvalidationBridge;
use crate::error::{RealtimeError, Result, TransportError};
use crate::subscription::{
    millis, LeaseId, Priority, SubscriptionKey, SubscriptionSpec, SubscriptionStatus,
};
use crate::transport::{
    BindStatus, ChangeFeed, ChannelEvent, ChannelEventKind, ChannelHandle, ChannelId,
    ChannelRequest, EventSink,
};

// ============================================================================
// Outcomes
// ============================================================================

/// Result of an attempt to (re)bind a subscription's channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// A new channel is live and the cache entries were invalidated
    Bound,
    /// `subscribe` matched an existing subscription; nothing was opened
    Joined,
    /// Another bind for the same key is in flight
    Coalesced,
    /// The transport refused; the subscription stays, disconnected
    Failed(TransportError),
    /// The subscription was removed while the open was in flight
    Cancelled,
    /// No subscription with that key
    Missing,
}

/// Result of releasing a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Lease released; other holders keep the subscription alive
    Released { remaining: usize },
    /// Last lease released; channel closed and subscription destroyed
    TornDown,
    /// The handle no longer holds anything (already released or torn down)
    NotHeld,
}

/// What a transport event did to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    /// Event from an unknown or replaced channel
    Ignored,
    /// Activity recorded
    Activity(SubscriptionKey),
    /// Row change: activity recorded and cache invalidated
    Invalidated(SubscriptionKey),
    /// Transport reported a channel error
    ChannelError(SubscriptionKey),
    /// Transport closed the channel
    Disconnected(SubscriptionKey),
}

/// Connection counts used to compute the global status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub total: usize,
    pub connected: usize,
    pub high_priority_connected: usize,
}

/// Statistics about the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub subscriptions: usize,
    pub connected: usize,
    pub open_channels: usize,
    pub holders: usize,
    pub routes: usize,
    pub binds_in_flight: usize,
}

// ============================================================================
// Handles
// ============================================================================

/// A caller's claim on one subscription
///
/// Cloning a handle does not add a claim; only `subscribe` does.
#[derive(Clone)]
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    lease: LeaseId,
    registry: Weak<SubscriptionRegistry>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Whether both handles refer to the same underlying subscription
    pub fn same_subscription(&self, other: &SubscriptionHandle) -> bool {
        self.key == other.key
    }

    /// Release this handle's claim
    pub async fn unsubscribe(&self) -> Release {
        match self.registry.upgrade() {
            Some(registry) => registry.unsubscribe(self).await,
            None => Release::NotHeld,
        }
    }
}

impl PartialEq for SubscriptionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.lease == other.lease
    }
}

impl Eq for SubscriptionHandle {}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key.to_string())
            .field("lease", &self.lease.to_string())
            .finish()
    }
}

/// Handles returned by a batch subscribe
#[derive(Debug, Clone, Default)]
pub struct CompositeHandle {
    handles: Vec<SubscriptionHandle>,
}

impl CompositeHandle {
    pub fn new(handles: Vec<SubscriptionHandle>) -> Self {
        Self { handles }
    }

    pub fn handles(&self) -> &[SubscriptionHandle] {
        &self.handles
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.handles.iter().map(|h| h.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Release every member; returns how many subscriptions were destroyed
    pub async fn unsubscribe(&self) -> usize {
        let mut torn_down = 0;
        for handle in &self.handles {
            if handle.unsubscribe().await == Release::TornDown {
                torn_down += 1;
            }
        }
        torn_down
    }
}

// ============================================================================
// State
// ============================================================================

struct Entry {
    incarnation: u64,
    filter: Option<String>,
    priority: Priority,
    channel: Option<ChannelHandle>,
    connected: bool,
    created_at: Instant,
    last_activity: Option<Instant>,
    leases: HashSet<LeaseId>,
    routes: BTreeSet<String>,
}

impl Entry {
    fn status(&self, key: &SubscriptionKey, now: Instant) -> SubscriptionStatus {
        SubscriptionStatus {
            key: key.clone(),
            connected: self.connected,
            priority: self.priority,
            last_activity: self.last_activity,
            idle_ms: self
                .last_activity
                .map(|t| millis(now.saturating_duration_since(t))),
            holders: self.leases.len(),
            routes: self.routes.iter().cloned().collect(),
            filter: self.filter.clone(),
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity.unwrap_or(self.created_at))
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<SubscriptionKey, Entry>,
    by_table: BTreeMap<String, BTreeSet<SubscriptionKey>>,
    by_route: BTreeMap<String, BTreeSet<SubscriptionKey>>,
    channels: HashMap<ChannelId, (SubscriptionKey, u64)>,
    binding: HashMap<SubscriptionKey, u64>,
    next_channel: u64,
    next_incarnation: u64,
    closed: bool,
}

impl RegistryState {
    /// Remove a subscription from the map and every index
    fn remove_entry(&mut self, key: &SubscriptionKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;

        if let Some(keys) = self.by_table.get_mut(key.table()) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_table.remove(key.table());
            }
        }
        for route in &entry.routes {
            if let Some(keys) = self.by_route.get_mut(route) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_route.remove(route);
                }
            }
        }
        if let Some(channel) = &entry.channel {
            self.channels.remove(&channel.id());
        }
        Some(entry)
    }
}

/// Clears the in-flight marker for a key when a bind ends, however it ends
///
/// A marker left by a newer incarnation of the key is not touched.
struct BindingGuard<'a> {
    registry: &'a SubscriptionRegistry,
    key: SubscriptionKey,
    incarnation: u64,
}

impl Drop for BindingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.registry.state.lock();
        if state.binding.get(&self.key) == Some(&self.incarnation) {
            state.binding.remove(&self.key);
        }
    }
}

/// Rolls a new subscription back if `subscribe` is dropped mid-bind
///
/// Only the caller's own lease is removed; holders that joined while the
/// bind was in flight keep the subscription.
struct PendingLease<'a> {
    registry: &'a SubscriptionRegistry,
    key: SubscriptionKey,
    lease: LeaseId,
    armed: bool,
}

impl PendingLease<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingLease<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.abandon_lease(&self.key, self.lease);
        }
    }
}

/// Releases a partial batch when `subscribe_many` errors or is dropped
struct PendingBatch<'a> {
    registry: &'a SubscriptionRegistry,
    handles: Vec<SubscriptionHandle>,
}

impl Drop for PendingBatch<'_> {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            self.registry.abandon_lease(&handle.key, handle.lease);
        }
    }
}

/// Unmaps a channel id whose open did not produce a live channel
struct PendingChannel<'a> {
    registry: &'a SubscriptionRegistry,
    id: ChannelId,
    armed: bool,
}

impl PendingChannel<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingChannel<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.state.lock().channels.remove(&self.id);
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registry of all live subscriptions
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    feed: Arc<dyn ChangeFeed>,
    bridge: Arc<CacheInvalidationBridge>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    me: Weak<SubscriptionRegistry>,
}

impl SubscriptionRegistry {
    /// Create a registry whose channels report into `events`
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        bridge: Arc<CacheInvalidationBridge>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            state: Mutex::new(RegistryState::default()),
            feed,
            bridge,
            events,
            me: me.clone(),
        })
    }

    fn handle(&self, key: SubscriptionKey, lease: LeaseId) -> SubscriptionHandle {
        SubscriptionHandle {
            key,
            lease,
            registry: self.me.clone(),
        }
    }

    /// Subscribe to a table, or join the existing subscription for the key
    ///
    /// Transport failures do not fail the call: the handle is returned and
    /// the outcome says what happened to the binding.
    pub async fn subscribe(&self, spec: SubscriptionSpec) -> Result<(SubscriptionHandle, BindOutcome)> {
        spec.validate()?;
        let key = spec.key();
        let lease = LeaseId::new();

        let incarnation = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return Err(RealtimeError::ShutDown);
            }

            if let Some(entry) = state.entries.get_mut(&key) {
                entry.leases.insert(lease);
                if spec.priority < entry.priority {
                    tracing::info!(
                        "[REGISTRY] Raising priority of {} from {} to {}",
                        key,
                        entry.priority,
                        spec.priority
                    );
                    entry.priority = spec.priority;
                }
                tracing::debug!(
                    "[REGISTRY] Reusing subscription {} ({} holders)",
                    key,
                    entry.leases.len()
                );
                return Ok((self.handle(key, lease), BindOutcome::Joined));
            }

            state.next_incarnation += 1;
            let incarnation = state.next_incarnation;
            let mut leases = HashSet::new();
            leases.insert(lease);
            state.entries.insert(
                key.clone(),
                Entry {
                    incarnation,
                    filter: spec.filter.clone(),
                    priority: spec.priority,
                    channel: None,
                    connected: false,
                    created_at: Instant::now(),
                    last_activity: None,
                    leases,
                    routes: BTreeSet::new(),
                },
            );
            state
                .by_table
                .entry(key.table().to_string())
                .or_default()
                .insert(key.clone());
            state.binding.insert(key.clone(), incarnation);
            incarnation
        };

        tracing::info!(
            "[REGISTRY] Creating subscription {} (priority {})",
            key,
            spec.priority
        );
        let pending = PendingLease {
            registry: self,
            key: key.clone(),
            lease,
            armed: true,
        };
        let _binding = BindingGuard {
            registry: self,
            key: key.clone(),
            incarnation,
        };
        let outcome = self.bind(&key, incarnation).await;
        pending.disarm();
        Ok((self.handle(key, lease), outcome))
    }

    /// Subscribe to several tables
    ///
    /// Every request is validated before anything is opened. If the batch
    /// fails or is dropped part way, the members it already holds are released.
    pub async fn subscribe_many(&self, specs: Vec<SubscriptionSpec>) -> Result<(CompositeHandle, Vec<BindOutcome>)> {
        for spec in &specs {
            spec.validate()?;
        }
        let mut batch = PendingBatch {
            registry: self,
            handles: Vec::with_capacity(specs.len()),
        };
        let mut outcomes = Vec::with_capacity(specs.len());
        for spec in specs {
            let (handle, outcome) = self.subscribe(spec).await?;
            batch.handles.push(handle);
            outcomes.push(outcome);
        }
        let handles = std::mem::take(&mut batch.handles);
        Ok((CompositeHandle::new(handles), outcomes))
    }

    /// Release a handle's claim; the last release destroys the subscription
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Release {
        let channel = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.entries.get_mut(&handle.key) else {
                return Release::NotHeld;
            };
            if !entry.leases.remove(&handle.lease) {
                return Release::NotHeld;
            }
            if !entry.leases.is_empty() {
                let remaining = entry.leases.len();
                tracing::debug!(
                    "[REGISTRY] Released {} on {} ({} holders left)",
                    handle.lease,
                    handle.key,
                    remaining
                );
                return Release::Released { remaining };
            }
            state.remove_entry(&handle.key).and_then(|e| e.channel)
        };

        tracing::info!("[REGISTRY] Tearing down subscription {}", handle.key);
        if let Some(channel) = channel {
            self.close_quietly(channel).await;
        }
        Release::TornDown
    }

    /// Tag a subscription as belonging to a UI route
    pub fn register_for_route(&self, route: &str, key: &SubscriptionKey) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.entries.get_mut(key) else {
            tracing::debug!("[REGISTRY] Cannot tag unknown subscription {} for {}", key, route);
            return false;
        };
        entry.routes.insert(route.to_string());
        state
            .by_route
            .entry(route.to_string())
            .or_default()
            .insert(key.clone());
        true
    }

    /// Destroy every subscription tagged for `route`, regardless of holders
    pub async fn teardown_route(&self, route: &str) -> usize {
        let (removed, channels) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(keys) = state.by_route.remove(route) else {
                return 0;
            };
            let mut removed = 0;
            let mut channels = Vec::new();
            for key in keys {
                if let Some(entry) = state.remove_entry(&key) {
                    removed += 1;
                    channels.extend(entry.channel);
                }
            }
            (removed, channels)
        };

        tracing::info!(
            "[REGISTRY] Route {} torn down: {} subscriptions, {} channels",
            route,
            removed,
            channels.len()
        );
        for channel in channels {
            self.close_quietly(channel).await;
        }
        removed
    }

    /// Close and reopen a subscription's channel, keeping its key and holders
    ///
    /// This is the primitive every reconnection path funnels through.
    pub async fn rebind(&self, key: &SubscriptionKey) -> BindOutcome {
        let (old, incarnation) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.entries.get_mut(key) else {
                return BindOutcome::Missing;
            };
            let incarnation = entry.incarnation;
            if state.binding.get(key) == Some(&incarnation) {
                return BindOutcome::Coalesced;
            }
            let old = entry.channel.take();
            entry.connected = false;
            if let Some(old) = &old {
                state.channels.remove(&old.id());
            }
            state.binding.insert(key.clone(), incarnation);
            (old, incarnation)
        };

        let _binding = BindingGuard {
            registry: self,
            key: key.clone(),
            incarnation,
        };
        if let Some(old) = old {
            tracing::debug!("[REGISTRY] Closing {} before rebind of {}", old.id(), key);
            self.close_quietly(old).await;
        }
        self.bind(key, incarnation).await
    }

    /// Open a channel for `key` and record it if the subscription still exists
    async fn bind(&self, key: &SubscriptionKey, incarnation: u64) -> BindOutcome {
        let request = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let filter = match state.entries.get(key) {
                Some(entry) if entry.incarnation == incarnation => entry.filter.clone(),
                _ => return BindOutcome::Cancelled,
            };
            state.next_channel += 1;
            let id = ChannelId(state.next_channel);
            state.channels.insert(id, (key.clone(), incarnation));
            ChannelRequest {
                id,
                table: key.table().to_string(),
                filter,
            }
        };

        let id = request.id;
        let routing = PendingChannel {
            registry: self,
            id,
            armed: true,
        };
        let sink = EventSink::new(id, self.events.clone());
        match self.feed.open_channel(request, sink).await {
            Ok(channel) => {
                let leftover = {
                    let mut state = self.state.lock();
                    match state.entries.get_mut(key) {
                        Some(entry) if entry.incarnation == incarnation => {
                            entry.channel = Some(channel);
                            entry.connected = true;
                            entry.last_activity = Some(Instant::now());
                            None
                        }
                        _ => Some(channel),
                    }
                };

                match leftover {
                    None => {
                        routing.disarm();
                        tracing::info!("[REGISTRY] Bound {} on {}", key, id);
                        self.bridge.invalidate(key.descriptor());
                        BindOutcome::Bound
                    }
                    Some(channel) => {
                        tracing::info!(
                            "[REGISTRY] {} was removed during bind, closing {}",
                            key,
                            id
                        );
                        self.close_quietly(channel).await;
                        BindOutcome::Cancelled
                    }
                }
            }
            Err(e) => {
                let mut state = self.state.lock();
                match state.entries.get_mut(key) {
                    Some(entry) if entry.incarnation == incarnation => {
                        entry.connected = false;
                        tracing::warn!("[REGISTRY] Bind of {} failed: {}", key, e);
                        BindOutcome::Failed(e)
                    }
                    _ => BindOutcome::Cancelled,
                }
            }
        }
    }

    /// Drop a lease whose handle never reached its caller
    fn abandon_lease(&self, key: &SubscriptionKey, lease: LeaseId) {
        let channel = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };
            if !entry.leases.remove(&lease) || !entry.leases.is_empty() {
                return;
            }
            state.remove_entry(key).and_then(|e| e.channel)
        };

        tracing::info!("[REGISTRY] Subscribe of {} abandoned, removing it", key);
        let Some(channel) = channel else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let feed = self.feed.clone();
                runtime.spawn(async move {
                    let id = channel.id();
                    if let Err(e) = feed.close_channel(channel).await {
                        tracing::warn!("[REGISTRY] Ignoring close error on {}: {}", id, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("[REGISTRY] No runtime to close {} of {}", channel.id(), key);
            }
        }
    }

    async fn close_quietly(&self, channel: ChannelHandle) {
        let id = channel.id();
        if let Err(e) = self.feed.close_channel(channel).await {
            tracing::warn!("[REGISTRY] Ignoring close error on {}: {}", id, e);
        }
    }

    /// Apply one transport callback
    ///
    /// Row changes invalidate the subscription's cache entries before this
    /// returns, so invalidations follow transport delivery order.
    pub fn apply_event(&self, event: ChannelEvent) -> EventDisposition {
        let now = Instant::now();
        let disposition = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some((key, incarnation)) = state.channels.get(&event.channel).cloned() else {
                tracing::trace!("[REGISTRY] Dropping event from retired {}", event.channel);
                return EventDisposition::Ignored;
            };
            let Some(entry) = state
                .entries
                .get_mut(&key)
                .filter(|e| e.incarnation == incarnation)
            else {
                return EventDisposition::Ignored;
            };

            match event.kind {
                ChannelEventKind::Change { kind, .. } => {
                    tracing::debug!("[REGISTRY] {:?} on {}", kind, key);
                    entry.last_activity = Some(now);
                    EventDisposition::Invalidated(key)
                }
                ChannelEventKind::Presence => {
                    entry.last_activity = Some(now);
                    EventDisposition::Activity(key)
                }
                ChannelEventKind::Bind(BindStatus::Subscribed) => {
                    entry.connected = true;
                    entry.last_activity = Some(now);
                    EventDisposition::Activity(key)
                }
                ChannelEventKind::Bind(BindStatus::Error(reason)) => {
                    tracing::warn!("[REGISTRY] Channel {} for {} errored: {}", event.channel, key, reason);
                    entry.connected = false;
                    EventDisposition::ChannelError(key)
                }
                ChannelEventKind::Bind(BindStatus::Closed) => {
                    tracing::info!("[REGISTRY] Channel {} for {} closed by transport", event.channel, key);
                    entry.connected = false;
                    EventDisposition::Disconnected(key)
                }
            }
        };

        if let EventDisposition::Invalidated(key) = &disposition {
            self.bridge.on_change(key.table(), key.descriptor());
        }
        disposition
    }

    /// Mark every subscription disconnected without destroying any
    pub fn mark_all_disconnected(&self) -> usize {
        let mut state = self.state.lock();
        let mut flipped = 0;
        for entry in state.entries.values_mut() {
            if entry.connected {
                entry.connected = false;
                flipped += 1;
            }
        }
        flipped
    }

    /// Global teardown: close every channel and refuse new subscriptions
    pub async fn teardown_all(&self) -> usize {
        let (removed, channels) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.closed = true;
            let removed = state.entries.len();
            let channels: Vec<ChannelHandle> = state
                .entries
                .drain()
                .filter_map(|(_, entry)| entry.channel)
                .collect();
            state.by_table.clear();
            state.by_route.clear();
            state.channels.clear();
            (removed, channels)
        };

        tracing::info!(
            "[REGISTRY] Global teardown: {} subscriptions, {} channels",
            removed,
            channels.len()
        );
        for channel in channels {
            self.close_quietly(channel).await;
        }
        removed
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn status(&self, key: &SubscriptionKey) -> Option<SubscriptionStatus> {
        let now = Instant::now();
        self.state.lock().entries.get(key).map(|e| e.status(key, now))
    }

    /// Status of every subscription, most urgent first
    pub fn statuses(&self) -> Vec<SubscriptionStatus> {
        let now = Instant::now();
        let state = self.state.lock();
        let mut statuses: Vec<SubscriptionStatus> = state
            .entries
            .iter()
            .map(|(key, entry)| entry.status(key, now))
            .collect();
        statuses.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.key.cmp(&b.key)));
        statuses
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Table index snapshot
    pub fn subscriptions_by_table(&self) -> BTreeMap<String, Vec<SubscriptionKey>> {
        self.state
            .lock()
            .by_table
            .iter()
            .map(|(table, keys)| (table.clone(), keys.iter().cloned().collect()))
            .collect()
    }

    pub fn route_members(&self, route: &str) -> Vec<SubscriptionKey> {
        self.state
            .lock()
            .by_route
            .get(route)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every key, high priority first
    pub fn keys_by_priority(&self) -> Vec<SubscriptionKey> {
        let state = self.state.lock();
        let mut keys: Vec<(Priority, SubscriptionKey)> = state
            .entries
            .iter()
            .map(|(key, entry)| (entry.priority, key.clone()))
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, key)| key).collect()
    }

    /// Keys whose table is in `tables`
    pub fn keys_for_tables(&self, tables: &[String]) -> Vec<SubscriptionKey> {
        let state = self.state.lock();
        tables
            .iter()
            .filter_map(|table| state.by_table.get(table))
            .flat_map(|keys| keys.iter().cloned())
            .collect()
    }

    /// Subscriptions at `priority` with no activity for longer than `older_than`
    ///
    /// A subscription that never bound counts as idle since its creation.
    pub fn stale_keys(&self, priority: Priority, older_than: Duration, now: Instant) -> Vec<SubscriptionKey> {
        let state = self.state.lock();
        let mut keys: Vec<SubscriptionKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.priority == priority && entry.idle_for(now) > older_than)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn connection_summary(&self) -> ConnectionSummary {
        let state = self.state.lock();
        let mut summary = ConnectionSummary {
            total: state.entries.len(),
            ..ConnectionSummary::default()
        };
        for entry in state.entries.values().filter(|e| e.connected) {
            summary.connected += 1;
            if entry.priority == Priority::High {
                summary.high_priority_connected += 1;
            }
        }
        summary
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        RegistryStats {
            subscriptions: state.entries.len(),
            connected: state.entries.values().filter(|e| e.connected).count(),
            open_channels: state.entries.values().filter(|e| e.channel.is_some()).count(),
            holders: state.entries.values().map(|e| e.leases.len()).sum(),
            routes: state.by_route.len(),
            binds_in_flight: state.binding.len(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RecordingCache;
    use crate::transport::{ChangeKind, InMemoryFeed};

    struct Fixture {
        feed: Arc<InMemoryFeed>,
        cache: Arc<RecordingCache>,
        registry: Arc<SubscriptionRegistry>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let feed = Arc::new(InMemoryFeed::new());
            let cache = Arc::new(RecordingCache::new());
            let bridge = Arc::new(CacheInvalidationBridge::new(cache.clone()));
            let (tx, events) = mpsc::unbounded_channel();
            let registry = SubscriptionRegistry::new(feed.clone(), bridge, tx);
            Self {
                feed,
                cache,
                registry,
                events,
            }
        }

        /// Apply every queued transport event
        fn pump(&mut self) -> Vec<EventDisposition> {
            let mut applied = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                applied.push(self.registry.apply_event(event));
            }
            applied
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn jobs() -> SubscriptionSpec {
        SubscriptionSpec::new("jobs", ["jobs-list"]).with_priority(Priority::High)
    }

    #[tokio::test]
    async fn test_subscribe_binds_and_invalidates() {
        let fx = Fixture::new();
        let (handle, outcome) = fx.registry.subscribe(jobs()).await.unwrap();

        assert_eq!(outcome, BindOutcome::Bound);
        assert_eq!(fx.feed.open_count(), 1);
        assert_eq!(fx.cache.count_for("jobs-list"), 1);

        let status = fx.registry.status(handle.key()).unwrap();
        assert!(status.connected);
        assert!(status.last_activity.is_some());
        assert_eq!(status.priority, Priority::High);
        assert_eq!(status.holders, 1);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_shares_one_channel() {
        let fx = Fixture::new();
        let (first, _) = fx.registry.subscribe(jobs()).await.unwrap();
        let (second, outcome) = fx.registry.subscribe(jobs()).await.unwrap();

        assert_eq!(outcome, BindOutcome::Joined);
        assert!(first.same_subscription(&second));
        assert_ne!(first, second);
        assert_eq!(fx.feed.opened_total(), 1);
        assert_eq!(fx.registry.len(), 1);
        assert_eq!(fx.registry.status(first.key()).unwrap().holders, 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_reference_counted() {
        let fx = Fixture::new();
        let (first, _) = fx.registry.subscribe(jobs()).await.unwrap();
        let (second, _) = fx.registry.subscribe(jobs()).await.unwrap();

        assert_eq!(
            fx.registry.unsubscribe(&first).await,
            Release::Released { remaining: 1 }
        );
        assert_eq!(fx.feed.open_count(), 1);

        // Same handle twice is a no-op and must not eat the other lease
        assert_eq!(fx.registry.unsubscribe(&first).await, Release::NotHeld);
        assert_eq!(fx.feed.open_count(), 1);

        assert_eq!(second.unsubscribe().await, Release::TornDown);
        assert_eq!(fx.feed.open_count(), 0);
        assert!(fx.registry.is_empty());
        assert!(fx.registry.subscriptions_by_table().is_empty());
        assert_eq!(second.unsubscribe().await, Release::NotHeld);
    }

    #[tokio::test]
    async fn test_joining_with_higher_priority_raises_it() {
        let fx = Fixture::new();
        let (handle, _) = fx
            .registry
            .subscribe(SubscriptionSpec::new("crew", "crew-list").with_priority(Priority::Low))
            .await
            .unwrap();
        fx.registry
            .subscribe(SubscriptionSpec::new("crew", "crew-list").with_priority(Priority::High))
            .await
            .unwrap();

        assert_eq!(fx.registry.status(handle.key()).unwrap().priority, Priority::High);
    }

    #[tokio::test]
    async fn test_failed_bind_keeps_subscription() {
        let fx = Fixture::new();
        fx.feed.fail_next_opens(1);

        let (handle, outcome) = fx.registry.subscribe(jobs()).await.unwrap();
        assert!(matches!(outcome, BindOutcome::Failed(_)));

        let status = fx.registry.status(handle.key()).unwrap();
        assert!(!status.connected);
        assert!(status.last_activity.is_none());
        assert_eq!(fx.cache.count_for("jobs-list"), 0);
        assert_eq!(fx.registry.stats().open_channels, 0);
    }

    #[tokio::test]
    async fn test_rebind_replaces_channel_and_keeps_key() {
        let mut fx = Fixture::new();
        let (handle, _) = fx.registry.subscribe(jobs()).await.unwrap();
        let old = fx.feed.open_channels_for("jobs")[0].id;

        assert_eq!(fx.registry.rebind(handle.key()).await, BindOutcome::Bound);

        let open = fx.feed.open_channels_for("jobs");
        assert_eq!(open.len(), 1);
        assert_ne!(open[0].id, old);
        assert_eq!(fx.feed.closed(), vec![old]);
        assert_eq!(fx.cache.count_for("jobs-list"), 2);
        assert_eq!(fx.registry.len(), 1);
        assert!(fx.registry.status(handle.key()).unwrap().connected);

        // The handle still works against the rebound subscription
        fx.feed
            .emit_change("jobs", ChangeKind::Insert, serde_json::json!({"id": 11}));
        assert_eq!(
            fx.pump(),
            vec![EventDisposition::Invalidated(handle.key().clone())]
        );
        assert_eq!(fx.cache.count_for("jobs-list"), 3);
    }

    #[tokio::test]
    async fn test_rebind_ignores_close_errors() {
        let fx = Fixture::new();
        let (handle, _) = fx.registry.subscribe(jobs()).await.unwrap();
        fx.feed.fail_closes(true);

        assert_eq!(fx.registry.rebind(handle.key()).await, BindOutcome::Bound);
        assert!(fx.registry.status(handle.key()).unwrap().connected);
    }

    #[tokio::test]
    async fn test_rebind_unknown_key() {
        let fx = Fixture::new();
        let key = SubscriptionKey::new("jobs", "nope");
        assert_eq!(fx.registry.rebind(&key).await, BindOutcome::Missing);
    }

    #[tokio::test]
    async fn test_events_from_replaced_channel_are_dropped() {
        let mut fx = Fixture::new();
        let (handle, _) = fx.registry.subscribe(jobs()).await.unwrap();
        let old = fx.feed.open_channels_for("jobs")[0].id;
        fx.registry.rebind(handle.key()).await;

        let stale = ChannelEvent {
            channel: old,
            kind: ChannelEventKind::Bind(BindStatus::Error("late".to_string())),
        };
        assert_eq!(fx.registry.apply_event(stale), EventDisposition::Ignored);
        assert!(fx.registry.status(handle.key()).unwrap().connected);
        assert!(fx.pump().is_empty());
    }

    #[tokio::test]
    async fn test_bind_status_events() {
        let mut fx = Fixture::new();
        let (handle, _) = fx.registry.subscribe(jobs()).await.unwrap();
        let key = handle.key().clone();

        fx.feed
            .emit_bind_status("jobs", BindStatus::Error("socket reset".to_string()));
        assert_eq!(fx.pump(), vec![EventDisposition::ChannelError(key.clone())]);
        assert!(!fx.registry.status(&key).unwrap().connected);

        fx.feed.emit_bind_status("jobs", BindStatus::Subscribed);
        assert_eq!(fx.pump(), vec![EventDisposition::Activity(key.clone())]);
        assert!(fx.registry.status(&key).unwrap().connected);

        fx.feed.emit_bind_status("jobs", BindStatus::Closed);
        assert_eq!(fx.pump(), vec![EventDisposition::Disconnected(key.clone())]);
        assert!(!fx.registry.status(&key).unwrap().connected);
        assert!(fx.registry.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_refreshes_activity() {
        let mut fx = Fixture::new();
        let (handle, _) = fx.registry.subscribe(jobs()).await.unwrap();
        let bound_at = fx.registry.status(handle.key()).unwrap().last_activity.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        fx.feed.emit_presence("jobs");
        fx.pump();

        let pinged_at = fx.registry.status(handle.key()).unwrap().last_activity.unwrap();
        assert_eq!(pinged_at - bound_at, Duration::from_secs(30));
        // Presence is not a data change
        assert_eq!(fx.cache.count_for("jobs-list"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebind_coalesces_while_bind_in_flight() {
        let fx = Fixture::new();
        fx.feed.set_open_delay(Some(Duration::from_secs(1)));

        let registry = fx.registry.clone();
        let pending = tokio::spawn(async move { registry.subscribe(jobs()).await });
        settle().await;

        let key = SubscriptionKey::new("jobs", "jobs-list");
        assert_eq!(fx.registry.rebind(&key).await, BindOutcome::Coalesced);
        assert_eq!(fx.registry.stats().binds_in_flight, 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let (_, outcome) = pending.await.unwrap().unwrap();
        assert_eq!(outcome, BindOutcome::Bound);
        assert_eq!(fx.feed.opened_total(), 1);
        assert_eq!(fx.registry.stats().binds_in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_during_rebind_wins() {
        let fx = Fixture::new();
        let (handle, _) = fx.registry.subscribe(jobs()).await.unwrap();
        fx.feed.set_open_delay(Some(Duration::from_secs(2)));

        let registry = fx.registry.clone();
        let key = handle.key().clone();
        let rebind = tokio::spawn(async move { registry.rebind(&key).await });
        settle().await;

        assert_eq!(handle.unsubscribe().await, Release::TornDown);
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(rebind.await.unwrap(), BindOutcome::Cancelled);
        assert!(!fx.registry.contains(handle.key()));
        assert_eq!(fx.feed.open_count(), 0);
        assert_eq!(fx.registry.stats(), RegistryStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_during_stale_bind_is_not_hijacked() {
        let fx = Fixture::new();
        let (handle, _) = fx.registry.subscribe(jobs()).await.unwrap();
        fx.feed.set_open_delay(Some(Duration::from_secs(2)));

        let registry = fx.registry.clone();
        let key = handle.key().clone();
        let rebind = tokio::spawn(async move { registry.rebind(&key).await });
        settle().await;

        handle.unsubscribe().await;
        let registry = fx.registry.clone();
        let resubscribe = tokio::spawn(async move { registry.subscribe(jobs()).await });
        settle().await;

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(rebind.await.unwrap(), BindOutcome::Cancelled);
        let (fresh, outcome) = resubscribe.await.unwrap().unwrap();
        assert_eq!(outcome, BindOutcome::Bound);
        assert_eq!(fx.feed.open_count(), 1);
        assert_eq!(fx.registry.status(fresh.key()).unwrap().holders, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_subscribe_leaves_nothing_behind() {
        let fx = Fixture::new();
        fx.feed.set_open_delay(Some(Duration::from_secs(10)));

        let timed_out =
            tokio::time::timeout(Duration::from_secs(1), fx.registry.subscribe(jobs())).await;
        assert!(timed_out.is_err());
        assert_eq!(fx.registry.stats(), RegistryStats::default());
        assert!(fx.registry.state.lock().channels.is_empty());

        fx.feed.set_open_delay(None);
        let (handle, outcome) = fx.registry.subscribe(jobs()).await.unwrap();
        assert_eq!(outcome, BindOutcome::Bound);
        assert_eq!(fx.registry.status(handle.key()).unwrap().holders, 1);
        assert_eq!(handle.unsubscribe().await, Release::TornDown);
        assert_eq!(fx.feed.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_batch_releases_finished_members() {
        let fx = Fixture::new();
        fx.feed.set_open_delay(Some(Duration::from_secs(10)));
        let specs = vec![jobs(), SubscriptionSpec::new("crew", "crew-list")];

        let timed_out =
            tokio::time::timeout(Duration::from_secs(15), fx.registry.subscribe_many(specs)).await;
        assert!(timed_out.is_err());
        assert_eq!(fx.feed.opened_total(), 1);

        settle().await;
        assert_eq!(fx.registry.stats(), RegistryStats::default());
        assert_eq!(fx.feed.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_subscribe_keeps_holders_that_joined() {
        let fx = Fixture::new();
        fx.feed.set_open_delay(Some(Duration::from_secs(10)));

        let registry = fx.registry.clone();
        let creating = tokio::spawn(async move { registry.subscribe(jobs()).await });
        settle().await;
        let (joined, outcome) = fx.registry.subscribe(jobs()).await.unwrap();
        assert_eq!(outcome, BindOutcome::Joined);

        creating.abort();
        assert!(creating.await.unwrap_err().is_cancelled());

        let stats = fx.registry.stats();
        assert_eq!(stats.subscriptions, 1);
        assert_eq!(stats.holders, 1);
        assert_eq!(stats.binds_in_flight, 0);
        assert!(fx.registry.state.lock().channels.is_empty());

        // The survivor can still be brought up and released
        fx.feed.set_open_delay(None);
        assert_eq!(fx.registry.rebind(joined.key()).await, BindOutcome::Bound);
        assert_eq!(joined.unsubscribe().await, Release::TornDown);
        assert_eq!(fx.feed.open_count(), 0);
    }

    #[tokio::test]
    async fn test_route_teardown_is_total() {
        let fx = Fixture::new();
        let (jobs_handle, _) = fx.registry.subscribe(jobs()).await.unwrap();
        // Independently held elsewhere
        fx.registry.subscribe(jobs()).await.unwrap();
        let (crew, _) = fx
            .registry
            .subscribe(SubscriptionSpec::new("crew", "crew-list"))
            .await
            .unwrap();

        assert!(fx.registry.register_for_route("/jobs/7", jobs_handle.key()));
        assert!(fx.registry.register_for_route("/dashboard", jobs_handle.key()));
        assert!(fx.registry.register_for_route("/dashboard", crew.key()));

        assert_eq!(fx.registry.teardown_route("/jobs/7").await, 1);

        assert!(!fx.registry.contains(jobs_handle.key()));
        assert!(!fx.registry.subscriptions_by_table().contains_key("jobs"));
        assert_eq!(fx.registry.route_members("/dashboard"), vec![crew.key().clone()]);
        assert!(fx.registry.route_members("/jobs/7").is_empty());
        assert!(fx.feed.open_channels_for("jobs").is_empty());
        assert_eq!(fx.feed.open_channels_for("crew").len(), 1);

        assert_eq!(jobs_handle.unsubscribe().await, Release::NotHeld);
        assert_eq!(fx.registry.teardown_route("/jobs/7").await, 0);
    }

    #[tokio::test]
    async fn test_register_unknown_key_for_route() {
        let fx = Fixture::new();
        let key = SubscriptionKey::new("jobs", "ghost");
        assert!(!fx.registry.register_for_route("/jobs", &key));
        assert!(fx.registry.route_members("/jobs").is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_cleans_route_buckets() {
        let fx = Fixture::new();
        let (handle, _) = fx.registry.subscribe(jobs()).await.unwrap();
        fx.registry.register_for_route("/jobs", handle.key());

        handle.unsubscribe().await;
        assert!(fx.registry.route_members("/jobs").is_empty());
        assert_eq!(fx.registry.stats().routes, 0);
    }

    #[tokio::test]
    async fn test_indices_and_priority_order() {
        let fx = Fixture::new();
        let specs = vec![
            SubscriptionSpec::new("jobs", "jobs-list").with_priority(Priority::Low),
            SubscriptionSpec::new("jobs", ["job", "7"]).with_filter("id=eq.7"),
            SubscriptionSpec::new("timesheets", "timesheets").with_priority(Priority::High),
        ];
        let (composite, outcomes) = fx.registry.subscribe_many(specs).await.unwrap();
        assert_eq!(composite.len(), 3);
        assert!(outcomes.iter().all(|o| *o == BindOutcome::Bound));

        let by_table = fx.registry.subscriptions_by_table();
        assert_eq!(by_table["jobs"].len(), 2);
        assert_eq!(by_table["timesheets"].len(), 1);

        let order = fx.registry.keys_by_priority();
        assert_eq!(order[0].table(), "timesheets");
        assert_eq!(order[2].descriptor().tokens(), ["jobs-list"]);

        let jobs_keys = fx.registry.keys_for_tables(&["jobs".to_string()]);
        assert_eq!(jobs_keys.len(), 2);

        let filtered = fx
            .registry
            .status(&SubscriptionKey::new("jobs", ["job", "7"]))
            .unwrap();
        assert_eq!(filtered.filter.as_deref(), Some("id=eq.7"));
        assert_eq!(
            fx.feed.open_channels_for("jobs").iter().filter(|r| r.filter.is_some()).count(),
            1
        );

        assert_eq!(composite.unsubscribe().await, 3);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_many_rejects_invalid_batch_up_front() {
        let fx = Fixture::new();
        let specs = vec![jobs(), SubscriptionSpec::new("", "x")];
        assert!(fx.registry.subscribe_many(specs).await.is_err());
        assert!(fx.registry.is_empty());
        assert_eq!(fx.feed.opened_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_keys() {
        let fx = Fixture::new();
        let (high, _) = fx.registry.subscribe(jobs()).await.unwrap();
        fx.registry
            .subscribe(SubscriptionSpec::new("crew", "crew-list"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        let now = Instant::now();
        assert_eq!(
            fx.registry
                .stale_keys(Priority::High, Duration::from_secs(300), now),
            vec![high.key().clone()]
        );
        assert!(fx
            .registry
            .stale_keys(Priority::High, Duration::from_secs(600), now)
            .is_empty());
    }

    #[tokio::test]
    async fn test_connection_summary_and_mark_all_disconnected() {
        let fx = Fixture::new();
        fx.registry.subscribe(jobs()).await.unwrap();
        fx.registry
            .subscribe(SubscriptionSpec::new("crew", "crew-list"))
            .await
            .unwrap();

        assert_eq!(
            fx.registry.connection_summary(),
            ConnectionSummary {
                total: 2,
                connected: 2,
                high_priority_connected: 1,
            }
        );
        assert_eq!(fx.registry.mark_all_disconnected(), 2);
        assert_eq!(fx.registry.connection_summary().connected, 0);
        assert_eq!(fx.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_teardown_all_refuses_new_subscriptions() {
        let fx = Fixture::new();
        fx.registry.subscribe(jobs()).await.unwrap();
        fx.registry
            .subscribe(SubscriptionSpec::new("crew", "crew-list"))
            .await
            .unwrap();

        assert_eq!(fx.registry.teardown_all().await, 2);
        assert_eq!(fx.feed.open_count(), 0);
        assert!(fx.registry.is_closed());
        assert!(matches!(
            fx.registry.subscribe(jobs()).await,
            Err(RealtimeError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected() {
        let fx = Fixture::new();
        let err = fx
            .registry
            .subscribe(SubscriptionSpec::new("jobs", Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidRequest { .. }));
        assert_eq!(fx.feed.opened_total(), 0);
    }
}
