//! Cache invalidation bridge
//!
//! Translates change notifications into invalidation calls on the external
//! query cache. Invalidation is fire-and-forget: a failed call is logged and
//! counted, never retried, and never affects subscription health. The next
//! change event or reconnect corrects a missed invalidation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CacheError;
use crate::subscription::CacheKeyDescriptor;

/// External cache layer holding query results
pub trait CacheLayer: Send + Sync {
    /// Mark every cached result named by `descriptor` for recomputation
    fn invalidate(&self, descriptor: &CacheKeyDescriptor) -> Result<(), CacheError>;

    /// Mark every cached result for recomputation
    fn invalidate_all(&self) -> Result<(), CacheError>;
}

/// Routes change notifications to the cache layer
pub struct CacheInvalidationBridge {
    cache: Arc<dyn CacheLayer>,
    issued: AtomicU64,
    failed: AtomicU64,
}

impl CacheInvalidationBridge {
    pub fn new(cache: Arc<dyn CacheLayer>) -> Self {
        Self {
            cache,
            issued: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// A change arrived on `table`: invalidate exactly `descriptor`
    pub fn on_change(&self, table: &str, descriptor: &CacheKeyDescriptor) {
        tracing::trace!("[CACHE] Change on {} -> invalidate [{}]", table, descriptor);
        self.invalidate(descriptor);
    }

    /// Administrative resync: invalidate everything cached under each table
    ///
    /// Cached queries are keyed with their table name as the leading token,
    /// so invalidating the table token covers every result derived from it.
    pub fn on_force_refresh(&self, tables: &[String]) {
        for table in tables {
            tracing::info!("[CACHE] Force refresh of table {}", table);
            self.invalidate(&CacheKeyDescriptor::single(table.as_str()));
        }
    }

    /// Invalidate the whole cache (long absence from the foreground)
    pub fn invalidate_all(&self) {
        self.issued.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.cache.invalidate_all() {
            self.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("[CACHE] Full invalidation failed: {}", e);
        }
    }

    /// Invalidate one descriptor's entries (bind, rebind, change)
    pub fn invalidate(&self, descriptor: &CacheKeyDescriptor) {
        self.issued.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.cache.invalidate(descriptor) {
            self.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("[CACHE] Invalidation of [{}] failed: {}", descriptor, e);
        }
    }

    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Recording cache
// ============================================================================

/// One call received by [`RecordingCache`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Keys(CacheKeyDescriptor),
    All,
}

/// Cache layer that records every invalidation it receives
///
/// Used by the simulator binary and by tests. `set_failing(true)` makes every
/// call return an error after recording it.
#[derive(Default)]
pub struct RecordingCache {
    calls: Mutex<Vec<Invalidation>>,
    failing: Mutex<bool>,
}

impl RecordingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn calls(&self) -> Vec<Invalidation> {
        self.calls.lock().clone()
    }

    /// Number of descriptor invalidations that named `token`
    pub fn count_for(&self, token: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Invalidation::Keys(d) if d.contains(token)))
            .count()
    }

    /// Number of descriptor invalidations exactly matching `descriptor`
    pub fn count_exact(&self, descriptor: &CacheKeyDescriptor) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Invalidation::Keys(d) if d == descriptor))
            .count()
    }

    pub fn full_invalidations(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Invalidation::All))
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: Invalidation) -> Result<(), CacheError> {
        let keys = match &call {
            Invalidation::Keys(d) => d.to_string(),
            Invalidation::All => "*".to_string(),
        };
        self.calls.lock().push(call);
        if *self.failing.lock() {
            return Err(CacheError::Rejected {
                keys,
                reason: "recording cache set to fail".to_string(),
            });
        }
        Ok(())
    }
}

impl CacheLayer for RecordingCache {
    fn invalidate(&self, descriptor: &CacheKeyDescriptor) -> Result<(), CacheError> {
        self.record(Invalidation::Keys(descriptor.clone()))
    }

    fn invalidate_all(&self) -> Result<(), CacheError> {
        self.record(Invalidation::All)
    }
}
