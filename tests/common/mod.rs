//! Common test utilities for realtime-sync integration tests
//!
//! This module provides:
//! - `Harness` building a started manager over `InMemoryFeed` + `RecordingCache`
//! - `settle()` to let spawned tasks run after advancing virtual time

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use realtime_sync::{
    InMemoryFeed, Priority, RealtimeConfig, RealtimeManager, RecordingCache, SubscriptionSpec,
};

/// A running manager plus handles on its collaborators
pub struct Harness {
    pub feed: Arc<InMemoryFeed>,
    pub cache: Arc<RecordingCache>,
    pub manager: RealtimeManager,
}

impl Harness {
    /// Start a manager with default configuration
    pub fn new() -> Self {
        Self::with_config(RealtimeConfig::default())
    }

    pub fn with_config(config: RealtimeConfig) -> Self {
        let feed = Arc::new(InMemoryFeed::new());
        let cache = Arc::new(RecordingCache::new());
        let manager = RealtimeManager::start(config, feed.clone(), cache.clone())
            .expect("Failed to start manager");
        Self {
            feed,
            cache,
            manager,
        }
    }

    /// Advance virtual time and let woken tasks finish
    pub async fn advance(&self, by: Duration) {
        tokio::time::advance(by).await;
        settle().await;
    }
}

/// Yield enough times for spawned tasks and the event loop to drain
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub fn high(table: &str, descriptor: &str) -> SubscriptionSpec {
    SubscriptionSpec::new(table, descriptor).with_priority(Priority::High)
}

pub fn medium(table: &str, descriptor: &str) -> SubscriptionSpec {
    SubscriptionSpec::new(table, descriptor)
}
