//! realtime-sync: live change-feed subscriptions kept healthy and cache-coherent
//!
//! Maintains a pool of subscriptions against a backend change feed, keeps a
//! client-side query cache consistent with server state, and recovers on
//! its own from network and backend failures.
//!
//! # Components
//!
//! - [`SubscriptionRegistry`]: owns subscriptions, indexed by table and UI route
//! - [`ConnectionHealthMonitor`]: probes, staleness sweeps, host signals
//! - [`ReconnectionCoordinator`]: rebinds channels without changing identity
//! - [`CacheInvalidationBridge`]: turns change events into cache invalidations
//! - [`RealtimeManager`]: wires the above together and runs the event loop
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use realtime_sync::{InMemoryFeed, Priority, RealtimeConfig, RealtimeManager, RecordingCache, SubscriptionSpec};
//!
//! let manager = RealtimeManager::start(
//!     RealtimeConfig::default(),
//!     Arc::new(InMemoryFeed::new()),
//!     Arc::new(RecordingCache::new()),
//! )?;
//!
//! let jobs = manager
//!     .subscribe(SubscriptionSpec::new("jobs", "jobs-list").with_priority(Priority::High))
//!     .await?;
//! manager.register_for_route("/jobs", &jobs);
//!
//! // Leaving the screen frees its listeners
//! manager.teardown_route("/jobs").await;
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod reconnect;
pub mod registry;
pub mod scheduler;
pub mod subscription;
pub mod transport;

// Re-export commonly used types
pub use cache::{CacheInvalidationBridge, CacheLayer, Invalidation, RecordingCache};
pub use config::{HealthConfig, LoggingConfig, ReconnectConfig, RealtimeConfig};
pub use error::{CacheError, RealtimeError, Result, TransportError};
pub use health::{ConnectionHealthMonitor, LivenessSignals, ProbeOutcome, SweepReport};
pub use manager::{ManagerStats, RealtimeManager};
pub use reconnect::{ReconnectSummary, ReconnectionCoordinator};
pub use registry::{
    BindOutcome, CompositeHandle, RegistryStats, Release, SubscriptionHandle, SubscriptionRegistry,
};
pub use scheduler::{Scheduler, TaskHandle};
pub use subscription::{
    CacheKeyDescriptor, ConnectionStatus, LeaseId, Priority, SubscriptionKey, SubscriptionSpec,
    SubscriptionStatus,
};
pub use transport::{
    BindStatus, ChangeFeed, ChangeKind, ChannelEvent, ChannelHandle, ChannelId, ChannelRequest,
    EventSink, InMemoryFeed,
};
