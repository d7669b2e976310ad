//! Change-feed transport seam
//!
//! The backend change feed is an external collaborator. It exposes a
//! channel-based subscribe primitive keyed by table and optional row filter,
//! plus a lightweight reachability check.
//!
//! # Event delivery
//!
//! ```text
//! ┌──────────────┐  EventSink   ┌─────────────────┐   in order   ┌──────────────┐
//! │  ChangeFeed  │─────────────>│ mpsc (unbounded)│─────────────>│  event loop  │
//! │ (per channel)│ change/ping/ │  shared by all  │              │ (registry +  │
//! │              │ bind status  │    channels     │              │   bridge)    │
//! └──────────────┘              └─────────────────┘              └──────────────┘
//! ```
//!
//! Each channel gets its own [`EventSink`] stamped with the [`ChannelId`] the
//! registry allocated for it, so events from a replaced channel can be told
//! apart and dropped.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

pub use memory::InMemoryFeed;

/// Registry-assigned identifier of one channel binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// What the registry asks the transport to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub id: ChannelId,
    pub table: String,
    pub filter: Option<String>,
}

impl ChannelRequest {
    /// Transport topic name, e.g. `realtime:jobs:job_id=eq.7`
    pub fn topic(&self) -> String {
        match &self.filter {
            Some(filter) => format!("realtime:{}:{}", self.table, filter),
            None => format!("realtime:{}", self.table),
        }
    }
}

/// Opaque handle to a live transport binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    id: ChannelId,
    topic: String,
}

impl ChannelHandle {
    pub fn new(id: ChannelId, topic: impl Into<String>) -> Self {
        Self {
            id,
            topic: topic.into(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Row change type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Transport-reported state of a channel binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindStatus {
    Subscribed,
    Error(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEventKind {
    Change {
        kind: ChangeKind,
        payload: serde_json::Value,
    },
    Presence,
    Bind(BindStatus),
}

/// One transport callback, tagged with the channel it came from
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub channel: ChannelId,
    pub kind: ChannelEventKind,
}

/// Callback target handed to the transport when a channel is opened
#[derive(Debug, Clone)]
pub struct EventSink {
    channel: ChannelId,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl EventSink {
    pub fn new(channel: ChannelId, tx: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self { channel, tx }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Deliver a row change. Returns false once the manager has stopped.
    pub fn change(&self, kind: ChangeKind, payload: serde_json::Value) -> bool {
        self.send(ChannelEventKind::Change { kind, payload })
    }

    /// Deliver a presence/liveness ping
    pub fn presence(&self) -> bool {
        self.send(ChannelEventKind::Presence)
    }

    /// Deliver a bind status change
    pub fn bind_status(&self, status: BindStatus) -> bool {
        self.send(ChannelEventKind::Bind(status))
    }

    fn send(&self, kind: ChannelEventKind) -> bool {
        self.tx
            .send(ChannelEvent {
                channel: self.channel,
                kind,
            })
            .is_ok()
    }
}

/// Backend change feed
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a channel scoped to `request.table` (narrowed by its filter).
    ///
    /// Returning `Ok` means the binding is live. Later status changes and
    /// row changes arrive through `sink`.
    async fn open_channel(
        &self,
        request: ChannelRequest,
        sink: EventSink,
    ) -> Result<ChannelHandle, TransportError>;

    /// Close a channel. Callers treat errors as informational.
    async fn close_channel(&self, handle: ChannelHandle) -> Result<(), TransportError>;

    /// Lightweight network check against the backend
    async fn reachability_probe(&self) -> Result<(), TransportError>;
}
