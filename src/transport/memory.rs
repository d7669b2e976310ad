//! In-process change feed
//!
//! Keeps every open channel in memory and lets the host (or a test) push
//! row changes, presence pings and bind status changes into them. Failure
//! knobs cover the cases the manager has to recover from: rejected binds,
//! an unreachable backend, failing closes and slow opens.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BindStatus, ChangeFeed, ChangeKind, ChannelHandle, ChannelId, ChannelRequest, EventSink};
use crate::error::TransportError;

struct OpenChannel {
    request: ChannelRequest,
    sink: EventSink,
}

struct FeedState {
    open: BTreeMap<ChannelId, OpenChannel>,
    opened_total: usize,
    closed: Vec<ChannelId>,
    fail_opens: usize,
    fail_closes: bool,
    reachable: bool,
    open_delay: Option<Duration>,
}

/// Change feed living entirely in this process
pub struct InMemoryFeed {
    state: Mutex<FeedState>,
}

impl InMemoryFeed {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FeedState {
                open: BTreeMap::new(),
                opened_total: 0,
                closed: Vec::new(),
                fail_opens: 0,
                fail_closes: false,
                reachable: true,
                open_delay: None,
            }),
        }
    }

    /// Toggle the result of reachability probes (and of opens)
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Reject the next `n` open requests
    pub fn fail_next_opens(&self, n: usize) {
        self.state.lock().fail_opens = n;
    }

    /// Make closes report an error (the channel is still dropped)
    pub fn fail_closes(&self, fail: bool) {
        self.state.lock().fail_closes = fail;
    }

    /// Delay every open by `delay` on the tokio clock
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.state.lock().open_delay = delay;
    }

    /// Number of successful opens since creation
    pub fn opened_total(&self) -> usize {
        self.state.lock().opened_total
    }

    /// Number of channels currently open
    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn is_open(&self, id: ChannelId) -> bool {
        self.state.lock().open.contains_key(&id)
    }

    /// Channels currently open for `table`
    pub fn open_channels_for(&self, table: &str) -> Vec<ChannelRequest> {
        self.state
            .lock()
            .open
            .values()
            .filter(|c| c.request.table == table)
            .map(|c| c.request.clone())
            .collect()
    }

    /// Channels closed so far, in close order
    pub fn closed(&self) -> Vec<ChannelId> {
        self.state.lock().closed.clone()
    }

    /// Push a row change to every channel open on `table`
    pub fn emit_change(&self, table: &str, kind: ChangeKind, payload: serde_json::Value) -> usize {
        self.sinks_for(table)
            .into_iter()
            .filter(|sink| sink.change(kind, payload.clone()))
            .count()
    }

    /// Push a presence ping to every channel open on `table`
    pub fn emit_presence(&self, table: &str) -> usize {
        self.sinks_for(table)
            .into_iter()
            .filter(|sink| sink.presence())
            .count()
    }

    /// Push a bind status to every channel open on `table`
    pub fn emit_bind_status(&self, table: &str, status: BindStatus) -> usize {
        self.sinks_for(table)
            .into_iter()
            .filter(|sink| sink.bind_status(status.clone()))
            .count()
    }

    /// Report an error on every open channel, as a dropped socket would
    pub fn break_all(&self, reason: &str) -> usize {
        let sinks: Vec<EventSink> = self.state.lock().open.values().map(|c| c.sink.clone()).collect();
        sinks
            .into_iter()
            .filter(|sink| sink.bind_status(BindStatus::Error(reason.to_string())))
            .count()
    }

    fn sinks_for(&self, table: &str) -> Vec<EventSink> {
        // Clone out so nothing is sent while the feed lock is held
        self.state
            .lock()
            .open
            .values()
            .filter(|c| c.request.table == table)
            .map(|c| c.sink.clone())
            .collect()
    }
}

impl Default for InMemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for InMemoryFeed {
    async fn open_channel(
        &self,
        request: ChannelRequest,
        sink: EventSink,
    ) -> Result<ChannelHandle, TransportError> {
        let delay = self.state.lock().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let topic = request.topic();
        let id = request.id;
        {
            let mut state = self.state.lock();
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(TransportError::BindRejected {
                    topic,
                    reason: "rejected by in-memory feed".to_string(),
                });
            }
            if !state.reachable {
                return Err(TransportError::Unreachable {
                    message: "in-memory feed is offline".to_string(),
                });
            }
            state.opened_total += 1;
            state.open.insert(id, OpenChannel { request, sink });
        }

        tracing::debug!("[FEED] Opened {} as {}", topic, id);
        Ok(ChannelHandle::new(id, topic))
    }

    async fn close_channel(&self, handle: ChannelHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.open.remove(&handle.id());
        state.closed.push(handle.id());
        tracing::debug!("[FEED] Closed {} ({})", handle.topic(), handle.id());

        if state.fail_closes {
            return Err(TransportError::CloseFailed {
                topic: handle.topic().to_string(),
                reason: "in-memory feed close failure".to_string(),
            });
        }
        Ok(())
    }

    async fn reachability_probe(&self) -> Result<(), TransportError> {
        if self.state.lock().reachable {
            Ok(())
        } else {
            Err(TransportError::Unreachable {
                message: "in-memory feed is offline".to_string(),
            })
        }
    }
}
