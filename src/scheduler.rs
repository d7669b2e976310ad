//! Centralized task scheduling
//!
//! Every timer in the subsystem goes through here: the periodic health
//! probe and staleness sweep, the online-settle debounce, and delayed
//! reconnects. Tasks run on the tokio clock, so tests can pause and
//! fast-forward time with `tokio::time::pause`/`advance`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Handle to a scheduled task
///
/// Dropping the handle aborts the task unless it was detached.
pub struct TaskHandle {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancel the task at its next suspension point
    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    /// Let the task run to completion without keeping a handle
    ///
    /// A task that removes its own handle from a table must detach it,
    /// otherwise dropping the handle cancels the task mid-flight.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Owner of the periodic tasks and spawner of delayed ones
pub struct Scheduler {
    periodic: Mutex<Vec<TaskHandle>>,
    stopped: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            periodic: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Run `task` every `period`, first run one period from now
    ///
    /// A run that overruns its slot delays the next one instead of bursting.
    pub fn every<F, Fut>(&self, name: &'static str, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            tracing::debug!("[SCHEDULER] Ignoring periodic task {} after shutdown", name);
            return;
        }

        // Deadlines are fixed at call time, not at the task's first poll
        let start = Instant::now() + period;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracing::trace!("[SCHEDULER] Running {}", name);
                task().await;
            }
        });

        tracing::debug!("[SCHEDULER] Started {} every {:?}", name, period);
        self.periodic.lock().push(TaskHandle::new(name, handle));
    }

    /// Run `task` once after `delay`
    ///
    /// Returns `None` once the scheduler has been shut down.
    pub fn after<Fut>(&self, name: &'static str, delay: Duration, task: Fut) -> Option<TaskHandle>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            tracing::debug!("[SCHEDULER] Ignoring delayed task {} after shutdown", name);
            return None;
        }

        let deadline = Instant::now() + delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            tracing::trace!("[SCHEDULER] Firing {} after {:?}", name, delay);
            task.await;
        });
        Some(TaskHandle::new(name, handle))
    }

    /// Stop all periodic tasks and refuse new ones
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<TaskHandle> = self.periodic.lock().drain(..).collect();
        tracing::debug!("[SCHEDULER] Stopping {} periodic tasks", tasks.len());
        drop(tasks);
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn periodic_count(&self) -> usize {
        self.periodic.lock().len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
