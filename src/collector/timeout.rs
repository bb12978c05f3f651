//! Shared pool of delayed, cancellable conversation timers.
//!
//! Timers are tokio tasks on a runtime owned by the scheduler, sized by
//! `timerThreadPoolSize`. A timer holds only a weak reference to its
//! collector, so a forgotten timer never keeps a finished conversation
//! alive.
//!
//! Cancelling a handle aborts the sleeping task, but a timer whose sleep has
//! already elapsed may be running its callback at that moment. Collectors
//! therefore re-check, under their own lock, that the firing timer is still
//! the one they armed (see [`TimeoutHandle::id`]).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::task::AbortHandle;

use super::Collector;
use crate::error::{LockResultExt, MsbResult};

const LOG_TARGET: &str = "msb::collector::timeout";

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Response,
    Ack,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Response => f.write_str("response"),
            TimeoutKind::Ack => f.write_str("ack"),
        }
    }
}

/// Cancellable handle of one scheduled timer.
#[derive(Debug)]
pub struct TimeoutHandle {
    id: u64,
    kind: TimeoutKind,
    abort: AbortHandle,
}

impl TimeoutHandle {
    /// Unique id passed to the collector when the timer fires.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TimeoutKind {
        self.kind
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }
}

/// Schedules response and ack timeouts for collectors.
pub struct TimeoutScheduler {
    runtime: Mutex<Option<Runtime>>,
}

impl TimeoutScheduler {
    /// Start a scheduler backed by `worker_threads` timer threads.
    pub fn new(worker_threads: usize) -> MsbResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("msb-timeout")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// End `collector`'s conversation after `delay` unless cancelled.
    pub fn schedule_response_timeout(
        &self,
        delay: Duration,
        collector: &Arc<Collector>,
    ) -> Option<TimeoutHandle> {
        let target = Arc::downgrade(collector);
        self.schedule(TimeoutKind::Response, delay, move |id| {
            if let Some(collector) = target.upgrade() {
                collector.on_response_timeout(id);
            }
        })
    }

    /// Stop waiting for acks after `delay` unless cancelled.
    ///
    /// A zero delay schedules nothing.
    pub fn schedule_ack_timeout(
        &self,
        delay: Duration,
        collector: &Arc<Collector>,
    ) -> Option<TimeoutHandle> {
        if delay.is_zero() {
            log::debug!(target: LOG_TARGET, "Ack timeout already elapsed, not scheduling");
            return None;
        }
        let target = Arc::downgrade(collector);
        self.schedule(TimeoutKind::Ack, delay, move |id| {
            if let Some(collector) = target.upgrade() {
                collector.on_ack_timeout(id);
            }
        })
    }

    fn schedule(
        &self,
        kind: TimeoutKind,
        delay: Duration,
        callback: impl FnOnce(u64) + Send + 'static,
    ) -> Option<TimeoutHandle> {
        let runtime = self
            .runtime
            .lock()
            .recover_poison("TimeoutScheduler::schedule");
        let Some(runtime) = runtime.as_ref() else {
            log::warn!(
                target: LOG_TARGET,
                "Scheduler is shut down, dropping {} timeout of {:?}",
                kind,
                delay
            );
            return None;
        };

        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            log::trace!(target: LOG_TARGET, "{} timer {} fired", kind, id);
            callback(id);
        });
        log::trace!(target: LOG_TARGET, "Scheduled {} timer {} in {:?}", kind, id, delay);

        Some(TimeoutHandle {
            id,
            kind,
            abort: task.abort_handle(),
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.runtime
            .lock()
            .recover_poison("TimeoutScheduler::is_shut_down")
            .is_none()
    }

    /// Stop every pending timer. Later scheduling is a logged no-op.
    pub fn shutdown(&self) {
        let runtime = self
            .runtime
            .lock()
            .recover_poison("TimeoutScheduler::shutdown")
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            log::info!(target: LOG_TARGET, "Timeout scheduler shut down");
        }
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TimeoutScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutScheduler")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
