//! Timers for scheduling delayed and repeated operations.
//!
//! Reconnect and rejoin scheduling run through [`TimeoutTimer`], a stepped
//! back-off timer driven by a `tries -> delay` function. Heartbeats run
//! through [`HeartbeatTimer`], a fixed-interval repeating timer with
//! idempotent start/stop.
//!
//! Both post their work onto an injectable [`Scheduler`] (a delayed-task
//! queue). Production code uses [`TokioScheduler`]; tests substitute a fake
//! that records pending tasks and advances a virtual clock explicitly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// A delayed-task queue the timers post their work onto.
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TaskHandle;

    /// Run `task` every `interval` until the returned handle is cancelled.
    fn schedule_repeating(&self, interval: Duration, task: Box<dyn FnMut() + Send>) -> TaskHandle;
}

/// Handle to a scheduled task. Cancelling prevents any further invocation;
/// dropping the handle cancels implicitly, so callers must hold on to it for
/// as long as the task should stay live.
#[derive(Debug)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Create a handle around a shared cancellation flag.
    pub fn new(cancelled: Arc<AtomicBool>) -> Self {
        Self { cancelled }
    }

    /// Prevent the task from running (again).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// Tokio scheduler
// ============================================================================

/// Production [`Scheduler`] backed by the tokio runtime.
///
/// The runtime handle is captured lazily: at construction when one is
/// current, otherwise at the first `schedule` call made from runtime context.
pub struct TokioScheduler {
    handle: Mutex<Option<tokio::runtime::Handle>>,
}

impl TokioScheduler {
    /// Create a scheduler, capturing the current runtime handle if any.
    pub fn new() -> Self {
        Self {
            handle: Mutex::new(tokio::runtime::Handle::try_current().ok()),
        }
    }

    /// Create a scheduler bound to an explicit runtime handle.
    pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    fn runtime(&self) -> Option<tokio::runtime::Handle> {
        let mut guard = self.handle.lock();
        if guard.is_none() {
            *guard = tokio::runtime::Handle::try_current().ok();
        }
        guard.clone()
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        match self.runtime() {
            Some(runtime) => {
                let flag = cancelled.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !flag.load(Ordering::SeqCst) {
                        task();
                    }
                });
            }
            None => {
                tracing::warn!("no tokio runtime available, dropping scheduled task");
                cancelled.store(true, Ordering::SeqCst);
            }
        }
        TaskHandle::new(cancelled)
    }

    fn schedule_repeating(
        &self,
        interval: Duration,
        mut task: Box<dyn FnMut() + Send>,
    ) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        match self.runtime() {
            Some(runtime) => {
                let flag = cancelled.clone();
                runtime.spawn(async move {
                    loop {
                        tokio::time::sleep(interval).await;
                        if flag.load(Ordering::SeqCst) {
                            break;
                        }
                        task();
                    }
                });
            }
            None => {
                tracing::warn!("no tokio runtime available, dropping repeating task");
                cancelled.store(true, Ordering::SeqCst);
            }
        }
        TaskHandle::new(cancelled)
    }
}

// ============================================================================
// Stepped back-off timer
// ============================================================================

/// One-shot timer whose delay steps up with consecutive tries.
///
/// Used for socket reconnects and channel rejoins. The callback must not
/// close over a strong reference to the timer's owner, otherwise the owner
/// can never drop while a retry is pending.
pub struct TimeoutTimer {
    scheduler: Arc<dyn Scheduler>,
    timer_calc: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
    callback: Arc<dyn Fn() + Send + Sync>,
    tries: Mutex<u32>,
    handle: Mutex<Option<TaskHandle>>,
}

impl TimeoutTimer {
    /// Create a timer with a back-off function and a fire callback.
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        timer_calc: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
        callback: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            scheduler,
            timer_calc,
            callback,
            tries: Mutex::new(0),
            handle: Mutex::new(None),
        }
    }

    /// Post the next attempt, replacing any in-flight one.
    pub fn schedule(&self) {
        let delay = {
            let mut tries = self.tries.lock();
            *tries += 1;
            (self.timer_calc)(*tries)
        };

        let callback = self.callback.clone();
        let handle = self.scheduler.schedule(delay, Box::new(move || callback()));
        // Replacing the handle cancels the previous task.
        *self.handle.lock() = Some(handle);
    }

    /// Cancel any in-flight task and restart the back-off from zero.
    pub fn reset(&self) {
        *self.tries.lock() = 0;
        if let Some(handle) = self.handle.lock().take() {
            handle.cancel();
        }
    }

    /// Number of attempts scheduled since the last reset.
    pub fn tries(&self) -> u32 {
        *self.tries.lock()
    }
}

// ============================================================================
// Heartbeat timer
// ============================================================================

static HEARTBEAT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

/// Fixed-interval repeating timer driving heartbeat ticks.
///
/// `start` is idempotent: starting an already-started timer replaces the
/// underlying periodic task. Equality is identity, each timer is distinct
/// from any other.
pub struct HeartbeatTimer {
    id: u64,
    interval: Duration,
    scheduler: Arc<dyn Scheduler>,
    handle: Mutex<Option<TaskHandle>>,
}

impl HeartbeatTimer {
    /// Create a stopped timer with the given tick interval.
    pub fn new(interval: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            id: HEARTBEAT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            interval,
            scheduler,
            handle: Mutex::new(None),
        }
    }

    /// Install and activate the periodic task, replacing any prior one.
    pub fn start(&self, handler: Box<dyn FnMut() + Send>) {
        let handle = self.scheduler.schedule_repeating(self.interval, handler);
        if let Some(previous) = self.handle.lock().replace(handle) {
            previous.cancel();
        }
    }

    /// Cancel the periodic task and mark the timer invalid.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.cancel();
        }
    }

    /// Whether a live periodic task is currently installed.
    pub fn is_valid(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|handle| !handle.is_cancelled())
            .unwrap_or(false)
    }

    /// The tick interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl PartialEq for HeartbeatTimer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for HeartbeatTimer {}

impl std::fmt::Debug for HeartbeatTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatTimer")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .finish()
    }
}
