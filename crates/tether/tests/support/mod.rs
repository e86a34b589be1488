//! Shared test fixtures: a virtual-clock scheduler and a recording fake
//! transport, so connection scenarios run deterministically without sockets
//! or real time.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use tether::error::TransportError;
use tether::timer::{Scheduler, TaskHandle};
use tether::transport::{ReadyState, Transport, TransportDelegate, TransportFactory};

// ============================================================================
// Virtual scheduler
// ============================================================================

enum TaskKind {
    Once(Option<Box<dyn FnOnce() + Send>>),
    Repeating {
        interval: Duration,
        task: Box<dyn FnMut() + Send>,
    },
}

struct Scheduled {
    due: Duration,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    kind: TaskKind,
}

struct SchedulerInner {
    now: Duration,
    seq: u64,
    tasks: Vec<Scheduled>,
}

/// A delayed-task queue driven by an explicit virtual clock.
pub struct VirtualScheduler {
    inner: Mutex<SchedulerInner>,
}

impl VirtualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SchedulerInner {
                now: Duration::ZERO,
                seq: 0,
                tasks: Vec::new(),
            }),
        })
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.inner.lock().unwrap().now
    }

    /// Number of live (non-cancelled) pending tasks.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|task| !task.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Advance the clock, running every due task in deadline order. Tasks
    /// scheduled while running (retries, rejoins) are included if they fall
    /// within the window.
    pub fn advance(&self, delta: Duration) {
        let target = self.inner.lock().unwrap().now + delta;

        loop {
            let next = {
                let mut inner = self.inner.lock().unwrap();
                inner
                    .tasks
                    .retain(|task| !task.cancelled.load(Ordering::SeqCst));

                let index = inner
                    .tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, task)| task.due <= target)
                    .min_by_key(|(_, task)| (task.due, task.seq))
                    .map(|(index, _)| index);

                match index {
                    Some(index) => {
                        let task = inner.tasks.remove(index);
                        inner.now = task.due;
                        Some(task)
                    }
                    None => {
                        inner.now = target;
                        None
                    }
                }
            };

            let Some(scheduled) = next else { break };
            match scheduled.kind {
                TaskKind::Once(mut task) => {
                    if let Some(task) = task.take() {
                        task();
                    }
                }
                TaskKind::Repeating { interval, mut task } => {
                    task();
                    if !scheduled.cancelled.load(Ordering::SeqCst) {
                        let mut inner = self.inner.lock().unwrap();
                        let seq = inner.seq;
                        inner.seq += 1;
                        inner.tasks.push(Scheduled {
                            due: scheduled.due + interval,
                            seq,
                            cancelled: scheduled.cancelled,
                            kind: TaskKind::Repeating { interval, task },
                        });
                    }
                }
            }
        }
    }

    fn push(&self, delay: Duration, kind: TaskKind) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.seq;
        inner.seq += 1;
        let due = inner.now + delay;
        inner.tasks.push(Scheduled {
            due,
            seq,
            cancelled: cancelled.clone(),
            kind,
        });
        TaskHandle::new(cancelled)
    }
}

impl Scheduler for VirtualScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TaskHandle {
        self.push(delay, TaskKind::Once(Some(task)))
    }

    fn schedule_repeating(
        &self,
        interval: Duration,
        task: Box<dyn FnMut() + Send>,
    ) -> TaskHandle {
        self.push(interval, TaskKind::Repeating { interval, task })
    }
}

// ============================================================================
// Fake transport
// ============================================================================

/// A transport that records outbound frames and lets the test act as the
/// server.
pub struct FakeTransport {
    auto_open: bool,
    url: Mutex<Option<String>>,
    state: Mutex<ReadyState>,
    delegate: Mutex<Option<Arc<dyn TransportDelegate>>>,
    sent: Mutex<Vec<String>>,
    closes: Mutex<Vec<(u16, Option<String>)>>,
}

impl FakeTransport {
    pub fn new(auto_open: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_open,
            url: Mutex::new(None),
            state: Mutex::new(ReadyState::Closed),
            delegate: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
        })
    }

    fn delegate(&self) -> Option<Arc<dyn TransportDelegate>> {
        self.delegate.lock().unwrap().clone()
    }

    /// The URL this transport was created for.
    pub fn url(&self) -> Option<String> {
        self.url.lock().unwrap().clone()
    }

    /// Complete the handshake (for transports created with `auto_open: false`).
    pub fn open(&self) {
        *self.state.lock().unwrap() = ReadyState::Open;
        if let Some(delegate) = self.delegate() {
            delegate.on_open();
        }
    }

    /// Deliver a raw text frame from the server.
    pub fn server_message(&self, text: impl Into<String>) {
        if let Some(delegate) = self.delegate() {
            delegate.on_message(text.into());
        }
    }

    /// Deliver a `phx_reply` from the server.
    pub fn server_reply(&self, msg_ref: &str, topic: &str, status: &str, response: Value) {
        let frame = json!([null, msg_ref, topic, "phx_reply", { "status": status, "response": response }]);
        self.server_message(frame.to_string());
    }

    /// Report a transport error (no close implied).
    pub fn server_error(&self, reason: &str) {
        if let Some(delegate) = self.delegate() {
            delegate.on_error(TransportError::Websocket(reason.to_string()));
        }
    }

    /// Close the connection from the server side.
    pub fn server_close(&self, code: u16) {
        *self.state.lock().unwrap() = ReadyState::Closed;
        if let Some(delegate) = self.delegate() {
            delegate.on_close(code);
        }
    }

    /// Every frame written to this transport, decoded as JSON.
    pub fn sent_frames(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|text| serde_json::from_str(text).expect("sent frame is json"))
            .collect()
    }

    /// Event names of every frame written, in write order.
    pub fn sent_events(&self) -> Vec<String> {
        self.sent_frames()
            .iter()
            .map(|frame| frame[3].as_str().unwrap_or_default().to_string())
            .collect()
    }

    /// Frames written for one event name.
    pub fn frames_for_event(&self, event: &str) -> Vec<Value> {
        self.sent_frames()
            .into_iter()
            .filter(|frame| frame[3] == event)
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Disconnect requests issued by the socket, as `(code, reason)`.
    pub fn closes(&self) -> Vec<(u16, Option<String>)> {
        self.closes.lock().unwrap().clone()
    }
}

impl Transport for FakeTransport {
    fn ready_state(&self) -> ReadyState {
        *self.state.lock().unwrap()
    }

    fn connect(&self, delegate: Arc<dyn TransportDelegate>) {
        *self.delegate.lock().unwrap() = Some(delegate);
        if self.auto_open {
            self.open();
        } else {
            *self.state.lock().unwrap() = ReadyState::Connecting;
        }
    }

    fn disconnect(&self, code: u16, reason: Option<&str>) {
        self.closes
            .lock()
            .unwrap()
            .push((code, reason.map(str::to_string)));
        *self.state.lock().unwrap() = ReadyState::Closed;
        // A real peer acknowledges the close; report it back like one would.
        if let Some(delegate) = self.delegate() {
            delegate.on_close(code);
        }
    }

    fn send(&self, data: String) {
        self.sent.lock().unwrap().push(data);
    }
}

/// Factory producing one [`FakeTransport`] per connection attempt and
/// remembering each, so tests can inspect every generation.
pub struct FakeTransportFactory {
    auto_open: bool,
    created: Arc<Mutex<Vec<Arc<FakeTransport>>>>,
}

impl FakeTransportFactory {
    pub fn new(auto_open: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_open,
            created: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn factory(&self) -> TransportFactory {
        let auto_open = self.auto_open;
        let created = self.created.clone();
        Arc::new(move |url: &url::Url| -> Arc<dyn Transport> {
            let transport = FakeTransport::new(auto_open);
            *transport.url.lock().unwrap() = Some(url.to_string());
            created.lock().unwrap().push(transport.clone());
            transport
        })
    }

    /// How many transports have been requested.
    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// The transport for the newest connection attempt.
    pub fn latest(&self) -> Arc<FakeTransport> {
        self.created
            .lock()
            .unwrap()
            .last()
            .expect("no transport created yet")
            .clone()
    }

    /// The transport for the n-th connection attempt (0-based).
    pub fn nth(&self, index: usize) -> Arc<FakeTransport> {
        self.created.lock().unwrap()[index].clone()
    }
}
