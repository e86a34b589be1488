//! Socket configuration.
//!
//! All options are optional and default to the values a stock Phoenix server
//! expects: 30s heartbeats, 10s push timeout, serializer v2, stepped
//! reconnect/rejoin back-off.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tether::config::SocketOptions;
//!
//! let opts = SocketOptions::new()
//!     .heartbeat_interval(Duration::from_secs(15))
//!     .params([("token", "abc123")])
//!     .logger(|line| println!("{line}"));
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::serializer::{self, DecodeFn, EncodeFn};
use crate::timer::Scheduler;

/// Back-off function mapping consecutive tries (1-based) to a delay.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// User-supplied diagnostic sink, invoked with one formatted line per event.
pub type LoggerFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Default socket reconnect back-off: stepped, saturating at 5s.
pub fn default_reconnect_after(tries: u32) -> Duration {
    const STEPS_MS: [u64; 9] = [10, 50, 100, 150, 200, 250, 500, 1000, 2000];
    STEPS_MS
        .get(tries.saturating_sub(1) as usize)
        .map(|ms| Duration::from_millis(*ms))
        .unwrap_or_else(|| Duration::from_secs(5))
}

/// Default channel rejoin back-off: stepped, saturating at 10s.
pub fn default_rejoin_after(tries: u32) -> Duration {
    const STEPS_S: [u64; 3] = [1, 2, 5];
    STEPS_S
        .get(tries.saturating_sub(1) as usize)
        .map(|s| Duration::from_secs(*s))
        .unwrap_or_else(|| Duration::from_secs(10))
}

/// Connection query parameters, resolved on every `connect()`.
#[derive(Clone, Default)]
pub enum Params {
    /// No extra query parameters.
    #[default]
    None,
    /// A fixed parameter map.
    Static(Map<String, Value>),
    /// A thunk re-evaluated on each connect. Must be thread-safe; the socket
    /// may call it from timer context during reconnects.
    Dynamic(Arc<dyn Fn() -> Map<String, Value> + Send + Sync>),
}

impl Params {
    pub(crate) fn resolve(&self) -> Map<String, Value> {
        match self {
            Params::None => Map::new(),
            Params::Static(map) => map.clone(),
            Params::Dynamic(thunk) => thunk(),
        }
    }
}

/// Configuration for a [`Socket`](crate::socket::Socket).
#[derive(Clone)]
pub struct SocketOptions {
    pub(crate) heartbeat_interval: Duration,
    pub(crate) timeout: Duration,
    pub(crate) reconnect_after: BackoffFn,
    pub(crate) rejoin_after: BackoffFn,
    pub(crate) skip_heartbeat: bool,
    pub(crate) logger: Option<LoggerFn>,
    pub(crate) vsn: String,
    pub(crate) params: Params,
    pub(crate) encode: EncodeFn,
    pub(crate) decode: DecodeFn,
    pub(crate) scheduler: Option<Arc<dyn Scheduler>>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            reconnect_after: Arc::new(default_reconnect_after),
            rejoin_after: Arc::new(default_rejoin_after),
            skip_heartbeat: false,
            logger: None,
            vsn: "2.0.0".to_string(),
            params: Params::None,
            encode: serializer::default_encode(),
            decode: serializer::default_decode(),
            scheduler: None,
        }
    }
}

impl SocketOptions {
    /// Create the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds between heartbeats (default 30s).
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Default push/join timeout (default 10s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Socket reconnect back-off function.
    pub fn reconnect_after(mut self, f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.reconnect_after = Arc::new(f);
        self
    }

    /// Channel rejoin back-off function.
    pub fn rejoin_after(mut self, f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.rejoin_after = Arc::new(f);
        self
    }

    /// Disable heartbeats entirely.
    pub fn no_heartbeat(mut self) -> Self {
        self.skip_heartbeat = true;
        self
    }

    /// Diagnostic sink receiving one line per socket/channel event.
    pub fn logger(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.logger = Some(Arc::new(f));
        self
    }

    /// Serializer version sent as the `vsn` query value (default "2.0.0").
    pub fn vsn(mut self, vsn: impl Into<String>) -> Self {
        self.vsn = vsn.into();
        self
    }

    /// Static connection params, merged into the endpoint query string.
    pub fn params<K, V, I>(mut self, params: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let map = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.params = Params::Static(map);
        self
    }

    /// Dynamic connection params, re-evaluated on every connect.
    pub fn params_fn(
        mut self,
        f: impl Fn() -> Map<String, Value> + Send + Sync + 'static,
    ) -> Self {
        self.params = Params::Dynamic(Arc::new(f));
        self
    }

    /// Custom outbound frame encoder (default: serializer v2).
    pub fn encode(mut self, f: EncodeFn) -> Self {
        self.encode = f;
        self
    }

    /// Custom inbound frame decoder (default: serializer v2).
    pub fn decode(mut self, f: DecodeFn) -> Self {
        self.decode = f;
        self
    }

    /// Delayed-task queue the timers run on (default: tokio).
    ///
    /// Tests substitute a virtual-clock scheduler here.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}
