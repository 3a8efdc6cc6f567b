//! Outbound flows
//!
//! An outbound is one outgoing network flow, TCP or UDP, with its own
//! state machine, metric labels, and upward event sink. This module
//! holds the pieces both protocols share: the [`State`] tag, the
//! [`OutboundCore`] carrying per-flow state, the [`Outbound`] trait, and
//! the [`OutboundInfo`] introspection snapshot.
//!
//! The state tag is the single source of truth; transitions go through
//! one funnel that fires the configured `on_state_changed` observer.
//! The only exception is user-requested [`Outbound::close`], which
//! writes the field directly.

mod tcp;
mod udp;

pub use tcp::TcpOutbound;
pub use udp::UdpOutbound;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::Result;
use crate::event::{Event, StreamError};
use crate::input::{Input, InputContext};
use crate::metrics::{outbound_metrics, Counter, Histogram};
use crate::options::{Options, Protocol};
use crate::registry;

/// Lifecycle state of an outbound.
///
/// `Closed` is terminal; no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum State {
    /// Constructed, or waiting out a retry delay
    Idle = 0,
    /// Hostname resolution in flight
    Resolving = 1,
    /// Transport connect in flight
    Connecting = 2,
    /// Transport established, pumping bytes
    Connected = 3,
    /// Terminal
    Closed = 4,
}

impl State {
    /// Stable string form, matching the serialized representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Resolving,
            2 => Self::Connecting,
            3 => Self::Connected,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Introspection snapshot of one outbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundInfo {
    /// Current lifecycle state
    pub state: State,
    /// Transport protocol
    pub protocol: Protocol,
    /// Local address after bind or connect, empty before
    pub local_address: String,
    /// Local port after bind or connect, 0 before
    pub local_port: u16,
    /// Resolved peer address, empty until resolve succeeds
    pub remote_address: String,
    /// Target port
    pub remote_port: u16,
    /// Accumulated connect time across successful attempts
    pub connection_time_ms: f64,
}

/// Label-keyed metric handles attached to one outbound at connect time.
pub(crate) struct AttachedMetrics {
    pub(crate) traffic_in: Arc<Counter>,
    pub(crate) traffic_out: Arc<Counter>,
    pub(crate) conn_time: Arc<Histogram>,
}

/// Per-flow state shared between an outbound handle and its driver task.
///
/// Construction registers the flow in the process-wide registry; the
/// last reference dropping removes it.
pub struct OutboundCore {
    options: Options,
    input: Arc<dyn Input>,
    protocol: Protocol,

    target: Mutex<(String, u16)>,
    remote_addr: Mutex<String>,
    local_addr: Mutex<String>,
    local_port: AtomicU16,

    state: AtomicU8,
    retries: AtomicU32,
    last_error: Mutex<StreamError>,
    connect_called: AtomicBool,

    start_time: Mutex<Option<Instant>>,
    connection_time_us: AtomicU64,

    traffic_read: AtomicU64,
    traffic_written: AtomicU64,
    buffered: AtomicU64,

    metrics: OnceLock<AttachedMetrics>,
    registry_id: AtomicU64,

    closed: AtomicBool,
    close_notify: Notify,
}

impl OutboundCore {
    pub(crate) fn new(protocol: Protocol, input: Arc<dyn Input>, options: Options) -> Arc<Self> {
        let core = Arc::new(Self {
            options,
            input,
            protocol,
            target: Mutex::new((String::new(), 0)),
            remote_addr: Mutex::new(String::new()),
            local_addr: Mutex::new(String::new()),
            local_port: AtomicU16::new(0),
            state: AtomicU8::new(State::Idle as u8),
            retries: AtomicU32::new(0),
            last_error: Mutex::new(StreamError::NoError),
            connect_called: AtomicBool::new(false),
            start_time: Mutex::new(None),
            connection_time_us: AtomicU64::new(0),
            traffic_read: AtomicU64::new(0),
            traffic_written: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            metrics: OnceLock::new(),
            registry_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        let id = registry::register(&core);
        core.registry_id.store(id, Ordering::Relaxed);
        debug!(protocol = %protocol, "outbound created");
        core
    }

    pub(crate) fn options(&self) -> &Options {
        &self.options
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The single funnel for state transitions: writes the tag, then
    /// fires the observer. Callers write any fields belonging to the new
    /// state before coming here.
    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
        if let Some(callback) = &self.options.on_state_changed {
            callback(state);
        }
    }

    /// Record the failure reason, deliver the terminal `StreamEnd`, and
    /// transition to `Closed`. A no-op once closed: nothing is delivered
    /// upstream after the terminal state.
    pub(crate) fn error(&self, err: StreamError) {
        if self.state() == State::Closed {
            return;
        }
        *self.last_error.lock() = err;
        {
            let mut ctx = InputContext::new(self.input.as_ref());
            ctx.input(Event::StreamEnd(err));
        }
        self.set_state(State::Closed);
    }

    /// User-requested teardown: silent, and bypasses the transition
    /// observer. Idempotent.
    pub(crate) fn request_close(&self) {
        if self.state() == State::Closed {
            return;
        }
        self.closed.store(true, Ordering::Release);
        self.state.store(State::Closed as u8, Ordering::Release);
        self.retries.store(0, Ordering::Relaxed);
        self.close_notify.notify_waiters();
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve when [`request_close`](Self::request_close) has been
    /// called, whether before or after this call.
    pub(crate) async fn wait_close(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.close_requested() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn upward(&self) -> &dyn Input {
        self.input.as_ref()
    }

    /// Record the target and attach label-keyed metrics. Returns false
    /// if a connect was already issued.
    pub(crate) fn begin_connect(&self, host: &str, port: u16) -> bool {
        if self.connect_called.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.target.lock() = (host.to_string(), port);

        let metrics = outbound_metrics();
        let peer = self.address();
        let protocol = self.protocol.name();
        let _ = self.metrics.set(AttachedMetrics {
            traffic_in: metrics.traffic_in(protocol, &peer),
            traffic_out: metrics.traffic_out(protocol, &peer),
            conn_time: metrics.conn_time(protocol, &peer),
        });
        true
    }

    pub(crate) fn attached_metrics(&self) -> Option<&AttachedMetrics> {
        self.metrics.get()
    }

    /// Transport protocol of this flow.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Target host as handed to connect.
    #[must_use]
    pub fn host(&self) -> String {
        self.target.lock().0.clone()
    }

    /// Target port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.target.lock().1
    }

    /// Peer label: `"[host]:port"`.
    #[must_use]
    pub fn address(&self) -> String {
        let target = self.target.lock();
        format!("[{}]:{}", target.0, target.1)
    }

    /// Resolved peer address, empty until a resolve has succeeded.
    #[must_use]
    pub fn remote_address(&self) -> String {
        self.remote_addr.lock().clone()
    }

    /// Local address after bind or connect, empty before.
    #[must_use]
    pub fn local_address(&self) -> String {
        self.local_addr.lock().clone()
    }

    /// Local port after bind or connect, 0 before.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Relaxed)
    }

    /// Reason recorded by the last terminal transition.
    #[must_use]
    pub fn last_error(&self) -> StreamError {
        *self.last_error.lock()
    }

    /// Downward bytes staged but not yet written.
    #[must_use]
    pub fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Introspection snapshot.
    #[must_use]
    pub fn info(&self) -> OutboundInfo {
        OutboundInfo {
            state: self.state(),
            protocol: self.protocol,
            local_address: self.local_address(),
            local_port: self.local_port(),
            remote_address: self.remote_address(),
            remote_port: self.port(),
            connection_time_ms: self.connection_time_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    /// Flow identity for log lines.
    pub(crate) fn flow(&self) -> String {
        let local = self.local_address();
        let target = self.target.lock();
        format!(
            "[{}]:{} -> [{}]:{} ({})",
            if local.is_empty() { "0.0.0.0" } else { &local },
            self.local_port(),
            self.remote_addr.lock(),
            target.1,
            target.0,
        )
    }

    pub(crate) fn set_remote_addr(&self, addr: SocketAddr) {
        *self.remote_addr.lock() = addr.ip().to_string();
    }

    pub(crate) fn set_local_endpoint(&self, addr: SocketAddr) {
        *self.local_addr.lock() = addr.ip().to_string();
        self.local_port.store(addr.port(), Ordering::Relaxed);
    }

    pub(crate) fn mark_attempt_start(&self) {
        *self.start_time.lock() = Some(Instant::now());
    }

    /// Record a successful connect: fold the attempt duration into the
    /// accumulated connection time and both histogram levels.
    pub(crate) fn observe_connected(&self) -> f64 {
        let elapsed = self
            .start_time
            .lock()
            .map_or(0.0, |t| t.elapsed().as_secs_f64() * 1000.0);
        self.connection_time_us
            .fetch_add((elapsed * 1000.0) as u64, Ordering::Relaxed);
        if let Some(attached) = self.attached_metrics() {
            attached.conn_time.observe_ms(elapsed);
        }
        outbound_metrics().conn_time_total().observe_ms(elapsed);
        elapsed
    }

    pub(crate) fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    pub(crate) fn incr_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_retries(&self) {
        self.retries.store(0, Ordering::Relaxed);
    }

    pub(crate) fn add_traffic_read(&self, n: u64) {
        self.traffic_read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_traffic_written(&self, n: u64) {
        self.traffic_written.fetch_add(n, Ordering::Relaxed);
    }

    /// Drain the inbound byte delta accumulated since the last scrape.
    pub(crate) fn take_traffic_in(&self) -> u64 {
        self.traffic_read.swap(0, Ordering::Relaxed)
    }

    /// Drain the outbound byte delta accumulated since the last scrape.
    pub(crate) fn take_traffic_out(&self) -> u64 {
        self.traffic_written.swap(0, Ordering::Relaxed)
    }

    pub(crate) fn add_buffered(&self, n: u64) {
        self.buffered.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn sub_buffered(&self, n: u64) {
        let _ = self
            .buffered
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(n))
            });
    }
}

impl Drop for OutboundCore {
    fn drop(&mut self) {
        registry::unregister(self.registry_id.load(Ordering::Relaxed));
        debug!(protocol = %self.protocol, "outbound destroyed");
    }
}

/// Common contract of TCP and UDP outbounds.
pub trait Outbound: Send + Sync {
    /// Bind the requested local endpoint before connecting.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::OutboundError`] when the address does not
    /// parse or the bind fails.
    fn bind(&self, ip: &str, port: u16) -> Result<()>;

    /// Record the target and start the connect attempt sequence.
    ///
    /// Must be called at most once, from within a tokio runtime. A
    /// repeated call is ignored with a warning.
    fn connect(&self, host: &str, port: u16);

    /// Ingest one downward event.
    fn send(&self, evt: Event);

    /// Tear the flow down. Silent: no `StreamEnd` is delivered upstream.
    /// Idempotent on a closed outbound.
    fn close(&self);

    /// Current lifecycle state.
    fn state(&self) -> State;

    /// Transport protocol.
    fn protocol(&self) -> Protocol;

    /// Metric label value for the protocol.
    fn protocol_name(&self) -> &'static str {
        self.protocol().name()
    }

    /// Local address after bind or connect, empty before.
    fn local_address(&self) -> String;

    /// Local port after bind or connect, 0 before.
    fn local_port(&self) -> u16;

    /// Resolved peer address, empty until resolve succeeds.
    fn remote_address(&self) -> String;

    /// Target port.
    fn remote_port(&self) -> u16;

    /// Peer label: `"[host]:port"`.
    fn address(&self) -> String;

    /// Downward bytes staged but not yet written (0 for UDP).
    fn buffered(&self) -> u64;

    /// Introspection snapshot.
    fn info(&self) -> OutboundInfo;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::CollectInput;

    fn test_core() -> (Arc<OutboundCore>, Arc<CollectInput>) {
        let sink = Arc::new(CollectInput::new());
        let core = OutboundCore::new(Protocol::Tcp, sink.clone(), Options::default());
        (core, sink)
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::Idle.to_string(), "idle");
        assert_eq!(State::Resolving.to_string(), "resolving");
        assert_eq!(State::Connecting.to_string(), "connecting");
        assert_eq!(State::Connected.to_string(), "connected");
        assert_eq!(State::Closed.to_string(), "closed");
    }

    #[test]
    fn test_initial_state() {
        let (core, _) = test_core();
        assert_eq!(core.state(), State::Idle);
        assert_eq!(core.last_error(), StreamError::NoError);
        assert!(core.remote_address().is_empty());
        assert_eq!(core.local_port(), 0);
    }

    #[test]
    fn test_state_funnel_fires_observer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let options = Options {
            on_state_changed: Some(Arc::new(move |s| seen_cb.lock().push(s))),
            ..Options::default()
        };
        let core = OutboundCore::new(Protocol::Tcp, Arc::new(CollectInput::new()), options);
        core.set_state(State::Resolving);
        core.set_state(State::Connecting);
        assert_eq!(*seen.lock(), vec![State::Resolving, State::Connecting]);
    }

    #[test]
    fn test_error_emits_once_and_closes() {
        let (core, sink) = test_core();
        core.error(StreamError::CannotResolve);
        assert_eq!(core.state(), State::Closed);
        assert_eq!(core.last_error(), StreamError::CannotResolve);

        // Terminal: a second error is swallowed.
        core.error(StreamError::ReadError);
        let events = sink.take();
        assert_eq!(events, vec![Event::StreamEnd(StreamError::CannotResolve)]);
        assert_eq!(core.last_error(), StreamError::CannotResolve);
    }

    #[test]
    fn test_close_is_silent_and_bypasses_observer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let sink = Arc::new(CollectInput::new());
        let options = Options {
            on_state_changed: Some(Arc::new(move |s| seen_cb.lock().push(s))),
            ..Options::default()
        };
        let core = OutboundCore::new(Protocol::Udp, sink.clone(), options);
        core.incr_retries();
        core.request_close();

        assert_eq!(core.state(), State::Closed);
        assert!(sink.is_empty());
        assert!(seen.lock().is_empty());
        // Explicit close resets the retry counter.
        assert_eq!(core.retries(), 0);

        // Idempotent.
        core.request_close();
        assert_eq!(core.state(), State::Closed);
    }

    #[test]
    fn test_error_after_close_is_swallowed() {
        let (core, sink) = test_core();
        core.request_close();
        core.error(StreamError::WriteError);
        assert!(sink.is_empty());
        assert_eq!(core.last_error(), StreamError::NoError);
    }

    #[test]
    fn test_begin_connect_once() {
        let (core, _) = test_core();
        assert!(core.begin_connect("example.test", 8080));
        assert!(!core.begin_connect("other.test", 1));
        assert_eq!(core.address(), "[example.test]:8080");
        assert!(core.attached_metrics().is_some());
    }

    #[test]
    fn test_traffic_deltas_drain() {
        let (core, _) = test_core();
        core.add_traffic_read(100);
        core.add_traffic_read(20);
        assert_eq!(core.take_traffic_in(), 120);
        assert_eq!(core.take_traffic_in(), 0);
    }

    #[test]
    fn test_info_snapshot() {
        let (core, _) = test_core();
        core.begin_connect("example.test", 443);
        core.set_remote_addr("93.184.216.34:443".parse().unwrap());
        let info = core.info();
        assert_eq!(info.state, State::Idle);
        assert_eq!(info.remote_address, "93.184.216.34");
        assert_eq!(info.remote_port, 443);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["remoteAddress"], "93.184.216.34");
        assert!(json["localPort"].is_number());
    }

    #[tokio::test]
    async fn test_wait_close_resolves_after_request() {
        let (core, _) = test_core();
        let waiter = {
            let core = core.clone();
            tokio::spawn(async move { core.wait_close().await })
        };
        tokio::task::yield_now().await;
        core.request_close();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_close_resolves_if_already_closed() {
        let (core, _) = test_core();
        core.request_close();
        core.wait_close().await;
    }
}
