//! UDP outbound
//!
//! Shares the resolve/connect/retry wiring with TCP but replaces byte
//! streaming with datagram coalescing: each downward
//! `MessageStart … MessageEnd` group becomes exactly one outgoing
//! datagram, and each received datagram is delivered upstream as
//! exactly one such group. An idle timer closes the flow after
//! `idle_timeout` without traffic in either direction.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{Outbound, OutboundCore, OutboundInfo, State};
use crate::error::{OutboundError, Result};
use crate::event::{Data, Event, StreamError};
use crate::input::{Input, InputContext};
use crate::metrics::outbound_metrics;
use crate::options::{Options, Protocol};
use crate::resolver::{effective_host, Resolver, SystemResolver};

/// One outgoing UDP flow.
pub struct UdpOutbound {
    core: Arc<OutboundCore>,
    resolver: Arc<dyn Resolver>,
    cmd_tx: mpsc::UnboundedSender<Event>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    bound: Mutex<BoundLocal>,
}

#[derive(Default)]
struct BoundLocal {
    socket: Option<std::net::UdpSocket>,
    requested: Option<SocketAddr>,
}

impl UdpOutbound {
    /// Create a UDP outbound using the system resolver.
    #[must_use]
    pub fn new(input: Arc<dyn Input>, options: Options) -> Self {
        Self::with_resolver(input, options, Arc::new(SystemResolver))
    }

    /// Create a UDP outbound with a custom resolver.
    #[must_use]
    pub fn with_resolver(
        input: Arc<dyn Input>,
        options: Options,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            core: OutboundCore::new(Protocol::Udp, input, options),
            resolver,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            bound: Mutex::new(BoundLocal::default()),
        }
    }
}

impl Outbound for UdpOutbound {
    fn bind(&self, ip: &str, port: u16) -> Result<()> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|e: std::net::AddrParseError| OutboundError::InvalidBindAddress {
                addr: ip.to_string(),
                reason: e.to_string(),
            })?;
        let addr = SocketAddr::new(ip, port);

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(SockProtocol::UDP))?;
        socket
            .bind(&addr.into())
            .map_err(|e| OutboundError::bind(addr, e))?;
        socket.set_nonblocking(true)?;

        if let Some(local) = socket.local_addr().ok().and_then(|a| a.as_socket()) {
            self.core.set_local_endpoint(local);
        }

        let mut bound = self.bound.lock();
        bound.socket = Some(socket.into());
        bound.requested = Some(addr);
        Ok(())
    }

    fn connect(&self, host: &str, port: u16) {
        if !self.core.begin_connect(host, port) {
            warn!("{} connect() called more than once, ignored", self.core.flow());
            return;
        }
        let rx = self
            .cmd_rx
            .lock()
            .take()
            .expect("command receiver taken before first connect");
        let (socket, requested) = {
            let mut bound = self.bound.lock();
            (bound.socket.take(), bound.requested)
        };
        tokio::spawn(drive(
            self.core.clone(),
            self.resolver.clone(),
            rx,
            socket,
            requested,
        ));
    }

    fn send(&self, evt: Event) {
        if self.core.state() == State::Closed {
            return;
        }
        let _ = self.cmd_tx.send(evt);
    }

    fn close(&self) {
        self.core.request_close();
    }

    fn state(&self) -> State {
        self.core.state()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn local_address(&self) -> String {
        self.core.local_address()
    }

    fn local_port(&self) -> u16 {
        self.core.local_port()
    }

    fn remote_address(&self) -> String {
        self.core.remote_address()
    }

    fn remote_port(&self) -> u16 {
        self.core.port()
    }

    fn address(&self) -> String {
        self.core.address()
    }

    /// No backpressure surface on datagram flows.
    fn buffered(&self) -> u64 {
        0
    }

    fn info(&self) -> OutboundInfo {
        self.core.info()
    }
}

fn make_udp_socket(
    target: SocketAddr,
    requested_bind: Option<SocketAddr>,
) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(SockProtocol::UDP))?;
    if let Some(addr) = requested_bind {
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
    }
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Driver task: attempt sequence, then the datagram pump.
async fn drive(
    core: Arc<OutboundCore>,
    resolver: Arc<dyn Resolver>,
    rx: mpsc::UnboundedReceiver<Event>,
    mut first_socket: Option<std::net::UdpSocket>,
    requested_bind: Option<SocketAddr>,
) {
    let options = core.options().clone();

    let socket = loop {
        if core.close_requested() {
            return;
        }
        let retries = core.retries();
        if retries > 0 {
            warn!("{} retry connecting... (retries = {})", core.flow(), retries);
        }
        core.mark_attempt_start();

        let attempt = attempt_once(&core, resolver.as_ref(), first_socket.take(), requested_bind);
        let result = tokio::select! {
            _ = core.wait_close() => return,
            r = async {
                match options.connect_timeout() {
                    Some(limit) => tokio::time::timeout(limit, attempt)
                        .await
                        .unwrap_or(Err(StreamError::ConnectionTimeout)),
                    None => attempt.await,
                }
            } => r,
        };

        match result {
            Ok(socket) => break socket,
            Err(err) => {
                if options.retry_count >= 0 && core.retries() >= options.retry_count as u32 {
                    core.error(err);
                    return;
                }
                core.incr_retries();
                core.set_state(State::Idle);
                if let Some(delay) = options.retry_delay() {
                    tokio::select! {
                        _ = core.wait_close() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    };

    if let Ok(local) = socket.local_addr() {
        core.set_local_endpoint(local);
    }
    let conn_ms = core.observe_connected();
    debug!("{} connected in {:.3} ms", core.flow(), conn_ms);
    core.reset_retries();
    core.set_state(State::Connected);

    run_connected(&core, socket, rx, &options).await;
}

/// One resolve + connect attempt.
async fn attempt_once(
    core: &OutboundCore,
    resolver: &dyn Resolver,
    prepared: Option<std::net::UdpSocket>,
    requested_bind: Option<SocketAddr>,
) -> std::result::Result<UdpSocket, StreamError> {
    core.set_state(State::Resolving);
    let host = core.host();
    let port = core.port();
    debug!("{} resolving hostname...", core.flow());

    let addrs = resolver
        .resolve(effective_host(&host), port)
        .await
        .map_err(|e| {
            error!("{} cannot resolve hostname: {}", core.flow(), e);
            StreamError::CannotResolve
        })?;
    let Some(target) = addrs.into_iter().next() else {
        error!("{} cannot resolve hostname: empty result set", core.flow());
        return Err(StreamError::CannotResolve);
    };
    core.set_remote_addr(target);

    let std_socket = match prepared {
        Some(socket) => socket,
        None => make_udp_socket(target, requested_bind).map_err(|e| {
            error!("{} cannot open socket: {}", core.flow(), e);
            StreamError::ConnectionRefused
        })?,
    };
    let socket = UdpSocket::from_std(std_socket).map_err(|e| {
        error!("{} cannot register socket: {}", core.flow(), e);
        StreamError::ConnectionRefused
    })?;

    core.set_state(State::Connecting);
    debug!("{} connecting...", core.flow());
    socket.connect(target).await.map_err(|e| {
        error!("{} cannot connect: {}", core.flow(), e);
        StreamError::ConnectionRefused
    })?;
    Ok(socket)
}

enum UdpAction {
    Close,
    Idle,
    Downward(Option<Event>),
    Received(std::io::Result<usize>),
}

/// Datagram pump over a connected socket.
///
/// Downward events drive the coalescing state machine; each completed
/// message group is queued and flushed FIFO. Received datagrams are
/// delivered upstream as one `MessageStart`/`Data`/`MessageEnd` batch.
async fn run_connected(
    core: &Arc<OutboundCore>,
    socket: UdpSocket,
    mut rx: mpsc::UnboundedReceiver<Event>,
    options: &Options,
) {
    let idle_timeout = options.idle_timeout();
    let mut staging = Data::new();
    let mut message_started = false;
    let mut ended = false;
    let mut pending: VecDeque<Data> = VecDeque::new();
    let mut buf = vec![0_u8; options.max_packet_size as usize];
    let mut last_activity = Instant::now();

    loop {
        let deadline = idle_timeout.map(|d| last_activity + d);
        let timer_at = deadline.unwrap_or_else(Instant::now);

        let action = tokio::select! {
            _ = core.wait_close() => UdpAction::Close,
            () = tokio::time::sleep_until(tokio::time::Instant::from_std(timer_at)),
                if deadline.is_some() => UdpAction::Idle,
            cmd = rx.recv(), if !ended => UdpAction::Downward(cmd),
            r = socket.recv(&mut buf) => UdpAction::Received(r),
        };

        match action {
            UdpAction::Close => return,
            UdpAction::Idle => {
                close_with(core, StreamError::IdleTimeout);
                return;
            }
            UdpAction::Downward(Some(Event::MessageStart)) => {
                staging.clear();
                message_started = true;
            }
            UdpAction::Downward(Some(Event::Data(data))) => {
                if message_started {
                    staging.extend(data);
                }
            }
            UdpAction::Downward(Some(Event::MessageEnd)) => {
                if message_started {
                    pending.push_back(staging.take());
                    message_started = false;
                    if pump(core, &socket, &mut pending, &mut last_activity)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            UdpAction::Downward(Some(Event::StreamEnd(_)) | None) => {
                ended = true;
                message_started = false;
                if pump(core, &socket, &mut pending, &mut last_activity)
                    .await
                    .is_err()
                {
                    return;
                }
                // The caller ended the stream: flushed, now tear down
                // without an upward event.
                core.reset_retries();
                core.set_state(State::Closed);
                return;
            }
            UdpAction::Received(Ok(0)) => {
                // Empty datagram; nothing to deliver, re-arm.
                last_activity = Instant::now();
            }
            UdpAction::Received(Ok(n)) => {
                // A close may have raced the receive; closed flows
                // deliver nothing upstream.
                if core.close_requested() {
                    return;
                }
                if let Some(attached) = core.attached_metrics() {
                    attached.traffic_in.increase(n as u64);
                }
                outbound_metrics().in_total().increase(n as u64);
                last_activity = Instant::now();

                let mut ctx = InputContext::new(core.upward());
                ctx.input(Event::MessageStart);
                ctx.input(Event::data(&buf[..n]));
                ctx.input(Event::MessageEnd);
            }
            UdpAction::Received(Err(ref e))
                if e.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                warn!("{} connection reset by peer", core.flow());
                close_with(core, StreamError::ConnectionReset);
                return;
            }
            UdpAction::Received(Err(e)) => {
                warn!("{} error reading from peer: {}", core.flow(), e);
                close_with(core, StreamError::ReadError);
                return;
            }
        }
    }
}

/// Flush the pending queue, one datagram per entry, FIFO.
async fn pump(
    core: &Arc<OutboundCore>,
    socket: &UdpSocket,
    pending: &mut VecDeque<Data>,
    last_activity: &mut Instant,
) -> std::result::Result<(), ()> {
    while let Some(datagram) = pending.pop_front() {
        let payload = datagram.to_bytes();
        match socket.send(&payload).await {
            Ok(n) => {
                if let Some(attached) = core.attached_metrics() {
                    attached.traffic_out.increase(n as u64);
                }
                outbound_metrics().out_total().increase(n as u64);
                *last_activity = Instant::now();
            }
            Err(e) => {
                warn!("{} error writing to peer: {}", core.flow(), e);
                close_with(core, StreamError::WriteError);
                return Err(());
            }
        }
    }
    Ok(())
}

/// Teardown from the connected state.
///
/// Resets the retry counter while transitioning to closed, so nothing a
/// caller does afterwards can re-arm the flow.
fn close_with(core: &Arc<OutboundCore>, err: StreamError) {
    core.reset_retries();
    core.error(err);
    debug!("{} connection closed to peer", core.flow());
}
