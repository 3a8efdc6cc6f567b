//! TCP outbound
//!
//! Resolve, connect, then pump bytes full-duplex until one side ends
//! the stream. Resolve and connect failures are retry-eligible under
//! the configured retry policy; a single timer spans resolve + connect.
//! Once connected the pump honors `congestion_limit` for downward
//! backpressure and the read/write/idle timeouts.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, Protocol as SockProtocol, Socket, TcpKeepalive, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{Outbound, OutboundCore, OutboundInfo, State};
use crate::error::{OutboundError, Result};
use crate::event::{Data, Event, StreamError};
use crate::input::{Input, InputContext};
use crate::options::{Options, Protocol};
use crate::resolver::{effective_host, Resolver, SystemResolver};

/// One outgoing TCP flow.
///
/// Constructed by a pipeline stage with the upward sink and options;
/// `connect` starts the attempt sequence on a spawned driver task.
pub struct TcpOutbound {
    core: Arc<OutboundCore>,
    resolver: Arc<dyn Resolver>,
    cmd_tx: mpsc::UnboundedSender<Event>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    bound: Mutex<BoundLocal>,
}

#[derive(Default)]
struct BoundLocal {
    /// Socket prepared by `bind()`, consumed by the first attempt
    socket: Option<TcpSocket>,
    /// Requested local endpoint, re-applied on retried attempts
    requested: Option<SocketAddr>,
}

impl TcpOutbound {
    /// Create a TCP outbound using the system resolver.
    #[must_use]
    pub fn new(input: Arc<dyn Input>, options: Options) -> Self {
        Self::with_resolver(input, options, Arc::new(SystemResolver))
    }

    /// Create a TCP outbound with a custom resolver.
    #[must_use]
    pub fn with_resolver(
        input: Arc<dyn Input>,
        options: Options,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            core: OutboundCore::new(Protocol::Tcp, input, options),
            resolver,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            bound: Mutex::new(BoundLocal::default()),
        }
    }
}

impl Outbound for TcpOutbound {
    fn bind(&self, ip: &str, port: u16) -> Result<()> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|e: std::net::AddrParseError| OutboundError::InvalidBindAddress {
                addr: ip.to_string(),
                reason: e.to_string(),
            })?;
        let addr = SocketAddr::new(ip, port);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))?;
        if self.core.options().keep_alive {
            set_keepalive(&socket)?;
        }
        socket
            .bind(&addr.into())
            .map_err(|e| OutboundError::bind(addr, e))?;
        socket.set_nonblocking(true)?;

        if let Some(local) = socket.local_addr().ok().and_then(|a| a.as_socket()) {
            self.core.set_local_endpoint(local);
        }

        let mut bound = self.bound.lock();
        bound.socket = Some(TcpSocket::from_std_stream(socket.into()));
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
        if let Event::Data(data) = &evt {
            self.core.add_buffered(data.len() as u64);
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
        Protocol::Tcp
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

    fn buffered(&self) -> u64 {
        self.core.buffered()
    }

    fn info(&self) -> OutboundInfo {
        self.core.info()
    }
}

fn set_keepalive(socket: &Socket) -> Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(15));
    socket
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| OutboundError::socket_option("TCP_KEEPALIVE", e.to_string()))
}

fn make_socket(
    target: SocketAddr,
    requested_bind: Option<SocketAddr>,
    keep_alive: bool,
) -> std::io::Result<TcpSocket> {
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(SockProtocol::TCP))?;
    if keep_alive {
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(15));
        socket.set_tcp_keepalive(&keepalive)?;
    }
    if let Some(addr) = requested_bind {
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
    }
    socket.set_nonblocking(true)?;
    Ok(TcpSocket::from_std_stream(socket.into()))
}

/// Driver task: attempt sequence, then the full-duplex pump.
async fn drive(
    core: Arc<OutboundCore>,
    resolver: Arc<dyn Resolver>,
    rx: mpsc::UnboundedReceiver<Event>,
    mut first_socket: Option<TcpSocket>,
    requested_bind: Option<SocketAddr>,
) {
    let options = core.options().clone();

    let stream = loop {
        if core.close_requested() {
            return;
        }
        let retries = core.retries();
        if retries > 0 {
            warn!("{} retry connecting... (retries = {})", core.flow(), retries);
        }
        core.mark_attempt_start();

        let attempt = attempt_once(
            &core,
            resolver.as_ref(),
            first_socket.take(),
            requested_bind,
            options.keep_alive,
        );
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
            Ok(stream) => break stream,
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

    if let Ok(local) = stream.local_addr() {
        core.set_local_endpoint(local);
    }
    let conn_ms = core.observe_connected();
    debug!("{} connected in {:.3} ms", core.flow(), conn_ms);
    core.reset_retries();
    core.set_state(State::Connected);

    run_connected(&core, stream, rx, &options).await;
}

/// One resolve + connect attempt.
async fn attempt_once(
    core: &OutboundCore,
    resolver: &dyn Resolver,
    prepared: Option<TcpSocket>,
    requested_bind: Option<SocketAddr>,
    keep_alive: bool,
) -> std::result::Result<TcpStream, StreamError> {
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
    // First endpoint only; no multi-address racing.
    let Some(target) = addrs.into_iter().next() else {
        error!("{} cannot resolve hostname: empty result set", core.flow());
        return Err(StreamError::CannotResolve);
    };
    core.set_remote_addr(target);

    let socket = match prepared {
        Some(socket) => socket,
        None => make_socket(target, requested_bind, keep_alive).map_err(|e| {
            error!("{} cannot open socket: {}", core.flow(), e);
            StreamError::ConnectionRefused
        })?,
    };

    core.set_state(State::Connecting);
    debug!("{} connecting...", core.flow());
    socket.connect(target).await.map_err(|e| {
        error!("{} cannot connect: {}", core.flow(), e);
        StreamError::ConnectionRefused
    })
}

enum Action {
    Close,
    Timed(StreamError),
    Downward(Option<Event>),
    Writable(std::io::Result<()>),
    Readable(std::io::Result<()>),
}

fn earliest(candidates: [(Option<Instant>, StreamError); 3]) -> Option<(Instant, StreamError)> {
    let mut best: Option<(Instant, StreamError)> = None;
    for (at, err) in candidates {
        if let Some(at) = at {
            if best.is_none_or(|(b, _)| at < b) {
                best = Some((at, err));
            }
        }
    }
    best
}

/// Full-duplex pump over a connected stream.
///
/// Downward `Data` is staged and written as the socket accepts it;
/// upward reads are delivered one batch per completion. A downward
/// `StreamEnd` flushes the staging buffer, shuts the write half down,
/// and leaves the read side open until peer EOF.
async fn run_connected(
    core: &Arc<OutboundCore>,
    mut stream: TcpStream,
    mut rx: mpsc::UnboundedReceiver<Event>,
    options: &Options,
) {
    let read_timeout = options.read_timeout();
    let write_timeout = options.write_timeout();
    let idle_timeout = options.idle_timeout();
    let congestion = options.congestion_limit;

    let mut staged = Data::new();
    let mut ended = false;
    let mut write_open = true;
    let mut buf = vec![0_u8; 16 * 1024];

    let started = Instant::now();
    let mut last_read = started;
    let mut last_activity = started;
    let mut write_pending_since: Option<Instant> = None;

    loop {
        let deadline = earliest([
            (read_timeout.map(|d| last_read + d), StreamError::ReadTimeout),
            (
                write_timeout.and_then(|d| write_pending_since.map(|since| since + d)),
                StreamError::WriteTimeout,
            ),
            (
                idle_timeout.map(|d| last_activity + d),
                StreamError::IdleTimeout,
            ),
        ]);
        let timer_at = deadline.map_or_else(far_future, |(at, _)| at);
        let can_pull = !ended && (congestion == 0 || (staged.len() as u64) < congestion);

        let action = tokio::select! {
            _ = core.wait_close() => Action::Close,
            () = tokio::time::sleep_until(tokio::time::Instant::from_std(timer_at)),
                if deadline.is_some() => Action::Timed(deadline.expect("deadline present").1),
            cmd = rx.recv(), if can_pull => Action::Downward(cmd),
            r = stream.writable(), if write_open && !staged.is_empty() => Action::Writable(r),
            r = stream.readable() => Action::Readable(r),
        };

        match action {
            Action::Close => {
                // User close: flush what the socket will accept right
                // now, then shut the stream down.
                while let Some(chunk) = staged.first_chunk() {
                    match stream.try_write(chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            staged.consume(n);
                            core.add_traffic_written(n as u64);
                            core.sub_buffered(n as u64);
                        }
                    }
                }
                let _ = stream.shutdown().await;
                return;
            }
            Action::Timed(err) => {
                warn!("{} {}", core.flow(), err);
                core.error(err);
                return;
            }
            Action::Downward(cmd) => match cmd {
                Some(Event::Data(data)) => {
                    if !data.is_empty() {
                        if write_pending_since.is_none() {
                            write_pending_since = Some(Instant::now());
                        }
                        staged.extend(data);
                    }
                }
                // Message boundaries carry no meaning on a byte stream.
                Some(Event::MessageStart | Event::MessageEnd) => {}
                Some(Event::StreamEnd(_)) | None => ended = true,
            },
            Action::Writable(Ok(())) => {
                while let Some(chunk) = staged.first_chunk() {
                    match stream.try_write(chunk) {
                        Ok(0) => {
                            warn!("{} wrote zero bytes to peer", core.flow());
                            core.error(StreamError::WriteError);
                            return;
                        }
                        Ok(n) => {
                            staged.consume(n);
                            core.add_traffic_written(n as u64);
                            core.sub_buffered(n as u64);
                            last_activity = Instant::now();
                            write_pending_since = if staged.is_empty() {
                                None
                            } else {
                                Some(last_activity)
                            };
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!("{} error writing to peer: {}", core.flow(), e);
                            core.error(StreamError::WriteError);
                            return;
                        }
                    }
                }
            }
            Action::Readable(Ok(())) => match stream.try_read(&mut buf) {
                Ok(0) => {
                    debug!("{} connection closed by peer", core.flow());
                    core.error(StreamError::NoError);
                    return;
                }
                Ok(n) => {
                    // A close may have raced the read; closed flows
                    // deliver nothing upstream.
                    if core.close_requested() {
                        return;
                    }
                    core.add_traffic_read(n as u64);
                    last_read = Instant::now();
                    last_activity = last_read;
                    let mut ctx = InputContext::new(core.upward());
                    ctx.input(Event::data(&buf[..n]));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    warn!("{} connection reset by peer", core.flow());
                    core.error(StreamError::ConnectionReset);
                    return;
                }
                Err(e) => {
                    warn!("{} error reading from peer: {}", core.flow(), e);
                    core.error(StreamError::ReadError);
                    return;
                }
            },
            Action::Writable(Err(e)) => {
                warn!("{} error writing to peer: {}", core.flow(), e);
                core.error(StreamError::WriteError);
                return;
            }
            Action::Readable(Err(e)) => {
                warn!("{} error reading from peer: {}", core.flow(), e);
                core.error(StreamError::ReadError);
                return;
            }
        }

        if ended && staged.is_empty() && write_open {
            write_open = false;
            if let Err(e) = stream.shutdown().await {
                debug!("{} error shutting down write half: {}", core.flow(), e);
            }
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}
