//! Shared helpers for the outbound integration tests.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use outbound_core::{Event, Resolver};

/// Resolver that maps every hostname to one fixed address.
pub struct StaticResolver {
    addr: SocketAddr,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, _host: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(vec![self.addr])
    }
}

/// Resolver that fails every lookup (NXDOMAIN stand-in).
#[derive(Default)]
pub struct FailingResolver {
    calls: AtomicUsize,
}

impl FailingResolver {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Resolver for FailingResolver {
    async fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such host: {host}"),
        ))
    }
}

/// Resolver that never completes, for exercising the connect timeout.
pub struct HangingResolver;

#[async_trait]
impl Resolver for HangingResolver {
    async fn resolve(&self, _host: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
        std::future::pending().await
    }
}

/// Receive the next upward event, bounded by `timeout`.
pub async fn recv_timeout(
    events: &mut UnboundedReceiver<Event>,
    timeout: Duration,
) -> Option<Event> {
    tokio::time::timeout(timeout, events.recv()).await.ok()?
}

/// Collect `Data` events until `expected` bytes have arrived.
///
/// Panics on a non-data event or if the bytes do not arrive in time.
pub async fn read_payload(events: &mut UnboundedReceiver<Event>, expected: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(expected);
    while payload.len() < expected {
        match recv_timeout(events, Duration::from_secs(5)).await {
            Some(Event::Data(data)) => payload.extend_from_slice(&data.to_bytes()),
            other => panic!("expected Data, got {other:?}"),
        }
    }
    payload
}
