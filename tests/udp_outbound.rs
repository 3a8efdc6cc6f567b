//! End-to-end tests for the UDP outbound: echo with idle timeout,
//! datagram coalescing, boundary sizes, and the flush-then-close path.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use common::{recv_timeout, FailingResolver, StaticResolver};
use outbound_core::{
    ChannelInput, Event, Options, Outbound, Protocol, State, StreamError, UdpOutbound,
};

fn udp_options() -> Options {
    Options {
        protocol: Protocol::Udp,
        connect_timeout: 5.0,
        max_packet_size: 1500,
        idle_timeout: 1.0,
        ..Options::default()
    }
}

/// Wait until the outbound reaches `state`, bounded at two seconds.
async fn wait_for_state(outbound: &UdpOutbound, state: State) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while outbound.state() != state {
        assert!(Instant::now() < deadline, "timed out waiting for {state}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_udp_echo_then_idle_timeout() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0_u8; 2048];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        server.send_to(&buf[..n], peer).await.unwrap();
        // Stay alive so nothing resets the flow; the idle timer ends it.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (input, mut events) = ChannelInput::new();
    let outbound = UdpOutbound::with_resolver(
        Arc::new(input),
        udp_options(),
        Arc::new(StaticResolver::new(addr)),
    );
    outbound.connect("udp-echo.test", addr.port());
    outbound.send(Event::MessageStart);
    outbound.send(Event::data(&[0x01, 0x02, 0x03][..]));
    outbound.send(Event::MessageEnd);

    // One received datagram arrives as exactly one message group.
    assert_eq!(
        recv_timeout(&mut events, Duration::from_secs(5)).await,
        Some(Event::MessageStart)
    );
    assert_eq!(
        recv_timeout(&mut events, Duration::from_secs(5)).await,
        Some(Event::data(&[0x01, 0x02, 0x03][..]))
    );
    assert_eq!(
        recv_timeout(&mut events, Duration::from_secs(5)).await,
        Some(Event::MessageEnd)
    );

    // After a second with no traffic, the flow closes as idle.
    assert_eq!(
        recv_timeout(&mut events, Duration::from_secs(3)).await,
        Some(Event::StreamEnd(StreamError::IdleTimeout))
    );
    assert_eq!(outbound.state(), State::Closed);
}

#[tokio::test]
async fn test_udp_coalescing_one_datagram() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    let (input, _events) = ChannelInput::new();
    let outbound = UdpOutbound::with_resolver(
        Arc::new(input),
        udp_options(),
        Arc::new(StaticResolver::new(addr)),
    );
    outbound.connect("coalesce.test", addr.port());
    outbound.send(Event::MessageStart);
    outbound.send(Event::data("ab"));
    outbound.send(Event::data("cd"));
    outbound.send(Event::MessageEnd);

    // Exactly one datagram, with the chunks coalesced.
    let mut buf = [0_u8; 64];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"abcd");

    let second = tokio::time::timeout(Duration::from_millis(200), server.recv_from(&mut buf)).await;
    assert!(second.is_err(), "expected no second datagram");
}

#[tokio::test]
async fn test_udp_data_outside_message_is_dropped() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    let (input, _events) = ChannelInput::new();
    let outbound = UdpOutbound::with_resolver(
        Arc::new(input),
        udp_options(),
        Arc::new(StaticResolver::new(addr)),
    );
    outbound.connect("stray.test", addr.port());
    // No MessageStart: the chunk has no message to join and is dropped.
    outbound.send(Event::data("stray"));
    outbound.send(Event::MessageEnd);

    let mut buf = [0_u8; 64];
    let received =
        tokio::time::timeout(Duration::from_millis(300), server.recv_from(&mut buf)).await;
    assert!(received.is_err(), "expected no datagram");
}

#[tokio::test]
async fn test_udp_max_packet_size_datagram_received_whole() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0_u8; 64];
        let (_, peer) = server.recv_from(&mut buf).await.unwrap();
        let payload = vec![0xAB_u8; 1500];
        server.send_to(&payload, peer).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (input, mut events) = ChannelInput::new();
    let outbound = UdpOutbound::with_resolver(
        Arc::new(input),
        udp_options(),
        Arc::new(StaticResolver::new(addr)),
    );
    outbound.connect("big.test", addr.port());
    // Kick the server so it learns our address.
    outbound.send(Event::MessageStart);
    outbound.send(Event::data("hi"));
    outbound.send(Event::MessageEnd);

    assert_eq!(
        recv_timeout(&mut events, Duration::from_secs(5)).await,
        Some(Event::MessageStart)
    );
    match recv_timeout(&mut events, Duration::from_secs(5)).await {
        Some(Event::Data(data)) => {
            assert_eq!(data.len(), 1500);
            assert!(data.to_bytes().iter().all(|b| *b == 0xAB));
        }
        other => panic!("expected Data, got {other:?}"),
    }
    assert_eq!(
        recv_timeout(&mut events, Duration::from_secs(5)).await,
        Some(Event::MessageEnd)
    );
}

#[tokio::test]
async fn test_udp_stream_end_flushes_then_closes_silently() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    let (input, mut events) = ChannelInput::new();
    let outbound = UdpOutbound::with_resolver(
        Arc::new(input),
        udp_options(),
        Arc::new(StaticResolver::new(addr)),
    );
    outbound.connect("flush.test", addr.port());
    outbound.send(Event::MessageStart);
    outbound.send(Event::data("last words"));
    outbound.send(Event::MessageEnd);
    outbound.send(Event::StreamEnd(StreamError::NoError));

    // The queued datagram still goes out before teardown.
    let mut buf = [0_u8; 64];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"last words");

    wait_for_state(&outbound, State::Closed).await;
    // The caller ended the stream; nothing comes back up.
    assert_eq!(recv_timeout(&mut events, Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_udp_message_group_counts_balance() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0_u8; 2048];
        let (_, peer) = server.recv_from(&mut buf).await.unwrap();
        for payload in [&b"one"[..], b"two", b"three"] {
            server.send_to(payload, peer).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (input, mut events) = ChannelInput::new();
    let outbound = UdpOutbound::with_resolver(
        Arc::new(input),
        udp_options(),
        Arc::new(StaticResolver::new(addr)),
    );
    outbound.connect("balance.test", addr.port());
    outbound.send(Event::MessageStart);
    outbound.send(Event::data("ping"));
    outbound.send(Event::MessageEnd);

    let mut starts = 0;
    let mut ends = 0;
    let mut datagrams = Vec::new();
    loop {
        match recv_timeout(&mut events, Duration::from_secs(3)).await {
            Some(Event::MessageStart) => starts += 1,
            Some(Event::Data(data)) => datagrams.push(data.to_bytes()),
            Some(Event::MessageEnd) => ends += 1,
            Some(Event::StreamEnd(StreamError::IdleTimeout)) => break,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(starts, 3);
    assert_eq!(ends, 3);
    assert_eq!(datagrams, vec![&b"one"[..], b"two", b"three"]);
}

#[tokio::test]
async fn test_udp_resolve_failure_retries() {
    let resolver = Arc::new(FailingResolver::default());
    let (input, mut events) = ChannelInput::new();
    let outbound = UdpOutbound::with_resolver(
        Arc::new(input),
        Options {
            protocol: Protocol::Udp,
            retry_count: 1,
            retry_delay: 0.01,
            ..Options::default()
        },
        resolver.clone(),
    );
    outbound.connect("nxdomain.test", 53);

    assert_eq!(
        recv_timeout(&mut events, Duration::from_secs(5)).await,
        Some(Event::StreamEnd(StreamError::CannotResolve))
    );
    assert_eq!(resolver.calls(), 2);
    assert_eq!(outbound.state(), State::Closed);
}
