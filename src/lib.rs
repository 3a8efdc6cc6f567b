//! outbound-core: the outbound connection half of a streaming proxy
//!
//! Pipeline stages hand this crate a stream of framed events addressed
//! to a `(host, port)` tuple; the crate resolves the host, establishes
//! the TCP or UDP transport, pumps bytes in both directions, enforces
//! timeouts and retry policy, and reports completion or failure back as
//! framed events.
//!
//! # Architecture
//!
//! ```text
//! Pipeline stage → send(Event) → Outbound driver → socket → peer
//!                                      ↓
//!                                Input (batched) ← reads, errors
//! ```
//!
//! Every outbound is a small state machine (`idle → resolving →
//! connecting → connected → closed`) running on one spawned driver
//! task. Resolve and connect failures retry under the configured
//! policy; read, write, and idle errors are terminal. UDP flows
//! coalesce each `MessageStart … MessageEnd` group into exactly one
//! datagram and deliver each received datagram as exactly one group.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use outbound_core::{ChannelInput, Event, Options, Outbound, TcpOutbound};
//!
//! # async fn example() {
//! let (input, mut events) = ChannelInput::new();
//! let outbound = TcpOutbound::new(Arc::new(input), Options {
//!     connect_timeout: 5.0,
//!     ..Options::default()
//! });
//!
//! outbound.connect("example.com", 8080);
//! outbound.send(Event::data("hello"));
//!
//! while let Some(_event) = events.recv().await {
//!     // Data chunks from the peer, then a terminal StreamEnd.
//! }
//! # }
//! ```
//!
//! # Modules
//!
//! - [`event`]: framed events and chunked byte buffers
//! - [`input`]: upward delivery with per-completion batching
//! - [`options`]: the immutable per-outbound configuration record
//! - [`outbound`]: the TCP and UDP outbound implementations
//! - [`resolver`]: hostname resolution behind an injectable trait
//! - [`metrics`]: fleet-wide label-keyed counters, gauge, and histogram
//! - [`registry`]: the process-wide list of live outbounds
//! - [`error`]: error types for the synchronous API surface

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod error;
pub mod event;
pub mod input;
pub mod metrics;
pub mod options;
pub mod outbound;
pub mod registry;
pub mod resolver;

// Re-export commonly used types at the crate root
pub use error::{ConfigError, OutboundError};
pub use event::{Data, Event, StreamError};
pub use input::{ChannelInput, CollectInput, Input, InputContext};
pub use metrics::{
    outbound_metrics, scrape, Labels, MetricsSnapshot, METRIC_OUTBOUND_CONN_TIME,
    METRIC_OUTBOUND_COUNT, METRIC_OUTBOUND_IN, METRIC_OUTBOUND_OUT,
};
pub use options::{Options, Protocol, StateCallback};
pub use outbound::{Outbound, OutboundInfo, State, TcpOutbound, UdpOutbound};
pub use registry::live_outbounds;
pub use resolver::{Resolver, SystemResolver};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
