//! Outbound configuration
//!
//! An [`Options`] record is passed by value at construction and is
//! immutable afterwards. All defaults are explicit; durations are plain
//! seconds with `0` meaning "disabled" for the timeouts.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::outbound::State;

/// Transport protocol of an outbound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Stream transport
    #[default]
    Tcp,
    /// Datagram transport
    Udp,
}

impl Protocol {
    /// Metric label value for this protocol.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Callback invoked on every state transition of an outbound.
pub type StateCallback = Arc<dyn Fn(State) + Send + Sync>;

/// Configuration for one outbound.
#[derive(Clone, Serialize, Deserialize)]
pub struct Options {
    /// Transport protocol
    #[serde(default)]
    pub protocol: Protocol,

    /// Seconds allowed for resolve + connect together (0 = no limit)
    #[serde(default)]
    pub connect_timeout: f64,

    /// Seconds allowed between consecutive reads (0 = no limit, TCP)
    #[serde(default)]
    pub read_timeout: f64,

    /// Seconds buffered data may stay unwritten (0 = no limit, TCP)
    #[serde(default)]
    pub write_timeout: f64,

    /// Seconds without traffic in either direction before the flow is
    /// closed with `IDLE_TIMEOUT` (0 = no limit)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: f64,

    /// Connect attempts after the first failure; negative = unlimited
    #[serde(default)]
    pub retry_count: i32,

    /// Seconds between consecutive attempts
    #[serde(default)]
    pub retry_delay: f64,

    /// Receive buffer size for one datagram (UDP)
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,

    /// Enable TCP keep-alive probes on the connected socket
    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Stop accepting downward data once this many bytes are staged for
    /// write (0 = unbounded, TCP)
    #[serde(default)]
    pub congestion_limit: u64,

    /// Observer invoked on every state transition
    #[serde(skip)]
    pub on_state_changed: Option<StateCallback>,
}

const fn default_idle_timeout() -> f64 {
    60.0
}

const fn default_max_packet_size() -> u32 {
    16 * 1024
}

const fn default_true() -> bool {
    true
}

impl Default for Options {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            connect_timeout: 0.0,
            read_timeout: 0.0,
            write_timeout: 0.0,
            idle_timeout: default_idle_timeout(),
            retry_count: 0,
            retry_delay: 0.0,
            max_packet_size: default_max_packet_size(),
            keep_alive: true,
            congestion_limit: 0,
            on_state_changed: None,
        }
    }
}

impl Options {
    /// Connect timeout as a duration, `None` if disabled.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        secs_opt(self.connect_timeout)
    }

    /// Read timeout as a duration, `None` if disabled.
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        secs_opt(self.read_timeout)
    }

    /// Write timeout as a duration, `None` if disabled.
    #[must_use]
    pub fn write_timeout(&self) -> Option<Duration> {
        secs_opt(self.write_timeout)
    }

    /// Idle timeout as a duration, `None` if disabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        secs_opt(self.idle_timeout)
    }

    /// Delay before the next connect attempt, `None` if immediate.
    #[must_use]
    pub fn retry_delay(&self) -> Option<Duration> {
        secs_opt(self.retry_delay)
    }

    /// Validate field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a duration field is negative or not
    /// finite, or `max_packet_size` is zero.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (field, value) in [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("idle_timeout", self.idle_timeout),
            ("retry_delay", self.retry_delay),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::invalid(field, "must be finite"));
            }
            if value < 0.0 {
                return Err(ConfigError::invalid(field, "must be >= 0"));
            }
        }
        if self.max_packet_size == 0 {
            return Err(ConfigError::invalid("max_packet_size", "must be > 0"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("protocol", &self.protocol)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .field("max_packet_size", &self.max_packet_size)
            .field("keep_alive", &self.keep_alive)
            .field("congestion_limit", &self.congestion_limit)
            .field("on_state_changed", &self.on_state_changed.is_some())
            .finish()
    }
}

fn secs_opt(value: f64) -> Option<Duration> {
    if value > 0.0 {
        Some(Duration::from_secs_f64(value))
    } else {
        None
    }
}
