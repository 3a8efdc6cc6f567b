//! Framed events and chunked byte buffers
//!
//! Pipeline stages talk to outbounds in framed events: raw `Data` chunks
//! for byte streams, `MessageStart`/`MessageEnd` brackets for datagram
//! boundaries, and a terminal `StreamEnd` carrying the close reason.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Close reason carried by a terminal [`Event::StreamEnd`].
///
/// `NoError` is the default and denotes a clean, peer-initiated close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamError {
    /// Clean close (peer EOF)
    #[default]
    NoError,
    /// Hostname resolution failed
    CannotResolve,
    /// Peer refused the connection
    ConnectionRefused,
    /// Resolve + connect did not finish within the connect timeout
    ConnectionTimeout,
    /// Peer reset the connection
    ConnectionReset,
    /// Connection attempt was canceled before it completed
    ConnectionCanceled,
    /// Read failed
    ReadError,
    /// No data arrived within the read timeout
    ReadTimeout,
    /// Write failed
    WriteError,
    /// Buffered data could not be written within the write timeout
    WriteTimeout,
    /// No traffic in either direction within the idle timeout
    IdleTimeout,
    /// Reserved for authentication layers
    Unauthorized,
}

impl StreamError {
    /// Check whether this reason denotes an actual failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        !matches!(self, Self::NoError)
    }

    /// Stable string form, matching the serialized representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoError => "NO_ERROR",
            Self::CannotResolve => "CANNOT_RESOLVE",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::ConnectionReset => "CONNECTION_RESET",
            Self::ConnectionCanceled => "CONNECTION_CANCELED",
            Self::ReadError => "READ_ERROR",
            Self::ReadTimeout => "READ_TIMEOUT",
            Self::WriteError => "WRITE_ERROR",
            Self::WriteTimeout => "WRITE_TIMEOUT",
            Self::IdleTimeout => "IDLE_TIMEOUT",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A byte buffer made of reference-counted chunks.
///
/// Appending a chunk and moving a whole buffer onto a queue are both O(1);
/// no byte is copied until the buffer is flattened for a datagram send.
#[derive(Debug, Clone, Default)]
pub struct Data {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl Data {
    /// Create an empty buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
        }
    }

    /// Total number of bytes across all chunks.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check whether the buffer holds no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one chunk.
    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.len += chunk.len();
            self.chunks.push_back(chunk);
        }
    }

    /// Append every chunk of `other`, leaving it empty.
    pub fn extend(&mut self, mut other: Data) {
        self.len += other.len;
        self.chunks.append(&mut other.chunks);
        other.len = 0;
    }

    /// Move the contents out, leaving this buffer empty.
    #[must_use]
    pub fn take(&mut self) -> Data {
        std::mem::take(self)
    }

    /// Drop all chunks.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// First chunk, if any.
    #[must_use]
    pub fn first_chunk(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Discard `n` bytes from the front of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`Data::len`].
    pub fn consume(&mut self, mut n: usize) {
        assert!(n <= self.len, "consume past end of buffer");
        self.len -= n;
        while n > 0 {
            let front = self.chunks.front_mut().expect("chunk accounting");
            if n < front.len() {
                let _ = front.split_to(n);
                break;
            }
            n -= front.len();
            self.chunks.pop_front();
        }
    }

    /// Iterate over the chunks in order.
    pub fn chunks(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }

    /// Flatten into one contiguous `Bytes`.
    ///
    /// Single-chunk buffers are returned without copying.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks[0].clone();
        }
        let mut out = BytesMut::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}

impl From<Bytes> for Data {
    fn from(chunk: Bytes) -> Self {
        let mut data = Data::new();
        data.push(chunk);
        data
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<&[u8]> for Data {
    fn from(slice: &[u8]) -> Self {
        Bytes::copy_from_slice(slice).into()
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        s.as_bytes().into()
    }
}

impl PartialEq for Data {
    /// Buffers compare by byte content, independent of chunking.
    fn eq(&self, other: &Self) -> bool {
        if self.len != other.len {
            return false;
        }
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for Data {}

/// A framed event flowing between a pipeline stage and an outbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Opens a message group (UDP: the start of one datagram)
    MessageStart,
    /// A chunk of payload bytes
    Data(Data),
    /// Closes a message group (UDP: the datagram is complete)
    MessageEnd,
    /// Terminal event; the stream is over
    StreamEnd(StreamError),
}

impl Event {
    /// Short name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MessageStart => "MessageStart",
            Self::Data(_) => "Data",
            Self::MessageEnd => "MessageEnd",
            Self::StreamEnd(_) => "StreamEnd",
        }
    }

    /// Convenience constructor for a data event.
    #[must_use]
    pub fn data(bytes: impl Into<Data>) -> Self {
        Self::Data(bytes.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_push_and_len() {
        let mut data = Data::new();
        assert!(data.is_empty());

        data.push(Bytes::from_static(b"ab"));
        data.push(Bytes::from_static(b"cd"));
        assert_eq!(data.len(), 4);
        assert_eq!(data.to_bytes(), Bytes::from_static(b"abcd"));
    }

    #[test]
    fn test_data_empty_chunk_ignored() {
        let mut data = Data::new();
        data.push(Bytes::new());
        assert!(data.is_empty());
        assert_eq!(data.chunks().count(), 0);
    }

    #[test]
    fn test_data_extend_moves_chunks() {
        let mut a = Data::from("ab");
        let b = Data::from("cd");
        a.extend(b);
        assert_eq!(a.len(), 4);
        assert_eq!(a.to_bytes(), Bytes::from_static(b"abcd"));
    }

    #[test]
    fn test_data_take() {
        let mut data = Data::from("hello");
        let taken = data.take();
        assert!(data.is_empty());
        assert_eq!(taken.len(), 5);
    }

    #[test]
    fn test_data_consume_within_chunk() {
        let mut data = Data::from("hello");
        data.consume(2);
        assert_eq!(data.to_bytes(), Bytes::from_static(b"llo"));
    }

    #[test]
    fn test_data_consume_across_chunks() {
        let mut data = Data::new();
        data.push(Bytes::from_static(b"ab"));
        data.push(Bytes::from_static(b"cdef"));
        data.consume(3);
        assert_eq!(data.len(), 3);
        assert_eq!(data.to_bytes(), Bytes::from_static(b"def"));
    }

    #[test]
    #[should_panic(expected = "consume past end")]
    fn test_data_consume_past_end_panics() {
        let mut data = Data::from("ab");
        data.consume(3);
    }

    #[test]
    fn test_data_eq_ignores_chunking() {
        let mut a = Data::new();
        a.push(Bytes::from_static(b"ab"));
        a.push(Bytes::from_static(b"cd"));
        let b = Data::from("abcd");
        assert_eq!(a, b);
    }

    #[test]
    fn test_stream_error_default_and_display() {
        assert_eq!(StreamError::default(), StreamError::NoError);
        assert!(!StreamError::NoError.is_error());
        assert!(StreamError::CannotResolve.is_error());
        assert_eq!(StreamError::IdleTimeout.to_string(), "IDLE_TIMEOUT");
    }

    #[test]
    fn test_event_name() {
        assert_eq!(Event::MessageStart.name(), "MessageStart");
        assert_eq!(Event::data("x").name(), "Data");
        assert_eq!(Event::StreamEnd(StreamError::NoError).name(), "StreamEnd");
    }
}
