//! Upward event delivery
//!
//! An outbound reports everything it learns from the network (reads,
//! errors, the terminal close) through an [`Input`] sink owned by the
//! pipeline stage that created it. Delivery is batched per I/O
//! completion with an [`InputContext`]: events emitted inside the scope
//! are queued and handed to the sink in insertion order when the scope
//! ends, so one socket completion produces one atomic upward delivery
//! and the sink never re-enters the outbound mid-callback.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::event::Event;

/// Upward sink for events emitted by an outbound.
pub trait Input: Send + Sync {
    /// Deliver one event to the pipeline.
    fn input(&self, evt: Event);
}

/// Batching scope for upward events.
///
/// Created at the entry of an I/O completion; all events pushed into it
/// are flushed to the sink, in order, when the context drops.
pub struct InputContext<'a> {
    sink: &'a dyn Input,
    batch: Vec<Event>,
}

impl<'a> InputContext<'a> {
    /// Open a batching scope over `sink`.
    #[must_use]
    pub fn new(sink: &'a dyn Input) -> Self {
        Self {
            sink,
            batch: Vec::new(),
        }
    }

    /// Queue one event for delivery at scope exit.
    pub fn input(&mut self, evt: Event) {
        self.batch.push(evt);
    }
}

impl Drop for InputContext<'_> {
    fn drop(&mut self) {
        for evt in self.batch.drain(..) {
            self.sink.input(evt);
        }
    }
}

/// An [`Input`] sink that forwards events onto an unbounded channel.
///
/// The usual way to consume an outbound from async code: hand the
/// outbound a `ChannelInput` and await events on the receiver.
pub struct ChannelInput {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelInput {
    /// Create a sink and the receiver draining it.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Input for ChannelInput {
    fn input(&self, evt: Event) {
        // Receiver gone means nobody is listening anymore; drop the event.
        let _ = self.tx.send(evt);
    }
}

/// An [`Input`] sink that accumulates events for later inspection.
pub struct CollectInput {
    events: Mutex<Vec<Event>>,
}

impl CollectInput {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Take every event received so far.
    #[must_use]
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of events received so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check whether no events were received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Default for CollectInput {
    fn default() -> Self {
        Self::new()
    }
}

impl Input for CollectInput {
    fn input(&self, evt: Event) {
        self.events.lock().push(evt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StreamError;

    #[test]
    fn test_context_flushes_in_order_on_drop() {
        let sink = CollectInput::new();
        {
            let mut ctx = InputContext::new(&sink);
            ctx.input(Event::MessageStart);
            ctx.input(Event::data("abc"));
            ctx.input(Event::MessageEnd);
            // Nothing delivered while the scope is open.
            assert!(sink.is_empty());
        }
        let events = sink.take();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], Event::MessageStart);
        assert_eq!(events[1], Event::data("abc"));
        assert_eq!(events[2], Event::MessageEnd);
    }

    #[test]
    fn test_empty_context_delivers_nothing() {
        let sink = CollectInput::new();
        drop(InputContext::new(&sink));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_channel_input() {
        let (sink, mut rx) = ChannelInput::new();
        sink.input(Event::StreamEnd(StreamError::NoError));
        assert_eq!(rx.recv().await, Some(Event::StreamEnd(StreamError::NoError)));
    }

    #[test]
    fn test_channel_input_dropped_receiver() {
        let (sink, rx) = ChannelInput::new();
        drop(rx);
        // Must not panic.
        sink.input(Event::MessageStart);
    }
}
