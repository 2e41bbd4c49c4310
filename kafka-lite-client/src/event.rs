//! Typed notifications and listener registration

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::ErrorCode;
use crate::protocol::{Offset, PartitionId, TopicName};

/// Everything a client reports to its listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A socket is being opened
    Connecting { address: String },
    /// The socket finished connecting
    Connected { address: String },
    /// The broker closed the socket
    Disconnected { address: String },
    /// Socket-level failure; always followed by `Closed`
    ConnectionError { address: String, error: String },
    /// The socket is gone, whatever the cause
    Closed { address: String },
    /// One decoded message; `offset` is the position after it
    Message {
        topic: TopicName,
        payload: Bytes,
        offset: Offset,
    },
    /// The broker answered with a non-zero error code
    MessageError {
        topic: TopicName,
        partition: PartitionId,
        code: i16,
        name: &'static str,
    },
    /// The response was malformed; its remaining bytes were discarded
    ParseError {
        topic: TopicName,
        partition: PartitionId,
        description: String,
    },
    /// One offset from an offsets response
    Offset { topic: TopicName, value: Offset },
    /// An offsets response is fully drained
    LastOffset {
        topic: TopicName,
        offset: Offset,
        code: i16,
        name: &'static str,
    },
    /// A fetch round is fully drained
    LastMessage {
        topic: TopicName,
        offset: Offset,
        code: i16,
        name: &'static str,
    },
    Debug { message: String },
}

impl ClientEvent {
    pub(crate) fn last_message(topic: TopicName, offset: Offset, code: i16) -> Self {
        ClientEvent::LastMessage {
            topic,
            offset,
            code,
            name: ErrorCode::from(code).name(),
        }
    }

    pub(crate) fn last_offset(topic: TopicName, offset: Offset, code: i16) -> Self {
        ClientEvent::LastOffset {
            topic,
            offset,
            code,
            name: ErrorCode::from(code).name(),
        }
    }

    pub(crate) fn debug<S: Into<String>>(message: S) -> Self {
        ClientEvent::Debug {
            message: message.into(),
        }
    }

    /// Topic the event concerns, if any
    pub fn topic(&self) -> Option<&str> {
        match self {
            ClientEvent::Message { topic, .. }
            | ClientEvent::MessageError { topic, .. }
            | ClientEvent::ParseError { topic, .. }
            | ClientEvent::Offset { topic, .. }
            | ClientEvent::LastOffset { topic, .. }
            | ClientEvent::LastMessage { topic, .. } => Some(topic),
            _ => None,
        }
    }
}

/// Registration handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out of events to registered listeners
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    listeners: Arc<DashMap<ListenerId, mpsc::UnboundedSender<ClientEvent>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Events emitted from now on are queued for it
    /// until it is dropped or unsubscribed.
    pub fn subscribe(&self) -> EventStream {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(id, tx);
        EventStream {
            id,
            rx,
            bus: self.clone(),
        }
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn emit(&self, event: &ClientEvent) {
        self.listeners
            .retain(|_, listener| listener.send(event.clone()).is_ok());
    }
}

/// Stream of events for one listener; deregisters itself on drop
#[derive(Debug)]
pub struct EventStream {
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<ClientEvent>,
    bus: EventBus,
}

impl EventStream {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }

    /// Take an already queued event without waiting
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = ClientEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_emit_reaches_every_listener() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(&ClientEvent::debug("hello"));

        assert_eq!(first.recv().await, Some(ClientEvent::debug("hello")));
        assert_eq!(second.next().await, Some(ClientEvent::debug("hello")));
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        assert!(bus.unsubscribe(stream.id()));
        assert!(!bus.unsubscribe(stream.id()));
        bus.emit(&ClientEvent::debug("ignored"));

        assert_eq!(stream.try_recv(), None);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_drop_deregisters() {
        let bus = EventBus::new();
        let stream = bus.subscribe();
        assert_eq!(bus.listener_count(), 1);

        drop(stream);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_event_topic() {
        let event = ClientEvent::last_message("t".into(), 7, 0);
        assert!(matches!(event, ClientEvent::LastMessage { name: "NoError", .. }));
        assert_eq!(event.topic(), Some("t"));
        assert_eq!(ClientEvent::debug("x").topic(), None);
    }
}
