//! Producer client for sending messages to the broker

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::debug;

use crate::config::{ProducerConfig, ProducerConfigBuilder};
use crate::error::ClientError;
use crate::event::{ClientEvent, EventStream};
use crate::metrics::MetricsSnapshot;
use crate::protocol::{Messages, PartitionId, ProduceRequest, RequestEncoder, TopicName};
use crate::queue::QueuedSend;
use crate::session::{Command, Handle, Policy, Session};
use crate::Result;

/// Keeps the connection up: reconnect after every close unless disconnected
#[derive(Debug, Default)]
struct ProducerPolicy;

impl Policy for ProducerPolicy {
    type Command = Infallible;

    fn on_command(&mut self, _session: &mut Session, command: Infallible) {
        match command {}
    }

    fn on_event(&mut self, session: &mut Session, event: &ClientEvent) {
        if let ClientEvent::Closed { .. } = event {
            session.schedule_reconnect();
        }
    }
}

/// Completion of one [`Producer::send`].
///
/// Resolves to `Ok(())` once the request is written to the socket,
/// `Err(Dropped)` if a newer send pushed it out of a full queue, or
/// `Err(Cancelled)` if [`Producer::disconnect`] discarded it. Dropping a
/// `Delivery` does not cancel the send.
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for Delivery {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(result) => result,
            Err(_) => Err(ClientError::ClientShutdown),
        })
    }
}

/// Producer with a bounded, drop-oldest send queue and automatic reconnect.
///
/// Sends are written in the order they were made. While the socket is down
/// they wait in the queue; once `send_queue_length` are waiting, each new send
/// evicts the oldest one.
#[derive(Clone)]
pub struct Producer {
    handle: Handle<Infallible>,
    encoder: RequestEncoder,
    max_message_size: usize,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("address", &self.handle.address())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

impl Producer {
    /// Create a new producer with the given configuration. Must be called
    /// within a Tokio runtime.
    pub fn new(config: ProducerConfig) -> Result<Self> {
        let encoder = RequestEncoder::new(config.client_config.max_size as u32);
        let handle = Handle::spawn(
            config.client_config,
            config.send_queue_length,
            ProducerPolicy,
        )?;

        Ok(Self {
            handle,
            encoder,
            max_message_size: config.max_message_size,
        })
    }

    /// Create a producer builder
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::new()
    }

    pub async fn connect(&self) -> Result<()> {
        self.handle.connect().await
    }

    /// Close the socket; queued sends are kept and reconnecting continues
    pub fn close(&self) -> Result<()> {
        self.handle.send(Command::Close)
    }

    /// Close for good: stop reconnecting and cancel every queued send
    pub fn disconnect(&self) -> Result<()> {
        self.handle.send(Command::Disconnect)
    }

    /// Queue messages for partition 0 of a topic
    pub fn send<T, M>(&self, topic: T, messages: M) -> Result<Delivery>
    where
        T: Into<TopicName>,
        M: Into<Messages>,
    {
        self.send_request(ProduceRequest::new(topic, messages))
    }

    /// Queue messages for a specific partition
    pub fn send_to<T, M>(&self, topic: T, partition: PartitionId, messages: M) -> Result<Delivery>
    where
        T: Into<TopicName>,
        M: Into<Messages>,
    {
        self.send_request(ProduceRequest::new(topic, messages).partition(partition))
    }

    /// Queue a produce request. Fails only for requests that can never be
    /// written: an oversized message or topic name, or a stopped session.
    pub fn send_request(&self, request: ProduceRequest) -> Result<Delivery> {
        // Validate message sizes
        for message in request.messages.iter() {
            if message.len() > self.max_message_size {
                return Err(ClientError::MessageTooLarge {
                    size: message.len(),
                    max_size: self.max_message_size,
                });
            }
        }

        let mut encoder = self.encoder;
        let frame = encoder.frame(&request)?;
        debug!(topic = %request.topic, messages = request.messages.len(), "Queueing send");

        let (reply, rx) = oneshot::channel();
        self.handle.metrics().record_send_requested();
        self.handle
            .send(Command::Send(QueuedSend::new(request, frame, Some(reply))))?;
        Ok(Delivery { rx })
    }

    /// Subscribe to this producer's events
    pub fn events(&self) -> EventStream {
        self.handle.bus().subscribe()
    }

    /// Requested, completed and dropped send counts
    pub fn stats(&self) -> MetricsSnapshot {
        self.handle.metrics().snapshot()
    }

    pub fn address(&self) -> &str {
        self.handle.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_too_large() {
        let producer = Producer::new(
            Producer::builder()
                .send_queue_length(4)
                .max_message_size(8)
                .build(),
        )
        .unwrap();

        let err = producer.send("t", vec![0u8; 9]).unwrap_err();
        assert!(matches!(
            err,
            ClientError::MessageTooLarge {
                size: 9,
                max_size: 8
            }
        ));
        assert_eq!(producer.stats().sends_requested, 0);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_queued_sends() {
        let mut config = Producer::builder().build();
        config.client_config.auto_connect_on_write = false;
        let producer = Producer::new(config).unwrap();

        let delivery = producer.send("t", "queued").unwrap();
        producer.disconnect().unwrap();

        assert!(matches!(delivery.await, Err(ClientError::Cancelled)));
        assert_eq!(producer.stats().sends_requested, 1);
    }
}
