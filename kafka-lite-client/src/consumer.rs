//! Consumer client for receiving messages from the broker
//!
//! Polling runs in rounds. A round fetches every subscribed topic once and
//! starts only when the previous round has fully drained *and* the poll
//! interval has ticked since it began, so at most one fetch per topic is ever
//! in flight.
//!
//! A topic's offset only moves while no fetch for it is in flight.
//! Subscribing again to such a topic takes effect once that fetch finishes.
//!
//! A broker error or a malformed response for a topic discards its offset:
//! the topic is dropped, the connection is closed, and after reconnecting an
//! offsets lookup decides where to resume.

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::{ConsumerConfig, ConsumerConfigBuilder};
use crate::error::ClientError;
use crate::event::{ClientEvent, EventStream};
use crate::metrics::MetricsSnapshot;
use crate::protocol::{
    validate_topic, FetchRequest, Offset, OffsetTime, OffsetsRequest, PartitionId, TopicName,
};
use crate::session::{Command, Handle, Policy, Session};
use crate::Result;

/// A topic partition being consumed and the offset of the next fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
}

impl Subscription {
    pub fn new<T: Into<TopicName>>(topic: T) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
        }
    }

    pub fn partition(mut self, partition: PartitionId) -> Self {
        self.partition = partition;
        self
    }

    pub fn offset(mut self, offset: Offset) -> Self {
        self.offset = offset;
        self
    }
}

/// A topic waiting for an offsets lookup before it is consumed again
#[derive(Debug, Clone, PartialEq, Eq)]
struct Resync {
    topic: TopicName,
    partition: PartitionId,
    /// Lookup written on the current connection
    requested: bool,
}

/// Round gate: outstanding fetches plus whether the timer ticked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PollGate {
    outstanding: usize,
    ticked: bool,
}

impl Default for PollGate {
    fn default() -> Self {
        Self {
            outstanding: 0,
            ticked: true,
        }
    }
}

impl PollGate {
    fn is_open(&self) -> bool {
        self.outstanding == 0 && self.ticked
    }

    fn start_round(&mut self, fetches: usize) {
        self.ticked = false;
        self.outstanding = fetches;
    }

    fn complete(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Connection lost: nothing is outstanding and the next round waits for
    /// a tick
    fn reset(&mut self) {
        self.outstanding = 0;
        self.ticked = false;
    }
}

pub(crate) enum ConsumerCommand {
    Subscribe(Subscription),
    Unsubscribe(TopicName),
    Subscriptions(oneshot::Sender<Vec<Subscription>>),
}

struct ConsumerPolicy {
    subscriptions: Vec<Subscription>,
    /// Topics fetched in the current round whose response has not finished
    in_flight: Vec<TopicName>,
    /// Subscriptions waiting for their topic's fetch to finish
    deferred: Vec<Subscription>,
    resyncing: Vec<Resync>,
    gate: PollGate,
    poll_interval: Duration,
    resync_position: OffsetTime,
}

impl ConsumerPolicy {
    fn new(config: &ConsumerConfig) -> Self {
        Self {
            subscriptions: Vec::new(),
            in_flight: Vec::new(),
            deferred: Vec::new(),
            resyncing: Vec::new(),
            gate: PollGate::default(),
            poll_interval: config.poll_interval,
            resync_position: config.resync_position,
        }
    }

    fn subscription_mut(&mut self, topic: &str) -> Option<&mut Subscription> {
        self.subscriptions.iter_mut().find(|sub| sub.topic == topic)
    }

    fn forget(&mut self, topic: &str) {
        self.subscriptions.retain(|sub| sub.topic != topic);
        self.resyncing.retain(|entry| entry.topic != topic);
    }

    /// Start a round if the gate allows it
    fn poll(&mut self, session: &mut Session) {
        if !session.is_connected() || !self.gate.is_open() || self.subscriptions.is_empty() {
            return;
        }

        self.gate.start_round(self.subscriptions.len());
        self.in_flight = self.subscriptions.iter().map(|sub| sub.topic.clone()).collect();
        for sub in &self.subscriptions {
            session.fetch(
                FetchRequest::new(sub.topic.clone())
                    .partition(sub.partition)
                    .offset(sub.offset),
            );
        }
    }

    fn subscribe(&mut self, session: &mut Session, subscription: Subscription) {
        if self.in_flight.contains(&subscription.topic) {
            debug!(
                topic = %subscription.topic,
                offset = subscription.offset,
                "Fetch in flight; deferring subscription"
            );
            self.deferred.retain(|sub| sub.topic != subscription.topic);
            self.deferred.push(subscription);
            return;
        }

        debug!(topic = %subscription.topic, offset = subscription.offset, "Subscribing");
        self.forget(&subscription.topic);
        self.subscriptions.push(subscription);
        session.ensure_connected();
        self.poll(session);
    }

    /// A topic's fetch is over; apply any subscription that waited for it
    fn fetch_finished(&mut self, topic: &str) {
        self.in_flight.retain(|name| name != topic);
        if let Some(index) = self.deferred.iter().position(|sub| sub.topic == topic) {
            let subscription = self.deferred.remove(index);
            self.forget(topic);
            self.subscriptions.push(subscription);
        }
    }

    /// Current view of the subscriptions, deferred ones included
    fn snapshot(&self) -> Vec<Subscription> {
        let mut subscriptions: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|sub| !self.deferred.iter().any(|d| d.topic == sub.topic))
            .cloned()
            .collect();
        subscriptions.extend(self.deferred.iter().cloned());
        subscriptions
    }

    fn request_resyncs(&mut self, session: &mut Session) {
        for entry in self.resyncing.iter_mut().filter(|entry| !entry.requested) {
            info!(topic = %entry.topic, partition = entry.partition, "Resyncing topic offset");
            session.offsets(
                OffsetsRequest::new(entry.topic.clone())
                    .partition(entry.partition)
                    .time(self.resync_position),
            );
            session.emit_debug(format!("resyncing offset of topic {}", entry.topic));
            entry.requested = true;
        }
    }

    /// Stop consuming a topic until an offsets lookup succeeds
    fn start_resync(&mut self, session: &mut Session, topic: &str, partition: PartitionId) {
        if self.deferred.iter().any(|sub| sub.topic == topic) {
            // The failed fetch used an offset the caller already replaced
            return;
        }
        let known = self.subscriptions.iter().any(|sub| sub.topic == topic)
            || self.resyncing.iter().any(|entry| entry.topic == topic);
        if !known {
            return;
        }

        warn!(%topic, partition, "Dropping topic offset after error");
        self.forget(topic);
        self.resyncing.push(Resync {
            topic: topic.to_string(),
            partition,
            requested: false,
        });
        if session.is_connected() {
            session.close();
        }
    }

    fn finish_resync(&mut self, session: &mut Session, topic: &str, offset: Offset, code: i16) {
        let Some(index) = self
            .resyncing
            .iter()
            .position(|entry| entry.topic == topic && entry.requested)
        else {
            return;
        };
        if code != 0 {
            return;
        }

        let entry = self.resyncing.remove(index);
        info!(topic = %entry.topic, offset, "Topic resynced");
        session.emit_debug(format!("resubscribed topic {} at offset {}", entry.topic, offset));
        self.subscriptions.push(Subscription {
            topic: entry.topic,
            partition: entry.partition,
            offset,
        });
        self.poll(session);
    }
}

impl Policy for ConsumerPolicy {
    type Command = ConsumerCommand;

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }

    fn on_command(&mut self, session: &mut Session, command: ConsumerCommand) {
        match command {
            ConsumerCommand::Subscribe(subscription) => self.subscribe(session, subscription),
            ConsumerCommand::Unsubscribe(topic) => {
                debug!(%topic, "Unsubscribing");
                self.forget(&topic);
                self.deferred.retain(|sub| sub.topic != topic);
            }
            ConsumerCommand::Subscriptions(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn on_event(&mut self, session: &mut Session, event: &ClientEvent) {
        match event {
            ClientEvent::Message { topic, offset, .. } => {
                if let Some(sub) = self.subscription_mut(topic) {
                    sub.offset = *offset;
                }
            }
            ClientEvent::LastMessage { topic, .. } => {
                self.fetch_finished(topic);
                self.gate.complete();
                self.poll(session);
            }
            ClientEvent::MessageError {
                topic, partition, ..
            }
            | ClientEvent::ParseError {
                topic, partition, ..
            } => self.start_resync(session, topic, *partition),
            ClientEvent::LastOffset {
                topic,
                offset,
                code,
                ..
            } => self.finish_resync(session, topic, *offset, *code),
            ClientEvent::Connected { .. } => {
                self.request_resyncs(session);
                self.poll(session);
            }
            ClientEvent::Closed { .. } => {
                self.gate.reset();
                for topic in std::mem::take(&mut self.in_flight) {
                    self.fetch_finished(&topic);
                }
                session.clear_requests();
                for entry in &mut self.resyncing {
                    entry.requested = false;
                }
                session.schedule_reconnect();
            }
            _ => {}
        }
    }

    fn on_tick(&mut self, session: &mut Session) {
        self.gate.ticked = true;
        self.poll(session);
    }
}

/// Consumer that polls its subscribed topics and resyncs them after errors
#[derive(Clone)]
pub struct Consumer {
    handle: Handle<ConsumerCommand>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("address", &self.handle.address())
            .finish()
    }
}

impl Consumer {
    /// Create a new consumer with the given configuration. Must be called
    /// within a Tokio runtime.
    pub fn new(config: ConsumerConfig) -> Result<Self> {
        if config.poll_interval.is_zero() {
            return Err(ClientError::invalid_config(
                "poll_interval must be non-zero",
            ));
        }
        let policy = ConsumerPolicy::new(&config);
        let handle = Handle::spawn(config.client_config, 0, policy)?;
        Ok(Self { handle })
    }

    /// Create a consumer builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    pub async fn connect(&self) -> Result<()> {
        self.handle.connect().await
    }

    /// Close the socket; subscriptions are kept and reconnecting continues
    pub fn close(&self) -> Result<()> {
        self.handle.send(Command::Close)
    }

    /// Close for good and stop reconnecting
    pub fn disconnect(&self) -> Result<()> {
        self.handle.send(Command::Disconnect)
    }

    /// Start consuming a topic, replacing any subscription to the same topic
    pub fn subscribe(&self, subscription: Subscription) -> Result<()> {
        validate_topic(&subscription.topic)?;
        self.handle
            .send(Command::Policy(ConsumerCommand::Subscribe(subscription)))
    }

    pub fn unsubscribe<T: Into<TopicName>>(&self, topic: T) -> Result<()> {
        self.handle
            .send(Command::Policy(ConsumerCommand::Unsubscribe(topic.into())))
    }

    /// Current subscriptions with their next fetch offsets
    pub async fn subscriptions(&self) -> Result<Vec<Subscription>> {
        let (reply, rx) = oneshot::channel();
        self.handle
            .send(Command::Policy(ConsumerCommand::Subscriptions(reply)))?;
        rx.await.map_err(|_| ClientError::ClientShutdown)
    }

    /// Subscribe to this consumer's events
    pub fn events(&self) -> EventStream {
        self.handle.bus().subscribe()
    }

    pub fn stats(&self) -> MetricsSnapshot {
        self.handle.metrics().snapshot()
    }

    pub fn address(&self) -> &str {
        self.handle.address()
    }
}
