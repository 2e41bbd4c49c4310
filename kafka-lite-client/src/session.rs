//! Session driver shared by the client, producer and consumer
//!
//! Every handle talks to one spawned task that owns the socket, the decoder,
//! the request queue and the send queue. Nothing else touches them, so there
//! is no locking: the task reacts to one thing at a time, whether a handle
//! command, socket activity, a deadline or a poll tick. The task never awaits
//! the socket outside its `select!`, so commands keep flowing while the broker
//! is slow to read.
//!
//! A [`Policy`] supplies the behavior that differs between handles:
//! reconnecting, polling, resyncing.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::connection::{Activity, Connection};
use crate::decoder::{Decoded, ResponseDecoder};
use crate::error::ClientError;
use crate::event::{ClientEvent, EventBus};
use crate::metrics::ClientMetrics;
use crate::protocol::{FetchRequest, OffsetsRequest, ReadRequest, RequestEncoder};
use crate::queue::{QueuedSend, SendQueue};
use crate::Result;

/// Handle-specific behavior plugged into a session
pub(crate) trait Policy: Send + 'static {
    type Command: Send + 'static;

    /// Period of the poll ticker, if the policy wants one
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    fn on_command(&mut self, session: &mut Session, command: Self::Command);

    /// Called for every event before listeners see it
    fn on_event(&mut self, session: &mut Session, event: &ClientEvent);

    fn on_tick(&mut self, _session: &mut Session) {}
}

/// Requests from a handle to its session
pub(crate) enum Command<C> {
    Connect(oneshot::Sender<Result<()>>),
    Close,
    Disconnect,
    Fetch(FetchRequest),
    Offsets(OffsetsRequest),
    Send(QueuedSend),
    Policy(C),
}

/// Policy of the plain client: report everything, decide nothing
#[derive(Debug, Default)]
pub(crate) struct Passive;

impl Policy for Passive {
    type Command = Infallible;

    fn on_command(&mut self, _session: &mut Session, command: Infallible) {
        match command {}
    }

    fn on_event(&mut self, _session: &mut Session, _event: &ClientEvent) {}
}

/// Shared plumbing of the public handle types
pub(crate) struct Handle<C> {
    commands: mpsc::UnboundedSender<Command<C>>,
    bus: EventBus,
    metrics: Arc<ClientMetrics>,
    address: String,
}

impl<C> Clone for Handle<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            bus: self.bus.clone(),
            metrics: self.metrics.clone(),
            address: self.address.clone(),
        }
    }
}

impl<C: Send + 'static> Handle<C> {
    /// Validate the configuration and start the session task
    pub(crate) fn spawn<P>(config: ClientConfig, send_queue_length: usize, policy: P) -> Result<Self>
    where
        P: Policy<Command = C>,
    {
        config.validate()?;

        let bus = EventBus::new();
        let metrics = Arc::new(ClientMetrics::new());
        let address = config.address();
        let (commands, receiver) = mpsc::unbounded_channel();

        let session = Session::new(config, send_queue_length, bus.clone(), metrics.clone());
        tokio::spawn(session.run(policy, receiver));

        Ok(Self {
            commands,
            bus,
            metrics,
            address,
        })
    }

    pub(crate) fn send(&self, command: Command<C>) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::ClientShutdown)
    }

    pub(crate) async fn connect(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Connect(reply))?;
        response.await.map_err(|_| ClientError::ClientShutdown)?
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub(crate) fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn tick_some(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

/// What the frame currently handed to the socket belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outgoing {
    Send,
    Read,
}

/// State owned by the session task
pub(crate) struct Session {
    config: ClientConfig,
    connection: Connection,
    decoder: ResponseDecoder,
    encoder: RequestEncoder,
    sends: SendQueue,
    writing: Option<Outgoing>,
    /// Events waiting to be dispatched
    events: VecDeque<ClientEvent>,
    bus: EventBus,
    metrics: Arc<ClientMetrics>,
    reconnect_enabled: bool,
    reconnect_at: Option<Instant>,
    idle_deadline: Option<Instant>,
}

impl Session {
    pub(crate) fn new(
        config: ClientConfig,
        send_queue_length: usize,
        bus: EventBus,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        let max_size = config.max_size;
        Self {
            connection: Connection::new(&config),
            decoder: ResponseDecoder::new(max_size).with_checksums(config.verify_checksums),
            encoder: RequestEncoder::new(max_size as u32),
            sends: SendQueue::new(send_queue_length),
            writing: None,
            events: VecDeque::new(),
            bus,
            metrics,
            reconnect_enabled: config.reconnect_interval.is_some(),
            reconnect_at: None,
            idle_deadline: None,
            config,
        }
    }

    pub(crate) async fn run<P: Policy>(
        mut self,
        mut policy: P,
        mut commands: mpsc::UnboundedReceiver<Command<P::Command>>,
    ) {
        let mut ticker = policy.poll_interval().map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        debug!(address = %self.connection.address(), "Session started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(&mut policy, command),
                    None => break,
                },
                activity = self.connection.activity() => self.handle_activity(activity),
                _ = sleep_until_some(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.reconnect();
                }
                _ = sleep_until_some(self.idle_deadline) => self.request_timed_out(),
                _ = tick_some(&mut ticker) => policy.on_tick(&mut self),
            }
            self.settle(&mut policy);
        }

        // Every handle is gone
        self.disconnect();
        self.settle(&mut policy);
        debug!(address = %self.connection.address(), "Session stopped");
    }

    fn handle_command<P: Policy>(&mut self, policy: &mut P, command: Command<P::Command>) {
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(self.connect());
            }
            Command::Close => self.close(),
            Command::Disconnect => self.disconnect(),
            Command::Fetch(request) => self.fetch(request),
            Command::Offsets(request) => self.offsets(request),
            Command::Send(entry) => self.enqueue_send(entry),
            Command::Policy(command) => policy.on_command(self, command),
        }
    }

    fn handle_activity(&mut self, activity: Activity) {
        match activity {
            Activity::Connected(stream) => {
                self.connection.established(stream, &mut self.events);
            }
            Activity::ConnectFailed(e) | Activity::ReadFailed(e) | Activity::WriteFailed(e) => {
                self.connection.failed(&e, &mut self.events);
                self.close();
            }
            Activity::Eof => {
                self.connection.ended(&mut self.events);
                self.close();
            }
            Activity::Data(_) => self.read_responses(),
            Activity::Written(_) => {
                if !self.connection.is_writing() {
                    self.frame_written();
                }
            }
        }
    }

    fn read_responses(&mut self) {
        loop {
            match self.decoder.decode(self.connection.read_buf_mut()) {
                Ok(Some(Decoded::Event(event))) => self.events.push_back(event),
                Ok(Some(Decoded::Resumed { topic, offset })) => {
                    self.events.push_back(ClientEvent::debug(format!(
                        "fetch of {} filled the fetch size; continuing at offset {}",
                        topic, offset
                    )));
                }
                Ok(None) => break,
                Err(e) => {
                    error!(address = %self.connection.address(), error = %e, "Response decoding failed");
                    self.close();
                    break;
                }
            }
        }

        self.idle_deadline = match self.config.request_timeout {
            Some(limit) if self.decoder.requests().awaiting_response() => {
                Some(Instant::now() + limit)
            }
            _ => None,
        };
    }

    /// Dispatch queued events and write whatever became writable, until
    /// neither produces anything new
    fn settle<P: Policy>(&mut self, policy: &mut P) {
        loop {
            while let Some(event) = self.events.pop_front() {
                self.record(&event);
                policy.on_event(self, &event);
                self.bus.emit(&event);
            }
            self.flush();
            if self.events.is_empty() {
                break;
            }
        }
    }

    fn record(&self, event: &ClientEvent) {
        match event {
            ClientEvent::Connected { .. } => self.metrics.record_connection_created(),
            ClientEvent::ConnectionError { .. } => self.metrics.record_connection_error(),
            ClientEvent::Message { payload, .. } => {
                self.metrics.record_message(payload.len() as u64)
            }
            ClientEvent::ParseError { .. } => self.metrics.record_parse_error(),
            ClientEvent::MessageError { .. } => self.metrics.record_broker_error(),
            _ => {}
        }
    }

    /// Hand the next frame to the socket: queued sends first, then reads not
    /// yet written on this socket. One frame is outstanding at a time; the
    /// next goes out once the socket reports the last one fully written.
    fn flush(&mut self) {
        if !self.connection.is_connected() || self.writing.is_some() {
            return;
        }

        if let Some(frame) = self.sends.begin_front() {
            self.start_write(frame, Outgoing::Send);
            return;
        }

        loop {
            let encoded = match self.decoder.requests_mut().unsent_mut().next() {
                Some(pending) => self.encoder.frame(&pending.request).map(|frame| {
                    pending.sent = true;
                    frame
                }),
                None => return,
            };
            match encoded {
                Ok(frame) => {
                    self.start_write(frame, Outgoing::Read);
                    if self.idle_deadline.is_none() {
                        if let Some(limit) = self.config.request_timeout {
                            self.idle_deadline = Some(Instant::now() + limit);
                        }
                    }
                    return;
                }
                Err(e) => {
                    if let Some(request) = self.decoder.requests_mut().discard_first_unsent() {
                        error!(topic = %request.topic(), error = %e, "Failed to encode request; discarding it");
                    }
                }
            }
        }
    }

    fn start_write(&mut self, frame: Bytes, outgoing: Outgoing) {
        match self.connection.start_write(frame) {
            Ok(()) => self.writing = Some(outgoing),
            Err(e) => {
                if outgoing == Outgoing::Send {
                    self.sends.abort_front();
                }
                self.write_failed(e);
            }
        }
    }

    /// The outstanding frame is fully on the wire
    fn frame_written(&mut self) {
        if self.writing.take() == Some(Outgoing::Send) {
            if let Some(entry) = self.sends.finish_front() {
                debug!(topic = %entry.request.topic, "Produce request written");
                self.metrics.record_send_completed();
                entry.complete(Ok(()));
            }
        }
    }

    fn write_failed(&mut self, error: std::io::Error) {
        self.connection.failed(&error, &mut self.events);
        self.close();
    }

    fn request_timed_out(&mut self) {
        self.idle_deadline = None;
        if !self.decoder.requests().awaiting_response() {
            return;
        }
        let limit = self.config.request_timeout.unwrap_or_default();
        warn!(
            address = %self.connection.address(),
            timeout_ms = limit.as_millis() as u64,
            "No response from broker"
        );
        self.events.push_back(ClientEvent::ConnectionError {
            address: self.connection.address().to_string(),
            error: ClientError::timeout(limit.as_millis() as u64).to_string(),
        });
        self.close();
    }

    fn reconnect(&mut self) {
        if self.reconnect_enabled && self.connection.is_disconnected() {
            info!(address = %self.connection.address(), "Reconnecting");
            let _ = self.connect();
        }
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        self.connection.connect(&mut self.events)?;
        self.reconnect_at = None;
        Ok(())
    }

    /// Open the socket if a request was issued while disconnected
    pub(crate) fn ensure_connected(&mut self) {
        if self.config.auto_connect_on_write && self.connection.is_disconnected() {
            let _ = self.connect();
        }
    }

    /// Drop the socket. Queued requests stay queued and are written again on
    /// the next connection.
    pub(crate) fn close(&mut self) {
        if self.connection.close(&mut self.events) {
            self.decoder.reset();
            self.decoder.requests_mut().mark_unsent();
            self.sends.abort_front();
            self.writing = None;
            self.idle_deadline = None;
        }
    }

    /// Close for good: no further reconnects, and everything queued is
    /// discarded.
    pub(crate) fn disconnect(&mut self) {
        self.reconnect_enabled = false;
        self.reconnect_at = None;
        self.close();
        self.clear_requests();

        let cancelled = self.sends.len();
        for entry in self.sends.drain() {
            self.metrics.record_send_cancelled();
            entry.complete(Err(ClientError::Cancelled));
        }
        if cancelled > 0 {
            debug!(cancelled, "Discarded queued sends on disconnect");
        }
    }

    pub(crate) fn clear_requests(&mut self) {
        self.decoder.requests_mut().clear();
        self.decoder.reset();
    }

    pub(crate) fn fetch(&mut self, mut request: FetchRequest) {
        let limit = self.decoder.max_size() as u32;
        request.max_size = request.max_size.map(|size| size.min(limit));
        debug!(topic = %request.topic, offset = request.offset, "Queueing fetch");
        self.decoder.requests_mut().push(ReadRequest::Fetch(request));
        self.ensure_connected();
    }

    pub(crate) fn offsets(&mut self, request: OffsetsRequest) {
        debug!(topic = %request.topic, time = request.time.as_i64(), "Queueing offsets lookup");
        self.decoder.requests_mut().push(ReadRequest::Offsets(request));
        self.ensure_connected();
    }

    pub(crate) fn enqueue_send(&mut self, entry: QueuedSend) {
        if let Some(evicted) = self.sends.push(entry) {
            warn!(
                topic = %evicted.request.topic,
                capacity = self.sends.capacity(),
                "Send queue full; dropping oldest request"
            );
            self.metrics.record_send_dropped();
            self.emit_debug(format!(
                "send queue full: dropped request for topic {}",
                evicted.request.topic
            ));
            evicted.complete(Err(ClientError::Dropped));
        }
        self.ensure_connected();
    }

    /// Arm the reconnect timer, unless reconnecting is off
    pub(crate) fn schedule_reconnect(&mut self) {
        if !self.reconnect_enabled {
            return;
        }
        if let Some(interval) = self.config.reconnect_interval {
            info!(
                address = %self.connection.address(),
                delay_ms = interval.as_millis() as u64,
                "Scheduling reconnect"
            );
            self.reconnect_at = Some(Instant::now() + interval);
            self.emit_debug(format!("reconnecting in {}ms", interval.as_millis()));
        }
    }

    pub(crate) fn emit_debug(&mut self, message: String) {
        self.events.push_back(ClientEvent::debug(message));
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    #[cfg(test)]
    pub(crate) fn pending_reads(&self) -> usize {
        self.decoder.requests().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProduceRequest;

    fn session(send_queue_length: usize) -> Session {
        Session::new(
            ClientConfig {
                auto_connect_on_write: false,
                ..ClientConfig::default()
            },
            send_queue_length,
            EventBus::new(),
            Arc::new(ClientMetrics::new()),
        )
    }

    fn queued(topic: &str) -> (QueuedSend, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let entry = QueuedSend::new(ProduceRequest::new(topic, "m"), Bytes::new(), Some(tx));
        (entry, rx)
    }

    #[tokio::test]
    async fn test_eviction_completes_dropped() {
        let mut session = session(1);
        let (first, first_rx) = queued("a");
        let (second, _second_rx) = queued("b");

        session.enqueue_send(first);
        session.enqueue_send(second);

        assert!(matches!(first_rx.await, Ok(Err(ClientError::Dropped))));
        assert_eq!(session.metrics.snapshot().sends_dropped, 1);
        assert!(matches!(session.events.back(), Some(ClientEvent::Debug { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_and_stops_reconnecting() {
        let mut session = session(10);
        let (entry, rx) = queued("a");
        session.enqueue_send(entry);
        session.fetch(FetchRequest::new("a"));
        assert_eq!(session.pending_reads(), 1);

        session.disconnect();

        assert!(matches!(rx.await, Ok(Err(ClientError::Cancelled))));
        assert_eq!(session.pending_reads(), 0);
        let stats = session.metrics.snapshot();
        assert_eq!(stats.sends_cancelled, 1);
        assert_eq!(stats.sends_pending(), 0);
        assert!(!session.reconnect_enabled);
        session.schedule_reconnect();
        assert!(session.reconnect_at.is_none());
    }

    #[tokio::test]
    async fn test_fetch_size_is_clamped() {
        let mut session = Session::new(
            ClientConfig {
                max_size: 100,
                auto_connect_on_write: false,
                ..ClientConfig::default()
            },
            1,
            EventBus::new(),
            Arc::new(ClientMetrics::new()),
        );
        session.fetch(FetchRequest::new("t").max_size(5000));
        assert_eq!(
            session.decoder.requests().head(),
            Some(&ReadRequest::Fetch(FetchRequest::new("t").max_size(100)))
        );
    }
}
