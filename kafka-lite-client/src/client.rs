//! Low-level client: issue fetch and offsets requests, observe the results
//!
//! No reconnect and no polling happen here. A dropped connection stays down
//! until [`Client::connect`] is called again; queued requests are written
//! once it is back.

use std::convert::Infallible;

use crate::config::ClientConfig;
use crate::event::EventStream;
use crate::metrics::MetricsSnapshot;
use crate::protocol::{validate_topic, FetchRequest, OffsetsRequest};
use crate::session::{Command, Handle, Passive};
use crate::Result;

/// Handle to a single broker connection
#[derive(Clone)]
pub struct Client {
    handle: Handle<Infallible>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.handle.address())
            .finish()
    }
}

impl Client {
    /// Create a client. Must be called within a Tokio runtime; the socket is
    /// not opened until [`connect`](Self::connect) or, with
    /// `auto_connect_on_write`, the first request.
    pub fn new(mut config: ClientConfig) -> Result<Self> {
        config.reconnect_interval = None;
        let handle = Handle::spawn(config, 0, Passive)?;
        Ok(Self { handle })
    }

    /// Start connecting. Fails with `AlreadyConnected` if a socket is already
    /// open or opening; the outcome of the connect itself arrives as an event.
    pub async fn connect(&self) -> Result<()> {
        self.handle.connect().await
    }

    /// Close the socket, keeping queued requests for the next connection
    pub fn close(&self) -> Result<()> {
        self.handle.send(Command::Close)
    }

    /// Close the socket and discard every queued request
    pub fn disconnect(&self) -> Result<()> {
        self.handle.send(Command::Disconnect)
    }

    /// Queue a fetch. Messages arrive as `Message` events followed by one
    /// `LastMessage`; a fetch larger than the configured `max_size` is capped.
    pub fn fetch_topic(&self, request: FetchRequest) -> Result<()> {
        validate_topic(&request.topic)?;
        self.handle.send(Command::Fetch(request))
    }

    /// Queue an offsets lookup, answered by `Offset` events and one `LastOffset`
    pub fn fetch_offsets(&self, request: OffsetsRequest) -> Result<()> {
        validate_topic(&request.topic)?;
        self.handle.send(Command::Offsets(request))
    }

    /// Subscribe to this client's events
    pub fn events(&self) -> EventStream {
        self.handle.bus().subscribe()
    }

    pub fn stats(&self) -> MetricsSnapshot {
        self.handle.metrics().snapshot()
    }

    /// Broker address in `kafka://host:port` form
    pub fn address(&self) -> &str {
        self.handle.address()
    }
}
