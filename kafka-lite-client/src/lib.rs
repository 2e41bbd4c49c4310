//! # Kafka Lite Client Library
//!
//! An async Rust client for brokers speaking the length-prefixed Kafka 0.7
//! wire protocol: fetch, offsets lookup and produce over a single TCP
//! connection.
//!
//! ## Features
//!
//! - **Resumable decoding**: responses may arrive split at any byte
//! - **Zero-copy payloads**: messages are handed out as `bytes::Bytes`
//! - **Reconnecting producer**: bounded drop-oldest send queue
//! - **Polling consumer**: gated fetch rounds with offset resync on error
//! - **Typed events**: every notification is a [`ClientEvent`] on a `Stream`
//!
//! The protocol has no correlation identifiers. Responses are matched to
//! requests purely by order, so one connection must only ever carry requests
//! issued through one handle.
//!
//! ## Quick Start
//!
//! ### Producer Example
//!
//! ```rust,no_run
//! use kafka_lite_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let producer = Producer::new(Producer::builder().send_queue_length(1000).build())?;
//!     producer.connect().await?;
//!
//!     producer.send("my-topic", "Hello broker!")?.await?;
//!     println!("sent; stats: {:?}", producer.stats());
//!     Ok(())
//! }
//! ```
//!
//! ### Consumer Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use kafka_lite_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let consumer = Consumer::new(ConsumerConfig::default())?;
//!     let mut events = consumer.events();
//!     consumer.subscribe(Subscription::new("my-topic").offset(0))?;
//!
//!     while let Some(event) = events.next().await {
//!         if let ClientEvent::Message { payload, offset, .. } = event {
//!             println!("{} bytes, next offset {}", payload.len(), offset);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod decoder;
pub mod error;
pub mod event;
pub mod metrics;
pub mod producer;
pub mod protocol;
pub mod queue;
mod session;
pub mod testing;

pub use client::*;
pub use config::*;
pub use consumer::{Consumer, Subscription};
pub use decoder::{Decoded, ResponseDecoder};
pub use error::*;
pub use event::{ClientEvent, EventBus, EventStream, ListenerId};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use producer::{Delivery, Producer};
pub use protocol::{
    FetchRequest, Messages, Offset, OffsetTime, OffsetsRequest, PartitionId, ProduceRequest,
    ReadRequest, RequestEncoder, RequestKind, TopicName,
};

/// Client library result type
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
