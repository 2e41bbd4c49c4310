//! In-process mock broker for integration tests

#![allow(dead_code)]

use std::time::Duration;

use bytes::BytesMut;
use kafka_lite_client::testing::{parse_request, split_frame, WireRequest};
use kafka_lite_client::{ClientConfig, ClientConfigBuilder, ClientEvent, EventStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub struct MockBroker {
    listener: TcpListener,
    port: u16,
}

impl MockBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    /// Client settings pointing at this broker with a short reconnect delay
    pub fn config(&self) -> ClientConfig {
        ClientConfigBuilder::new()
            .host("127.0.0.1")
            .port(self.port)
            .reconnect_interval(Duration::from_millis(50))
            .build()
    }

    pub fn address(&self) -> String {
        format!("kafka://127.0.0.1:{}", self.port)
    }

    pub async fn accept(&self) -> BrokerConn {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("no connection within timeout")
            .unwrap();
        BrokerConn {
            stream,
            buf: BytesMut::new(),
        }
    }
}

/// Broker side of one accepted connection
pub struct BrokerConn {
    stream: TcpStream,
    buf: BytesMut,
}

impl BrokerConn {
    /// Next request frame, or `None` if nothing arrives within `wait` or the
    /// client closed the socket
    pub async fn try_next_request(&mut self, wait: Duration) -> Option<WireRequest> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(frame) = split_frame(&mut self.buf) {
                return Some(parse_request(&frame).unwrap());
            }
            match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return None,
                Ok(Ok(_)) => {}
            }
        }
    }

    pub async fn next_request(&mut self) -> WireRequest {
        self.try_next_request(WAIT)
            .await
            .expect("no request within timeout")
    }

    pub async fn reply(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Write `bytes` in pieces, pausing between them so they arrive as
    /// separate reads
    pub async fn reply_chunked(&mut self, bytes: &[u8], chunk: usize) {
        for piece in bytes.chunks(chunk) {
            self.stream.write_all(piece).await.unwrap();
            self.stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Wait for the client to close its end
    pub async fn closed(&mut self) -> bool {
        let mut scratch = vec![0u8; 64 * 1024];
        loop {
            match timeout(WAIT, self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => {}
                Err(_) => return false,
            }
        }
    }
}

/// Next event satisfying `pred`, skipping others
pub async fn next_event<F>(events: &mut EventStream, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("no matching event within timeout")
}

/// Events up to and including the first one satisfying `pred`
pub async fn events_until<F>(events: &mut EventStream, mut pred: F) -> Vec<ClientEvent>
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.expect("event stream ended");
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    })
    .await
    .expect("no matching event within timeout")
}
