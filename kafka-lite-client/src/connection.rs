//! Connection management for the Kafka lite client
//!
//! One [`Connection`] owns at most one socket. It reports lifecycle changes as
//! events and never retries on its own; reconnecting is up to the policy
//! driving the session.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::{self, BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::event::ClientEvent;

/// Initial capacity of the socket read buffer
const READ_BUFFER_SIZE: usize = 64 * 1024;

enum SocketState {
    Disconnected,
    Connecting(BoxFuture<'static, io::Result<TcpStream>>),
    Connected {
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
    },
}

/// What the socket did while the session was waiting on it
#[derive(Debug)]
pub(crate) enum Activity {
    Connected(TcpStream),
    ConnectFailed(io::Error),
    /// Bytes were appended to the read buffer
    Data(usize),
    Eof,
    ReadFailed(io::Error),
    /// Part of the outgoing frame reached the socket
    Written(usize),
    WriteFailed(io::Error),
}

/// A single broker connection
pub struct Connection {
    host: String,
    port: u16,
    address: String,
    connect_timeout: Option<Duration>,
    state: SocketState,
    read_buf: BytesMut,
    /// Unwritten remainder of the frame being written
    outgoing: Bytes,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            SocketState::Disconnected => "disconnected",
            SocketState::Connecting(_) => "connecting",
            SocketState::Connected { .. } => "connected",
        };
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("state", &state)
            .field("outgoing", &self.outgoing.len())
            .finish()
    }
}

impl Connection {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            address: config.address(),
            connect_timeout: config.connect_timeout,
            state: SocketState::Disconnected,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            outgoing: Bytes::new(),
        }
    }

    /// Address in `kafka://host:port` form
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.state, SocketState::Connecting(_))
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, SocketState::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self.state, SocketState::Disconnected)
    }

    /// Start opening the socket. Calling this while connecting or connected
    /// is a caller bug and fails without touching the live socket.
    pub(crate) fn connect(&mut self, out: &mut VecDeque<ClientEvent>) -> Result<(), ClientError> {
        if !self.is_disconnected() {
            error!(address = %self.address, "connect called on a live connection");
            return Err(ClientError::AlreadyConnected {
                address: self.address.clone(),
            });
        }

        let target = format!("{}:{}", self.host, self.port);
        let limit = self.connect_timeout;
        let connecting = async move {
            match limit {
                Some(limit) => timeout(limit, TcpStream::connect(target))
                    .await
                    .map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("connect timed out after {}ms", limit.as_millis()),
                        )
                    })?,
                None => TcpStream::connect(target).await,
            }
        }
        .boxed();

        info!(address = %self.address, "Connecting to broker");
        self.state = SocketState::Connecting(connecting);
        out.push_back(ClientEvent::Connecting {
            address: self.address.clone(),
        });
        Ok(())
    }

    /// Wait for the socket to make progress. Pending forever while
    /// disconnected. Reads and the outgoing frame are driven together, so a
    /// peer that stops reading never holds up incoming data.
    ///
    /// Safe to cancel: an interrupted connect, read or write resumes on the
    /// next call, and the outgoing frame only advances by what was written.
    pub(crate) async fn activity(&mut self) -> Activity {
        match &mut self.state {
            SocketState::Disconnected => future::pending().await,
            SocketState::Connecting(connecting) => match connecting.await {
                Ok(stream) => Activity::Connected(stream),
                Err(e) => Activity::ConnectFailed(e),
            },
            SocketState::Connected { reader, writer } => {
                let writing = !self.outgoing.is_empty();
                tokio::select! {
                    read = reader.read_buf(&mut self.read_buf) => match read {
                        Ok(0) => Activity::Eof,
                        Ok(n) => Activity::Data(n),
                        Err(e) => Activity::ReadFailed(e),
                    },
                    written = writer.write_buf(&mut self.outgoing), if writing => match written {
                        Ok(0) => Activity::WriteFailed(io::ErrorKind::WriteZero.into()),
                        Ok(n) => Activity::Written(n),
                        Err(e) => Activity::WriteFailed(e),
                    },
                }
            }
        }
    }

    /// Adopt the socket produced by a finished connect
    pub(crate) fn established(&mut self, stream: TcpStream, out: &mut VecDeque<ClientEvent>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(address = %self.address, error = %e, "Failed to set TCP_NODELAY");
        }
        info!(address = %self.address, "Connected to broker");
        let (reader, writer) = stream.into_split();
        self.state = SocketState::Connected { reader, writer };
        out.push_back(ClientEvent::Connected {
            address: self.address.clone(),
        });
    }

    /// Report a socket failure; the caller closes afterwards
    pub(crate) fn failed(&self, error: &io::Error, out: &mut VecDeque<ClientEvent>) {
        warn!(address = %self.address, error = %error, "Connection error");
        out.push_back(ClientEvent::ConnectionError {
            address: self.address.clone(),
            error: error.to_string(),
        });
    }

    /// Report that the broker closed the socket; the caller closes afterwards
    pub(crate) fn ended(&self, out: &mut VecDeque<ClientEvent>) {
        info!(address = %self.address, "Broker closed the connection");
        out.push_back(ClientEvent::Disconnected {
            address: self.address.clone(),
        });
    }

    /// Tear down the socket. Returns whether there was one to tear down.
    pub(crate) fn close(&mut self, out: &mut VecDeque<ClientEvent>) -> bool {
        if self.is_disconnected() {
            return false;
        }
        self.state = SocketState::Disconnected;
        self.read_buf.clear();
        self.outgoing.clear();
        debug!(address = %self.address, "Connection closed");
        out.push_back(ClientEvent::Closed {
            address: self.address.clone(),
        });
        true
    }

    /// Hand a frame to the socket. Only one frame is outstanding at a time;
    /// [`Connection::is_writing`] turns false once all of it is written.
    pub(crate) fn start_write(&mut self, frame: Bytes) -> io::Result<()> {
        if !self.is_connected() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket is not connected",
            ));
        }
        if self.is_writing() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "a frame is already being written",
            ));
        }
        self.outgoing = frame;
        Ok(())
    }

    pub(crate) fn is_writing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub(crate) fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfigBuilder;
    use tokio::net::TcpListener;

    async fn listener_config() -> (TcpListener, ClientConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ClientConfigBuilder::new()
            .host("127.0.0.1")
            .port(port)
            .build();
        (listener, config)
    }

    #[tokio::test]
    async fn test_connect_lifecycle() {
        let (listener, config) = listener_config().await;
        let mut connection = Connection::new(&config);
        let mut events = VecDeque::new();

        connection.connect(&mut events).unwrap();
        assert!(connection.is_connecting());

        let (accepted, activity) = tokio::join!(listener.accept(), connection.activity());
        let (mut peer, _) = accepted.unwrap();
        match activity {
            Activity::Connected(stream) => connection.established(stream, &mut events),
            other => panic!("unexpected activity {:?}", other),
        }
        assert!(connection.is_connected());

        peer.write_all(b"abc").await.unwrap();
        assert!(matches!(connection.activity().await, Activity::Data(3)));
        assert_eq!(&connection.read_buf_mut()[..], b"abc");

        drop(peer);
        assert!(matches!(connection.activity().await, Activity::Eof));
        connection.ended(&mut events);
        assert!(connection.close(&mut events));
        assert!(!connection.close(&mut events));

        let address = config.address();
        assert_eq!(
            events,
            VecDeque::from(vec![
                ClientEvent::Connecting {
                    address: address.clone()
                },
                ClientEvent::Connected {
                    address: address.clone()
                },
                ClientEvent::Disconnected {
                    address: address.clone()
                },
                ClientEvent::Closed { address },
            ])
        );
    }

    #[tokio::test]
    async fn test_double_connect_is_rejected() {
        let (_listener, config) = listener_config().await;
        let mut connection = Connection::new(&config);
        let mut events = VecDeque::new();

        connection.connect(&mut events).unwrap();
        let err = connection.connect(&mut events).unwrap_err();
        assert!(matches!(err, ClientError::AlreadyConnected { .. }));
        assert!(connection.is_connecting());
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_write_while_disconnected() {
        let config = ClientConfig::default();
        let mut connection = Connection::new(&config);
        let err = connection
            .start_write(Bytes::from_static(b"x"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_reads_continue_while_write_is_stuck() {
        let (listener, config) = listener_config().await;
        let mut connection = Connection::new(&config);
        let mut events = VecDeque::new();

        connection.connect(&mut events).unwrap();
        let (accepted, activity) = tokio::join!(listener.accept(), connection.activity());
        let (mut peer, _) = accepted.unwrap();
        match activity {
            Activity::Connected(stream) => connection.established(stream, &mut events),
            other => panic!("unexpected activity {:?}", other),
        }

        // Far more than the socket buffers hold while the peer is not reading
        connection
            .start_write(Bytes::from(vec![0u8; 64 * 1024 * 1024]))
            .unwrap();
        assert!(connection
            .start_write(Bytes::from_static(b"second"))
            .is_err());
        loop {
            match timeout(Duration::from_millis(200), connection.activity()).await {
                Ok(Activity::Written(_)) => continue,
                Ok(other) => panic!("unexpected activity {:?}", other),
                Err(_) => break,
            }
        }
        assert!(connection.is_writing());

        peer.write_all(b"abc").await.unwrap();
        assert!(matches!(connection.activity().await, Activity::Data(3)));

        assert!(connection.close(&mut events));
        assert!(!connection.is_writing());
    }
}
