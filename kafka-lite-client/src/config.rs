//! Configuration types for the Kafka lite client

use std::time::Duration;

use crate::error::ClientError;
use crate::protocol::OffsetTime;

/// Default broker host
pub const DEFAULT_HOST: &str = "localhost";
/// Default broker port
pub const DEFAULT_PORT: u16 = 9092;
/// Default receive buffer capacity and fetch size (1 MiB)
pub const DEFAULT_MAX_SIZE: usize = 1024 * 1024;

/// Connection and decoding options shared by every client flavour
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker host name or address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Receive buffer capacity; also the default fetch size
    pub max_size: usize,
    /// Open the socket on demand when a request is issued while disconnected
    pub auto_connect_on_write: bool,
    /// Delay before reconnecting after the socket closes; `None` disables
    /// reconnection. Only the producer and consumer act on it.
    pub reconnect_interval: Option<Duration>,
    /// Upper bound on TCP connect; `None` waits for the OS
    pub connect_timeout: Option<Duration>,
    /// Idle limit for an outstanding response; `None` waits indefinitely
    pub request_timeout: Option<Duration>,
    /// Check each message payload against its CRC32 while decoding
    pub verify_checksums: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_size: DEFAULT_MAX_SIZE,
            auto_connect_on_write: true,
            reconnect_interval: Some(Duration::from_millis(1000)),
            connect_timeout: Some(Duration::from_secs(30)),
            request_timeout: None,
            verify_checksums: false,
        }
    }
}

impl ClientConfig {
    /// Broker address in `kafka://host:port` form, as reported in events
    pub fn address(&self) -> String {
        format!("kafka://{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.max_size == 0 {
            return Err(ClientError::invalid_config("max_size must be non-zero"));
        }
        if self.max_size > u32::MAX as usize {
            return Err(ClientError::invalid_config(format!(
                "max_size {} does not fit the 32-bit fetch size field",
                self.max_size
            )));
        }
        if self.host.is_empty() {
            return Err(ClientError::invalid_config("host must not be empty"));
        }
        Ok(())
    }
}

/// Producer-specific configuration
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Base client configuration
    pub client_config: ClientConfig,
    /// Capacity of the outbound send queue; overflow evicts the oldest entry
    pub send_queue_length: usize,
    /// Maximum size of a single message body
    pub max_message_size: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_config: ClientConfig::default(),
            send_queue_length: 10_000,
            max_message_size: 1024 * 1024, // 1MB
        }
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Base client configuration
    pub client_config: ClientConfig,
    /// Minimum time between the starts of two polling rounds
    pub poll_interval: Duration,
    /// Which offset to look up when a topic is resynced after an error
    pub resync_position: OffsetTime,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client_config: ClientConfig::default(),
            poll_interval: Duration::from_millis(2000),
            resync_position: OffsetTime::Latest,
        }
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.config.max_size = max_size;
        self
    }

    pub fn auto_connect_on_write(mut self, enabled: bool) -> Self {
        self.config.auto_connect_on_write = enabled;
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect_interval = Some(interval);
        self
    }

    /// Signed form of the reconnect interval; a negative value disables
    /// reconnection.
    pub fn reconnect_interval_ms(mut self, millis: i64) -> Self {
        self.config.reconnect_interval = u64::try_from(millis).ok().map(Duration::from_millis);
        self
    }

    pub fn no_reconnect(mut self) -> Self {
        self.config.reconnect_interval = None;
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.config.verify_checksums = enabled;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Builder for ProducerConfig
#[derive(Debug, Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_config(mut self, client_config: ClientConfig) -> Self {
        self.config.client_config = client_config;
        self
    }

    pub fn send_queue_length(mut self, length: usize) -> Self {
        self.config.send_queue_length = length;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn build(self) -> ProducerConfig {
        self.config
    }
}

/// Builder for ConsumerConfig
#[derive(Debug, Default)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_config(mut self, client_config: ClientConfig) -> Self {
        self.config.client_config = client_config;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn resync_position(mut self, position: OffsetTime) -> Self {
        self.config.resync_position = position;
        self
    }

    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}
