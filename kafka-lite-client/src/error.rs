//! Error types for the Kafka lite client library

/// Main error type for client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Protocol-related errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// `connect` was called while a socket is already open or opening
    #[error("connect called twice for {address}")]
    AlreadyConnected { address: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Message too large
    #[error("Message size {size} exceeds maximum {max_size}")]
    MessageTooLarge { size: usize, max_size: usize },

    /// A queued send was evicted to make room for a newer one
    #[error("Send request dropped: send queue full")]
    Dropped,

    /// A queued request was cleared by an explicit disconnect
    #[error("Request cancelled by disconnect")]
    Cancelled,

    /// The session task behind a handle has exited
    #[error("Client session has shut down")]
    ClientShutdown,
}

impl ClientError {
    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io(_) | Self::Dropped)
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Error codes carried in the two-byte header of every broker response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No error
    NoError,
    /// Unknown server error
    Unknown,
    /// Requested offset is outside the range the broker holds
    OffsetOutOfRange,
    /// Message failed its checksum or format check
    InvalidMessage,
    /// Partition does not exist on this broker
    WrongPartition,
    /// Fetch size is invalid
    InvalidFetchSize,
}

impl ErrorCode {
    /// Wire value of this code
    pub fn code(self) -> i16 {
        match self {
            ErrorCode::NoError => 0,
            ErrorCode::Unknown => -1,
            ErrorCode::OffsetOutOfRange => 1,
            ErrorCode::InvalidMessage => 2,
            ErrorCode::WrongPartition => 3,
            ErrorCode::InvalidFetchSize => 4,
        }
    }

    /// Stable name reported alongside the numeric code in events
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::NoError => "NoError",
            ErrorCode::Unknown => "Unknown",
            ErrorCode::OffsetOutOfRange => "OffsetOutOfRange",
            ErrorCode::InvalidMessage => "InvalidMessage",
            ErrorCode::WrongPartition => "WrongPartition",
            ErrorCode::InvalidFetchSize => "InvalidFetchSize",
        }
    }

    pub fn is_error(self) -> bool {
        self != ErrorCode::NoError
    }
}

impl From<i16> for ErrorCode {
    fn from(code: i16) -> Self {
        match code {
            0 => ErrorCode::NoError,
            1 => ErrorCode::OffsetOutOfRange,
            2 => ErrorCode::InvalidMessage,
            3 => ErrorCode::WrongPartition,
            4 => ErrorCode::InvalidFetchSize,
            _ => ErrorCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(ErrorCode::from(0), ErrorCode::NoError);
        assert_eq!(ErrorCode::from(1), ErrorCode::OffsetOutOfRange);
        assert_eq!(ErrorCode::from(3), ErrorCode::WrongPartition);
        assert_eq!(ErrorCode::from(42), ErrorCode::Unknown);
        assert_eq!(ErrorCode::OffsetOutOfRange.code(), 1);
        assert_eq!(ErrorCode::from(-1).name(), "Unknown");
        assert!(!ErrorCode::NoError.is_error());
    }

    #[test]
    fn test_retryable() {
        let refused = ClientError::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(refused.is_retryable());
        assert!(refused.is_connection_error());
        assert!(ClientError::timeout(100).is_timeout());
        assert!(!ClientError::AlreadyConnected {
            address: "kafka://localhost:9092".into()
        }
        .is_retryable());
        assert!(!ClientError::protocol("bad magic").is_connection_error());
    }
}
