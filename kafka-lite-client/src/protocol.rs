//! Request types and wire encoding for the length-prefixed broker protocol
//!
//! Every frame starts with a big-endian u32 holding the length of the rest of
//! the frame, followed by a u16 request type. The protocol has no correlation
//! identifiers: responses arrive in the order requests were written.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Encoder;

use crate::error::ClientError;

pub type TopicName = String;
pub type PartitionId = u32;
pub type Offset = u64;

/// Request type identifiers
pub const PRODUCE_REQUEST: u16 = 0;
pub const FETCH_REQUEST: u16 = 1;
pub const OFFSETS_REQUEST: u16 = 4;

/// Magic byte for uncompressed, checksummed messages
pub const MAGIC_UNCOMPRESSED: u8 = 0;
/// Magic byte for messages carrying a compression attribute
pub const MAGIC_COMPRESSED: u8 = 1;

/// Bytes preceding the payload of a magic-0 message: magic + checksum
pub const MESSAGE_HEADER_LEN: usize = 1 + 4;

/// The kinds of request this client issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Fetch,
    Offsets,
    Produce,
}

impl RequestKind {
    /// Request type written after the frame length
    pub fn type_id(self) -> u16 {
        match self {
            RequestKind::Fetch => FETCH_REQUEST,
            RequestKind::Offsets => OFFSETS_REQUEST,
            RequestKind::Produce => PRODUCE_REQUEST,
        }
    }
}

/// Time selector of an offsets lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetTime {
    /// Offset after the newest message
    #[default]
    Latest,
    /// Oldest offset still held by the broker
    Earliest,
    /// Offsets of segments written before this time (milliseconds since epoch)
    Before(i64),
}

impl OffsetTime {
    pub fn as_i64(self) -> i64 {
        match self {
            OffsetTime::Latest => -1,
            OffsetTime::Earliest => -2,
            OffsetTime::Before(millis) => millis,
        }
    }
}

/// Read messages from a topic partition starting at an offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
    /// Upper bound on response size; `None` uses the receive buffer capacity
    pub max_size: Option<u32>,
}

impl FetchRequest {
    pub fn new<T: Into<TopicName>>(topic: T) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            max_size: None,
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

    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

/// Look up valid offsets of a topic partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetsRequest {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub time: OffsetTime,
    pub max_offsets: u32,
}

impl OffsetsRequest {
    pub fn new<T: Into<TopicName>>(topic: T) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            time: OffsetTime::Latest,
            max_offsets: 1,
        }
    }

    pub fn partition(mut self, partition: PartitionId) -> Self {
        self.partition = partition;
        self
    }

    pub fn time(mut self, time: OffsetTime) -> Self {
        self.time = time;
        self
    }

    pub fn max_offsets(mut self, max_offsets: u32) -> Self {
        self.max_offsets = max_offsets;
        self
    }
}

/// A list of message bodies; a single body converts to a one-element list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Messages(pub Vec<Bytes>);

impl Messages {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Bytes> {
        self.0.iter()
    }
}

impl From<Bytes> for Messages {
    fn from(message: Bytes) -> Self {
        Messages(vec![message])
    }
}

impl From<&'static str> for Messages {
    fn from(message: &'static str) -> Self {
        Messages(vec![Bytes::from_static(message.as_bytes())])
    }
}

impl From<String> for Messages {
    fn from(message: String) -> Self {
        Messages(vec![Bytes::from(message)])
    }
}

impl From<Vec<u8>> for Messages {
    fn from(message: Vec<u8>) -> Self {
        Messages(vec![Bytes::from(message)])
    }
}

impl From<Vec<Bytes>> for Messages {
    fn from(messages: Vec<Bytes>) -> Self {
        Messages(messages)
    }
}

impl From<Vec<String>> for Messages {
    fn from(messages: Vec<String>) -> Self {
        Messages(messages.into_iter().map(Bytes::from).collect())
    }
}

impl From<Vec<&'static str>> for Messages {
    fn from(messages: Vec<&'static str>) -> Self {
        Messages(
            messages
                .into_iter()
                .map(|m| Bytes::from_static(m.as_bytes()))
                .collect(),
        )
    }
}

/// Append messages to a topic partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRequest {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub messages: Messages,
}

impl ProduceRequest {
    pub fn new<T: Into<TopicName>, M: Into<Messages>>(topic: T, messages: M) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            messages: messages.into(),
        }
    }

    pub fn partition(mut self, partition: PartitionId) -> Self {
        self.partition = partition;
        self
    }
}

/// A request that expects a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadRequest {
    Fetch(FetchRequest),
    Offsets(OffsetsRequest),
}

impl ReadRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            ReadRequest::Fetch(_) => RequestKind::Fetch,
            ReadRequest::Offsets(_) => RequestKind::Offsets,
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            ReadRequest::Fetch(req) => &req.topic,
            ReadRequest::Offsets(req) => &req.topic,
        }
    }

    pub fn partition(&self) -> PartitionId {
        match self {
            ReadRequest::Fetch(req) => req.partition,
            ReadRequest::Offsets(req) => req.partition,
        }
    }
}

/// Stateless request encoder. The only parameter is the fetch size used when
/// a fetch does not name its own.
#[derive(Debug, Clone, Copy)]
pub struct RequestEncoder {
    default_max_size: u32,
}

impl RequestEncoder {
    pub fn new(default_max_size: u32) -> Self {
        Self { default_max_size }
    }

    /// Encode a request into a standalone frame
    pub fn frame<T>(&mut self, item: T) -> Result<Bytes, ClientError>
    where
        Self: Encoder<T, Error = ClientError>,
    {
        let mut buf = BytesMut::new();
        self.encode(item, &mut buf)?;
        Ok(buf.freeze())
    }
}

fn topic_len(topic: &str) -> Result<u16, ClientError> {
    u16::try_from(topic.len()).map_err(|_| {
        ClientError::protocol(format!(
            "topic name of {} bytes exceeds the 16-bit length field",
            topic.len()
        ))
    })
}

/// Check that a topic name fits the 16-bit length field
pub fn validate_topic(topic: &str) -> Result<(), ClientError> {
    topic_len(topic).map(|_| ())
}

/// Write one message: u32 length, magic 0, CRC32 of the body, body
pub fn put_message(dst: &mut BytesMut, body: &[u8]) {
    dst.put_u32((MESSAGE_HEADER_LEN + body.len()) as u32);
    dst.put_u8(MAGIC_UNCOMPRESSED);
    dst.put_u32(crc32fast::hash(body));
    dst.put_slice(body);
}

impl Encoder<&FetchRequest> for RequestEncoder {
    type Error = ClientError;

    fn encode(&mut self, item: &FetchRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let name_len = topic_len(&item.topic)?;
        let body_len = 2 + 2 + item.topic.len() + 4 + 8 + 4;

        dst.reserve(4 + body_len);
        dst.put_u32(body_len as u32);
        dst.put_u16(RequestKind::Fetch.type_id());
        dst.put_u16(name_len);
        dst.put_slice(item.topic.as_bytes());
        dst.put_u32(item.partition);
        dst.put_u64(item.offset);
        dst.put_u32(item.max_size.unwrap_or(self.default_max_size));
        Ok(())
    }
}

impl Encoder<&OffsetsRequest> for RequestEncoder {
    type Error = ClientError;

    fn encode(&mut self, item: &OffsetsRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let name_len = topic_len(&item.topic)?;
        let body_len = 2 + 2 + item.topic.len() + 4 + 8 + 4;

        dst.reserve(4 + body_len);
        dst.put_u32(body_len as u32);
        dst.put_u16(RequestKind::Offsets.type_id());
        dst.put_u16(name_len);
        dst.put_slice(item.topic.as_bytes());
        dst.put_u32(item.partition);
        dst.put_i64(item.time.as_i64());
        dst.put_u32(item.max_offsets);
        Ok(())
    }
}

impl Encoder<&ProduceRequest> for RequestEncoder {
    type Error = ClientError;

    fn encode(&mut self, item: &ProduceRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let name_len = topic_len(&item.topic)?;
        let payload_len: usize = item
            .messages
            .iter()
            .map(|m| 4 + MESSAGE_HEADER_LEN + m.len())
            .sum();
        let body_len = 2 + 2 + item.topic.len() + 4 + 4 + payload_len;
        let frame_len = u32::try_from(body_len).map_err(|_| ClientError::MessageTooLarge {
            size: body_len,
            max_size: u32::MAX as usize,
        })?;

        dst.reserve(4 + body_len);
        dst.put_u32(frame_len);
        dst.put_u16(RequestKind::Produce.type_id());
        dst.put_u16(name_len);
        dst.put_slice(item.topic.as_bytes());
        dst.put_u32(item.partition);
        dst.put_u32(payload_len as u32);
        for message in item.messages.iter() {
            put_message(dst, message);
        }
        Ok(())
    }
}

impl Encoder<&ReadRequest> for RequestEncoder {
    type Error = ClientError;

    fn encode(&mut self, item: &ReadRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            ReadRequest::Fetch(req) => self.encode(req, dst),
            ReadRequest::Offsets(req) => self.encode(req, dst),
        }
    }
}
