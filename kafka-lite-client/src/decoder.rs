//! Resumable response decoder
//!
//! Responses share one layout: a u32 length of everything that follows, an
//! i16 error code, then a body whose shape depends on the request at the head
//! of the [`RequestQueue`]:
//!
//! * fetch: repeated `u32 length · u8 magic · [u8 compression] · u32 crc · payload`
//! * offsets: `u32 count · u64 offset*`
//!
//! TCP delivers these in arbitrary pieces. The decoder keeps every partial
//! field in [`ResponseDecoder`] itself, so it can stop at any byte and pick up
//! again with the next read. Event output does not depend on how the input
//! was split.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

use crate::error::{ClientError, ErrorCode};
use crate::event::ClientEvent;
use crate::protocol::{
    FetchRequest, Offset, PartitionId, ReadRequest, RequestKind, TopicName, MAGIC_COMPRESSED,
    MAGIC_UNCOMPRESSED, MESSAGE_HEADER_LEN,
};
use crate::queue::RequestQueue;

/// Output of the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Event(ClientEvent),
    /// A fetch response filled the whole fetch size, so the topic may hold
    /// more. A continuation fetch from `offset` was queued.
    Resumed { topic: TopicName, offset: Offset },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length,
    ErrorCode,
    MessageLength,
    Magic,
    Compression,
    Checksum,
    Payload,
    OffsetCount,
    OffsetValue,
    /// Discard the rest of the response
    Skip,
}

/// Partially read big-endian integer
#[derive(Debug, Default)]
struct Field {
    value: u64,
    filled: usize,
}

impl Field {
    /// Feed at most `limit` bytes towards a `width`-byte field. Returns how
    /// many bytes were taken and the value once the field is complete.
    fn fill(&mut self, src: &mut BytesMut, width: usize, limit: usize) -> (usize, Option<u64>) {
        let n = (width - self.filled).min(src.len()).min(limit);
        for &byte in &src[..n] {
            self.value = (self.value << 8) | u64::from(byte);
        }
        src.advance(n);
        self.filled += n;

        if self.filled == width {
            let value = self.value;
            *self = Field::default();
            (n, Some(value))
        } else {
            (n, None)
        }
    }

    fn is_empty(&self) -> bool {
        self.filled == 0
    }
}

/// Stateful decoder for the response stream of one connection
#[derive(Debug)]
pub struct ResponseDecoder {
    requests: RequestQueue,
    ready: VecDeque<Decoded>,
    state: State,
    field: Field,
    /// Receive buffer for payloads split across reads
    buffer: BytesMut,
    max_size: usize,
    verify_checksums: bool,

    // Per-response progress
    response_len: usize,
    remaining: usize,
    error: i16,
    failed: bool,
    message_len: usize,
    message_remaining: usize,
    payload_len: usize,
    checksum: u32,
    original_offset: Offset,
    /// Offset at which the message being parsed starts
    last_offset: Offset,
    /// Offset after the last complete message, or the last offset read
    cursor: Offset,
}

impl ResponseDecoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            requests: RequestQueue::new(),
            ready: VecDeque::new(),
            state: State::Length,
            field: Field::default(),
            buffer: BytesMut::with_capacity(max_size),
            max_size,
            verify_checksums: false,
            response_len: 0,
            remaining: 0,
            error: 0,
            failed: false,
            message_len: 0,
            message_remaining: 0,
            payload_len: 0,
            checksum: 0,
            original_offset: 0,
            last_offset: 0,
            cursor: 0,
        }
    }

    pub fn with_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn requests(&self) -> &RequestQueue {
        &self.requests
    }

    pub fn requests_mut(&mut self) -> &mut RequestQueue {
        &mut self.requests
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Whether a response is partially decoded
    pub fn in_response(&self) -> bool {
        self.state != State::Length || !self.field.is_empty()
    }

    /// Drop partial-response state after the socket went away. A fetch that
    /// was cut short keeps the progress of its complete messages, so the
    /// re-issued request does not deliver them twice.
    pub fn reset(&mut self) {
        if self.state != State::Length {
            if let Some(ReadRequest::Fetch(request)) = self.requests.head_mut() {
                request.offset = self.cursor;
            }
        }
        self.ready.clear();
        self.reset_response();
    }

    fn reset_response(&mut self) {
        self.state = State::Length;
        self.field = Field::default();
        self.buffer.clear();
        self.response_len = 0;
        self.remaining = 0;
        self.error = 0;
        self.failed = false;
    }

    fn head_ident(&self) -> Option<(TopicName, PartitionId)> {
        self.requests
            .head()
            .map(|request| (request.topic().to_string(), request.partition()))
    }

    fn consume(&mut self, n: usize) {
        self.remaining -= n;
    }

    /// Read a body field, never past the end of the response
    fn field(&mut self, src: &mut BytesMut, width: usize) -> Option<u64> {
        let (n, value) = self.field.fill(src, width, self.remaining);
        self.consume(n);
        value
    }

    fn emit(&mut self, event: ClientEvent) {
        self.ready.push_back(Decoded::Event(event));
    }

    fn fetch_limit(&self, request: &FetchRequest) -> usize {
        request
            .max_size
            .map(|size| size as usize)
            .unwrap_or(self.max_size)
    }

    /// Whether the current response filled the whole fetch size of its request
    fn size_limited(&self) -> bool {
        match self.requests.head() {
            Some(ReadRequest::Fetch(request)) => self.response_len >= self.fetch_limit(request),
            _ => false,
        }
    }

    fn describe(&self, topic: &str, partition: PartitionId, what: &str) -> String {
        format!(
            "{} for topic: {}, partition: {}, original_offset: {}, last_offset: {}",
            what, topic, partition, self.original_offset, self.last_offset
        )
    }

    fn parse_error(&mut self, topic: TopicName, partition: PartitionId, description: String) {
        warn!(%topic, partition, %description, "malformed response");
        self.emit(ClientEvent::ParseError {
            topic,
            partition,
            description,
        });
        self.failed = true;
        self.error = ErrorCode::InvalidMessage.code();
        self.state = State::Skip;
    }

    /// Report the response at the head of the queue as malformed and skip the rest
    fn fail(&mut self, what: &str) {
        match self.head_ident() {
            Some((topic, partition)) => {
                let description = self.describe(&topic, partition, what);
                self.parse_error(topic, partition, description);
            }
            None => self.state = State::Skip,
        }
    }

    fn step(&mut self, src: &mut BytesMut) {
        match self.state {
            State::Length => {
                if let (_, Some(len)) = self.field.fill(src, 4, usize::MAX) {
                    self.begin_response(len as usize);
                }
            }
            State::ErrorCode => {
                if let Some(code) = self.field(src, 2) {
                    self.error = code as u16 as i16;
                    let kind = self.requests.head().map(ReadRequest::kind);
                    if self.error != 0 {
                        if let Some((topic, partition)) = self.head_ident() {
                            let error = ErrorCode::from(self.error);
                            warn!(%topic, partition, code = self.error, name = error.name(), "broker returned error");
                            self.emit(ClientEvent::MessageError {
                                topic,
                                partition,
                                code: self.error,
                                name: error.name(),
                            });
                        }
                    }
                    self.state = match kind {
                        Some(RequestKind::Fetch) => State::MessageLength,
                        Some(RequestKind::Offsets) => State::OffsetCount,
                        _ => State::Skip,
                    };
                }
            }
            State::MessageLength => {
                if self.field.is_empty() {
                    self.last_offset = self.cursor;
                }
                if let Some(len) = self.field(src, 4) {
                    let len = len as usize;
                    if len > self.remaining {
                        if self.size_limited() {
                            // Trailing message cut off by the fetch size
                            self.state = State::Skip;
                        } else {
                            let what =
                                format!("unexpected message len {} > {}", len, self.remaining);
                            self.fail(&what);
                        }
                    } else if len < MESSAGE_HEADER_LEN {
                        self.fail(&format!("message len {} shorter than its header", len));
                    } else {
                        self.message_len = len;
                        self.message_remaining = len;
                        self.state = State::Magic;
                    }
                }
            }
            State::Magic => {
                if let Some(magic) = self.field(src, 1) {
                    self.message_remaining -= 1;
                    match magic as u8 {
                        MAGIC_UNCOMPRESSED => self.state = State::Checksum,
                        MAGIC_COMPRESSED if self.message_remaining >= MESSAGE_HEADER_LEN => {
                            self.state = State::Compression
                        }
                        MAGIC_COMPRESSED => {
                            let what = format!(
                                "message len {} shorter than its header",
                                self.message_len
                            );
                            self.fail(&what);
                        }
                        other => self.fail(&format!(
                            "unexpected message format - bad magic value {}",
                            other
                        )),
                    }
                }
            }
            State::Compression => {
                if let Some(compression) = self.field(src, 1) {
                    self.message_remaining -= 1;
                    if compression != 0 {
                        self.fail(&format!(
                            "unexpected message format - bad compression flag {}",
                            compression
                        ));
                    } else {
                        self.state = State::Checksum;
                    }
                }
            }
            State::Checksum => {
                if let Some(checksum) = self.field(src, 4) {
                    self.message_remaining -= 4;
                    self.checksum = checksum as u32;
                    self.payload_len = self.message_remaining;
                    if self.payload_len > self.max_size {
                        let what = format!(
                            "message payload of {} bytes exceeds the {} byte receive buffer",
                            self.payload_len, self.max_size
                        );
                        self.fail(&what);
                    } else if self.payload_len == 0 {
                        self.complete_message(Bytes::new());
                    } else {
                        self.state = State::Payload;
                    }
                }
            }
            State::Payload => {
                let available = src.len().min(self.remaining);
                if self.buffer.is_empty() && available >= self.payload_len {
                    // Whole payload in this read: hand out a slice of it
                    let payload = src.split_to(self.payload_len).freeze();
                    self.consume(self.payload_len);
                    self.complete_message(payload);
                } else {
                    let n = (self.payload_len - self.buffer.len()).min(available);
                    self.buffer.reserve(self.payload_len - self.buffer.len());
                    self.buffer.extend_from_slice(&src[..n]);
                    src.advance(n);
                    self.consume(n);
                    if self.buffer.len() == self.payload_len {
                        let payload = self.buffer.split().freeze();
                        self.complete_message(payload);
                    }
                }
            }
            State::OffsetCount => {
                // Informational only; values run to the end of the response
                if self.field(src, 4).is_some() {
                    self.state = State::OffsetValue;
                }
            }
            State::OffsetValue => {
                if let Some(value) = self.field(src, 8) {
                    self.cursor = value;
                    if let Some((topic, _)) = self.head_ident() {
                        self.emit(ClientEvent::Offset { topic, value });
                    }
                }
            }
            State::Skip => {
                let n = src.len().min(self.remaining);
                src.advance(n);
                self.consume(n);
            }
        }

        if self.state != State::Length && self.remaining == 0 {
            self.finish();
        }
    }

    fn begin_response(&mut self, len: usize) {
        self.response_len = 4 + len;
        self.remaining = len;
        self.error = 0;
        self.failed = false;

        match self.requests.head() {
            Some(ReadRequest::Fetch(request)) => {
                self.original_offset = request.offset;
                self.last_offset = request.offset;
                self.cursor = request.offset;
            }
            Some(ReadRequest::Offsets(_)) => {
                self.original_offset = 0;
                self.last_offset = 0;
                self.cursor = 0;
            }
            None => {
                warn!(len, "response with no pending request; skipping");
                self.state = State::Skip;
                return;
            }
        }

        if len < 2 {
            self.fail(&format!("response len {} too short for an error code", len));
        } else {
            self.state = State::ErrorCode;
        }
    }

    fn complete_message(&mut self, payload: Bytes) {
        if self.verify_checksums {
            let actual = crc32fast::hash(&payload);
            if actual != self.checksum {
                let what = format!(
                    "checksum mismatch: expected {:#010x}, computed {:#010x}",
                    self.checksum, actual
                );
                self.fail(&what);
                return;
            }
        }

        let Some(next) = self
            .last_offset
            .checked_add(4 + self.message_len as u64)
        else {
            self.fail("message offset overflows 64 bits");
            return;
        };
        self.cursor = next;
        self.state = State::MessageLength;
        if let Some((topic, _)) = self.head_ident() {
            self.emit(ClientEvent::Message {
                topic,
                payload,
                offset: self.cursor,
            });
        }
    }

    /// The response is fully consumed: retire the head request
    fn finish(&mut self) {
        let size_limited = self.size_limited();
        let at_boundary = self.field.is_empty()
            && matches!(self.state, State::MessageLength | State::OffsetValue | State::OffsetCount);

        let Some(request) = self.requests.pop() else {
            self.reset_response();
            return;
        };

        match request {
            ReadRequest::Fetch(request) => {
                if !self.failed && self.error == 0 && size_limited {
                    if self.cursor == request.offset {
                        let what = format!(
                            "message at offset {} does not fit in a {} byte fetch",
                            request.offset,
                            self.fetch_limit(&request)
                        );
                        let description = self.describe(&request.topic, request.partition, &what);
                        self.parse_error(request.topic.clone(), request.partition, description);
                    } else {
                        // Resume where the last complete message ended
                        debug!(topic = %request.topic, offset = self.cursor, "fetch filled; continuing");
                        let next = FetchRequest {
                            offset: self.cursor,
                            ..request
                        };
                        self.ready.push_back(Decoded::Resumed {
                            topic: next.topic.clone(),
                            offset: next.offset,
                        });
                        self.requests.push(ReadRequest::Fetch(next));
                        self.reset_response();
                        return;
                    }
                } else if !self.failed && !at_boundary {
                    let description = self.describe(
                        &request.topic,
                        request.partition,
                        "response ended mid-message",
                    );
                    self.parse_error(request.topic.clone(), request.partition, description);
                }

                debug!(topic = %request.topic, offset = self.cursor, "fetch round drained");
                self.emit(ClientEvent::last_message(
                    request.topic,
                    self.cursor,
                    self.error,
                ));
            }
            ReadRequest::Offsets(request) => {
                if !self.failed && !at_boundary {
                    let description = self.describe(
                        &request.topic,
                        request.partition,
                        "response ended mid-offset",
                    );
                    self.parse_error(request.topic.clone(), request.partition, description);
                }
                self.emit(ClientEvent::last_offset(
                    request.topic,
                    self.cursor,
                    self.error,
                ));
            }
        }

        self.reset_response();
    }
}

impl Decoder for ResponseDecoder {
    type Item = Decoded;
    type Error = ClientError;

    /// Consumes as much of `src` as it can. Returns `Ok(None)` only once
    /// `src` is empty; protocol faults are reported as events, never as `Err`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let Some(decoded) = self.ready.pop_front() {
                return Ok(Some(decoded));
            }
            if src.is_empty() {
                return Ok(None);
            }
            if !self.in_response() && self.requests.is_empty() {
                warn!(bytes = src.len(), "discarding bytes with no pending request");
                src.clear();
                return Ok(None);
            }
            self.step(src);
        }
    }
}
