//! Broker-side wire helpers
//!
//! Encoders for the responses a broker sends and a parser for the requests
//! this client writes. Used by the crate's own tests and usable for mock
//! brokers in downstream tests.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ClientError;
use crate::protocol::{
    put_message, Offset, PartitionId, TopicName, FETCH_REQUEST, MAGIC_COMPRESSED,
    MAGIC_UNCOMPRESSED, OFFSETS_REQUEST, PRODUCE_REQUEST,
};

/// A request frame as a broker sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRequest {
    Fetch {
        topic: TopicName,
        partition: PartitionId,
        offset: Offset,
        max_size: u32,
    },
    Offsets {
        topic: TopicName,
        partition: PartitionId,
        time: i64,
        max_offsets: u32,
    },
    Produce {
        topic: TopicName,
        partition: PartitionId,
        messages: Vec<Bytes>,
    },
}

impl WireRequest {
    pub fn topic(&self) -> &str {
        match self {
            WireRequest::Fetch { topic, .. }
            | WireRequest::Offsets { topic, .. }
            | WireRequest::Produce { topic, .. } => topic,
        }
    }
}

/// Split one complete length-prefixed frame off the front of `buf`
pub fn split_frame(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return None;
    }
    Some(buf.split_to(4 + len).freeze())
}

fn need(frame: &Bytes, n: usize, what: &str) -> Result<(), ClientError> {
    if frame.remaining() < n {
        return Err(ClientError::protocol(format!(
            "frame truncated reading {}",
            what
        )));
    }
    Ok(())
}

fn get_topic(frame: &mut Bytes) -> Result<TopicName, ClientError> {
    need(frame, 2, "topic length")?;
    let len = frame.get_u16() as usize;
    need(frame, len, "topic")?;
    let topic = frame.split_to(len);
    String::from_utf8(topic.to_vec())
        .map_err(|_| ClientError::protocol("topic name is not UTF-8"))
}

/// Decode the message set of a produce request, checking each checksum
pub fn parse_message_set(mut set: Bytes) -> Result<Vec<Bytes>, ClientError> {
    let mut messages = Vec::new();
    while set.has_remaining() {
        need(&set, 4, "message length")?;
        let len = set.get_u32() as usize;
        need(&set, len, "message")?;
        let mut message = set.split_to(len);
        need(&message, 1, "magic")?;
        let magic = message.get_u8();
        if magic == MAGIC_COMPRESSED {
            need(&message, 1, "compression")?;
            message.advance(1);
        } else if magic != MAGIC_UNCOMPRESSED {
            return Err(ClientError::protocol(format!("bad magic {}", magic)));
        }
        need(&message, 4, "checksum")?;
        let checksum = message.get_u32();
        if crc32fast::hash(&message) != checksum {
            return Err(ClientError::protocol("checksum mismatch"));
        }
        messages.push(message);
    }
    Ok(messages)
}

/// Parse one complete request frame, length prefix included
pub fn parse_request(frame: &[u8]) -> Result<WireRequest, ClientError> {
    let mut frame = Bytes::copy_from_slice(frame);
    need(&frame, 4, "frame length")?;
    let len = frame.get_u32() as usize;
    if len != frame.remaining() {
        return Err(ClientError::protocol(format!(
            "frame length {} but {} bytes follow",
            len,
            frame.remaining()
        )));
    }

    need(&frame, 2, "request type")?;
    let kind = frame.get_u16();
    let topic = get_topic(&mut frame)?;
    need(&frame, 4, "partition")?;
    let partition = frame.get_u32();

    match kind {
        FETCH_REQUEST => {
            need(&frame, 12, "fetch body")?;
            Ok(WireRequest::Fetch {
                topic,
                partition,
                offset: frame.get_u64(),
                max_size: frame.get_u32(),
            })
        }
        OFFSETS_REQUEST => {
            need(&frame, 12, "offsets body")?;
            Ok(WireRequest::Offsets {
                topic,
                partition,
                time: frame.get_i64(),
                max_offsets: frame.get_u32(),
            })
        }
        PRODUCE_REQUEST => {
            need(&frame, 4, "payload length")?;
            let payload_len = frame.get_u32() as usize;
            need(&frame, payload_len, "payload")?;
            Ok(WireRequest::Produce {
                topic,
                partition,
                messages: parse_message_set(frame.split_to(payload_len))?,
            })
        }
        other => Err(ClientError::protocol(format!(
            "unknown request type {}",
            other
        ))),
    }
}

/// Concatenated magic-0 messages
pub fn message_set(messages: &[&[u8]]) -> BytesMut {
    let mut set = BytesMut::new();
    for body in messages {
        put_message(&mut set, body);
    }
    set
}

/// A single magic-1 message with the given compression attribute
pub fn magic_one_message(body: &[u8], compression: u8) -> BytesMut {
    let mut set = BytesMut::with_capacity(4 + 6 + body.len());
    set.put_u32((1 + 1 + 4 + body.len()) as u32);
    set.put_u8(MAGIC_COMPRESSED);
    set.put_u8(compression);
    set.put_u32(crc32fast::hash(body));
    set.put_slice(body);
    set
}

/// Response frame: u32 length, i16 error code, body
pub fn response(error: i16, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + body.len());
    buf.put_u32((2 + body.len()) as u32);
    buf.put_i16(error);
    buf.put_slice(body);
    buf.freeze()
}

pub fn fetch_response(error: i16, messages: &[&[u8]]) -> Bytes {
    response(error, &message_set(messages))
}

pub fn offsets_response(error: i16, offsets: &[Offset]) -> Bytes {
    let mut body = BytesMut::with_capacity(4 + 8 * offsets.len());
    body.put_u32(offsets.len() as u32);
    for offset in offsets {
        body.put_u64(*offset);
    }
    response(error, &body)
}

/// Offset just past a message of `len` body bytes starting at `offset`
pub fn next_offset(offset: Offset, len: usize) -> Offset {
    offset + 4 + 5 + len as u64
}
