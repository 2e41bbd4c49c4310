//! Request bookkeeping: the response-correlation FIFO and the bounded send queue

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::protocol::{ProduceRequest, ReadRequest};

/// A request awaiting its response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub request: ReadRequest,
    /// Written on the current socket
    pub sent: bool,
}

/// FIFO of requests that expect a response.
///
/// Insertion order is wire order is response order. The protocol carries no
/// identifier to check this, so the response being decoded is always taken to
/// belong to the head entry.
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: VecDeque<PendingRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: ReadRequest) {
        self.entries.push_back(PendingRequest {
            request,
            sent: false,
        });
    }

    pub fn head(&self) -> Option<&ReadRequest> {
        self.entries.front().map(|entry| &entry.request)
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut ReadRequest> {
        self.entries.front_mut().map(|entry| &mut entry.request)
    }

    pub fn pop(&mut self) -> Option<ReadRequest> {
        self.entries.pop_front().map(|entry| entry.request)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether any request has been written and is awaiting its response
    pub fn awaiting_response(&self) -> bool {
        self.entries.iter().any(|entry| entry.sent)
    }

    /// Forget which requests were written; used when the socket goes away
    pub fn mark_unsent(&mut self) {
        for entry in &mut self.entries {
            entry.sent = false;
        }
    }

    /// Requests not yet written on the current socket, in queue order
    pub fn unsent_mut(&mut self) -> impl Iterator<Item = &mut PendingRequest> {
        self.entries.iter_mut().filter(|entry| !entry.sent)
    }

    /// Drop the first request not yet written. Used for a request that cannot
    /// be encoded, which would otherwise hold up everything behind it.
    pub(crate) fn discard_first_unsent(&mut self) -> Option<ReadRequest> {
        let index = self.entries.iter().position(|entry| !entry.sent)?;
        self.entries.remove(index).map(|entry| entry.request)
    }
}

/// Completion signal of a queued send
pub type SendReply = oneshot::Sender<Result<(), ClientError>>;

/// A produce request waiting to be written
#[derive(Debug)]
pub struct QueuedSend {
    pub request: ProduceRequest,
    pub(crate) frame: Bytes,
    reply: Option<SendReply>,
}

impl QueuedSend {
    pub(crate) fn new(request: ProduceRequest, frame: Bytes, reply: Option<SendReply>) -> Self {
        Self {
            request,
            frame,
            reply,
        }
    }

    pub(crate) fn complete(mut self, result: Result<(), ClientError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

/// Bounded FIFO of unsent produce requests. Pushing onto a full queue evicts
/// the oldest entry first.
///
/// The front entry may be partly on the wire. It still counts against the
/// capacity but is never evicted; once it is in flight, the next oldest goes
/// instead, or the new entry itself when nothing else is queued.
#[derive(Debug)]
pub struct SendQueue {
    entries: VecDeque<QueuedSend>,
    capacity: usize,
    front_in_flight: bool,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            front_in_flight: false,
        }
    }

    /// Append an entry, returning the one evicted to make room
    pub fn push(&mut self, entry: QueuedSend) -> Option<QueuedSend> {
        if self.capacity == 0 {
            return Some(entry);
        }
        if self.entries.len() < self.capacity {
            self.entries.push_back(entry);
            return None;
        }

        let oldest = usize::from(self.front_in_flight);
        match self.entries.remove(oldest) {
            Some(evicted) => {
                self.entries.push_back(entry);
                Some(evicted)
            }
            None => Some(entry),
        }
    }

    pub fn front(&self) -> Option<&QueuedSend> {
        self.entries.front()
    }

    /// Mark the front entry as being written and return its frame
    pub(crate) fn begin_front(&mut self) -> Option<Bytes> {
        let frame = self.entries.front()?.frame.clone();
        self.front_in_flight = true;
        Some(frame)
    }

    /// The front entry's frame was fully written
    pub(crate) fn finish_front(&mut self) -> Option<QueuedSend> {
        if !self.front_in_flight {
            return None;
        }
        self.front_in_flight = false;
        self.entries.pop_front()
    }

    /// The socket went away mid-write; the front entry is resent in full later
    pub(crate) fn abort_front(&mut self) {
        self.front_in_flight = false;
    }

    pub fn is_front_in_flight(&self) -> bool {
        self.front_in_flight
    }

    pub fn pop_front(&mut self) -> Option<QueuedSend> {
        self.front_in_flight = false;
        self.entries.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = QueuedSend> + '_ {
        self.front_in_flight = false;
        self.entries.drain(..)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedSend> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FetchRequest, OffsetsRequest};

    fn queued(topic: &str) -> QueuedSend {
        QueuedSend::new(ProduceRequest::new(topic.to_string(), "m"), Bytes::new(), None)
    }

    #[test]
    fn test_request_queue_fifo() {
        let mut queue = RequestQueue::new();
        queue.push(ReadRequest::Fetch(FetchRequest::new("a")));
        queue.push(ReadRequest::Offsets(OffsetsRequest::new("b")));

        assert_eq!(queue.head().map(|r| r.topic()), Some("a"));
        assert_eq!(queue.pop().map(|r| r.topic().to_string()), Some("a".into()));
        assert_eq!(queue.head().map(|r| r.topic()), Some("b"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_request_queue_sent_tracking() {
        let mut queue = RequestQueue::new();
        queue.push(ReadRequest::Fetch(FetchRequest::new("a")));
        queue.push(ReadRequest::Fetch(FetchRequest::new("b")));
        assert!(!queue.awaiting_response());

        for entry in queue.unsent_mut() {
            entry.sent = true;
        }
        assert!(queue.awaiting_response());
        assert_eq!(queue.unsent_mut().count(), 0);

        queue.mark_unsent();
        assert_eq!(queue.unsent_mut().count(), 2);
    }

    #[test]
    fn test_send_queue_drops_oldest() {
        let mut queue = SendQueue::new(3);
        let mut evicted = Vec::new();
        for topic in ["t1", "t2", "t3", "t4", "t5"] {
            if let Some(entry) = queue.push(queued(topic)) {
                evicted.push(entry.request.topic.clone());
            }
        }

        assert_eq!(evicted, vec!["t1", "t2"]);
        let kept: Vec<_> = queue.iter().map(|e| e.request.topic.as_str()).collect();
        assert_eq!(kept, vec!["t3", "t4", "t5"]);
    }

    #[test]
    fn test_send_queue_keeps_in_flight_front() {
        let mut queue = SendQueue::new(2);
        queue.push(queued("t1"));
        queue.push(queued("t2"));
        assert!(queue.begin_front().is_some());

        let evicted = queue.push(queued("t3")).map(|e| e.request.topic);
        assert_eq!(evicted.as_deref(), Some("t2"));
        let kept: Vec<_> = queue.iter().map(|e| e.request.topic.as_str()).collect();
        assert_eq!(kept, vec!["t1", "t3"]);

        let written = queue.finish_front().map(|e| e.request.topic);
        assert_eq!(written.as_deref(), Some("t1"));
        assert!(!queue.is_front_in_flight());
        assert!(queue.finish_front().is_none());
    }

    #[test]
    fn test_send_queue_full_of_in_flight_drops_newest() {
        let mut queue = SendQueue::new(1);
        queue.push(queued("t1"));
        queue.begin_front();

        let evicted = queue.push(queued("t2")).map(|e| e.request.topic);
        assert_eq!(evicted.as_deref(), Some("t2"));
        assert_eq!(queue.len(), 1);

        queue.abort_front();
        assert_eq!(queue.push(queued("t3")).map(|e| e.request.topic).as_deref(), Some("t1"));
    }

    #[test]
    fn test_discard_first_unsent() {
        let mut queue = RequestQueue::new();
        queue.push(ReadRequest::Fetch(FetchRequest::new("a")));
        queue.push(ReadRequest::Fetch(FetchRequest::new("b")));
        if let Some(entry) = queue.unsent_mut().next() {
            entry.sent = true;
        }

        assert_eq!(
            queue.discard_first_unsent().map(|r| r.topic().to_string()),
            Some("b".into())
        );
        assert_eq!(queue.len(), 1);
        assert!(queue.discard_first_unsent().is_none());
    }

    #[test]
    fn test_send_queue_zero_capacity() {
        let mut queue = SendQueue::new(0);
        assert!(queue.push(queued("t")).is_some());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queued_send_completion() {
        let (tx, rx) = oneshot::channel();
        let entry = QueuedSend::new(ProduceRequest::new("t", "m"), Bytes::new(), Some(tx));
        entry.complete(Err(ClientError::Dropped));
        assert!(matches!(rx.await, Ok(Err(ClientError::Dropped))));
    }
}
