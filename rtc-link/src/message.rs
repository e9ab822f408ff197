use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;

/// A message traveling through the transport stack.
///
/// Text payloads are valid UTF-8 by construction. A message is consumed
/// exactly once: it is moved into the receive queue or into a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Close { code: Option<u16>, reason: String },
    Ping(Bytes),
    Pong(Bytes),
}

impl Message {
    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
            Message::Close { reason, .. } => reason.len(),
            Message::Ping(data) => data.len(),
            Message::Pong(data) => data.len(),
        }
    }

    /// Whether this is a text or binary payload rather than a control message.
    pub fn is_data(&self) -> bool {
        matches!(self, Message::Text(_) | Message::Binary(_))
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(data))
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

#[derive(Default)]
struct RecvQueueInner {
    queue: VecDeque<Message>,
    amount: usize,
}

/// FIFO of received messages with byte-amount accounting.
///
/// The queue is unbounded; the accumulated amount is exposed so callers can
/// report backpressure. The deque and the amount are guarded by a single
/// lock so `amount() == sum of queued payload sizes` holds at all times.
#[derive(Default)]
pub struct RecvQueue {
    inner: Mutex<RecvQueueInner>,
}

impl RecvQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        let mut inner = lock(&self.inner);
        inner.amount += message.size();
        inner.queue.push_back(message);
    }

    pub fn pop(&self) -> Option<Message> {
        let mut inner = lock(&self.inner);
        let message = inner.queue.pop_front()?;
        inner.amount -= message.size();
        Some(message)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).queue.is_empty()
    }

    /// Total payload bytes currently queued.
    pub fn amount(&self) -> usize {
        lock(&self.inner).amount
    }
}

fn lock(inner: &Mutex<RecvQueueInner>) -> std::sync::MutexGuard<'_, RecvQueueInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}
