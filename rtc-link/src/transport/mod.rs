//! Layered byte transports.
//!
//! Each layer of the stack (TCP, optional TLS, WebSocket framing) shares the
//! same contract: `start` blocks until the layer is ready or has failed,
//! `stop` is idempotent, `send` hands data to the downward path, and
//! received data ascends through a callback installed by the upper layer.
//! State transitions are reported exactly once, in transition order, and a
//! layer that reached `Failed` or `Disconnected` never becomes `Connected`
//! again.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use shared::error::Result;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

pub(crate) mod tcp;
pub(crate) mod tls;
pub(crate) mod ws;

/// State of a single transport layer.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TransportState {
    #[default]
    Connecting,
    Connected,
    Disconnected,
    Failed,
    #[allow(dead_code)]
    Completed,
}

pub(crate) type StateCallback = Box<dyn Fn(TransportState) + Send + Sync>;
pub(crate) type RecvCallback = Box<dyn Fn(BytesMut) + Send + Sync>;

/// Contract shared by the byte-oriented layers of the stack.
#[async_trait]
pub(crate) trait Transport: Send + Sync {
    /// Performs the layer's opening action. Resolves once the layer accepts
    /// sends, or with an error once it has transitioned to `Failed`.
    async fn start(&self) -> Result<()>;

    /// Tears the layer down. Idempotent and non-blocking.
    fn stop(&self);

    /// Hands data to the downward path. Returns whether it was accepted.
    fn send(&self, data: Bytes) -> bool;

    /// Installs the upward delivery callback. Must be called before bytes
    /// start flowing, i.e. before the upper layer writes anything.
    fn on_recv(&self, callback: RecvCallback);
}

/// Tracks a layer's state and reports transitions through a callback.
pub(crate) struct StateMachine {
    state: Mutex<TransportState>,
    callback: StateCallback,
}

impl StateMachine {
    pub(crate) fn new(callback: StateCallback) -> Self {
        Self {
            state: Mutex::new(TransportState::Connecting),
            callback,
        }
    }

    pub(crate) fn get(&self) -> TransportState {
        *lock(&self.state)
    }

    /// Moves to `next` and fires the callback, unless the layer already is
    /// in `next` or has reached a terminal state. Returns whether the
    /// transition happened, guaranteeing exactly one callback per
    /// transition.
    pub(crate) fn transition(&self, next: TransportState) -> bool {
        {
            let mut current = lock(&self.state);
            if *current == next {
                return false;
            }
            if matches!(
                *current,
                TransportState::Failed | TransportState::Disconnected
            ) {
                return false;
            }
            *current = next;
        }
        (self.callback)(next);
        true
    }
}

/// Locks a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Presents a lower transport as a duplex byte stream.
///
/// Reads are fed by the lower layer's receive callback through a channel;
/// writes are forwarded to the lower layer's `send`. This is what lets the
/// TLS layer hand the connection to a stream-oriented handshake.
pub(crate) struct LowerStream {
    lower: Arc<dyn Transport>,
    rx: mpsc::UnboundedReceiver<BytesMut>,
    pending: BytesMut,
}

impl LowerStream {
    pub(crate) fn new(lower: Arc<dyn Transport>, rx: mpsc::UnboundedReceiver<BytesMut>) -> Self {
        Self {
            lower,
            rx,
            pending: BytesMut::new(),
        }
    }

    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.pending.len());
        buf.put_slice(&self.pending.split_to(n));
    }
}

impl AsyncRead for LowerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            this.fill(buf);
            return Poll::Ready(Ok(()));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                this.pending = chunk;
                this.fill(buf);
                Poll::Ready(Ok(()))
            }
            // Lower layer is gone; report end of stream.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for LowerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.lower.send(Bytes::copy_from_slice(buf)) {
            Poll::Ready(Ok(buf.len()))
        } else {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_state_machine_transition_once() {
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&transitions);
        let machine = StateMachine::new(Box::new(move |state| {
            lock(&observed).push(state);
        }));

        assert!(machine.transition(TransportState::Connected));
        assert!(!machine.transition(TransportState::Connected));
        assert!(machine.transition(TransportState::Disconnected));
        assert_eq!(
            *lock(&transitions),
            vec![TransportState::Connected, TransportState::Disconnected]
        );
    }

    #[test]
    fn test_state_machine_terminal_states() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let machine = StateMachine::new(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(machine.transition(TransportState::Failed));
        assert!(!machine.transition(TransportState::Connected));
        assert!(!machine.transition(TransportState::Disconnected));
        assert_eq!(machine.get(), TransportState::Failed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
