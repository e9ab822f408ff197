use crate::constants::{CONNECT_TIMEOUT, RECV_CHUNK_SIZE};
use crate::transport::{
    lock, RecvCallback, StateCallback, StateMachine, Transport, TransportState,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use shared::error::{Error, Result};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Terminal layer of the stack. Resolves the remote host, connects, and
/// moves raw bytes in both directions.
pub(crate) struct TcpTransport {
    hostname: String,
    service: String,
    state: StateMachine,
    recv_callback: Mutex<Option<RecvCallback>>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    weak: Weak<TcpTransport>,
}

impl TcpTransport {
    pub(crate) fn new(
        hostname: String,
        service: String,
        state_callback: StateCallback,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            hostname,
            service,
            state: StateMachine::new(state_callback),
            recv_callback: Mutex::new(None),
            write_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            weak: weak.clone(),
        })
    }

    /// The resolution target, with IPv6 literals bracketed.
    fn target(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.service)
        } else {
            format!("{}:{}", self.hostname, self.service)
        }
    }

    fn attach(&self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            trace!("set_nodelay failed: {}", e);
        }
        let (mut read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        *lock(&self.write_tx) = Some(tx);

        let weak = self.weak.clone();
        let writer = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = write_half.write_all(&data).await {
                    warn!("tcp send failed: {}", e);
                    if let Some(transport) = weak.upgrade() {
                        transport.detach();
                        transport.state.transition(TransportState::Failed);
                    }
                    return;
                }
            }
        });

        let weak = self.weak.clone();
        let reader = tokio::spawn(async move {
            let mut buffer = BytesMut::with_capacity(RECV_CHUNK_SIZE);
            loop {
                buffer.reserve(RECV_CHUNK_SIZE);
                match read_half.read_buf(&mut buffer).await {
                    Ok(0) => {
                        debug!("tcp connection closed by remote");
                        if let Some(transport) = weak.upgrade() {
                            transport.detach();
                            transport.state.transition(TransportState::Disconnected);
                        }
                        return;
                    }
                    Ok(_) => {
                        let chunk = buffer.split();
                        let Some(transport) = weak.upgrade() else {
                            return;
                        };
                        transport.deliver(chunk);
                    }
                    Err(e) => {
                        warn!("tcp recv failed: {} ({})", Error::ErrReset, e);
                        if let Some(transport) = weak.upgrade() {
                            transport.detach();
                            transport.state.transition(TransportState::Failed);
                        }
                        return;
                    }
                }
            }
        });

        lock(&self.tasks).extend([writer, reader]);
    }

    fn deliver(&self, chunk: BytesMut) {
        let callback = lock(&self.recv_callback);
        if let Some(callback) = callback.as_ref() {
            callback(chunk);
        }
    }

    /// Releases the write path and the upward callback so upper layers
    /// observe end of stream.
    fn detach(&self) {
        lock(&self.write_tx).take();
        lock(&self.recv_callback).take();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> Result<()> {
        let target = self.target();
        debug!("connecting to {}", target);

        let addrs: Vec<_> = match lookup_host(target.clone()).await {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                warn!("resolution failed for {}: {}", target, e);
                self.state.transition(TransportState::Failed);
                return Err(Error::ErrResolutionFailed);
            }
        };
        if addrs.is_empty() {
            self.state.transition(TransportState::Failed);
            return Err(Error::ErrResolutionFailed);
        }

        for addr in addrs {
            trace!("trying {}", addr);
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!("tcp connected to {}", addr);
                    self.attach(stream);
                    self.state.transition(TransportState::Connected);
                    return Ok(());
                }
                Ok(Err(e)) => trace!("connect to {} failed: {}", addr, e),
                Err(_) => trace!("connect to {} timed out", addr),
            }
        }

        warn!("all connection attempts to {} failed", target);
        self.state.transition(TransportState::Failed);
        Err(Error::ErrConnectFailed)
    }

    fn stop(&self) {
        self.detach();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.state.transition(TransportState::Disconnected);
    }

    fn send(&self, data: Bytes) -> bool {
        match lock(&self.write_tx).as_ref() {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    fn on_recv(&self, callback: RecvCallback) {
        *lock(&self.recv_callback) = Some(callback);
    }
}
