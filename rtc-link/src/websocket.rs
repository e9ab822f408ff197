//! User-facing WebSocket client.
//!
//! The client owns a stack of transports (TCP, then TLS for `wss`, then the
//! WebSocket layer) and sequences their initialization from state
//! callbacks. Every callback captures a weak handle to the internals and
//! returns without effect once the client has been released, and teardown
//! hands the layer handles to a separate task so a layer is never stopped
//! from its own callback.

use crate::constants::DEFAULT_MAX_MESSAGE_SIZE;
use crate::message::{Message, RecvQueue};
use crate::transport::tcp::TcpTransport;
use crate::transport::tls::TlsTransport;
use crate::transport::ws::{MessageCallback, WsTransport};
use crate::transport::{lock, StateCallback, Transport, TransportState};
use log::debug;
use shared::error::{Error, Result};
use std::sync::{Arc, Mutex};

/// WebSocket client configuration.
#[derive(Default, Debug, Clone)]
pub struct WebSocketConfig {
    /// Skip certificate verification on `wss` connections.
    pub disable_tls_verification: bool,
}

/// State of the WebSocket client.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum WebSocketState {
    #[default]
    Closed,
    Connecting,
    Open,
    Closing,
}

/// A standalone WebSocket client over the layered transport stack.
pub struct WebSocket {
    inner: Arc<WebSocketInner>,
}

impl WebSocket {
    pub fn new(config: Option<WebSocketConfig>) -> Self {
        Self {
            inner: Arc::new(WebSocketInner {
                config: config.unwrap_or_default(),
                state: Mutex::new(WebSocketState::Closed),
                remote: Mutex::new(None),
                recv_queue: RecvQueue::new(),
                init_lock: tokio::sync::Mutex::new(()),
                slots: Mutex::new(TransportSlots::default()),
                callbacks: Mutex::new(Callbacks::default()),
            }),
        }
    }

    /// Connects to a `ws` or `wss` URL. Fails with `ErrInvalidState` unless
    /// the client is closed, and with an input error on a malformed URL, in
    /// which case the state is unchanged.
    pub async fn open(&self, url: &str) -> Result<()> {
        let remote = WsUrl::parse(url)?;
        {
            let mut state = lock(&self.inner.state);
            if *state != WebSocketState::Closed {
                return Err(Error::ErrInvalidState);
            }
            *state = WebSocketState::Connecting;
        }
        debug!("opening websocket to {}", url);
        *lock(&self.inner.remote) = Some(remote);
        Arc::clone(&self.inner).init_tcp().await?;
        Ok(())
    }

    /// Initiates the closing handshake. Idempotent and safe from any
    /// thread.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Sends a text or binary message. Requires the client to be open.
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.inner.send(message.into())
    }

    /// Pops the next received message, if any.
    pub fn receive(&self) -> Option<Message> {
        self.inner.recv_queue.pop()
    }

    /// Bytes currently buffered in the receive queue.
    pub fn available_amount(&self) -> usize {
        self.inner.recv_queue.amount()
    }

    pub fn ready_state(&self) -> WebSocketState {
        *lock(&self.inner.state)
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == WebSocketState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.ready_state() == WebSocketState::Closed
    }

    /// Maximum size accepted for an outgoing message.
    pub fn max_message_size(&self) -> usize {
        DEFAULT_MAX_MESSAGE_SIZE
    }

    pub fn on_open(&self, callback: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.callbacks).on_open = Some(Arc::new(callback));
    }

    pub fn on_closed(&self, callback: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.callbacks).on_closed = Some(Arc::new(callback));
    }

    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.inner.callbacks).on_error = Some(Arc::new(callback));
    }

    /// Invoked with the queue length whenever a message is queued.
    pub fn on_available(&self, callback: impl Fn(usize) + Send + Sync + 'static) {
        lock(&self.inner.callbacks).on_available = Some(Arc::new(callback));
    }
}

impl Default for WebSocket {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        self.inner.remote_close();
    }
}

#[derive(Default)]
struct TransportSlots {
    tcp: Option<Arc<TcpTransport>>,
    tls: Option<Arc<TlsTransport>>,
    ws: Option<Arc<WsTransport>>,
}

#[derive(Default)]
struct Callbacks {
    on_open: Option<Arc<dyn Fn() + Send + Sync>>,
    on_closed: Option<Arc<dyn Fn() + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    on_available: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

struct WebSocketInner {
    config: WebSocketConfig,
    state: Mutex<WebSocketState>,
    remote: Mutex<Option<WsUrl>>,
    recv_queue: RecvQueue,
    init_lock: tokio::sync::Mutex<()>,
    slots: Mutex<TransportSlots>,
    callbacks: Mutex<Callbacks>,
}

impl WebSocketInner {
    fn is_secure(&self) -> bool {
        lock(&self.remote)
            .as_ref()
            .map(WsUrl::is_secure)
            .unwrap_or(false)
    }

    fn close(&self) {
        {
            let mut state = lock(&self.state);
            match *state {
                WebSocketState::Connecting | WebSocketState::Open => {
                    *state = WebSocketState::Closing;
                }
                _ => return,
            }
        }
        debug!("closing websocket");
        let ws = lock(&self.slots).ws.clone();
        match ws {
            Some(ws) => ws.close(),
            None => self.close_transports(),
        }
    }

    fn remote_close(&self) {
        if *lock(&self.state) != WebSocketState::Closed {
            self.close();
            self.close_transports();
        }
    }

    fn send(&self, message: Message) -> Result<()> {
        if *lock(&self.state) != WebSocketState::Open {
            return Err(Error::ErrNotOpen);
        }
        if message.size() > DEFAULT_MAX_MESSAGE_SIZE {
            return Err(Error::ErrMessageTooLarge);
        }
        let ws = lock(&self.slots).ws.clone().ok_or(Error::ErrNotOpen)?;
        if ws.send(message) {
            Ok(())
        } else {
            Err(Error::ErrConnectionClosed)
        }
    }

    fn incoming(&self, message: Message) {
        if message.is_data() {
            self.recv_queue.push(message);
            self.trigger_available(self.recv_queue.len());
        }
    }

    async fn init_tcp(self: Arc<Self>) -> Result<Arc<TcpTransport>> {
        let _guard = self.init_lock.lock().await;
        if let Some(transport) = lock(&self.slots).tcp.clone() {
            return Ok(transport);
        }

        let (hostname, service) = {
            let remote = lock(&self.remote);
            let remote = remote.as_ref().ok_or(Error::ErrConnectionClosed)?;
            (remote.hostname.clone(), remote.service.clone())
        };

        let weak = Arc::downgrade(&self);
        let state_callback: StateCallback = Box::new(move |state| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match state {
                TransportState::Connected => {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        let result = if inner.is_secure() {
                            Arc::clone(&inner).init_tls().await.map(|_| ())
                        } else {
                            Arc::clone(&inner).init_ws().await.map(|_| ())
                        };
                        if result.is_err() {
                            inner.remote_close();
                        }
                    });
                }
                TransportState::Failed => {
                    inner.trigger_error(
                        &Error::ErrNetworkFailed("TCP connection failed".to_string()).to_string(),
                    );
                    inner.remote_close();
                }
                TransportState::Disconnected => inner.remote_close(),
                _ => {}
            }
        });

        let transport = TcpTransport::new(hostname, service, state_callback);
        {
            let mut slots = lock(&self.slots);
            if *lock(&self.state) == WebSocketState::Closed {
                return Err(Error::ErrConnectionClosed);
            }
            slots.tcp = Some(Arc::clone(&transport));
        }
        transport.start().await?;
        Ok(transport)
    }

    async fn init_tls(self: Arc<Self>) -> Result<Arc<TlsTransport>> {
        let _guard = self.init_lock.lock().await;
        if let Some(transport) = lock(&self.slots).tls.clone() {
            return Ok(transport);
        }

        let lower: Arc<dyn Transport> = lock(&self.slots)
            .tcp
            .clone()
            .ok_or(Error::ErrConnectionClosed)?;
        let hostname = {
            let remote = lock(&self.remote);
            remote
                .as_ref()
                .ok_or(Error::ErrConnectionClosed)?
                .hostname
                .clone()
        };

        let weak = Arc::downgrade(&self);
        let state_callback: StateCallback = Box::new(move |state| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match state {
                TransportState::Connected => {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        if Arc::clone(&inner).init_ws().await.is_err() {
                            inner.remote_close();
                        }
                    });
                }
                TransportState::Failed => {
                    inner.trigger_error(
                        &Error::ErrNetworkFailed("TLS handshake failed".to_string()).to_string(),
                    );
                    inner.remote_close();
                }
                TransportState::Disconnected => inner.remote_close(),
                _ => {}
            }
        });

        let transport = if self.config.disable_tls_verification {
            TlsTransport::new(lower, hostname, state_callback)
        } else {
            TlsTransport::new_verified(lower, hostname, state_callback)
        };
        {
            let mut slots = lock(&self.slots);
            if *lock(&self.state) == WebSocketState::Closed {
                return Err(Error::ErrConnectionClosed);
            }
            slots.tls = Some(Arc::clone(&transport));
        }
        transport.start().await?;
        Ok(transport)
    }

    async fn init_ws(self: Arc<Self>) -> Result<Arc<WsTransport>> {
        let _guard = self.init_lock.lock().await;
        if let Some(transport) = lock(&self.slots).ws.clone() {
            return Ok(transport);
        }

        let lower: Arc<dyn Transport> = {
            let slots = lock(&self.slots);
            match (&slots.tls, &slots.tcp) {
                (Some(tls), _) => Arc::clone(tls) as Arc<dyn Transport>,
                (None, Some(tcp)) => Arc::clone(tcp) as Arc<dyn Transport>,
                (None, None) => return Err(Error::ErrConnectionClosed),
            }
        };
        let (host, path) = {
            let remote = lock(&self.remote);
            let remote = remote.as_ref().ok_or(Error::ErrConnectionClosed)?;
            (remote.host.clone(), remote.path.clone())
        };

        let weak = Arc::downgrade(&self);
        let message_callback: MessageCallback = Box::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.incoming(message);
            }
        });

        let weak = Arc::downgrade(&self);
        let state_callback: StateCallback = Box::new(move |state| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match state {
                TransportState::Connected => {
                    let opened = {
                        let mut state = lock(&inner.state);
                        if *state == WebSocketState::Connecting {
                            *state = WebSocketState::Open;
                            true
                        } else {
                            false
                        }
                    };
                    if opened {
                        debug!("websocket open");
                        inner.trigger_open();
                    }
                }
                TransportState::Failed => {
                    inner.trigger_error(
                        &Error::ErrNetworkFailed("WebSocket connection failed".to_string())
                            .to_string(),
                    );
                    inner.remote_close();
                }
                TransportState::Disconnected => {
                    let code = lock(&inner.slots)
                        .ws
                        .as_ref()
                        .and_then(|ws| ws.remote_close_code());
                    if let Some(code) = code {
                        if code != 1000 {
                            inner.trigger_error(&Error::ErrRemoteClosed(code).to_string());
                        }
                    }
                    inner.remote_close();
                }
                _ => {}
            }
        });

        let transport = WsTransport::new(lower, host, path, message_callback, state_callback);
        {
            let mut slots = lock(&self.slots);
            if *lock(&self.state) == WebSocketState::Closed {
                return Err(Error::ErrConnectionClosed);
            }
            slots.ws = Some(Arc::clone(&transport));
        }
        transport.start().await?;
        Ok(transport)
    }

    fn close_transports(&self) {
        let closed_now = {
            let mut state = lock(&self.state);
            if *state != WebSocketState::Closed {
                *state = WebSocketState::Closed;
                true
            } else {
                false
            }
        };
        if closed_now {
            debug!("websocket closed");
            self.trigger_closed();
        }

        // Clear the callbacks before releasing the layers so nothing
        // re-enters the user from a dying transport.
        *lock(&self.callbacks) = Callbacks::default();

        let (ws, tls, tcp) = {
            let mut slots = lock(&self.slots);
            (slots.ws.take(), slots.tls.take(), slots.tcp.take())
        };
        if ws.is_none() && tls.is_none() && tcp.is_none() {
            return;
        }

        // Stop the layers top-down on a separate task, so a layer is never
        // torn down from a callback dispatched by itself.
        let stop_all = move || {
            if let Some(ws) = ws {
                ws.stop();
            }
            if let Some(tls) = tls {
                tls.stop();
            }
            if let Some(tcp) = tcp {
                tcp.stop();
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { stop_all() });
            }
            Err(_) => stop_all(),
        }
    }

    fn trigger_open(&self) {
        let callback = lock(&self.callbacks).on_open.clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn trigger_closed(&self) {
        let callback = lock(&self.callbacks).on_closed.clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn trigger_error(&self, cause: &str) {
        let callback = lock(&self.callbacks).on_error.clone();
        if let Some(callback) = callback {
            callback(cause);
        }
    }

    fn trigger_available(&self, count: usize) {
        let callback = lock(&self.callbacks).on_available.clone();
        if let Some(callback) = callback {
            callback(count);
        }
    }
}

/// A parsed `ws`/`wss` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WsUrl {
    scheme: String,
    /// Authority as written, used for the Host header.
    host: String,
    /// Host without port or brackets, used for resolution and SNI.
    hostname: String,
    /// Port number or named service.
    service: String,
    /// Path including the query string.
    path: String,
}

impl WsUrl {
    fn parse(url: &str) -> Result<WsUrl> {
        let (scheme, rest) = url.split_once("://").ok_or(Error::ErrInvalidUrl)?;
        let scheme = scheme.to_ascii_lowercase();
        if scheme != "ws" && scheme != "wss" {
            return Err(Error::ErrSchemeType);
        }

        let (host, tail) = match rest.find(['/', '?']) {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };
        if host.is_empty() {
            return Err(Error::ErrHost);
        }

        let default_service = if scheme == "ws" { "80" } else { "443" };
        let (hostname, service) = if let Some(bracketed) = host.strip_prefix('[') {
            let (name, after) = bracketed.split_once(']').ok_or(Error::ErrInvalidUrl)?;
            match after.strip_prefix(':') {
                Some(port) if !port.is_empty() => (name.to_string(), port.to_string()),
                Some(_) => return Err(Error::ErrInvalidPortNumber),
                None if after.is_empty() => (name.to_string(), default_service.to_string()),
                None => return Err(Error::ErrInvalidUrl),
            }
        } else if let Some((name, port)) = host.rsplit_once(':') {
            if name.is_empty() {
                return Err(Error::ErrHost);
            }
            if port.is_empty() {
                return Err(Error::ErrInvalidPortNumber);
            }
            (name.to_string(), port.to_string())
        } else {
            (host.to_string(), default_service.to_string())
        };
        if hostname.is_empty() {
            return Err(Error::ErrHost);
        }

        let path = if tail.is_empty() {
            "/".to_string()
        } else if tail.starts_with('?') {
            format!("/{tail}")
        } else {
            tail.to_string()
        };

        Ok(WsUrl {
            scheme,
            host: host.to_string(),
            hostname,
            service,
            path,
        })
    }

    fn is_secure(&self) -> bool {
        self.scheme == "wss"
    }
}
