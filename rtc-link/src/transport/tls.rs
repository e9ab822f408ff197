use crate::constants::RECV_CHUNK_SIZE;
use crate::transport::{
    lock, LowerStream, RecvCallback, StateCallback, StateMachine, Transport, TransportState,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use shared::error::{Error, Result};
use std::io;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore,
    SignatureScheme,
};
use tokio_rustls::TlsConnector;

/// TLS layer stacked on a lower byte transport.
///
/// The handshake runs on `start()` over the lower layer presented as a
/// duplex stream. The verified constructor validates the peer certificate
/// chain against the webpki root store and matches the server name with
/// standard wildcard rules; the plain constructor skips verification.
pub(crate) struct TlsTransport {
    lower: Arc<dyn Transport>,
    host: String,
    verify: bool,
    state: StateMachine,
    recv_callback: Mutex<Option<RecvCallback>>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    weak: Weak<TlsTransport>,
}

impl TlsTransport {
    /// TLS without certificate verification.
    pub(crate) fn new(
        lower: Arc<dyn Transport>,
        host: String,
        state_callback: StateCallback,
    ) -> Arc<Self> {
        Self::build(lower, host, false, state_callback)
    }

    /// TLS validating the peer certificate against the root trust store.
    pub(crate) fn new_verified(
        lower: Arc<dyn Transport>,
        host: String,
        state_callback: StateCallback,
    ) -> Arc<Self> {
        Self::build(lower, host, true, state_callback)
    }

    fn build(
        lower: Arc<dyn Transport>,
        host: String,
        verify: bool,
        state_callback: StateCallback,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            lower,
            host,
            verify,
            state: StateMachine::new(state_callback),
            recv_callback: Mutex::new(None),
            write_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            weak: weak.clone(),
        })
    }

    fn client_config(&self) -> ClientConfig {
        if self.verify {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
                .with_no_client_auth()
        }
    }

    fn attach(&self, stream: TlsStream<LowerStream>) {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        *lock(&self.write_tx) = Some(tx);

        let weak = self.weak.clone();
        let writer = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = write_half.write_all(&data).await {
                    warn!("tls send failed: {}", e);
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
                        debug!("tls connection closed by remote");
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
                        warn!("tls recv failed: {}", e);
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

    fn detach(&self) {
        lock(&self.write_tx).take();
        lock(&self.recv_callback).take();
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn start(&self) -> Result<()> {
        debug!("starting tls handshake with {}", self.host);

        let (tx, rx) = mpsc::unbounded_channel();
        self.lower.on_recv(Box::new(move |chunk| {
            let _ = tx.send(chunk);
        }));
        let stream = LowerStream::new(Arc::clone(&self.lower), rx);

        let connector = TlsConnector::from(Arc::new(self.client_config()));
        let server_name = match ServerName::try_from(self.host.clone()) {
            Ok(name) => name,
            Err(_) => {
                self.state.transition(TransportState::Failed);
                return Err(Error::ErrHost);
            }
        };

        match connector.connect(server_name, stream).await {
            Ok(stream) => {
                debug!("tls handshake with {} complete", self.host);
                self.attach(stream);
                self.state.transition(TransportState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("tls handshake with {} failed: {}", self.host, e);
                let error = map_handshake_error(&e);
                self.state.transition(TransportState::Failed);
                self.lower.stop();
                Err(error)
            }
        }
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

fn map_handshake_error(e: &io::Error) -> Error {
    if let Some(inner) = e.get_ref() {
        if let Some(tls_error) = inner.downcast_ref::<RustlsError>() {
            return match tls_error {
                RustlsError::InvalidCertificate(CertificateError::NotValidForName)
                | RustlsError::InvalidCertificate(CertificateError::NotValidForNameContext {
                    ..
                }) => Error::ErrNameMismatch,
                RustlsError::InvalidCertificate(_) => Error::ErrCertificateUntrusted,
                _ => Error::ErrTlsHandshakeFailed,
            };
        }
    }
    Error::ErrTlsHandshakeFailed
}

/// Accepts any server certificate. Used when TLS verification is disabled
/// by configuration.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
