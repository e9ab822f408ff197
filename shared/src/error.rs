#![allow(dead_code)]

use std::io;
use std::num::ParseIntError;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //URL errors
    #[error("invalid url")]
    ErrInvalidUrl,
    #[error("unknown scheme type")]
    ErrSchemeType,
    #[error("invalid hostname")]
    ErrHost,
    #[error("invalid port number")]
    ErrInvalidPortNumber,

    //State errors
    /// Indicates an operation that can not be run in the current state,
    /// such as opening a WebSocket that is not closed.
    #[error("operation can not be run in current state")]
    ErrInvalidState,
    /// Indicates a send attempted while the WebSocket is not open.
    #[error("websocket is not open")]
    ErrNotOpen,
    /// Indicates an operation executed after the connection has already
    /// been closed.
    #[error("connection closed")]
    ErrConnectionClosed,

    //Message errors
    #[error("message size exceeds limit")]
    ErrMessageTooLarge,

    //TCP transport errors
    #[error("dns resolution failed")]
    ErrResolutionFailed,
    #[error("tcp connection failed")]
    ErrConnectFailed,
    #[error("connection reset by remote")]
    ErrReset,

    //TLS transport errors
    #[error("tls handshake failed")]
    ErrTlsHandshakeFailed,
    #[error("peer certificate is untrusted")]
    ErrCertificateUntrusted,
    #[error("certificate does not match server name")]
    ErrNameMismatch,

    //WebSocket transport errors
    #[error("websocket handshake failed")]
    ErrWsHandshakeFailed,
    #[error("websocket protocol violation")]
    ErrWsProtocolViolation,
    #[error("network failed: {0}")]
    ErrNetworkFailed(String),
    /// Clean close by the peer, carrying the WebSocket close code when the
    /// peer supplied one.
    #[error("remote closed with code {0}")]
    ErrRemoteClosed(u16),

    //Utility errors
    #[error("mutex poison: {0}")]
    PoisonError(String),
    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("utf8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::PoisonError(e.to_string())
    }
}
