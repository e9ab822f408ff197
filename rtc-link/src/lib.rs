#![warn(rust_2018_idioms)]

//! WebRTC-compatible peer connectivity core.
//!
//! Two subsystems live here: a layered transport stack with a standalone
//! WebSocket client on top (TCP, optional TLS, RFC 6455 framing), and the
//! session description model used to negotiate a peer session over a
//! signaling channel.
//!
//! The transport stack needs a tokio runtime; [`constants::THREADPOOL_SIZE`]
//! is the minimum worker count expected by the concurrency model.

pub mod constants;
pub mod message;
pub mod sdp;
mod transport;
pub mod websocket;

pub use message::Message;
pub use sdp::{Candidate, Description, Media, SdpType, SetupRole};
pub use shared::error::{Error, Result};
pub use websocket::{WebSocket, WebSocketConfig, WebSocketState};
