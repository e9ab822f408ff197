//! WebSocket transport: opening handshake and RFC 6455 frame codec.
//!
//! The layer performs the HTTP/1.1 upgrade over its lower transport, then
//! decodes server frames (unmasked) and encodes client frames (masked).
//! Fragmented data frames are reassembled; control frames may interleave
//! fragments but must be final and carry at most 125 bytes. A protocol
//! violation closes the connection with code 1002 and fails the layer.

use crate::constants::LOCAL_MAX_MESSAGE_SIZE;
use crate::message::Message;
use crate::transport::{lock, StateCallback, StateMachine, Transport, TransportState};
use base64::{prelude::BASE64_STANDARD, Engine};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};
use rand::Rng;
use sha1::{Digest, Sha1};
use shared::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xa;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) type MessageCallback = Box<dyn Fn(Message) + Send + Sync>;

enum WsPhase {
    Handshake {
        key: String,
        buffer: BytesMut,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    Frames(WsCodec),
    Stopped,
}

/// WebSocket layer stacked on a TCP or TLS transport.
pub(crate) struct WsTransport {
    lower: Arc<dyn Transport>,
    host: String,
    path: String,
    state: StateMachine,
    recv_callback: MessageCallback,
    phase: Mutex<WsPhase>,
    close_sent: AtomicBool,
    remote_close_code: Mutex<Option<u16>>,
    weak: Weak<WsTransport>,
}

impl WsTransport {
    pub(crate) fn new(
        lower: Arc<dyn Transport>,
        host: String,
        path: String,
        recv_callback: MessageCallback,
        state_callback: StateCallback,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            lower,
            host,
            path,
            state: StateMachine::new(state_callback),
            recv_callback,
            phase: Mutex::new(WsPhase::Stopped),
            close_sent: AtomicBool::new(false),
            remote_close_code: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    pub(crate) async fn start(&self) -> Result<()> {
        debug!("starting websocket handshake with {}", self.host);

        let key = generate_key();
        let (done_tx, done_rx) = oneshot::channel();
        *lock(&self.phase) = WsPhase::Handshake {
            key: key.clone(),
            buffer: BytesMut::new(),
            done: Some(done_tx),
        };

        let weak = self.weak.clone();
        self.lower.on_recv(Box::new(move |chunk| {
            if let Some(transport) = weak.upgrade() {
                transport.handle_incoming(chunk);
            }
        }));

        let request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {}\r\n\
             \r\n",
            self.path, self.host, key
        );
        if !self.lower.send(Bytes::from(request)) {
            self.state.transition(TransportState::Failed);
            return Err(Error::ErrWsHandshakeFailed);
        }

        match done_rx.await {
            Ok(Ok(())) => {
                debug!("websocket open");
                self.state.transition(TransportState::Connected);
                Ok(())
            }
            Ok(Err(e)) => {
                self.state.transition(TransportState::Failed);
                Err(e)
            }
            // The handshake was abandoned during teardown.
            Err(_) => {
                self.state.transition(TransportState::Failed);
                Err(Error::ErrWsHandshakeFailed)
            }
        }
    }

    pub(crate) fn stop(&self) {
        *lock(&self.phase) = WsPhase::Stopped;
        self.state.transition(TransportState::Disconnected);
    }

    /// Sends a data message downward. Returns whether it was accepted.
    pub(crate) fn send(&self, message: Message) -> bool {
        if self.state.get() != TransportState::Connected {
            return false;
        }
        if message.size() > LOCAL_MAX_MESSAGE_SIZE {
            warn!(
                "outgoing websocket message of {} bytes exceeds limit",
                message.size()
            );
            return false;
        }
        let frame = match &message {
            Message::Text(text) => encode_frame(OPCODE_TEXT, text.as_bytes()),
            Message::Binary(data) => encode_frame(OPCODE_BINARY, data),
            Message::Ping(data) => encode_frame(OPCODE_PING, data),
            Message::Pong(data) => encode_frame(OPCODE_PONG, data),
            Message::Close { code, reason } => return self.send_close(*code, reason),
        };
        self.lower.send(frame)
    }

    /// Initiates the closing handshake if the layer is connected.
    pub(crate) fn close(&self) {
        if self.state.get() == TransportState::Connected {
            debug!("sending websocket close");
            self.send_close(Some(1000), "");
        }
    }

    /// The close code received from the remote, if any. An absent code in
    /// the remote close frame is reported as 1005 per RFC 6455.
    pub(crate) fn remote_close_code(&self) -> Option<u16> {
        *lock(&self.remote_close_code)
    }

    fn send_close(&self, code: Option<u16>, reason: &str) -> bool {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.lower
            .send(encode_frame(OPCODE_CLOSE, &close_payload(code, reason)))
    }

    fn handle_incoming(&self, chunk: BytesMut) {
        let mut established = None;
        {
            let mut phase = lock(&self.phase);
            match &mut *phase {
                WsPhase::Handshake { key, buffer, done } => {
                    buffer.extend_from_slice(&chunk);
                    let Some(pos) = find_header_end(buffer) else {
                        return;
                    };
                    let head = buffer.split_to(pos + 4);
                    let result = check_handshake_response(&head, key);
                    let done = done.take();
                    match result {
                        Ok(()) => {
                            let mut codec = WsCodec::new();
                            codec.feed(&buffer.split());
                            *phase = WsPhase::Frames(codec);
                            established = done;
                        }
                        Err(e) => {
                            *phase = WsPhase::Stopped;
                            drop(phase);
                            // Fail here, on the delivery path, so the state
                            // change is observed before the lower layer can
                            // report the connection loss.
                            self.state.transition(TransportState::Failed);
                            if let Some(done) = done {
                                let _ = done.send(Err(e));
                            }
                            return;
                        }
                    }
                }
                WsPhase::Frames(codec) => codec.feed(&chunk),
                WsPhase::Stopped => return,
            }
        }
        if let Some(done) = established {
            let _ = done.send(Ok(()));
        }
        self.process_frames();
    }

    fn process_frames(&self) {
        loop {
            let next = {
                let mut phase = lock(&self.phase);
                let WsPhase::Frames(codec) = &mut *phase else {
                    return;
                };
                match codec.next_message() {
                    Ok(Some(message)) => Ok(message),
                    Ok(None) => return,
                    Err(e) => {
                        *phase = WsPhase::Stopped;
                        Err(e)
                    }
                }
            };
            match next {
                Err(e) => {
                    warn!("websocket protocol violation: {}", e);
                    if !self.close_sent.swap(true, Ordering::SeqCst) {
                        let payload = close_payload(Some(close_code_for(&e)), "");
                        self.lower.send(encode_frame(OPCODE_CLOSE, &payload));
                    }
                    self.state.transition(TransportState::Failed);
                    return;
                }
                Ok(Message::Close { code, reason }) => {
                    debug!("websocket close received, code {:?}", code);
                    *lock(&self.remote_close_code) = Some(code.unwrap_or(1005));
                    if !self.close_sent.swap(true, Ordering::SeqCst) {
                        // Echo the code; an absent code is echoed as an
                        // empty close payload, never as 1005 on the wire.
                        self.lower
                            .send(encode_frame(OPCODE_CLOSE, &close_payload(code, "")));
                    }
                    let _ = reason;
                    *lock(&self.phase) = WsPhase::Stopped;
                    self.state.transition(TransportState::Disconnected);
                    return;
                }
                Ok(Message::Ping(payload)) => {
                    trace!("websocket ping received, replying with pong");
                    self.lower.send(encode_frame(OPCODE_PONG, &payload));
                }
                Ok(Message::Pong(_)) => trace!("websocket pong received"),
                Ok(message) => (self.recv_callback)(message),
            }
        }
    }
}

/// Decodes server-to-client frames from a byte stream and reassembles
/// fragmented messages.
pub(crate) struct WsCodec {
    buffer: BytesMut,
    fragment_opcode: Option<u8>,
    fragment_buffer: BytesMut,
}

struct RawFrame {
    fin: bool,
    opcode: u8,
    payload: BytesMut,
}

impl WsCodec {
    pub(crate) fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            fragment_opcode: None,
            fragment_buffer: BytesMut::new(),
        }
    }

    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pops the next complete message, or `None` when more bytes are
    /// needed. A returned error is a protocol violation and poisons the
    /// connection.
    pub(crate) fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            let Some(frame) = self.next_frame()? else {
                return Ok(None);
            };
            match frame.opcode {
                OPCODE_CONTINUATION => {
                    let Some(opcode) = self.fragment_opcode else {
                        return Err(Error::ErrWsProtocolViolation);
                    };
                    if self.fragment_buffer.len() + frame.payload.len() > LOCAL_MAX_MESSAGE_SIZE {
                        return Err(Error::ErrMessageTooLarge);
                    }
                    self.fragment_buffer.extend_from_slice(&frame.payload);
                    if frame.fin {
                        self.fragment_opcode = None;
                        let payload = self.fragment_buffer.split();
                        return Ok(Some(data_message(opcode, payload)?));
                    }
                }
                OPCODE_TEXT | OPCODE_BINARY => {
                    if self.fragment_opcode.is_some() {
                        return Err(Error::ErrWsProtocolViolation);
                    }
                    if frame.fin {
                        return Ok(Some(data_message(frame.opcode, frame.payload)?));
                    }
                    self.fragment_opcode = Some(frame.opcode);
                    self.fragment_buffer = frame.payload;
                }
                OPCODE_CLOSE => {
                    if frame.payload.len() == 1 {
                        return Err(Error::ErrWsProtocolViolation);
                    }
                    let code = if frame.payload.len() >= 2 {
                        Some(u16::from_be_bytes([frame.payload[0], frame.payload[1]]))
                    } else {
                        None
                    };
                    let reason =
                        String::from_utf8_lossy(frame.payload.get(2..).unwrap_or_default())
                            .into_owned();
                    return Ok(Some(Message::Close { code, reason }));
                }
                OPCODE_PING => return Ok(Some(Message::Ping(frame.payload.freeze()))),
                OPCODE_PONG => return Ok(Some(Message::Pong(frame.payload.freeze()))),
                _ => return Err(Error::ErrWsProtocolViolation),
            }
        }
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.buffer.len() < 2 {
            return Ok(None);
        }
        let b0 = self.buffer[0];
        let b1 = self.buffer[1];
        if b0 & 0x70 != 0 {
            return Err(Error::ErrWsProtocolViolation);
        }
        if b1 & 0x80 != 0 {
            // Server-to-client frames must not be masked.
            return Err(Error::ErrWsProtocolViolation);
        }
        let fin = b0 & 0x80 != 0;
        let opcode = b0 & 0x0f;
        let (header_len, payload_len) = match (b1 & 0x7f) as usize {
            126 => {
                if self.buffer.len() < 4 {
                    return Ok(None);
                }
                (4, u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize)
            }
            127 => {
                if self.buffer.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&self.buffer[2..10]);
                let len = u64::from_be_bytes(len);
                if len > LOCAL_MAX_MESSAGE_SIZE as u64 {
                    return Err(Error::ErrMessageTooLarge);
                }
                (10, len as usize)
            }
            len => (2, len),
        };
        if payload_len > LOCAL_MAX_MESSAGE_SIZE {
            return Err(Error::ErrMessageTooLarge);
        }
        if opcode >= OPCODE_CLOSE && (!fin || payload_len > 125) {
            return Err(Error::ErrWsProtocolViolation);
        }
        if self.buffer.len() < header_len + payload_len {
            return Ok(None);
        }
        self.buffer.advance(header_len);
        let payload = self.buffer.split_to(payload_len);
        Ok(Some(RawFrame {
            fin,
            opcode,
            payload,
        }))
    }
}

fn data_message(opcode: u8, payload: BytesMut) -> Result<Message> {
    if opcode == OPCODE_TEXT {
        Ok(Message::Text(String::from_utf8(payload.to_vec())?))
    } else {
        Ok(Message::Binary(payload.freeze()))
    }
}

/// Encodes a client-to-server frame with a fresh random mask.
pub(crate) fn encode_frame(opcode: u8, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 14);
    frame.put_u8(0x80 | opcode);
    match payload.len() {
        len if len <= 125 => frame.put_u8(0x80 | len as u8),
        len if len <= u16::MAX as usize => {
            frame.put_u8(0x80 | 126);
            frame.put_u16(len as u16);
        }
        len => {
            frame.put_u8(0x80 | 127);
            frame.put_u64(len as u64);
        }
    }
    let mask: [u8; 4] = rand::rng().random();
    frame.put_slice(&mask);
    for (i, byte) in payload.iter().enumerate() {
        frame.put_u8(byte ^ mask[i % 4]);
    }
    frame.freeze()
}

fn close_payload(code: Option<u16>, reason: &str) -> Bytes {
    let Some(code) = code else {
        return Bytes::new();
    };
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(code);
    payload.put_slice(reason.as_bytes());
    payload.freeze()
}

fn close_code_for(error: &Error) -> u16 {
    match error {
        Error::Utf8(_) => 1007,
        Error::ErrMessageTooLarge => 1009,
        _ => 1002,
    }
}

fn find_header_end(buffer: &BytesMut) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn generate_key() -> String {
    let nonce: [u8; 16] = rand::rng().random();
    BASE64_STANDARD.encode(nonce)
}

pub(crate) fn compute_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

fn check_handshake_response(head: &[u8], key: &str) -> Result<()> {
    let text = std::str::from_utf8(head).map_err(|_| Error::ErrWsHandshakeFailed)?;
    let mut lines = text.split("\r\n");

    let status = lines.next().unwrap_or_default();
    let mut words = status.split_whitespace();
    let version = words.next().unwrap_or_default();
    let code = words.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") || code != "101" {
        warn!("unexpected websocket handshake response: {}", status);
        return Err(Error::ErrWsHandshakeFailed);
    }

    let mut accept = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("sec-websocket-accept") {
                accept = Some(value.trim().to_string());
            }
        }
    }
    if accept.as_deref() != Some(compute_accept_key(key).as_str()) {
        warn!("websocket handshake accept key mismatch");
        return Err(Error::ErrWsHandshakeFailed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.push(if fin { 0x80 | opcode } else { opcode });
        match payload.len() {
            len if len <= 125 => frame.push(len as u8),
            len if len <= u16::MAX as usize => {
                frame.push(126);
                frame.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                frame.push(127);
                frame.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_accept_key_derivation() {
        // Sample key from RFC 6455 section 1.3.
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_decode_text_frame() {
        let mut codec = WsCodec::new();
        codec.feed(&server_frame(true, OPCODE_TEXT, b"hello"));
        assert_eq!(
            codec.next_message().unwrap(),
            Some(Message::Text("hello".to_string()))
        );
        assert_eq!(codec.next_message().unwrap(), None);
    }

    #[test]
    fn test_decode_partial_frame() {
        let frame = server_frame(true, OPCODE_BINARY, &[1, 2, 3, 4]);
        let mut codec = WsCodec::new();
        codec.feed(&frame[..3]);
        assert_eq!(codec.next_message().unwrap(), None);
        codec.feed(&frame[3..]);
        assert_eq!(
            codec.next_message().unwrap(),
            Some(Message::Binary(Bytes::from_static(&[1, 2, 3, 4])))
        );
    }

    #[test]
    fn test_decode_extended_length() {
        let payload = vec![0x42u8; 300];
        let mut codec = WsCodec::new();
        codec.feed(&server_frame(true, OPCODE_BINARY, &payload));
        match codec.next_message().unwrap() {
            Some(Message::Binary(data)) => assert_eq!(data.len(), 300),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_fragmented_message_with_interleaved_ping() {
        let mut codec = WsCodec::new();
        codec.feed(&server_frame(false, OPCODE_TEXT, b"He"));
        codec.feed(&server_frame(true, OPCODE_PING, b"p"));
        codec.feed(&server_frame(true, OPCODE_CONTINUATION, b"llo"));

        assert_eq!(
            codec.next_message().unwrap(),
            Some(Message::Ping(Bytes::from_static(b"p")))
        );
        assert_eq!(
            codec.next_message().unwrap(),
            Some(Message::Text("Hello".to_string()))
        );
    }

    #[test]
    fn test_continuation_without_start_is_violation() {
        let mut codec = WsCodec::new();
        codec.feed(&server_frame(true, OPCODE_CONTINUATION, b"x"));
        assert_eq!(
            codec.next_message(),
            Err(Error::ErrWsProtocolViolation)
        );
    }

    #[test]
    fn test_fragmented_control_frame_is_violation() {
        let mut codec = WsCodec::new();
        codec.feed(&server_frame(false, OPCODE_PING, b"x"));
        assert_eq!(
            codec.next_message(),
            Err(Error::ErrWsProtocolViolation)
        );
    }

    #[test]
    fn test_masked_server_frame_is_violation() {
        let mut codec = WsCodec::new();
        codec.feed(&[0x81, 0x81, 0, 0, 0, 0, b'x']);
        assert_eq!(
            codec.next_message(),
            Err(Error::ErrWsProtocolViolation)
        );
    }

    #[test]
    fn test_unknown_opcode_is_violation() {
        let mut codec = WsCodec::new();
        codec.feed(&server_frame(true, 0x3, b""));
        assert_eq!(
            codec.next_message(),
            Err(Error::ErrWsProtocolViolation)
        );
    }

    #[test]
    fn test_oversize_frame_is_rejected() {
        let mut codec = WsCodec::new();
        let mut frame = vec![0x82, 127];
        frame.extend_from_slice(&((LOCAL_MAX_MESSAGE_SIZE as u64) + 1).to_be_bytes());
        codec.feed(&frame);
        assert_eq!(codec.next_message(), Err(Error::ErrMessageTooLarge));
    }

    #[test]
    fn test_close_frame_with_code() {
        let mut codec = WsCodec::new();
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"done");
        codec.feed(&server_frame(true, OPCODE_CLOSE, &payload));
        assert_eq!(
            codec.next_message().unwrap(),
            Some(Message::Close {
                code: Some(1000),
                reason: "done".to_string()
            })
        );
    }

    #[test]
    fn test_close_frame_without_code() {
        let mut codec = WsCodec::new();
        codec.feed(&server_frame(true, OPCODE_CLOSE, b""));
        assert_eq!(
            codec.next_message().unwrap(),
            Some(Message::Close {
                code: None,
                reason: String::new()
            })
        );
    }

    #[test]
    fn test_encode_frame_masks_payload() {
        let frame = encode_frame(OPCODE_TEXT, b"hello");
        assert_eq!(frame[0], 0x80 | OPCODE_TEXT);
        assert_eq!(frame[1], 0x80 | 5);
        let mask = &frame[2..6];
        let unmasked: Vec<u8> = frame[6..]
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ mask[i % 4])
            .collect();
        assert_eq!(unmasked, b"hello");
    }

    #[test]
    fn test_handshake_response_accepted() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let head = "HTTP/1.1 101 Switching Protocols\r\n\
                    Upgrade: websocket\r\n\
                    Connection: Upgrade\r\n\
                    Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
                    \r\n";
        assert!(check_handshake_response(head.as_bytes(), key).is_ok());
    }

    #[test]
    fn test_handshake_response_rejected() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let tests = vec![
            "HTTP/1.1 200 OK\r\n\r\n".to_string(),
            "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: bogus\r\n\r\n".to_string(),
            "HTTP/1.1 101 Switching Protocols\r\n\r\n".to_string(),
        ];
        for head in tests {
            assert_eq!(
                check_handshake_response(head.as_bytes(), key),
                Err(Error::ErrWsHandshakeFailed)
            );
        }
    }
}
