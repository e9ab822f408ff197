//! End-to-end WebSocket client tests against an in-process echo server.

use base64::{prelude::BASE64_STANDARD, Engine};
use rtc_link::{Error, Message, WebSocket};
use sha1::{Digest, Sha1};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

async fn wait_until(predicate: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !predicate() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    BASE64_STANDARD.encode(sha1.finalize())
}

async fn read_http_request(stream: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8(buffer).unwrap()
}

async fn perform_server_handshake(stream: &mut TcpStream) {
    let request = read_http_request(stream).await;
    assert!(request.starts_with("GET "), "request: {request}");
    assert!(request.contains("Upgrade: websocket"), "request: {request}");
    let key = request
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("sec-websocket-key")
                .then(|| value.trim().to_string())
        })
        .expect("missing Sec-WebSocket-Key");

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(&key)
    );
    stream.write_all(response.as_bytes()).await.unwrap();
}

async fn read_frame(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.ok()?;
    let opcode = header[0] & 0x0f;
    let masked = header[1] & 0x80 != 0;

    let mut len = (header[1] & 0x7f) as usize;
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await.ok()?;
        len = u16::from_be_bytes(ext) as usize;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).await.ok()?;
        len = u64::from_be_bytes(ext) as usize;
    }

    let mask = if masked {
        let mut mask = [0u8; 4];
        stream.read_exact(&mut mask).await.ok()?;
        Some(mask)
    } else {
        None
    };

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.ok()?;
    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }
    Some((opcode, payload))
}

async fn write_frame(stream: &mut TcpStream, opcode: u8, payload: &[u8]) {
    let mut frame = vec![0x80 | opcode];
    match payload.len() {
        n if n <= 125 => frame.push(n as u8),
        n if n <= u16::MAX as usize => {
            frame.push(126);
            frame.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            frame.push(127);
            frame.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.unwrap();
}

/// Accepts one connection and echoes data frames until a close arrives.
async fn serve_echo(listener: TcpListener) {
    let (mut stream, _) = listener.accept().await.unwrap();
    perform_server_handshake(&mut stream).await;

    while let Some((opcode, payload)) = read_frame(&mut stream).await {
        match opcode {
            0x8 => {
                write_frame(&mut stream, 0x8, &payload).await;
                return;
            }
            0x9 => write_frame(&mut stream, 0xa, &payload).await,
            0xa => {}
            _ => write_frame(&mut stream, opcode, &payload).await,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_open_send_receive_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(serve_echo(listener));

    let ws = WebSocket::new(None);
    let opened = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    {
        let opened = Arc::clone(&opened);
        ws.on_open(move || {
            opened.fetch_add(1, Ordering::SeqCst);
        });
        let closed = Arc::clone(&closed);
        ws.on_closed(move || {
            closed.fetch_add(1, Ordering::SeqCst);
        });
    }

    ws.open(&format!("ws://127.0.0.1:{port}/echo")).await.unwrap();
    wait_until(|| ws.is_open()).await;
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    // A second open while not closed must be rejected.
    assert_eq!(
        ws.open(&format!("ws://127.0.0.1:{port}/")).await,
        Err(Error::ErrInvalidState)
    );

    ws.send("hello websocket").unwrap();
    wait_until(|| ws.available_amount() > 0).await;
    assert_eq!(ws.available_amount(), "hello websocket".len());
    assert_eq!(
        ws.receive(),
        Some(Message::Text("hello websocket".to_string()))
    );
    assert_eq!(ws.available_amount(), 0);

    ws.send(vec![1u8, 2, 3]).unwrap();
    wait_until(|| ws.available_amount() == 3).await;
    match ws.receive() {
        Some(Message::Binary(data)) => assert_eq!(&data[..], &[1, 2, 3]),
        other => panic!("unexpected message: {other:?}"),
    }

    // An oversized send fails and leaves the queue untouched.
    let oversized = vec![0u8; 300 * 1024];
    assert_eq!(ws.send(oversized), Err(Error::ErrMessageTooLarge));
    assert_eq!(ws.available_amount(), 0);

    ws.close();
    wait_until(|| ws.is_closed()).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(ws.send("after close"), Err(Error::ErrNotOpen));

    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_failure_reports_error() {
    // Bind a port, then free it so the connection is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let ws = WebSocket::new(None);
    let errors = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let errors = Arc::clone(&errors);
        ws.on_error(move |cause| {
            errors.lock().unwrap().push(cause.to_string());
        });
    }

    let result = ws.open(&format!("ws://127.0.0.1:{port}/")).await;
    assert_eq!(result, Err(Error::ErrConnectFailed));
    wait_until(|| ws.is_closed()).await;
    assert_eq!(
        errors.lock().unwrap().as_slice(),
        ["network failed: TCP connection failed"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handshake_rejection_fails_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_http_request(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
            .await
            .unwrap();
    });

    let ws = WebSocket::new(None);
    let opened = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let opened = Arc::clone(&opened);
        ws.on_open(move || {
            opened.fetch_add(1, Ordering::SeqCst);
        });
        let errors = Arc::clone(&errors);
        ws.on_error(move |cause| {
            errors.lock().unwrap().push(cause.to_string());
        });
    }

    ws.open(&format!("ws://127.0.0.1:{port}/")).await.unwrap();
    wait_until(|| ws.is_closed()).await;
    assert_eq!(opened.load(Ordering::SeqCst), 0);
    assert!(
        errors
            .lock()
            .unwrap()
            .iter()
            .any(|cause| cause == "network failed: WebSocket connection failed"),
        "errors: {:?}",
        errors.lock().unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_close_reports_code() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        perform_server_handshake(&mut stream).await;

        // Wait for the client's first message, then close with a code.
        let _ = read_frame(&mut stream).await;
        write_frame(&mut stream, 0x8, &4000u16.to_be_bytes()).await;
        // Drain the echoed close.
        let _ = read_frame(&mut stream).await;
    });

    let ws = WebSocket::new(None);
    let closed = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let closed = Arc::clone(&closed);
        ws.on_closed(move || {
            closed.fetch_add(1, Ordering::SeqCst);
        });
        let errors = Arc::clone(&errors);
        ws.on_error(move |cause| {
            errors.lock().unwrap().push(cause.to_string());
        });
    }

    ws.open(&format!("ws://127.0.0.1:{port}/")).await.unwrap();
    wait_until(|| ws.is_open()).await;
    ws.send("bye").unwrap();

    wait_until(|| ws.is_closed()).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(
        errors
            .lock()
            .unwrap()
            .iter()
            .any(|cause| cause == "remote closed with code 4000"),
        "errors: {:?}",
        errors.lock().unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drop_while_open_is_safe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_echo(listener));

    let ws = WebSocket::new(None);
    ws.open(&format!("ws://127.0.0.1:{port}/")).await.unwrap();
    wait_until(|| ws.is_open()).await;

    // Any callback delivered after release must be a no-op.
    drop(ws);
    sleep(Duration::from_millis(100)).await;
}
