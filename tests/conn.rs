//! End to end behaviour of two connections talking over an in-memory stream.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use tokio::io::duplex;
use wsflow::{
    CloseCode, Conn, EventHandler, Message, OpCode, Options, Role, Upgrader, WebSocketError,
};

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<Message>>,
    errors: Mutex<Vec<String>>,
    closes: Mutex<Vec<(CloseCode, Vec<u8>)>>,
    pings: Mutex<Vec<Bytes>>,
    pongs: Mutex<Vec<Bytes>>,
    echo: bool,
}

impl Recorder {
    fn echo() -> Self {
        Self {
            echo: true,
            ..Default::default()
        }
    }

    fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

impl EventHandler for Recorder {
    fn on_message(&self, conn: &Conn, message: Message) {
        if self.echo {
            conn.write_async(message.opcode, message.payload.clone()).unwrap();
        }
        self.messages.lock().unwrap().push(message);
    }

    fn on_error(&self, _conn: &Conn, err: &WebSocketError) {
        self.errors.lock().unwrap().push(err.to_string());
    }

    fn on_close(&self, _conn: &Conn, code: CloseCode, reason: &[u8]) {
        self.closes.lock().unwrap().push((code, reason.to_vec()));
    }

    fn on_ping(&self, _conn: &Conn, payload: &[u8]) {
        self.pings.lock().unwrap().push(Bytes::copy_from_slice(payload));
    }

    fn on_pong(&self, _conn: &Conn, payload: &[u8]) {
        self.pongs.lock().unwrap().push(Bytes::copy_from_slice(payload));
    }
}

/// Connects a server and a client over a duplex stream and starts both read loops.
fn pair(
    server_options: Options,
    server: Arc<Recorder>,
    client_options: Options,
    client: Arc<Recorder>,
    compression: bool,
) -> (Conn, Conn) {
    let (a, b) = duplex(64 * 1024);
    let server = Upgrader::new(server_options, server).serve(Role::Server, a, compression);
    let client = Upgrader::new(client_options, client).serve(Role::Client, b, compression);

    for conn in [server.clone(), client.clone()] {
        tokio::spawn(async move { conn.listen().await });
    }

    (server, client)
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Queues a message, backing off while the queue is full.
async fn send(conn: &Conn, opcode: OpCode, payload: Bytes) {
    loop {
        match conn.write_async(opcode, payload.clone()) {
            Ok(()) => return,
            Err(WebSocketError::QueueFull) => tokio::time::sleep(Duration::from_millis(1)).await,
            Err(err) => panic!("write failed: {err}"),
        }
    }
}

fn payloads(n: usize) -> Vec<Bytes> {
    (0..n)
        .map(|i| Bytes::from(format!("{i}:{}", "x".repeat(i % 2000))))
        .collect()
}

fn sorted(messages: &[Message]) -> Vec<Bytes> {
    let mut out: Vec<Bytes> = messages.iter().map(|m| m.payload.clone()).collect();
    out.sort();
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo() {
    let server = Arc::new(Recorder::echo());
    let client = Arc::new(Recorder::default());
    let options = Options::default().with_message_queue_size(1024);
    let (_server_conn, client_conn) = pair(
        options.clone(),
        server.clone(),
        options,
        client.clone(),
        false,
    );

    let mut expected = payloads(200);
    for payload in &expected {
        send(&client_conn, OpCode::Text, payload.clone()).await;
    }

    wait_until(|| client.message_count() == expected.len()).await;

    expected.sort();
    assert_eq!(sorted(&client.messages.lock().unwrap()), expected);
    assert!(server.errors.lock().unwrap().is_empty());
    assert!(client.errors.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_compressed() {
    let server = Arc::new(Recorder::echo());
    let client = Arc::new(Recorder::default());
    let options = Options::default()
        .with_compression()
        .with_compression_threshold(64)
        .with_message_queue_size(1024);
    let (server_conn, client_conn) = pair(
        options.clone(),
        server.clone(),
        options,
        client.clone(),
        true,
    );
    assert!(server_conn.compression_enabled());

    let mut expected = payloads(200);
    for payload in &expected {
        send(&client_conn, OpCode::Binary, payload.clone()).await;
    }

    wait_until(|| client.message_count() == expected.len()).await;

    expected.sort();
    assert_eq!(sorted(&server.messages.lock().unwrap()), expected);
    assert_eq!(sorted(&client.messages.lock().unwrap()), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_read() {
    let server = Arc::new(Recorder::default());
    let client = Arc::new(Recorder::default());
    let server_options = Options::default()
        .with_compression()
        .with_async_read()
        .with_worker_pool_size(4);
    let client_options = Options::default()
        .with_compression()
        .with_message_queue_size(64);
    let (_server_conn, client_conn) =
        pair(server_options, server.clone(), client_options, client, true);

    let mut expected = payloads(1000);
    for payload in &expected {
        send(&client_conn, OpCode::Text, payload.clone()).await;
    }

    wait_until(|| server.message_count() == expected.len()).await;

    expected.sort();
    assert_eq!(sorted(&server.messages.lock().unwrap()), expected);
}

#[tokio::test]
async fn test_write_after_peer_dropped() {
    let (a, b) = duplex(1024);
    let handler = Arc::new(Recorder::default());
    let conn = Upgrader::new(Options::default(), handler.clone()).serve(Role::Client, a, false);
    drop(b);

    let err = conn
        .write_message(OpCode::Text, "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, WebSocketError::IoError(_)));
    assert!(conn.is_closed());

    assert!(matches!(
        conn.write_async(OpCode::Text, "again"),
        Err(WebSocketError::ConnectionClosed)
    ));
    assert!(matches!(
        conn.write_message(OpCode::Text, "again").await,
        Err(WebSocketError::ConnectionClosed)
    ));
    assert_eq!(handler.errors.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_queued_write_after_peer_dropped() {
    let (a, b) = duplex(1024);
    let handler = Arc::new(Recorder::default());
    let conn = Upgrader::new(Options::default(), handler.clone()).serve(Role::Client, a, false);
    drop(b);

    // queued fine, the failure surfaces when the pool drains the queue
    conn.write_async(OpCode::Text, "hello").unwrap();
    wait_until(|| !handler.errors.lock().unwrap().is_empty()).await;
    assert!(conn.is_closed());

    assert!(matches!(
        conn.write_async(OpCode::Text, "again"),
        Err(WebSocketError::ConnectionClosed)
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.errors.lock().unwrap().len(), 1);
    assert_eq!(conn.pending(), 0);
}

#[tokio::test]
async fn test_ping_pong() {
    let server = Arc::new(Recorder::default());
    let client = Arc::new(Recorder::default());
    let (_server_conn, client_conn) = pair(
        Options::default(),
        server.clone(),
        Options::default(),
        client.clone(),
        false,
    );

    client_conn.write_ping("are you there").await.unwrap();
    wait_until(|| !client.pongs.lock().unwrap().is_empty()).await;

    assert_eq!(server.pings.lock().unwrap()[0], "are you there");
    assert_eq!(client.pongs.lock().unwrap()[0], "are you there");
}

#[tokio::test]
async fn test_close_handshake() {
    let server = Arc::new(Recorder::default());
    let client = Arc::new(Recorder::default());
    let (server_conn, client_conn) = pair(
        Options::default(),
        server.clone(),
        Options::default(),
        client.clone(),
        false,
    );

    client_conn.write_close(CloseCode::Normal, "bye").await.unwrap();
    wait_until(|| !server.closes.lock().unwrap().is_empty()).await;

    assert_eq!(
        server.closes.lock().unwrap()[0],
        (CloseCode::Normal, b"bye".to_vec())
    );
    assert!(server_conn.is_closed());
    assert!(client_conn.is_closed());
    assert_eq!(
        *client.closes.lock().unwrap(),
        vec![(CloseCode::Normal, b"bye".to_vec())]
    );
    assert!(client.errors.lock().unwrap().is_empty());

    assert!(matches!(
        client_conn.write_close(CloseCode::Normal, "").await,
        Err(WebSocketError::ConnectionClosed)
    ));
    assert_eq!(client.closes.lock().unwrap().len(), 1);
    assert_eq!(server.closes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_oversized_message() {
    let server = Arc::new(Recorder::default());
    let client = Arc::new(Recorder::default());
    let (server_conn, client_conn) = pair(
        Options::default().with_max_content_length(1024),
        server.clone(),
        Options::default(),
        client.clone(),
        false,
    );

    client_conn
        .write_message(OpCode::Binary, vec![0u8; 2048])
        .await
        .unwrap();

    wait_until(|| !client.closes.lock().unwrap().is_empty()).await;

    assert_eq!(server.errors.lock().unwrap().len(), 1);
    assert!(server.messages.lock().unwrap().is_empty());
    assert_eq!(client.closes.lock().unwrap()[0].0, CloseCode::Size);
    assert!(server_conn.is_closed());
}
