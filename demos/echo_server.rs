//! A WebSocket echo server built on wsflow and hyper.
//! Every text or binary message a client sends is queued back to it unchanged.

use std::sync::Arc;

use http_body_util::Empty;
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
    Request, Response,
};
use tokio::net::TcpListener;
use wsflow::{
    CloseCode, CompressionLevel, Conn, EventHandler, Message, Options, Upgrader, WebSocketError,
};

/// Sends each message back to the connection it came from.
struct Echo;

impl EventHandler for Echo {
    fn on_message(&self, conn: &Conn, message: Message) {
        if let Err(e) = conn.write_async(message.opcode, message.payload) {
            log::warn!("Dropping echo: {}", e);
        }
    }

    fn on_error(&self, _conn: &Conn, err: &WebSocketError) {
        log::error!("Error in websocket connection: {}", err);
    }

    fn on_close(&self, _conn: &Conn, code: CloseCode, reason: &[u8]) {
        log::debug!(
            "Client disconnected ({}): {}",
            code,
            String::from_utf8_lossy(reason)
        );
    }
}

/// Upgrades an HTTP request and hands the connection to its read loop.
async fn server_upgrade(
    upgrader: Upgrader,
    mut req: Request<Incoming>,
) -> wsflow::Result<Response<Empty<Bytes>>> {
    let (response, fut) = upgrader.upgrade(&mut req)?;

    tokio::task::spawn(async move {
        match fut.await {
            Ok(conn) => conn.listen().await,
            Err(e) => log::error!("Upgrade failed: {}", e),
        }
    });

    Ok(response)
}

/// Listens on port 8080 and serves each client on its own task.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Debug)?;

    let options = Options::default()
        .with_utf8()
        .with_async_read()
        .with_max_content_length(16 * 1024 * 1024)
        .with_compression_level(CompressionLevel::fast());
    let upgrader = Upgrader::new(options, Arc::new(Echo));

    let listener = TcpListener::bind("0.0.0.0:8080").await?;
    log::debug!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, _) = listener.accept().await?;
        log::info!("Client connected");

        let upgrader = upgrader.clone();
        tokio::spawn(async move {
            let io = hyper_util::rt::TokioIo::new(stream);
            let service = service_fn(move |req| server_upgrade(upgrader.clone(), req));
            let conn_fut = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades();
            if let Err(e) = conn_fut.await {
                log::error!("An error occurred: {:?}", e);
            }
        });
    }
}
