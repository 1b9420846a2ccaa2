//! # wsflow
//! A WebSocket connection engine: RFC 6455 framing, permessage-deflate (RFC 7692) without
//! context takeover, and a concurrent read/write pipeline over any duplex byte stream.
//!
//! A [`Conn`] owns both halves of a stream. Its read loop ([`Conn::listen`]) reassembles
//! fragmented messages, inflates compressed ones, answers pings and closes, and reports
//! everything to an [`EventHandler`]. Outgoing messages go through a bounded [`MessageQueue`]
//! and are flushed by jobs on a shared [`WorkerPool`], so writers never wait on the network.
//!
//! # Features
//! - `zlib`: builds flate2 on top of zlib-rs instead of miniz_oxide.
//! - `logging`: debug logging of handshakes and connection failures through the `log` crate.
//! - `simd`: SIMD accelerated UTF-8 validation with `simdutf8`.
//! - `json`: [`Conn::write_json_async`] for sending serde values as text messages.
//!
//! # Server Example
//! ```rust
//! use std::sync::Arc;
//! use http_body_util::Empty;
//! use hyper::{body::{Bytes, Incoming}, Request, Response};
//! use wsflow::{Conn, EventHandler, Message, Options, Upgrader};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_message(&self, conn: &Conn, message: Message) {
//!         let _ = conn.write_async(message.opcode, message.payload);
//!     }
//! }
//!
//! async fn server_upgrade(
//!     upgrader: Upgrader,
//!     mut req: Request<Incoming>,
//! ) -> wsflow::Result<Response<Empty<Bytes>>> {
//!     let (response, fut) = upgrader.upgrade(&mut req)?;
//!
//!     tokio::spawn(async move {
//!         if let Ok(conn) = fut.await {
//!             conn.listen().await;
//!         }
//!     });
//!
//!     Ok(response)
//! }
//!
//! # async fn setup() {
//! let upgrader = Upgrader::new(Options::default().with_compression(), Arc::new(Echo));
//! # }
//! ```
//!
//! # Memory Safety
//! - Incoming messages are capped at [`Options::max_content_length`], after reassembly and
//!   after decompression.
//! - The outbound queue is bounded: writers get [`WebSocketError::QueueFull`] instead of
//!   buffering without limit.
//! - Asynchronously dispatched messages are bounded by the queue size as well.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod codec;
mod compression;
mod conn;
pub mod frame;
mod handler;
mod mask;
mod options;
mod pool;
mod queue;
mod upgrade;

use thiserror::Error;

pub use close::CloseCode;
pub use compression::{Compressor, Decompressor, WebSocketExtensions};
pub use conn::{Conn, Role};
pub use frame::{Frame, Message, OpCode};
pub use handler::{EventHandler, NoopHandler};
pub use mask::apply_mask;
pub use options::*;
pub use pool::{AsyncJob, WorkerPool};
pub use queue::MessageQueue;
pub use upgrade::{sec_websocket_accept, UpgradeFut, UpgradeResult, Upgrader};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors that can occur on a WebSocket connection.
///
/// Broadly:
/// - Protocol errors: the peer sent something RFC 6455 forbids.
/// - Limits: a frame or message exceeded the configured size, or the outbound queue is full.
/// - Handshake errors: the HTTP upgrade request was not acceptable.
/// - I/O and system-level errors.
///
/// [`WebSocketError::close_code`] maps each error to the status code sent to the peer when the
/// error ends a connection.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A new data frame arrived before the previous fragmented message was complete.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// A continuation frame arrived without a message to continue, or had RSV1 set.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// A text message or a close reason is not valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// The connection is closed; nothing can be written anymore.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// A close frame with a one byte payload.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carrying a status code that may not be sent on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// RSV2 or RSV3 set, or RSV1 on a control frame.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A ping, pong or close frame without the FIN bit.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame with more than 125 bytes of payload.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// A single frame larger than the maximum content length.
    #[error("Frame too large")]
    FrameTooLarge,

    /// A message larger than the maximum content length, once reassembled or inflated.
    #[error("Message too large")]
    MessageTooLarge,

    /// A payload length not encoded in its shortest form.
    #[error("Payload length is not minimally encoded")]
    NonCanonicalLength,

    /// A client sent a frame without a mask.
    #[error("Frame from client is not masked")]
    UnmaskedFrame,

    /// A server sent a masked frame.
    #[error("Frame from server is masked")]
    MaskedFrame,

    /// An opcode RFC 6455 reserves for future use.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A compressed frame on a connection that did not negotiate permessage-deflate.
    #[error("Received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// Deflating an outgoing message failed.
    #[error("Compression failed: {0}")]
    Compression(std::io::Error),

    /// An incoming message is not a valid deflate stream, or was cut short.
    #[error("Decompression failed: {0}")]
    Decompression(std::io::Error),

    /// The outbound queue is at capacity; the message was not queued.
    #[error("Message queue is full")]
    QueueFull,

    /// A read, write or handshake did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// The upgrade request is not a `GET`.
    #[error("Upgrade request must use GET")]
    InvalidMethod,

    /// The "Sec-WebSocket-Version" header is not 13.
    #[error("Sec-Websocket-Version must be 13")]
    InvalidSecWebsocketVersion,

    /// The "Connection" header is missing or doesn't contain "upgrade".
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// The "Upgrade" header is missing or isn't "websocket".
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The "Sec-WebSocket-Key" header is missing.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The origin check refused the request.
    #[error("Request origin not allowed")]
    OriginRejected,

    /// A response header could not be built.
    #[error(transparent)]
    InvalidHeaderValue(#[from] hyper::header::InvalidHeaderValue),

    /// Wraps standard I/O errors, such as connection resets.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Wraps errors from hyper during the upgrade.
    #[error(transparent)]
    HTTPError(#[from] hyper::Error),

    /// Serializing a JSON message failed.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// The close code sent to the peer when this error terminates the connection.
    pub fn close_code(&self) -> CloseCode {
        use WebSocketError::*;

        match self {
            FrameTooLarge | MessageTooLarge => CloseCode::Size,
            InvalidUTF8 | Decompression(_) => CloseCode::Invalid,
            InvalidOpCode(_) => CloseCode::Unsupported,
            InvalidFragment
            | InvalidContinuationFrame
            | InvalidCloseFrame
            | InvalidCloseCode
            | ReservedBitsNotZero
            | ControlFrameFragmented
            | ControlFrameTooLarge
            | NonCanonicalLength
            | UnmaskedFrame
            | MaskedFrame
            | CompressionNotSupported => CloseCode::Protocol,
            _ => CloseCode::Error,
        }
    }
}
