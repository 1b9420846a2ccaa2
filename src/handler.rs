//! Callbacks through which a [`Conn`] reports what happens on the wire.
use crate::{close::CloseCode, conn::Conn, frame::Message, WebSocketError};

/// Receives the events of one or more connections.
///
/// Every method has an empty default, so an implementation only overrides what it cares about.
/// With asynchronous reads enabled `on_message` runs on the worker pool, possibly for several
/// messages of the same connection at once; all the other hooks run on the read loop.
pub trait EventHandler: Send + Sync + 'static {
    /// A complete (reassembled and decompressed) text or binary message arrived.
    fn on_message(&self, _conn: &Conn, _message: Message) {}

    /// The connection failed and is now closed. Called at most once per connection.
    fn on_error(&self, _conn: &Conn, _err: &WebSocketError) {}

    /// The connection was closed with a close frame. Called at most once per connection.
    ///
    /// When the peer closed it, its close frame was already echoed; when it was closed with
    /// [`Conn::write_close`], `code` and `reason` are the ones sent.
    fn on_close(&self, _conn: &Conn, _code: CloseCode, _reason: &[u8]) {}

    /// A ping arrived. The pong reply was already queued.
    fn on_ping(&self, _conn: &Conn, _payload: &[u8]) {}

    /// A pong arrived.
    fn on_pong(&self, _conn: &Conn, _payload: &[u8]) {}
}

/// An [`EventHandler`] that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}
