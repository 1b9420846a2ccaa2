//! # Connection
//!
//! [`Conn`] is a cloneable handle to one WebSocket connection. Any number of tasks may write
//! through it concurrently while a single task runs [`Conn::listen`]:
//!
//! - [`Conn::write_async`] queues a message and returns immediately. The queue is drained by a
//!   job on the [`WorkerPool`], at most one per connection at a time, so queued messages reach
//!   the wire in order.
//! - [`Conn::write_message`] writes inline and returns once the frame was flushed.
//! - Physical writes are serialized by an async mutex around the [`WriteHalf`], so frames are
//!   never interleaved.
//! - [`Conn::listen`] reads messages until the connection ends and hands them to the
//!   [`EventHandler`], inline or on the pool.
//!
//! The first failure closes the connection: a close frame carrying the matching status code is
//! sent when the stream still allows it, the handler's `on_error` runs once, and every later
//! write fails with [`WebSocketError::ConnectionClosed`].
mod read;
mod write;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tokio_util::sync::CancellationToken;

use crate::{
    close::CloseCode,
    frame::{Message, OpCode, MAX_CONTROL_PAYLOAD},
    handler::EventHandler,
    options::Options,
    pool::{AsyncJob, WorkerPool},
    queue::MessageQueue,
    Result, WebSocketError,
};

pub(crate) use read::ReadHalf;
pub(crate) use write::WriteHalf;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The side of the connection the local endpoint plays.
///
/// Clients mask every frame they send; servers never do, and each rejects frames that break
/// the rule for the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// A WebSocket connection over an already upgraded stream.
///
/// Cloning is cheap and every clone refers to the same connection. The stream is released
/// when the last clone is dropped.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<Inner>,
}

struct Inner {
    role: Role,
    options: Options,
    compression_enabled: bool,
    closed: AtomicBool,
    /// Stops the read loop once the connection is closed from elsewhere.
    shutdown: CancellationToken,
    write_half: tokio::sync::Mutex<WriteHalf>,
    /// Taken by the one and only `listen` call.
    read_half: Mutex<Option<ReadHalf>>,
    queue: MessageQueue,
    pool: WorkerPool,
    handler: Arc<dyn EventHandler>,
    /// Bounds the messages dispatched on the pool but not yet handled.
    read_permits: Arc<Semaphore>,
}

impl Conn {
    pub(crate) fn new<S>(
        role: Role,
        stream: S,
        options: Options,
        compression_enabled: bool,
        pool: WorkerPool,
        handler: Arc<dyn EventHandler>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let options = options.normalized();
        let (reader, writer) = tokio::io::split(stream);

        #[cfg(feature = "logging")]
        log::debug!(
            "new {} connection, compression: {}",
            role,
            compression_enabled
        );

        Self {
            inner: Arc::new(Inner {
                role,
                compression_enabled,
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                write_half: tokio::sync::Mutex::new(WriteHalf::new(
                    role,
                    Box::new(writer),
                    &options,
                    compression_enabled,
                )),
                read_half: Mutex::new(Some(ReadHalf::new(
                    role,
                    Box::new(reader),
                    &options,
                    compression_enabled,
                ))),
                queue: MessageQueue::new(options.message_queue_size),
                pool,
                handler,
                read_permits: Arc::new(Semaphore::new(options.message_queue_size)),
                options,
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Options in effect, with zero values already replaced by their defaults.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Whether permessage-deflate is active on this connection.
    pub fn compression_enabled(&self) -> bool {
        self.inner.compression_enabled
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of messages queued by [`Conn::write_async`] and not yet written.
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    // ======== write path =============

    /// Queues a message and returns without waiting for it to be written.
    ///
    /// Queued messages are written in order by a job on the worker pool. A failure while
    /// writing them is reported through the handler's `on_error` and closes the connection.
    ///
    /// # Errors
    /// - [`WebSocketError::ConnectionClosed`] once the connection is closed
    /// - [`WebSocketError::QueueFull`] if `message_queue_size` messages are already waiting;
    ///   the connection stays usable
    /// - [`WebSocketError::ControlFrameTooLarge`] for a control payload above 125 bytes
    pub fn write_async(&self, opcode: OpCode, payload: impl Into<Bytes>) -> Result<()> {
        if self.is_closed() {
            return Err(WebSocketError::ConnectionClosed);
        }

        let payload = payload.into();
        check_outgoing(opcode, &payload)?;

        if self.inner.queue.push(opcode, payload)? {
            let conn = self.clone();
            self.inner.pool.add_job(AsyncJob::new(conn, |conn: Conn| async move {
                conn.drain().await;
                Ok(())
            }));
        }

        Ok(())
    }

    /// Serializes `value` to JSON and queues it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn write_json_async<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.write_async(OpCode::Text, bytes)
    }

    /// Writes a message and waits until it has been flushed to the stream.
    ///
    /// Unlike [`Conn::write_async`] the message doesn't wait behind the queue. A write failure
    /// closes the connection, is reported to `on_error` and returned.
    pub async fn write_message(&self, opcode: OpCode, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        check_outgoing(opcode, &payload)?;

        match self.write_frame(opcode, payload).await {
            Err(WebSocketError::ConnectionClosed) => Err(WebSocketError::ConnectionClosed),
            Err(err) => {
                self.emit_error(&err).await;
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }

    pub async fn write_ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.write_message(OpCode::Ping, payload).await
    }

    pub async fn write_pong(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.write_message(OpCode::Pong, payload).await
    }

    /// Closes the connection: sends a close frame, shuts the stream down and stops the read
    /// loop. Messages still queued are discarded.
    ///
    /// The handler's `on_close` runs once with `code` and `reason`, whether or not the close
    /// frame could be written.
    pub async fn write_close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(WebSocketError::ConnectionClosed);
        }

        #[cfg(feature = "logging")]
        log::debug!("{} closing connection with {}", self.inner.role, code);

        self.inner.shutdown.cancel();
        self.inner.queue.clear();

        let message = Message::close(code, reason);
        let res = {
            let mut write_half = self.inner.write_half.lock().await;
            match self.timed(write_half.send(OpCode::Close, message.payload.clone())).await {
                Ok(()) => self.timed(write_half.shutdown()).await,
                Err(err) => Err(err),
            }
        };

        self.inner.handler.on_close(self, code, message.close_reason());
        res
    }

    /// Writes everything in the queue, then hands the queue back to idle.
    async fn drain(&self) {
        while let Some((opcode, payload)) = self.inner.queue.pop() {
            if let Err(err) = self.write_frame(opcode, payload).await {
                self.inner.queue.clear();
                if !matches!(err, WebSocketError::ConnectionClosed) {
                    self.emit_error(&err).await;
                }
            }
        }
    }

    /// One physical write under the write lock.
    async fn write_frame(&self, opcode: OpCode, payload: Bytes) -> Result<()> {
        let mut write_half = self.inner.write_half.lock().await;
        if self.is_closed() {
            return Err(WebSocketError::ConnectionClosed);
        }

        self.timed(write_half.send(opcode, payload)).await
    }

    /// Bounds a write by `write_timeout`.
    async fn timed<F>(&self, fut: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        with_timeout(self.inner.options.write_timeout, fut).await
    }

    /// Closes the connection because of `err` and reports it, unless it's already closed.
    async fn emit_error(&self, err: &WebSocketError) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        #[cfg(feature = "logging")]
        log::debug!("{} connection failed: {}", self.inner.role, err);

        self.inner.shutdown.cancel();
        self.inner.queue.clear();

        {
            let mut write_half = self.inner.write_half.lock().await;
            // a broken stream can't carry the close frame
            if !matches!(err, WebSocketError::IoError(_)) {
                let message = Message::close(err.close_code(), &err.to_string());
                let _ = self
                    .timed(write_half.send(OpCode::Close, message.payload))
                    .await;
            }
            let _ = self.timed(write_half.shutdown()).await;
        }

        self.inner.handler.on_error(self, err);
    }

    // ======== read path =============

    /// Reads and dispatches messages until the connection ends.
    ///
    /// Pings are answered with a pong before `on_ping` runs, and a close frame from the peer is
    /// echoed before `on_close` runs. Every other way the loop can end (end of stream, protocol
    /// violation, read timeout) is reported through `on_error`.
    ///
    /// Only the first call reads; later calls return immediately.
    pub async fn listen(&self) {
        let read_half = self
            .inner
            .read_half
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut read_half) = read_half else {
            #[cfg(feature = "logging")]
            log::debug!("{} connection is already being read", self.inner.role);
            return;
        };

        let read_timeout = self.inner.options.read_timeout;
        while !self.is_closed() {
            let res = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                res = with_timeout(read_timeout, read_half.next_message()) => res,
            };

            let res = match res {
                Ok(message) => self.on_message(message).await,
                Err(err) => Err(err),
            };

            if let Err(err) = res {
                self.emit_error(&err).await;
                break;
            }
        }
    }

    async fn on_message(&self, message: Message) -> Result<()> {
        let handler = &self.inner.handler;
        match message.opcode {
            OpCode::Text | OpCode::Binary => {
                if !self.inner.options.async_read_enabled {
                    handler.on_message(self, message);
                    return Ok(());
                }

                let permit = Arc::clone(&self.inner.read_permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| WebSocketError::ConnectionClosed)?;
                let job = AsyncJob::new(
                    (self.clone(), message, permit),
                    |(conn, message, _permit): (Conn, Message, OwnedSemaphorePermit)| async move {
                        conn.inner.handler.on_message(&conn, message);
                        Ok(())
                    },
                );
                self.inner.pool.add_job(job);
                Ok(())
            }
            OpCode::Ping => {
                self.write_frame(OpCode::Pong, message.payload.clone())
                    .await?;
                handler.on_ping(self, &message.payload);
                Ok(())
            }
            OpCode::Pong => {
                handler.on_pong(self, &message.payload);
                Ok(())
            }
            OpCode::Close => self.on_close(message).await,
            // reassembly never yields a bare continuation
            OpCode::Continuation => Err(WebSocketError::InvalidContinuationFrame),
        }
    }

    /// Validates the peer's close frame, echoes it and closes the connection.
    async fn on_close(&self, message: Message) -> Result<()> {
        let code = match message.payload.len() {
            0 => CloseCode::Status,
            1 => return Err(WebSocketError::InvalidCloseFrame),
            _ => {
                read::validate_utf8(message.close_reason())?;
                match message.close_code() {
                    Some(code) if code.is_allowed() => code,
                    _ => return Err(WebSocketError::InvalidCloseCode),
                }
            }
        };

        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        #[cfg(feature = "logging")]
        log::debug!("{} connection closed by peer with {}", self.inner.role, code);

        self.inner.shutdown.cancel();
        self.inner.queue.clear();

        {
            let mut write_half = self.inner.write_half.lock().await;
            let _ = self
                .timed(write_half.send(OpCode::Close, message.payload.clone()))
                .await;
            let _ = self.timed(write_half.shutdown()).await;
        }

        self.inner.handler.on_close(self, code, message.close_reason());
        Ok(())
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("role", &self.inner.role)
            .field("compression", &self.inner.compression_enabled)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Rejects messages that can't be sent as one frame.
fn check_outgoing(opcode: OpCode, payload: &[u8]) -> Result<()> {
    if opcode == OpCode::Continuation {
        return Err(WebSocketError::InvalidContinuationFrame);
    }
    if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(WebSocketError::ControlFrameTooLarge);
    }
    Ok(())
}

async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(res) => res,
        Err(_) => Err(WebSocketError::Timeout),
    }
}
