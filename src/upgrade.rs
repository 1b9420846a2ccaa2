//! # Upgrader
//!
//! Server side of the opening handshake ([RFC 6455 Section 4.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2))
//! on top of hyper: [`Upgrader::upgrade`] validates the request and builds the
//! `101 Switching Protocols` response, and the returned [`UpgradeFut`] turns the upgraded
//! transport into a [`Conn`] once hyper hands it over.
//!
//! Streams that were upgraded some other way go straight to [`Upgrader::serve`].
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    upgrade::OnUpgrade,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    compression::WebSocketExtensions,
    conn::{Conn, Role},
    handler::EventHandler,
    options::Options,
    pool::WorkerPool,
    Result, WebSocketError,
};

/// GUID appended to the client key before hashing.
const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The upgrade response and the future resolving to the connection.
pub type UpgradeResult = Result<(Response<Empty<Bytes>>, UpgradeFut)>;

type OriginCheck = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// Accepts WebSocket connections and wires them to a handler and a worker pool.
///
/// An `Upgrader` is cheap to clone; clones share the pool and the handler.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use http_body_util::Empty;
/// use hyper::{body::{Bytes, Incoming}, Request, Response};
/// use wsflow::{NoopHandler, Options, Upgrader};
///
/// async fn server_upgrade(
///     upgrader: Upgrader,
///     mut req: Request<Incoming>,
/// ) -> wsflow::Result<Response<Empty<Bytes>>> {
///     let (response, fut) = upgrader.upgrade(&mut req)?;
///
///     tokio::spawn(async move {
///         if let Ok(conn) = fut.await {
///             conn.listen().await;
///         }
///     });
///
///     Ok(response)
/// }
/// ```
#[derive(Clone)]
pub struct Upgrader {
    options: Options,
    pool: WorkerPool,
    handler: Arc<dyn EventHandler>,
    check_origin: Option<OriginCheck>,
    response_headers: HeaderMap,
}

impl Upgrader {
    /// Creates an upgrader with its own pool of `options.worker_pool_size` executors.
    ///
    /// # Panics
    /// Must be called from within a tokio runtime.
    pub fn new(options: Options, handler: Arc<dyn EventHandler>) -> Self {
        let options = options.normalized();
        Self {
            pool: WorkerPool::new(options.worker_pool_size),
            options,
            handler,
            check_origin: None,
            response_headers: HeaderMap::new(),
        }
    }

    /// Uses `pool` instead of the pool created by [`Upgrader::new`], e.g. to share one pool
    /// between several upgraders.
    pub fn with_pool(self, pool: WorkerPool) -> Self {
        Self { pool, ..self }
    }

    /// Rejects requests for which `check` returns `false`, typically by looking at `Origin`.
    /// Every request is accepted by default.
    pub fn with_check_origin<F>(self, check: F) -> Self
    where
        F: Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    {
        Self {
            check_origin: Some(Arc::new(check)),
            ..self
        }
    }

    /// Adds a header to every upgrade response.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.response_headers.insert(name, value);
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Starts a connection over a stream whose handshake already took place.
    ///
    /// `compression_enabled` states whether permessage-deflate was negotiated.
    pub fn serve<S>(&self, role: Role, stream: S, compression_enabled: bool) -> Conn
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Conn::new(
            role,
            stream,
            self.options.clone(),
            compression_enabled,
            self.pool.clone(),
            Arc::clone(&self.handler),
        )
    }

    /// Validates an upgrade request and prepares the response.
    ///
    /// The response must be sent back through hyper for the returned future to resolve. The
    /// future fails with [`WebSocketError::Timeout`] if that doesn't happen within the
    /// handshake timeout.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidMethod`] for anything but `GET`
    /// - [`WebSocketError::InvalidSecWebsocketVersion`] unless `Sec-WebSocket-Version` is 13
    /// - [`WebSocketError::InvalidConnectionHeader`] / [`WebSocketError::InvalidUpgradeHeader`]
    ///   when the request doesn't ask for an upgrade to `websocket`
    /// - [`WebSocketError::MissingSecWebSocketKey`] without a `Sec-WebSocket-Key`
    /// - [`WebSocketError::OriginRejected`] if the origin check refuses the request
    pub fn upgrade<B>(&self, request: &mut Request<B>) -> UpgradeResult {
        let handshake = self.handshake(request.method(), request.headers())?;

        let mut response = Response::new(Empty::new());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

        let headers = response.headers_mut();
        for (name, value) in self.response_headers.iter() {
            headers.insert(name, value.clone());
        }
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(
            header::SEC_WEBSOCKET_ACCEPT,
            HeaderValue::try_from(handshake.accept)?,
        );
        if let Some(extensions) = &handshake.extensions {
            headers.insert(
                header::SEC_WEBSOCKET_EXTENSIONS,
                HeaderValue::try_from(extensions.to_string())?,
            );
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "upgrading connection, compression: {}",
            handshake.extensions.is_some()
        );

        let fut = UpgradeFut {
            inner: hyper::upgrade::on(request),
            deadline: tokio::time::sleep(self.options.handshake_timeout),
            upgrader: Some(self.clone()),
            compression_enabled: handshake.extensions.is_some(),
        };

        Ok((response, fut))
    }

    /// Checks the request line and headers, and negotiates compression.
    fn handshake(&self, method: &Method, headers: &HeaderMap) -> Result<Handshake> {
        if method != Method::GET {
            return Err(WebSocketError::InvalidMethod);
        }

        if headers
            .get(header::SEC_WEBSOCKET_VERSION)
            .map(|v| v.as_bytes())
            != Some(b"13")
        {
            return Err(WebSocketError::InvalidSecWebsocketVersion);
        }

        if !has_token(headers, header::CONNECTION, "upgrade") {
            return Err(WebSocketError::InvalidConnectionHeader);
        }
        if !has_token(headers, header::UPGRADE, "websocket") {
            return Err(WebSocketError::InvalidUpgradeHeader);
        }

        let key = headers
            .get(header::SEC_WEBSOCKET_KEY)
            .ok_or(WebSocketError::MissingSecWebSocketKey)?;

        if let Some(check) = &self.check_origin {
            if !check(headers) {
                return Err(WebSocketError::OriginRejected);
            }
        }

        let extensions = if self.options.compression_enabled {
            headers
                .get_all(header::SEC_WEBSOCKET_EXTENSIONS)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .find_map(WebSocketExtensions::negotiate)
        } else {
            None
        };

        Ok(Handshake {
            accept: sec_websocket_accept(key.as_bytes()),
            extensions,
        })
    }
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader")
            .field("options", &self.options)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Outcome of a valid handshake request.
struct Handshake {
    accept: String,
    extensions: Option<WebSocketExtensions>,
}

/// Returns whether a comma-separated header lists `token`, ignoring case.
fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Computes `Sec-WebSocket-Accept` for a client key.
pub fn sec_websocket_accept(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Future that completes the upgrade and yields the server-side [`Conn`].
///
/// The upgrade response has to be sent to the client before this future can resolve.
#[pin_project]
pub struct UpgradeFut {
    #[pin]
    inner: OnUpgrade,
    #[pin]
    deadline: tokio::time::Sleep,
    upgrader: Option<Upgrader>,
    compression_enabled: bool,
}

impl Future for UpgradeFut {
    type Output = Result<Conn>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(upgraded) = this.inner.poll(cx) {
            let upgraded = upgraded?;
            let Some(upgrader) = this.upgrader.take() else {
                return Poll::Ready(Err(WebSocketError::ConnectionClosed));
            };

            return Poll::Ready(Ok(upgrader.serve(
                Role::Server,
                TokioIo::new(upgraded),
                *this.compression_enabled,
            )));
        }

        if this.deadline.poll(cx).is_ready() {
            #[cfg(feature = "logging")]
            log::debug!("handshake timed out");
            return Poll::Ready(Err(WebSocketError::Timeout));
        }

        Poll::Pending
    }
}
