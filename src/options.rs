//! Connection configuration.
use std::time::Duration;

/// Compression level used by permessage-deflate.
pub type CompressionLevel = flate2::Compression;

/// Default minimum payload size, in bytes, for a message to be compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 512;
/// Default time the peer has to complete the HTTP upgrade.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default time allowed for receiving one complete message.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time allowed for flushing one frame.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default maximum size of an incoming message: 1 MiB.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 1024 * 1024;
/// Default capacity of the outbound message queue.
pub const DEFAULT_MESSAGE_QUEUE_SIZE: usize = 16;

/// Worker pool size used when the available parallelism can't be determined.
const FALLBACK_WORKER_POOL_SIZE: usize = 8;

/// Configuration options for WebSocket connections.
///
/// Every field has a default (see [`Options::default`]). Zero sizes and zero durations are
/// not meaningful and are replaced by their defaults when a connection is created.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use wsflow::{CompressionLevel, Options};
///
/// let options = Options::default()
///     .with_compression_level(CompressionLevel::new(6))
///     .with_read_timeout(Duration::from_secs(60))
///     .with_async_read();
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Whether permessage-deflate may be negotiated. Default: `false`.
    pub compression_enabled: bool,

    /// Deflate level for outgoing messages. Default: fast (1).
    pub compression_level: CompressionLevel,

    /// Messages shorter than this many bytes are sent uncompressed. Default: 512.
    pub compression_threshold: usize,

    /// Deadline for the HTTP upgrade to complete. Default: 5 seconds.
    pub handshake_timeout: Duration,

    /// Deadline for receiving each complete message. Default: 30 seconds.
    pub read_timeout: Duration,

    /// Deadline for each frame to be written and flushed. Default: 30 seconds.
    pub write_timeout: Duration,

    /// Largest incoming message accepted, after reassembly and decompression. Default: 1 MiB.
    pub max_content_length: usize,

    /// Capacity of the outbound queue, and the number of messages that may be dispatched
    /// concurrently when asynchronous reads are on. Default: 16.
    pub message_queue_size: usize,

    /// Dispatch incoming messages on the worker pool instead of the read loop. Default: `false`.
    pub async_read_enabled: bool,

    /// Executors in the pool created by [`Upgrader::new`](crate::Upgrader::new).
    /// Default: the available parallelism, or 8.
    pub worker_pool_size: usize,

    /// Reject text messages that aren't valid UTF-8. Default: `false`.
    pub check_utf8: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            compression_enabled: false,
            compression_level: CompressionLevel::fast(),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            message_queue_size: DEFAULT_MESSAGE_QUEUE_SIZE,
            async_read_enabled: false,
            worker_pool_size: default_worker_pool_size(),
            check_utf8: false,
        }
    }
}

fn default_worker_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKER_POOL_SIZE)
}

impl Options {
    /// Allows permessage-deflate to be negotiated.
    pub fn with_compression(self) -> Self {
        Self {
            compression_enabled: true,
            ..self
        }
    }

    /// Allows permessage-deflate and sets the level used for outgoing messages.
    ///
    /// Lower levels (1-3) suit latency-sensitive traffic; higher levels (7-9) trade CPU for
    /// bandwidth.
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        Self {
            compression_enabled: true,
            compression_level: level,
            ..self
        }
    }

    /// Disables compression for the WebSocket connection.
    pub fn without_compression(self) -> Self {
        Self {
            compression_enabled: false,
            ..self
        }
    }

    /// Sets the minimum payload size for outgoing messages to be compressed.
    pub fn with_compression_threshold(self, threshold: usize) -> Self {
        Self {
            compression_threshold: threshold,
            ..self
        }
    }

    pub fn with_handshake_timeout(self, timeout: Duration) -> Self {
        Self {
            handshake_timeout: timeout,
            ..self
        }
    }

    pub fn with_read_timeout(self, timeout: Duration) -> Self {
        Self {
            read_timeout: timeout,
            ..self
        }
    }

    pub fn with_write_timeout(self, timeout: Duration) -> Self {
        Self {
            write_timeout: timeout,
            ..self
        }
    }

    /// Sets the largest incoming message the connection accepts.
    pub fn with_max_content_length(self, size: usize) -> Self {
        Self {
            max_content_length: size,
            ..self
        }
    }

    /// Sets the outbound queue capacity.
    pub fn with_message_queue_size(self, size: usize) -> Self {
        Self {
            message_queue_size: size,
            ..self
        }
    }

    /// Dispatches incoming messages on the worker pool.
    pub fn with_async_read(self) -> Self {
        Self {
            async_read_enabled: true,
            ..self
        }
    }

    pub fn with_worker_pool_size(self, size: usize) -> Self {
        Self {
            worker_pool_size: size,
            ..self
        }
    }

    /// Enables UTF-8 validation for incoming text messages.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Replaces every zero value with its default.
    ///
    /// A compression level of 0 would store messages uncompressed while still paying for the
    /// deflate framing, so it falls back to the fast level as well.
    pub fn normalized(self) -> Self {
        let defaults = Options::default();
        let or_default = |value: usize, default: usize| if value == 0 { default } else { value };
        let or_default_duration = |value: Duration, default: Duration| {
            if value.is_zero() {
                default
            } else {
                value
            }
        };

        Self {
            compression_enabled: self.compression_enabled,
            compression_level: if self.compression_level.level() == 0 {
                defaults.compression_level
            } else {
                self.compression_level
            },
            compression_threshold: self.compression_threshold,
            handshake_timeout: or_default_duration(
                self.handshake_timeout,
                defaults.handshake_timeout,
            ),
            read_timeout: or_default_duration(self.read_timeout, defaults.read_timeout),
            write_timeout: or_default_duration(self.write_timeout, defaults.write_timeout),
            max_content_length: or_default(self.max_content_length, defaults.max_content_length),
            message_queue_size: or_default(self.message_queue_size, defaults.message_queue_size),
            async_read_enabled: self.async_read_enabled,
            worker_pool_size: or_default(self.worker_pool_size, defaults.worker_pool_size),
            check_utf8: self.check_utf8,
        }
    }
}
