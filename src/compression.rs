//! # Compression
//!
//! permessage-deflate ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)) without
//! context takeover: every message is compressed and decompressed with a fresh deflate state,
//! so no dictionary survives between messages in either direction.
//!
//! [`WebSocketExtensions`] parses the `Sec-WebSocket-Extensions` offers of a client and renders
//! the parameters the server answers with.
use std::io;

use bytes::{BufMut, BytesMut};
use flate2::{CompressError, DecompressError, FlushDecompress, Status};
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space0},
    combinator::opt,
    sequence::{pair, preceded},
    IResult, Parser,
};

use crate::{options::CompressionLevel, Result, WebSocketError};

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Appended to every compressed message before inflating it: the empty stored block removed by
/// the sender ([RFC 7692 Section 7.2.2](https://datatracker.ietf.org/doc/html/rfc7692#section-7.2.2)),
/// followed by an empty *final* stored block that terminates the deflate stream.
const TRAILER: [u8; 9] = [0x00, 0x00, 0xff, 0xff, 0x01, 0x00, 0x00, 0xff, 0xff];

/// Parameters of a single permessage-deflate offer or response.
///
/// A window-bits parameter given without a value is stored as `Some(0)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebSocketExtensions {
    pub(crate) server_max_window_bits: Option<u8>,
    pub(crate) client_max_window_bits: Option<u8>,
    pub(crate) server_no_context_takeover: bool,
    pub(crate) client_no_context_takeover: bool,
}

impl std::fmt::Display for WebSocketExtensions {
    /// Formats the parameters as a permessage-deflate header value.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", PERMESSAGE_DEFLATE)?;

        if let Some(bits) = self.server_max_window_bits {
            if (8..16).contains(&bits) {
                write!(f, "; server_max_window_bits={}", bits)?;
            } else {
                write!(f, "; server_max_window_bits")?;
            }
        }
        if let Some(bits) = self.client_max_window_bits {
            if (8..16).contains(&bits) {
                write!(f, "; client_max_window_bits={}", bits)?;
            } else {
                write!(f, "; client_max_window_bits")?;
            }
        }
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }

        Ok(())
    }
}

impl WebSocketExtensions {
    /// The only parameters this crate ever answers with: no context takeover in both directions.
    pub fn no_context_takeover() -> Self {
        Self {
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            ..Default::default()
        }
    }

    /// Picks the first acceptable permessage-deflate offer of a `Sec-WebSocket-Extensions` header.
    ///
    /// Offers are separated by commas. Offers naming another extension or failing to parse are
    /// skipped. Returns the response parameters if one offer was accepted.
    pub fn negotiate(header: &str) -> Option<Self> {
        header
            .split(',')
            .filter_map(|offer| offer.trim().parse::<Self>().ok())
            .find(Self::is_acceptable)
            .map(|_| Self::no_context_takeover())
    }

    /// Compression always runs with a full 32 KiB window, so a client asking the server to use
    /// a smaller one can't be served.
    fn is_acceptable(&self) -> bool {
        matches!(self.server_max_window_bits, None | Some(0) | Some(15))
    }

    fn parse(input: &str) -> std::result::Result<Self, nom::Err<nom::error::Error<&str>>> {
        let mut this = Self::default();
        let (remaining, _) = Self::parse_name(input)?;
        this.parse_parameters(remaining)?;
        Ok(this)
    }

    fn parse_name(input: &str) -> IResult<&str, &str> {
        tag(PERMESSAGE_DEFLATE).parse(input)
    }

    fn parse_parameters<'a>(
        &mut self,
        mut input: &'a str,
    ) -> std::result::Result<(), nom::Err<nom::error::Error<&'a str>>> {
        while !input.is_empty() {
            let (remaining, (key, value)) = Self::parse_parameter(input)?;
            // unparsable or out of range values make the offer unacceptable
            let bits = || value.map_or(0, |value| value.parse().unwrap_or(u8::MAX));
            match key {
                "client_no_context_takeover" => self.client_no_context_takeover = true,
                "server_no_context_takeover" => self.server_no_context_takeover = true,
                "server_max_window_bits" => self.server_max_window_bits = Some(bits()),
                "client_max_window_bits" => self.client_max_window_bits = Some(bits()),
                _ => {}
            }

            input = remaining;
        }

        Ok(())
    }

    /// Parses one `; key` or `; key=value` parameter.
    fn parse_parameter(input: &str) -> IResult<&str, (&str, Option<&str>)> {
        preceded(
            (space0, tag(";"), space0),
            pair(
                take_while1(|c: char| c.is_alphanumeric() || c == '_'),
                opt(preceded(tag("="), digit1)),
            ),
        )
        .parse(input)
    }
}

impl std::str::FromStr for WebSocketExtensions {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(input.trim_end()).map_err(|err| err.to_string())
    }
}

/// Compresses outgoing message payloads.
///
/// The deflate state is reset before every message and the sync-flush marker
/// (`00 00 ff ff`) is stripped from the output, as RFC 7692 requires.
pub struct Compressor {
    output: BytesMut,
    compress: flate2::Compress,
}

impl Compressor {
    /// Creates a raw deflate compressor with the given level.
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            output: BytesMut::with_capacity(1024),
            compress: flate2::Compress::new(level, false),
        }
    }

    /// Compresses a whole message payload.
    pub fn compress(&mut self, mut input: &[u8]) -> io::Result<BytesMut> {
        self.compress.reset();
        self.output.clear();

        while !input.is_empty() {
            let consumed = self.write(input)?;
            input = &input[consumed..];
        }
        self.flush()
    }

    /// Feeds input to the compressor, returning how many bytes it consumed.
    fn write(&mut self, input: &[u8]) -> io::Result<usize> {
        let output = &mut self.output;
        let compressor = &mut self.compress;

        let dst = chunk(output);

        let before_out = compressor.total_out();
        let before_in = compressor.total_in();

        let status = compressor.compress(input, dst, flate2::FlushCompress::None);

        let written = (compressor.total_out() - before_out) as usize;
        let consumed = (compressor.total_in() - before_in) as usize;

        // SAFETY: the compressor initialized `written` bytes of the spare capacity.
        unsafe { output.advance_mut(written) };

        match status {
            Ok(Status::Ok) => Ok(consumed),
            Ok(Status::StreamEnd | Status::BufError) | Err(..) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "corrupt deflate stream",
            )),
        }
    }

    /// Sync-flushes the stream and returns the message with the trailing marker removed.
    ///
    /// The flush is repeated with the same mode until it fits in the space it was given: zlib
    /// only completes a partial sync flush when asked for another sync flush.
    fn flush(&mut self) -> io::Result<BytesMut> {
        let output = &mut self.output;
        let compressor = &mut self.compress;

        loop {
            let dst = chunk(output);
            let available = dst.len();
            let before_out = compressor.total_out();

            compressor
                .compress(&[], dst, flate2::FlushCompress::Sync)
                .map_err(deflate_error)?;

            let written = (compressor.total_out() - before_out) as usize;
            // SAFETY: see `write`.
            unsafe { output.advance_mut(written) };

            if written < available {
                break;
            }
        }

        if output.ends_with(&[0x0, 0x0, 0xff, 0xff]) {
            output.truncate(output.len() - 4);
        }

        Ok(output.split())
    }
}

/// Decompresses incoming message payloads.
///
/// Each call handles one complete message with a fresh inflate state. A message whose deflate
/// stream doesn't terminate once the trailer is appended is rejected as truncated.
pub struct Decompressor {
    output: BytesMut,
    decompress: flate2::Decompress,
    max_size: usize,
}

impl Decompressor {
    /// Creates a decompressor that refuses to inflate messages beyond `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            output: BytesMut::with_capacity(1024),
            decompress: flate2::Decompress::new(false),
            max_size,
        }
    }

    /// Decompresses one whole message.
    ///
    /// # Errors
    /// - [`WebSocketError::Decompression`] if the data is corrupt or truncated
    /// - [`WebSocketError::MessageTooLarge`] if the output grows past the configured limit
    pub fn decompress(&mut self, input: &[u8]) -> Result<BytesMut> {
        self.decompress.reset(false);
        self.output.clear();

        let mut ended = self.write(input, FlushDecompress::None)?;
        if !ended {
            ended = self.write(&TRAILER, FlushDecompress::Sync)?;
        }

        if !ended {
            self.output.clear();
            return Err(WebSocketError::Decompression(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated deflate stream",
            )));
        }

        Ok(self.output.split())
    }

    /// Inflates `input` into the output buffer. Returns `true` once the deflate stream ended.
    fn write(&mut self, mut input: &[u8], flush: FlushDecompress) -> Result<bool> {
        let output = &mut self.output;
        let decompressor = &mut self.decompress;

        loop {
            let dst = chunk(output);
            let available = dst.len();

            let before_out = decompressor.total_out();
            let before_in = decompressor.total_in();

            let status = decompressor
                .decompress(input, dst, flush)
                .map_err(|err| WebSocketError::Decompression(inflate_error(err)))?;

            let written = (decompressor.total_out() - before_out) as usize;
            let consumed = (decompressor.total_in() - before_in) as usize;

            // SAFETY: the decompressor initialized `written` bytes of the spare capacity.
            unsafe { output.advance_mut(written) };
            input = &input[consumed..];

            if output.len() > self.max_size {
                output.clear();
                return Err(WebSocketError::MessageTooLarge);
            }

            if status == Status::StreamEnd {
                return Ok(true);
            }
            if written == 0 && consumed == 0 {
                return Ok(false);
            }
            if input.is_empty() && written < available {
                return Ok(false);
            }
        }
    }
}

fn deflate_error(err: CompressError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Compression error: {}", err),
    )
}

fn inflate_error(err: DecompressError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Decompression error: {}", err),
    )
}

/// Returns the spare capacity of `output` as a byte slice, growing it first if it's full.
///
/// flate2 only ever writes into the slice, and callers advance the length by exactly the
/// number of bytes it reports as written, so uninitialized bytes are never read.
fn chunk(output: &mut BytesMut) -> &mut [u8] {
    if output.len() == output.capacity() {
        // allocate capacity ourselves since chunk_mut reserves only 64 bytes
        output.reserve(1024);
    }

    let uninitbuf = output.spare_capacity_mut();
    // SAFETY: see above, the bytes are written before being read.
    unsafe { &mut *(uninitbuf as *mut [std::mem::MaybeUninit<u8>] as *mut [u8]) }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rand::Rng;

    use super::*;

    #[test]
    fn test_parse_extensions() {
        let compression = WebSocketExtensions::from_str("permessage-deflate; client_no_context_takeover; server_max_window_bits=10; client_max_window_bits; server_no_context_takeover").unwrap();
        assert!(compression.client_no_context_takeover);
        assert!(compression.server_no_context_takeover);
        assert_eq!(compression.server_max_window_bits, Some(10));
        assert_eq!(compression.client_max_window_bits, Some(0));
    }

    #[test]
    fn test_parse_extensions_fail() {
        let res = WebSocketExtensions::from_str("permessage-deflate; client_max_window_bits=");
        assert!(res.is_err());
        let res = WebSocketExtensions::from_str("x-webkit-deflate-frame");
        assert!(res.is_err());
        let res = WebSocketExtensions::from_str(
            "permessage-deflate; client_no_context_takeover server_max_window_bits=7",
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_response_header() {
        assert_eq!(
            WebSocketExtensions::no_context_takeover().to_string(),
            "permessage-deflate; server_no_context_takeover; client_no_context_takeover"
        );
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(
            WebSocketExtensions::negotiate("permessage-deflate; client_max_window_bits"),
            Some(WebSocketExtensions::no_context_takeover())
        );
        assert!(WebSocketExtensions::negotiate("x-webkit-deflate-frame").is_none());
        assert!(WebSocketExtensions::negotiate("").is_none());
    }

    #[test]
    fn test_negotiate_declines_small_window() {
        assert!(
            WebSocketExtensions::negotiate("permessage-deflate; server_max_window_bits=10")
                .is_none()
        );
        assert!(
            WebSocketExtensions::negotiate("permessage-deflate; server_max_window_bits=300")
                .is_none()
        );
        // the fallback offer is accepted
        assert!(WebSocketExtensions::negotiate(
            "permessage-deflate; server_max_window_bits=10, permessage-deflate"
        )
        .is_some());
        assert!(
            WebSocketExtensions::negotiate("permessage-deflate; server_max_window_bits=15")
                .is_some()
        );
    }

    #[test]
    fn test_compress_strips_sync_marker() {
        let mut compressor = Compressor::new(CompressionLevel::default());
        let compressed = compressor.compress(b"test data").unwrap();
        assert!(!compressed.is_empty());
        assert!(!compressed.ends_with(&[0x0, 0x0, 0xff, 0xff]));
    }

    #[test]
    fn test_compress_then_decompress() {
        let mut rng = rand::thread_rng();
        let mut compressor = Compressor::new(CompressionLevel::fast());
        let mut decompressor = Decompressor::new(1 << 20);

        for len in [0usize, 1, 100, 4096, 100_000] {
            let data: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'f')).collect();
            let compressed = compressor.compress(&data).unwrap();
            let decompressed = decompressor.decompress(&compressed).unwrap();
            assert_eq!(&decompressed[..], &data[..], "length {len}");
        }
    }

    #[test]
    fn test_large_incompressible_roundtrip() {
        let mut rng = rand::thread_rng();
        let mut compressor = Compressor::new(CompressionLevel::fast());
        let mut decompressor = Decompressor::new(1 << 20);

        // the flushed tail is larger than one output chunk
        for len in [4096usize, 16_384, 100_000, 500_000] {
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let compressed = compressor.compress(&data).unwrap();
            assert!(!compressed.ends_with(&[0x0, 0x0, 0xff, 0xff]), "length {len}");

            let decompressed = decompressor.decompress(&compressed).unwrap();
            assert_eq!(&decompressed[..], &data[..], "length {len}");
        }
    }

    #[test]
    fn test_no_context_between_messages() {
        let mut compressor = Compressor::new(CompressionLevel::default());
        let first = compressor.compress(b"repeated payload").unwrap();
        let second = compressor.compress(b"repeated payload").unwrap();
        // without context takeover identical messages compress identically
        assert_eq!(first, second);

        // and each one inflates on its own
        let mut decompressor = Decompressor::new(1024);
        assert_eq!(&decompressor.decompress(&second).unwrap()[..], b"repeated payload");
    }

    #[test]
    fn test_decompress_truncated() {
        // stored blocks make the cut land inside the data
        let mut compressor = Compressor::new(CompressionLevel::none());
        let compressed = compressor.compress(&[b'x'; 200]).unwrap();

        let mut decompressor = Decompressor::new(1024);
        let res = decompressor.decompress(&compressed[..compressed.len() / 2]);
        assert!(matches!(res, Err(WebSocketError::Decompression(_))));
    }

    #[test]
    fn test_decompress_corrupt() {
        let mut decompressor = Decompressor::new(1024);
        let res = decompressor.decompress(&[0xff; 16]);
        assert!(matches!(res, Err(WebSocketError::Decompression(_))));
    }

    #[test]
    fn test_decompress_limit() {
        let mut compressor = Compressor::new(CompressionLevel::best());
        let compressed = compressor.compress(&[0u8; 10_000]).unwrap();

        let mut decompressor = Decompressor::new(1000);
        assert!(matches!(
            decompressor.decompress(&compressed),
            Err(WebSocketError::MessageTooLarge)
        ));

        // the decompressor stays usable
        let small = compressor.compress(b"ok").unwrap();
        assert_eq!(&decompressor.decompress(&small).unwrap()[..], b"ok");
    }
}
