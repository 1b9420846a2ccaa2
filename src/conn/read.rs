use std::io;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio_util::codec::FramedRead;

use crate::{
    codec::Decoder,
    compression::Decompressor,
    frame::{Frame, Message, OpCode},
    options::Options,
    Result, WebSocketError,
};

use super::{BoxedReader, Role};

/// The read half of a connection: turns frames into complete messages.
///
/// [`ReadHalf`] reassembles fragmented messages, inflates compressed ones and validates text
/// payloads. Control frames are returned as soon as they arrive, even in the middle of a
/// fragmented message; answering them is up to the caller.
pub(crate) struct ReadHalf {
    stream: FramedRead<BoxedReader, Decoder>,
    /// Present only when compression was negotiated.
    inflate: Option<Decompressor>,
    /// The message being reassembled, if any.
    fragment: Option<Fragment>,
    /// Payload received so far for `fragment`.
    accumulated: BytesMut,
    max_content_length: usize,
    check_utf8: bool,
}

/// Fragmented message header.
struct Fragment {
    opcode: OpCode,
    is_compressed: bool,
}

impl ReadHalf {
    pub(crate) fn new(
        role: Role,
        reader: BoxedReader,
        options: &Options,
        compression_enabled: bool,
    ) -> Self {
        let max_content_length = options.max_content_length;
        Self {
            stream: FramedRead::new(reader, Decoder::new(role, max_content_length)),
            inflate: compression_enabled.then(|| Decompressor::new(max_content_length)),
            fragment: None,
            accumulated: BytesMut::new(),
            max_content_length,
            check_utf8: options.check_utf8,
        }
    }

    /// Reads until a complete data message or a control frame is available.
    ///
    /// End of stream is reported as an [`io::ErrorKind::UnexpectedEof`] error: a well-behaved
    /// peer closes with a close frame first.
    pub(crate) async fn next_message(&mut self) -> Result<Message> {
        loop {
            let frame = match self.stream.next().await {
                Some(res) => res?,
                None => {
                    return Err(WebSocketError::IoError(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed without a close frame",
                    )))
                }
            };

            if let Some(message) = self.on_frame(frame)? {
                return Ok(message);
            }
        }
    }

    /// Processes an incoming frame.
    ///
    /// # Returns
    /// - `Ok(Some(Message))` for a control frame or the last frame of a data message.
    /// - `Ok(None)` if the frame is part of a fragmented message and not yet complete.
    /// - `Err(WebSocketError)` on a fragmentation or compression violation.
    fn on_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        if frame.is_compressed && self.inflate.is_none() {
            return Err(WebSocketError::CompressionNotSupported);
        }

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }

                if frame.fin {
                    return self
                        .finish(frame.opcode, frame.is_compressed, frame.payload)
                        .map(Some);
                }

                self.fragment = Some(Fragment {
                    opcode: frame.opcode,
                    is_compressed: frame.is_compressed,
                });
                self.accumulated.extend_from_slice(&frame.payload);

                Ok(None)
            }
            OpCode::Continuation => {
                let Some(fragment) = self.fragment.as_ref() else {
                    return Err(WebSocketError::InvalidContinuationFrame);
                };
                // only the first frame of a message may carry RSV1
                if frame.is_compressed {
                    return Err(WebSocketError::InvalidContinuationFrame);
                }
                if self.accumulated.len() + frame.payload.len() > self.max_content_length {
                    return Err(WebSocketError::MessageTooLarge);
                }

                self.accumulated.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }

                let (opcode, is_compressed) = (fragment.opcode, fragment.is_compressed);
                self.fragment = None;
                let payload = self.accumulated.split().freeze();

                self.finish(opcode, is_compressed, payload).map(Some)
            }
            OpCode::Close | OpCode::Ping | OpCode::Pong => {
                if frame.is_compressed {
                    return Err(WebSocketError::ReservedBitsNotZero);
                }

                Ok(Some(Message::from(frame)))
            }
        }
    }

    /// Turns a reassembled payload into a message: inflate if needed, then validate.
    fn finish(&mut self, opcode: OpCode, is_compressed: bool, payload: Bytes) -> Result<Message> {
        let payload = match self.inflate.as_mut() {
            Some(inflate) if is_compressed => inflate.decompress(&payload)?.freeze(),
            _ => payload,
        };

        if opcode == OpCode::Text && self.check_utf8 {
            validate_utf8(&payload)?;
        }

        Ok(Message { opcode, payload })
    }
}

pub(crate) fn validate_utf8(payload: &[u8]) -> Result<()> {
    #[cfg(not(feature = "simd"))]
    if std::str::from_utf8(payload).is_err() {
        return Err(WebSocketError::InvalidUTF8);
    }
    #[cfg(feature = "simd")]
    if simdutf8::basic::from_utf8(payload).is_err() {
        return Err(WebSocketError::InvalidUTF8);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio_util::codec::Encoder as _;

    use super::*;
    use crate::{codec::Encoder, compression::Compressor, options::CompressionLevel};

    /// Encodes frames the way a client would put them on the wire.
    fn wire(frames: Vec<Frame>) -> Vec<u8> {
        let mut encoder = Encoder::new(Role::Client);
        let mut dst = BytesMut::new();
        for frame in frames {
            encoder.encode(frame, &mut dst).unwrap();
        }
        dst.to_vec()
    }

    async fn read_all(options: Options, compression: bool, bytes: Vec<u8>) -> Vec<Result<Message>> {
        let (mut client, server) = duplex(1 << 16);
        let mut read_half = ReadHalf::new(Role::Server, Box::new(server), &options, compression);

        client.write_all(&bytes).await.unwrap();
        drop(client);

        let mut out = Vec::new();
        loop {
            let res = read_half.next_message().await;
            let stop = res.is_err();
            out.push(res);
            if stop {
                break out;
            }
        }
    }

    #[tokio::test]
    async fn test_reassembles_fragments() {
        let bytes = wire(vec![
            Frame::new(false, OpCode::Text, "Hel"),
            Frame::new(true, OpCode::Ping, "p"),
            Frame::new(false, OpCode::Continuation, "lo, "),
            Frame::new(true, OpCode::Continuation, "world"),
        ]);

        let out = read_all(Options::default(), false, bytes).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref().unwrap().opcode, OpCode::Ping);
        assert_eq!(out[1].as_ref().unwrap(), &Message::text("Hello, world"));
        assert!(matches!(
            &out[2],
            Err(WebSocketError::IoError(err)) if err.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn test_compressed_fragments() {
        let mut compressor = Compressor::new(CompressionLevel::default());
        let compressed = compressor.compress(&[b'z'; 4000]).unwrap().freeze();
        let (a, b) = compressed.split_at(compressed.len() / 2);

        let bytes = wire(vec![
            Frame::compress(false, OpCode::Binary, Bytes::copy_from_slice(a)),
            Frame::new(true, OpCode::Continuation, Bytes::copy_from_slice(b)),
        ]);

        let out = read_all(Options::default(), true, bytes).await;
        assert_eq!(out[0].as_ref().unwrap(), &Message::binary(vec![b'z'; 4000]));
    }

    #[tokio::test]
    async fn test_compressed_without_negotiation() {
        let bytes = wire(vec![Frame::compress(true, OpCode::Text, "x")]);
        let out = read_all(Options::default(), false, bytes).await;
        assert!(matches!(out[0], Err(WebSocketError::CompressionNotSupported)));
    }

    #[tokio::test]
    async fn test_orphan_continuation() {
        let bytes = wire(vec![Frame::new(true, OpCode::Continuation, "x")]);
        let out = read_all(Options::default(), false, bytes).await;
        assert!(matches!(out[0], Err(WebSocketError::InvalidContinuationFrame)));
    }

    #[tokio::test]
    async fn test_interleaved_data_frames() {
        let bytes = wire(vec![
            Frame::new(false, OpCode::Text, "a"),
            Frame::new(true, OpCode::Binary, "b"),
        ]);
        let out = read_all(Options::default(), false, bytes).await;
        assert!(matches!(out[0], Err(WebSocketError::InvalidFragment)));
    }

    #[tokio::test]
    async fn test_fragments_exceed_limit() {
        let options = Options::default().with_max_content_length(10);
        let bytes = wire(vec![
            Frame::new(false, OpCode::Binary, vec![0u8; 6]),
            Frame::new(true, OpCode::Continuation, vec![0u8; 6]),
        ]);
        let out = read_all(options, false, bytes).await;
        assert!(matches!(out[0], Err(WebSocketError::MessageTooLarge)));
    }

    #[tokio::test]
    async fn test_invalid_utf8() {
        let bytes = wire(vec![Frame::new(true, OpCode::Text, vec![0xC3, 0x28])]);

        let out = read_all(Options::default().with_utf8(), false, bytes.clone()).await;
        assert!(matches!(out[0], Err(WebSocketError::InvalidUTF8)));

        // without the check the bytes are delivered as they are
        let out = read_all(Options::default(), false, bytes).await;
        assert_eq!(out[0].as_ref().unwrap().payload.as_ref(), &[0xC3, 0x28]);
    }
}
