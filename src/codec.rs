//! Framing of a raw byte stream into WebSocket frames.
//!
//! [`Decoder`] and [`Encoder`] plug into `tokio_util::codec::FramedRead` and
//! `FramedWrite`; masking direction is decided by the [`Role`] of the local endpoint.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    conn::Role,
    frame::{Frame, FrameHeader, MAX_HEAD_SIZE},
    mask::{apply_mask, new_mask_key},
    WebSocketError,
};

/// A decoder for WebSocket frames, handling state transitions.
///
/// `Decoder` parses the header first and then waits for the whole payload. Between calls it
/// keeps the already parsed header, so a frame split across many reads is only parsed once.
pub struct Decoder {
    /// Endpoint role; servers only accept masked frames, clients only unmasked ones.
    role: Role,
    /// Header of the frame whose payload is still being received.
    state: Option<FrameHeader>,
    /// Maximum allowed size for a frame payload.
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder` for the given role, limiting payloads to `max_payload_size` bytes.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            role,
            state: None,
            max_payload_size,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes WebSocket frames from a `BytesMut` buffer, managing header and payload parsing.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a complete, unmasked frame.
    /// - `Ok(None)`: more data is needed to complete the frame.
    /// - `Err(WebSocketError)`: a protocol violation. The connection can't recover from it.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    let Some((header, size)) = FrameHeader::decode(src)? else {
                        return Ok(None);
                    };

                    match (self.role, header.is_masked()) {
                        (Role::Server, false) => return Err(WebSocketError::UnmaskedFrame),
                        (Role::Client, true) => return Err(WebSocketError::MaskedFrame),
                        _ => {}
                    }

                    if header.payload_len > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    src.advance(size);
                    if src.len() < header.payload_len {
                        src.reserve(header.payload_len - src.len());
                    }

                    self.state = Some(header);
                }
                Some(header) => {
                    if src.remaining() < header.payload_len {
                        self.state = Some(header);
                        return Ok(None);
                    }

                    let mut payload = src.split_to(header.payload_len);
                    if let Some(mask) = header.mask {
                        apply_mask(&mut payload, mask);
                    }

                    let mut frame = Frame::new(header.fin, header.opcode, payload.freeze());
                    frame.is_compressed = header.rsv1;

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// WebSocket frame encoder for serializing `Frame` instances into a buffer.
///
/// In the client role every frame is masked with a fresh random key; the payload is
/// masked in the destination buffer, leaving the frame's own bytes untouched.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    /// Creates an encoder for frames sent by `role`.
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut header = frame.header();
        if self.role == Role::Client {
            header = header.with_mask(new_mask_key());
        }

        let mut head = [0; MAX_HEAD_SIZE];
        let size = header.encode(&mut head);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = header.mask {
            apply_mask(&mut dst[start..], mask);
        }

        Ok(())
    }
}
