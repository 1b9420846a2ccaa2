//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Three types live here:
//!
//! - [`FrameHeader`]: the wire header, with its shortest-form encoder and a strict decoder.
//! - [`Frame`]: one decoded (already unmasked) or outgoing frame.
//! - [`Message`]: a complete logical message handed to the event handler.
//!
//! RSV1 is repurposed by permessage-deflate ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692))
//! to flag a compressed message. RSV2 and RSV3 must always be zero.
use bytes::Bytes;

use crate::{close::CloseCode, Result, WebSocketError};

/// Largest possible header: 2 fixed bytes, 8 bytes of extended length and a 4-byte masking key.
pub const MAX_HEAD_SIZE: usize = 14;

/// Control frames (close, ping, pong) may carry at most this many payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The numeric values for each OpCode are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected as invalid.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    ///
    /// Control frames cannot be fragmented, carry at most 125 bytes and are
    /// processed as soon as they arrive.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for the opcodes that open a data message (`Text` and `Binary`).
    ///
    /// Only these are ever compressed.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// The header of a single WebSocket frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Last fragment of a message.
    pub fin: bool,
    /// Compressed-payload flag (RSV1).
    pub rsv1: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// Masking key, present on every client-to-server frame.
    pub mask: Option<[u8; 4]>,
    /// Length of the payload that follows the header.
    pub payload_len: usize,
}

impl FrameHeader {
    /// Creates an unmasked header.
    pub fn new(fin: bool, rsv1: bool, opcode: OpCode, payload_len: usize) -> Self {
        Self {
            fin,
            rsv1,
            opcode,
            mask: None,
            payload_len,
        }
    }

    /// Sets the masking key written after the length field.
    pub fn with_mask(self, key: [u8; 4]) -> Self {
        Self {
            mask: Some(key),
            ..self
        }
    }

    /// Returns whether the frame carries a masking key.
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Writes the header into `head` and returns how many bytes were used.
    ///
    /// The length always takes its shortest form: inline up to 125, a 16-bit
    /// extension up to 65535 and a 64-bit extension above that. The masking key,
    /// if any, follows the length.
    pub fn encode(&self, head: &mut [u8; MAX_HEAD_SIZE]) -> usize {
        head[0] = (self.fin as u8) << 7 | (self.rsv1 as u8) << 6 | u8::from(self.opcode);

        let len = self.payload_len;
        let size = if len <= 125 {
            head[1] = len as u8;
            2
        } else if len <= u16::MAX as usize {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }

    /// Parses a header from the front of `src`.
    ///
    /// Returns `Ok(None)` while `src` doesn't hold the whole header yet, otherwise the
    /// header and the number of bytes it occupied. Nothing is consumed from `src`.
    ///
    /// # Errors
    /// - [`WebSocketError::ReservedBitsNotZero`] if RSV2 or RSV3 is set
    /// - [`WebSocketError::InvalidOpCode`] for reserved opcodes
    /// - [`WebSocketError::NonCanonicalLength`] if an extended length would have fit a shorter form
    /// - [`WebSocketError::FrameTooLarge`] if the 64-bit length has its most significant bit set
    /// - [`WebSocketError::ControlFrameFragmented`] / [`WebSocketError::ControlFrameTooLarge`]
    ///   for control frames without FIN or with more than 125 bytes
    pub fn decode(src: &[u8]) -> Result<Option<(Self, usize)>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let fin = src[0] & 0b1000_0000 != 0;
        let rsv1 = src[0] & 0b0100_0000 != 0;
        if src[0] & 0b0011_0000 != 0 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }

        let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
        let masked = src[1] & 0b1000_0000 != 0;
        let length_code = src[1] & 0x7F;

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let size = 2 + extra + masked as usize * 4;
        if src.len() < size {
            return Ok(None);
        }

        let payload_len = match extra {
            0 => usize::from(length_code),
            2 => {
                let len = u16::from_be_bytes([src[2], src[3]]);
                if len < 126 {
                    return Err(WebSocketError::NonCanonicalLength);
                }
                usize::from(len)
            }
            _ => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(WebSocketError::FrameTooLarge);
                }
                if len <= u64::from(u16::MAX) {
                    return Err(WebSocketError::NonCanonicalLength);
                }
                usize::try_from(len).map_err(|_| WebSocketError::FrameTooLarge)?
            }
        };

        let mask = if masked {
            let at = 2 + extra;
            Some([src[at], src[at + 1], src[at + 2], src[at + 3]])
        } else {
            None
        };

        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        }

        Ok(Some((
            Self {
                fin,
                rsv1,
                opcode,
                mask,
                payload_len,
            },
            size,
        )))
    }
}

/// A single WebSocket frame.
///
/// Frames coming out of the decoder are already unmasked; the encoder masks outgoing
/// frames itself when the connection acts as a client, so a `Frame` never carries a key.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// Flag indicating whether the payload is compressed.
    pub(crate) is_compressed: bool,
    /// The payload of the frame.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new uncompressed frame.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            is_compressed: false,
            payload: payload.into(),
        }
    }

    /// Creates a frame whose payload was compressed with permessage-deflate (RSV1 set).
    pub fn compress(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            is_compressed: true,
            payload: payload.into(),
        }
    }

    /// Returns whether RSV1 is set on this frame.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    /// Builds the header describing this frame, without a masking key.
    pub(crate) fn header(&self) -> FrameHeader {
        FrameHeader::new(self.fin, self.is_compressed, self.opcode, self.payload.len())
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Frame::new(true, message.opcode, message.payload)
    }
}

/// A complete logical message: one unfragmented frame, or the reassembly of a
/// fragmented sequence, already decompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// `Text`, `Binary`, or a control opcode.
    pub opcode: OpCode,
    /// Message data.
    pub payload: Bytes,
}

impl Message {
    /// Creates a text message.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Text,
            payload: payload.into(),
        }
    }

    /// Creates a binary message.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Binary,
            payload: payload.into(),
        }
    }

    /// Creates a close message with a status code and a reason.
    ///
    /// The reason is cut, on a character boundary, so the payload stays within the
    /// 125 bytes allowed for control frames.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }

        let mut payload = Vec::with_capacity(2 + end);
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(&reason.as_bytes()[..end]);

        Self {
            opcode: OpCode::Close,
            payload: payload.into(),
        }
    }

    /// Interprets the payload as UTF-8 text.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Extracts the status code of a close message, if the payload carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = self.payload.get(0..2)?;
        Some(CloseCode::from(u16::from_be_bytes([code[0], code[1]])))
    }

    /// Returns the raw close reason following the status code.
    pub fn close_reason(&self) -> &[u8] {
        self.payload.get(2..).unwrap_or_default()
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        Self {
            opcode: frame.opcode,
            payload: frame.payload,
        }
    }
}
