use bytes::Bytes;
use futures::SinkExt;
use tokio_util::codec::FramedWrite;

use crate::{
    codec::Encoder,
    compression::Compressor,
    frame::{Frame, OpCode},
    options::Options,
    Result, WebSocketError,
};

use super::{BoxedWriter, Role};

/// Write half of the WebSocket connection.
///
/// Every message goes out as a single final frame. Text and binary messages of at least
/// `compression_threshold` bytes are deflated (RSV1 set) when compression was negotiated;
/// everything else is sent as it is. Masking is left to the [`Encoder`].
pub(crate) struct WriteHalf {
    sink: FramedWrite<BoxedWriter, Encoder>,
    deflate: Option<Compressor>,
    compression_threshold: usize,
}

impl WriteHalf {
    pub(crate) fn new(
        role: Role,
        writer: BoxedWriter,
        options: &Options,
        compression_enabled: bool,
    ) -> Self {
        Self {
            sink: FramedWrite::new(writer, Encoder::new(role)),
            deflate: compression_enabled.then(|| Compressor::new(options.compression_level)),
            compression_threshold: options.compression_threshold,
        }
    }

    /// Encodes one message, writes it and flushes the stream.
    pub(crate) async fn send(&mut self, opcode: OpCode, payload: Bytes) -> Result<()> {
        let frame = match self.deflate.as_mut() {
            Some(deflate) if opcode.is_data() && payload.len() >= self.compression_threshold => {
                let output = deflate
                    .compress(&payload)
                    .map_err(WebSocketError::Compression)?;
                Frame::compress(true, opcode, output.freeze())
            }
            _ => Frame::new(true, opcode, payload),
        };

        self.sink.send(frame).await
    }

    /// Flushes what's left and shuts the write side of the stream down.
    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.sink.close().await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt};

    use super::*;
    use crate::frame::FrameHeader;

    async fn first_header(
        options: Options,
        compression: bool,
        opcode: OpCode,
        len: usize,
    ) -> FrameHeader {
        let (client, mut server) = duplex(1 << 16);
        let mut write_half = WriteHalf::new(Role::Server, Box::new(client), &options, compression);

        write_half
            .send(opcode, Bytes::from(vec![b'a'; len]))
            .await
            .unwrap();

        let mut buf = vec![0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        let (header, _) = FrameHeader::decode(&buf[..n]).unwrap().unwrap();
        header
    }

    #[tokio::test]
    async fn test_compression_threshold() {
        let options = Options::default().with_compression_threshold(512);

        let below = first_header(options.clone(), true, OpCode::Text, 511).await;
        assert!(!below.rsv1);
        assert_eq!(below.payload_len, 511);

        let at = first_header(options, true, OpCode::Text, 512).await;
        assert!(at.rsv1);
        assert!(at.payload_len < 512);
    }

    #[tokio::test]
    async fn test_control_frames_never_compressed() {
        let options = Options::default().with_compression_threshold(1);
        let header = first_header(options, true, OpCode::Ping, 100).await;
        assert!(!header.rsv1);
    }

    #[tokio::test]
    async fn test_no_compression_unless_negotiated() {
        let options = Options::default().with_compression_threshold(1);
        let header = first_header(options, false, OpCode::Binary, 1000).await;
        assert!(!header.rsv1);
        assert_eq!(header.payload_len, 1000);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (client, mut server) = duplex(64);
        let mut write_half =
            WriteHalf::new(Role::Client, Box::new(client), &Options::default(), false);
        write_half.shutdown().await.unwrap();

        let mut buf = Vec::new();
        assert_eq!(server.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
