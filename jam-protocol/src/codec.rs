//! Newline framing for raw TCP sockets
//!
//! Control sockets and the worker handshake exchange one text frame per
//! line. serde_json never emits a raw newline, so a correlated-JSON frame
//! always fits on one line.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{CorrelatedFrame, ProtocolError};

/// Maximum frame size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Codec turning a byte stream into text frames and back
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Bytes already scanned for a newline in the current buffer
    scanned: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.scanned..].iter().position(|b| *b == b'\n');

        let Some(offset) = newline else {
            if src.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::MessageTooLarge {
                    size: src.len(),
                    max: MAX_FRAME_SIZE,
                });
            }
            self.scanned = src.len();
            return Ok(None);
        };

        let end = self.scanned + offset;
        self.scanned = 0;

        if end > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: end,
                max: MAX_FRAME_SIZE,
            });
        }

        let line = src.split_to(end);
        src.advance(1);

        let mut text = String::from_utf8(line.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?;
        if text.ends_with('\r') {
            text.pop();
        }
        Ok(Some(text))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Unterminated final frame
        self.scanned = 0;
        let rest = src.split_to(src.len());
        String::from_utf8(rest.to_vec())
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }
}

impl Encoder<String> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_line(item.as_bytes(), dst)
    }
}

impl Encoder<&str> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_line(item.as_bytes(), dst)
    }
}

impl Encoder<CorrelatedFrame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: CorrelatedFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_line(item.encode().as_bytes(), dst)
    }
}

fn encode_line(data: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    dst.reserve(data.len() + 1);
    dst.put_slice(data);
    dst.put_u8(b'\n');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CorrelationId;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_util::codec::Framed;

    #[test]
    fn test_single_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"42:\"info\"\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "42:\"info\"");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"1:{\"addNo"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"de\":null}\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "1:{\"addNode\":null}");
    }

    #[test]
    fn test_multiple_frames_in_buffer_keep_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        for i in 0..50u64 {
            codec
                .encode(CorrelatedFrame::new(CorrelationId::from(i), json!("nodes")), &mut buf)
                .unwrap();
        }
        for i in 0..50u64 {
            let line = codec.decode(&mut buf).unwrap().unwrap();
            let frame = CorrelatedFrame::parse(&line).unwrap();
            assert_eq!(frame.correlation_id, CorrelationId::from(i));
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_crlf_is_stripped() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"a1b2c3d4\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "a1b2c3d4");
    }

    #[test]
    fn test_unterminated_frame_at_eof() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"a1b2c3d4"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.decode_eof(&mut buf).unwrap().unwrap(), "a1b2c3d4");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(vec![b'x'; MAX_FRAME_SIZE + 1].as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0xff, 0xfe, b'\n'][..]);
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::InvalidUtf8)));
    }

    #[tokio::test]
    async fn test_framed_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = Framed::new(a, FrameCodec::new());
        let mut right = Framed::new(b, FrameCodec::new());

        left.send("7:\"sounds\"".to_string()).await.unwrap();
        left.send("8:\"nodes\"").await.unwrap();

        assert_eq!(right.next().await.unwrap().unwrap(), "7:\"sounds\"");
        assert_eq!(right.next().await.unwrap().unwrap(), "8:\"nodes\"");
    }
}
