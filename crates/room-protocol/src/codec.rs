//! Length-prefixed frame codec for the signaling channel.
//!
//! Wire layout per frame:
//!
//! ```text
//! +----------------+---------------------+
//! | length: u32 BE | JSON-encoded Frame  |
//! +----------------+---------------------+
//! ```
//!
//! The length counts the JSON payload only. Frames above
//! [`MAX_FRAME_SIZE`] are rejected rather than buffered, so a broken or
//! hostile peer cannot balloon the decode buffer.

use crate::message::Frame;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length prefix in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum accepted payload size. Signaling frames are small; a snapshot
/// of a full room stays well under this.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame payload exceeds [`MAX_FRAME_SIZE`].
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Payload is not a valid `Frame`.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Underlying stream error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec implementing `Encoder<Frame>`/`Decoder` for use with
/// `tokio_util::codec::Framed`.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Payload length parsed from the prefix, kept across partial reads.
    pending_len: Option<usize>,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&frame)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if src.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let len = src.get_u32() as usize;
                if len > MAX_FRAME_SIZE {
                    return Err(CodecError::FrameTooLarge(len));
                }
                self.pending_len = Some(len);
                len
            }
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.pending_len = None;
        let payload = src.split_to(len);
        let frame = serde_json::from_slice(&payload)?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::message::{ClientRequest, ErrorCode};

    fn sample_frame() -> Frame {
        Frame::Request {
            id: 42,
            request: ClientRequest::Authenticate {
                token: "session-token".to_string(),
            },
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(sample_frame(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, sample_frame());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_input() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(sample_frame(), &mut buf).unwrap();

        // Feed the bytes one at a time; only the final byte completes a
        // frame.
        let bytes = buf.split();
        let mut partial = BytesMut::new();
        let last_index = bytes.len() - 1;
        for (i, byte) in bytes.iter().enumerate() {
            partial.extend_from_slice(&[*byte]);
            let result = codec.decode(&mut partial).unwrap();
            if i < last_index {
                assert!(result.is_none());
            } else {
                assert_eq!(result.unwrap(), sample_frame());
            }
        }
    }

    #[test]
    fn test_decode_multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(sample_frame(), &mut buf).unwrap();
        codec
            .encode(
                Frame::Error {
                    id: 1,
                    code: ErrorCode::NotFound,
                    message: "Room not found".to_string(),
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), sample_frame());
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Frame::Error { id: 1, .. }));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.extend_from_slice(b"xxxx");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.extend_from_slice(b"not{");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Malformed(_))
        ));
    }
}
