//! Length-prefixed framing for the inbound command boundary
//!
//! Request frames are:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: request envelope ]
//! ```
//!
//! Reply frames carry the numeric status, an explicit result length and the
//! result bytes:
//! ```text
//! [ 4 bytes: length ][ 8 bytes: status (u64, LE) ][ 4 bytes: result length (u32, LE) ][ result ]
//! ```
//!
//! Framing preserves message boundaries over stream transports; the envelope
//! inside a frame is decoded separately by [`crate::wire`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum frame size (10 MB) to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Errors that can occur during framing
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    FrameTooLarge(usize),

    #[error("Invalid frame length prefix: {0}")]
    InvalidLength(u32),
}

/// Frame a raw request envelope
pub fn encode_request(envelope: &[u8]) -> Result<Bytes, CodecError> {
    if envelope.len() > MAX_MESSAGE_SIZE as usize {
        return Err(CodecError::FrameTooLarge(envelope.len()));
    }
    let mut buf = BytesMut::with_capacity(4 + envelope.len());
    buf.put_u32(envelope.len() as u32);
    buf.put_slice(envelope);
    Ok(buf.freeze())
}

/// Frame a reply: status code plus result bytes with an explicit length
pub fn encode_reply(status: u64, result: &[u8]) -> Result<Bytes, CodecError> {
    let payload_len = 8 + 4 + result.len();
    if payload_len > MAX_MESSAGE_SIZE as usize {
        return Err(CodecError::FrameTooLarge(payload_len));
    }
    let mut buf = BytesMut::with_capacity(4 + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u64_le(status);
    buf.put_u32_le(result.len() as u32);
    buf.put_slice(result);
    Ok(buf.freeze())
}

/// Try to extract one complete frame payload from a buffer
///
/// Returns:
/// - `Ok(Some(payload))` if a complete frame was available
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the prefix is invalid
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    // Peek at the length prefix without consuming
    let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if frame_len > MAX_MESSAGE_SIZE {
        return Err(CodecError::InvalidLength(frame_len));
    }

    let total_len = 4 + frame_len as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    buf.advance(4);
    Ok(Some(buf.split_to(frame_len as usize).freeze()))
}

/// Decoder state machine for streaming frame extraction
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract the next frame from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete
    /// frames
    pub fn decode_next(&mut self) -> Result<Option<Bytes>, CodecError> {
        decode_frame(&mut self.buffer)
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let envelope = b"some envelope bytes";
        let framed = encode_request(envelope).expect("encode failed");

        let len_prefix = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]);
        assert_eq!(len_prefix as usize, envelope.len());

        let mut buf = BytesMut::from(&framed[..]);
        let payload = decode_frame(&mut buf).expect("decode failed").expect("no frame");
        assert_eq!(&payload[..], envelope);
        assert!(buf.is_empty(), "buffer should be empty after decode");
    }

    #[test]
    fn partial_frame_returns_none() {
        let framed = encode_request(b"hello").expect("encode failed");

        let mut buf = BytesMut::from(&framed[..3]);
        let result = decode_frame(&mut buf).expect("partial data should not fail");
        assert!(result.is_none());
        assert_eq!(buf.len(), 3, "partial data must not be consumed");
    }

    #[test]
    fn streaming_decoder_accumulates() {
        let framed = encode_request(b"payload").expect("encode failed");

        let mut decoder = FrameDecoder::new();
        decoder.extend(&framed[..5]);
        assert!(decoder.decode_next().expect("decode error").is_none());

        decoder.extend(&framed[5..]);
        let payload = decoder
            .decode_next()
            .expect("decode error")
            .expect("should have frame");
        assert_eq!(&payload[..], b"payload");
    }

    #[test]
    fn multiple_frames_drain_in_order() {
        let f1 = encode_request(b"first").unwrap();
        let f2 = encode_request(b"second").unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&f1);
        decoder.extend(&f2);

        assert_eq!(&decoder.decode_next().unwrap().unwrap()[..], b"first");
        assert_eq!(&decoder.decode_next().unwrap().unwrap()[..], b"second");
        assert!(decoder.decode_next().unwrap().is_none());
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_SIZE + 1);
        buf.put_bytes(0, 100);

        let result = decode_frame(&mut buf);
        assert!(matches!(result, Err(CodecError::InvalidLength(_))));
    }

    #[test]
    fn reply_layout() {
        let framed = encode_reply(5, b"denied").expect("encode failed");
        let mut buf = BytesMut::from(&framed[..]);
        let payload = decode_frame(&mut buf).unwrap().unwrap();

        let status = u64::from_le_bytes(payload[0..8].try_into().unwrap());
        let result_len = u32::from_le_bytes(payload[8..12].try_into().unwrap());
        assert_eq!(status, 5);
        assert_eq!(result_len, 6);
        assert_eq!(&payload[12..], b"denied");
    }
}
