//! Streaming codec for the boardd session protocol.
//!
//! Wire format:
//! ```text
//! [msg_type:1][payload_len:2 LE][payload:N]      N <= 65535
//! ```
//!
//! The session transport is a byte stream, so message boundaries have to be
//! reassembled: the codec accumulates whatever the reader produced and hands
//! back at most one complete frame per [`FrameCodec::try_decode`] call.  A
//! partially buffered frame consumes nothing until the remaining bytes
//! arrive.  Callers drain the codec in a loop before going back to the
//! reactor to wait for more input.

use crate::protocol::messages::{Frame, MessageType, HEADER_SIZE, MAX_PAYLOAD};
use thiserror::Error;

/// Errors that can occur while encoding a frame.
///
/// Decoding itself cannot fail: the header is fixed-size and any payload
/// length is representable, so the only malformation a stream can exhibit is
/// an unrecognized type byte, which is a dispatcher concern.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload does not fit the 16-bit length field.
    #[error("payload too large: {0} bytes exceeds the {MAX_PAYLOAD}-byte frame limit")]
    PayloadTooLarge(usize),
}

/// Incremental decoder over an append-only receive buffer.
///
/// ```rust
/// use boardd_core::protocol::{encode_frame, Frame, FrameCodec, MessageType};
///
/// let mut codec = FrameCodec::new();
/// let frame = Frame::new(MessageType::Console, b"uart log line".to_vec());
/// codec.extend(&encode_frame(&frame).unwrap());
/// assert_eq!(codec.try_decode(), Some(frame));
/// assert_eq!(codec.try_decode(), None);
/// ```
#[derive(Debug, Default)]
pub struct FrameCodec {
    buf: Vec<u8>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes to the receive buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes and returns exactly one fully buffered frame, or `None` if
    /// fewer than a complete header + payload have been buffered yet.
    ///
    /// At most one frame's bytes are moved per call, so a caller that needs
    /// every buffered message must call this repeatedly until it returns
    /// `None` before resuming the read.
    pub fn try_decode(&mut self) -> Option<Frame> {
        if self.buf.len() < HEADER_SIZE {
            return None;
        }

        let msg_type = self.buf[0];
        let payload_len = u16::from_le_bytes([self.buf[1], self.buf[2]]) as usize;

        let total = HEADER_SIZE + payload_len;
        if self.buf.len() < total {
            return None;
        }

        let payload = self.buf[HEADER_SIZE..total].to_vec();
        self.buf.drain(..total);

        Some(Frame { msg_type, payload })
    }

    /// Number of bytes sitting in the receive buffer (complete or not).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Encodes a frame as header followed by payload in one buffer, so the caller
/// can hand it to the transport as a single logical write.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD`].
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    if frame.payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(frame.payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + frame.payload.len());
    buf.push(frame.msg_type);
    buf.extend_from_slice(&(frame.payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(&frame.payload);
    Ok(buf)
}

/// Convenience for the common "type + borrowed payload" send path.
pub fn encode_message(msg_type: MessageType, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    encode_frame(&Frame {
        msg_type: msg_type as u8,
        payload: payload.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_single_frame() {
        let frame = Frame::new(MessageType::BootDownload, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let bytes = encode_frame(&frame).expect("encode must succeed");

        let mut codec = FrameCodec::new();
        codec.extend(&bytes);

        assert_eq!(codec.try_decode(), Some(frame));
        assert_eq!(codec.try_decode(), None);
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_two_concatenated_frames_decode_in_order() {
        let first = Frame::new(MessageType::Console, b"one".to_vec());
        let second = Frame::new(MessageType::PowerOn, Vec::new());

        let mut codec = FrameCodec::new();
        let mut stream = encode_frame(&first).unwrap();
        stream.extend(encode_frame(&second).unwrap());
        codec.extend(&stream);

        assert_eq!(codec.try_decode(), Some(first));
        assert_eq!(codec.try_decode(), Some(second));
        assert_eq!(codec.try_decode(), None);
        assert_eq!(codec.buffered(), 0, "nothing may be left over");
    }

    #[test]
    fn test_partial_frame_consumes_nothing() {
        let frame = Frame::new(MessageType::Console, b"incremental".to_vec());
        let bytes = encode_frame(&frame).unwrap();

        let mut codec = FrameCodec::new();

        // Header arrives, but only half of the payload.
        let split = HEADER_SIZE + 4;
        codec.extend(&bytes[..split]);
        assert_eq!(codec.try_decode(), None);
        assert_eq!(codec.buffered(), split, "partial decode must not consume");

        // The remainder completes exactly one frame.
        codec.extend(&bytes[split..]);
        assert_eq!(codec.try_decode(), Some(frame));
        assert_eq!(codec.try_decode(), None);
    }

    #[test]
    fn test_bare_header_without_payload_bytes_waits() {
        let mut codec = FrameCodec::new();
        // Type 2, declared length 5, zero payload bytes buffered.
        codec.extend(&[2, 5, 0]);
        assert_eq!(codec.try_decode(), None);
        assert_eq!(codec.buffered(), 3);
    }

    #[test]
    fn test_zero_length_payload_is_a_valid_frame() {
        let mut codec = FrameCodec::new();
        codec.extend(&encode_message(MessageType::ListDevices, &[]).unwrap());

        let frame = codec.try_decode().expect("empty frame is complete");
        assert_eq!(frame.message_type(), Some(MessageType::ListDevices));
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_unknown_type_byte_still_decodes() {
        // The codec is policy-free: type 0xEE is not in the MessageType table
        // but the frame is syntactically fine.  Rejecting it is the
        // dispatcher's job.
        let mut codec = FrameCodec::new();
        codec.extend(&[0xEE, 1, 0, 0x42]);

        let frame = codec.try_decode().expect("frame must decode");
        assert_eq!(frame.msg_type, 0xEE);
        assert_eq!(frame.message_type(), None);
        assert_eq!(frame.payload, vec![0x42]);
    }

    #[test]
    fn test_max_payload_roundtrips_and_oversize_is_rejected() {
        let frame = Frame::new(MessageType::BootDownload, vec![0xA5; MAX_PAYLOAD]);
        let bytes = encode_frame(&frame).unwrap();

        let mut codec = FrameCodec::new();
        codec.extend(&bytes);
        assert_eq!(codec.try_decode(), Some(frame));

        let oversize = Frame {
            msg_type: MessageType::BootDownload as u8,
            payload: vec![0; MAX_PAYLOAD + 1],
        };
        assert_eq!(
            encode_frame(&oversize),
            Err(ProtocolError::PayloadTooLarge(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let frame = Frame::new(MessageType::BoardInfo, b"db410c".to_vec());
        let bytes = encode_frame(&frame).unwrap();

        let mut codec = FrameCodec::new();
        for (i, b) in bytes.iter().enumerate() {
            codec.extend(std::slice::from_ref(b));
            if i + 1 < bytes.len() {
                assert_eq!(codec.try_decode(), None);
            }
        }
        assert_eq!(codec.try_decode(), Some(frame));
    }
}
