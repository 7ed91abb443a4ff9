//! Message codec — length-prefixed framing for the wire protocol.
//!
//! Frames are a 4-byte big-endian payload length followed by the
//! bincode-encoded [`WireMessage`]. The length prefix is checked against
//! [`MAX_MESSAGE_SIZE`] before any allocation.

use veil_messages::WireMessage;

use crate::ProtocolError;

/// Maximum payload size in bytes. Anything larger is a protocol violation.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

const LEN_PREFIX: usize = 4;

/// Encode a message into a complete frame (length prefix + payload).
pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload = bincode::serialize(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::Oversized(payload.len()));
    }
    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// The on-wire size of a message, including the length prefix. Used for
/// outbound byte accounting (chocking/drown thresholds).
pub fn encoded_len(msg: &WireMessage) -> usize {
    bincode::serialized_size(msg).map(|n| n as usize).unwrap_or(0) + LEN_PREFIX
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(Some((msg, consumed)))` when a complete frame is available,
/// `Ok(None)` when more bytes are needed.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(WireMessage, usize)>, ProtocolError> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::Oversized(len));
    }
    if buf.len() < LEN_PREFIX + len {
        return Ok(None);
    }
    let payload = &buf[LEN_PREFIX..LEN_PREFIX + len];
    let msg =
        bincode::deserialize(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(Some((msg, LEN_PREFIX + len)))
}

/// Incremental frame reassembly for a socket read loop.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete message, if any.
    pub fn next_message(&mut self) -> Result<Option<WireMessage>, ProtocolError> {
        match decode_frame(&self.buf)? {
            Some((msg, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Bytes currently buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = encode_frame(&WireMessage::Ping).unwrap();
        let (msg, consumed) = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(msg, WireMessage::Ping);
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn partial_frame_needs_more_bytes() {
        let frame = encode_frame(&WireMessage::GetExternalAddr).unwrap();
        assert!(decode_frame(&frame[..2]).unwrap().is_none());
        assert!(decode_frame(&frame[..frame.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(u32::MAX).to_be_bytes());
        frame.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            decode_frame(&frame),
            Err(ProtocolError::Oversized(_))
        ));
    }

    #[test]
    fn buffer_reassembles_across_reads() {
        let a = encode_frame(&WireMessage::Ping).unwrap();
        let b = encode_frame(&WireMessage::Pong).unwrap();
        let stream: Vec<u8> = a.iter().chain(b.iter()).copied().collect();

        let mut fb = FrameBuffer::new();
        // Feed one byte at a time; messages must come out in order.
        let mut out = Vec::new();
        for byte in stream {
            fb.extend(&[byte]);
            while let Some(msg) = fb.next_message().unwrap() {
                out.push(msg);
            }
        }
        assert_eq!(out, vec![WireMessage::Ping, WireMessage::Pong]);
        assert_eq!(fb.pending(), 0);
    }

    #[test]
    fn encoded_len_matches_frame_len() {
        let msg = WireMessage::Bye {
            reason: veil_messages::ByeReason::Stopping,
        };
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(encoded_len(&msg), frame.len());
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&4u32.to_be_bytes());
        frame.extend_from_slice(&[0xFF, 0xFE, 0xFD, 0xFC]);
        assert!(matches!(
            decode_frame(&frame),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
