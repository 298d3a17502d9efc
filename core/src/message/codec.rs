// Message codec — length-prefixed frames with size limits
//
// Every protocol message travels as a 4-byte little-endian length followed
// by its bincode encoding. Limits are enforced on both encode and decode
// so neither a bug nor a malicious peer can force an oversized allocation.

use thiserror::Error;

use super::ProtocolMessage;

/// Maximum encoded message size: 4 MB. Shuffle transcripts dominate:
/// each step carries one membership proof per client with one clause per
/// client, so the proof material grows quadratically in the client count.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Bytes of length prefix in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Message codec error types
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("serialization failed: {0}")]
    Serialize(String),
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("truncated frame: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
}

/// Serialize a message into a length-prefixed frame.
pub fn encode_frame(msg: &ProtocolMessage) -> Result<Vec<u8>, MessageError> {
    let body = bincode::serialize(msg).map_err(|e| MessageError::Serialize(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(MessageError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parse one length-prefixed frame from the front of `bytes`. Returns the
/// message and the number of bytes consumed, so a stream of frames can be
/// drained in order.
pub fn decode_frame(bytes: &[u8]) -> Result<(ProtocolMessage, usize), MessageError> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(MessageError::Truncated {
            needed: LENGTH_PREFIX_SIZE,
            have: bytes.len(),
        });
    }

    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(MessageError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    let total = LENGTH_PREFIX_SIZE + len;
    if bytes.len() < total {
        return Err(MessageError::Truncated {
            needed: total,
            have: bytes.len(),
        });
    }

    let msg = bincode::deserialize(&bytes[LENGTH_PREFIX_SIZE..total])
        .map_err(|e| MessageError::Deserialize(e.to_string()))?;
    Ok((msg, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DownstreamCell;

    fn sample() -> ProtocolMessage {
        ProtocolMessage::DownstreamData(DownstreamCell {
            round_id: 9,
            ownership_id: None,
            hash_of_previous_upstream: [0u8; 32],
            data: vec![0xAB; 64],
            flag_resync: false,
            flag_open_closed_request: false,
        })
    }

    #[test]
    fn frame_roundtrip() {
        let msg = sample();
        let frame = encode_frame(&msg).unwrap();
        let (restored, consumed) = decode_frame(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(restored, msg);
    }

    #[test]
    fn frames_drain_in_order() {
        let first = ProtocolMessage::Shutdown;
        let second = sample();
        let mut stream = encode_frame(&first).unwrap();
        stream.extend(encode_frame(&second).unwrap());

        let (msg1, used1) = decode_frame(&stream).unwrap();
        let (msg2, used2) = decode_frame(&stream[used1..]).unwrap();
        assert_eq!(msg1, first);
        assert_eq!(msg2, second);
        assert_eq!(used1 + used2, stream.len());
    }

    #[test]
    fn rejects_oversized_payload() {
        let msg = ProtocolMessage::UpstreamData {
            client_id: 0,
            round_id: 0,
            data: vec![0u8; MAX_FRAME_SIZE + 1],
        };
        assert!(matches!(
            encode_frame(&msg),
            Err(MessageError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_oversized_declared_length() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(u32::MAX).to_le_bytes());
        frame.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            decode_frame(&frame),
            Err(MessageError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn reports_truncation() {
        let frame = encode_frame(&sample()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(MessageError::Truncated { .. })
        ));
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(MessageError::Truncated { .. })
        ));
    }

    #[test]
    fn garbage_body_is_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&8u32.to_le_bytes());
        frame.extend_from_slice(&[0xFFu8; 8]);
        assert!(matches!(
            decode_frame(&frame),
            Err(MessageError::Deserialize(_))
        ));
    }
}
