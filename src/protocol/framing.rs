// ABOUTME: Byte stuffing and frame layout helpers
// ABOUTME: Escaping, 14-bit length fields, frame writers and a whole-buffer frame parser

use super::messages::MessageType;
use super::{END_OF_TRANSMISSION, ESCAPE, MAX_PAYLOAD_LENGTH, START_OF_HEADING};
use crate::error::Error;
use crate::Result;

/// Bytes before the payload: start marker, type, two length bytes
pub const HEADER_LEN: usize = 4;

/// Returns true if `value` must be escaped inside a frame
#[inline]
pub fn is_reserved(value: u8) -> bool {
    value == START_OF_HEADING || value == ESCAPE
}

/// Write `value` at `offset`, escaping it when it collides with a marker.
///
/// Returns the offset just past the written byte(s). The caller guarantees
/// room for two bytes.
#[inline]
pub fn write_escaped(buffer: &mut [u8], offset: usize, value: u8) -> usize {
    if is_reserved(value) {
        buffer[offset] = ESCAPE;
        buffer[offset + 1] = value ^ 1;
        offset + 2
    } else {
        buffer[offset] = value;
        offset + 1
    }
}

/// Append `value` to `out`, escaped if necessary
pub fn escape_into(value: u8, out: &mut Vec<u8>) {
    if is_reserved(value) {
        out.push(ESCAPE);
        out.push(value ^ 1);
    } else {
        out.push(value);
    }
}

/// Reverse [`escape_into`] over a whole byte run.
///
/// An escape followed by a marker, or a trailing escape, is rejected.
pub fn unescape(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied();

    while let Some(byte) = iter.next() {
        match byte {
            START_OF_HEADING => return Err(Error::InvalidFrame("unescaped start marker")),
            ESCAPE => match iter.next() {
                Some(next) if is_reserved(next) => {
                    return Err(Error::InvalidFrame("escape followed by marker"))
                }
                Some(next) => out.push(next ^ 1),
                None => return Err(Error::InvalidFrame("trailing escape")),
            },
            _ => out.push(byte),
        }
    }

    Ok(out)
}

/// Encode a payload length as two wire bytes, low 7 bits first.
///
/// Each byte carries its 7 bits in positions 1-7; bit 0 is always clear, so
/// length bytes never collide with a marker.
#[inline]
pub fn encode_length(length: usize) -> [u8; 2] {
    debug_assert!(length <= MAX_PAYLOAD_LENGTH);
    [((length & 0x7F) << 1) as u8, (((length >> 7) & 0x7F) << 1) as u8]
}

/// Decode the two length bytes. Returns `None` if either has bit 0 set.
#[inline]
pub fn decode_length(low: u8, high: u8) -> Option<usize> {
    if (low | high) & 1 != 0 {
        return None;
    }
    Some((low >> 1) as usize | (((high >> 1) as usize) << 7))
}

/// Worst-case size of a frame carrying `payload_len` bytes
#[inline]
pub const fn max_frame_len(payload_len: usize) -> usize {
    HEADER_LEN + payload_len * 2 + 1
}

/// Write a complete frame into `buffer`, returning its length.
///
/// `buffer` must hold at least `max_frame_len(payload.len())` bytes.
pub fn write_frame(buffer: &mut [u8], message_type: MessageType, payload: &[u8]) -> usize {
    let [low, high] = encode_length(payload.len());
    buffer[0] = START_OF_HEADING;
    buffer[1] = message_type as u8;
    buffer[2] = low;
    buffer[3] = high;

    let mut offset = HEADER_LEN;
    for &byte in payload {
        offset = write_escaped(buffer, offset, byte);
    }

    buffer[offset] = END_OF_TRANSMISSION;
    offset + 1
}

/// Encode a complete frame into a new vector
pub fn encode_frame(message_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; max_frame_len(payload.len())];
    let len = write_frame(&mut buffer, message_type, payload);
    buffer.truncate(len);
    buffer
}

/// A frame parsed out of a byte buffer, payload unescaped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Message type byte
    pub message_type: MessageType,
    /// Unescaped payload
    pub payload: Vec<u8>,
}

/// Parse one frame from the front of `bytes`.
///
/// Returns `Ok(None)` when more bytes are needed, or the frame and the number
/// of bytes it occupied. Unlike [`FrameDecoder`](super::decoder::FrameDecoder)
/// this accepts every message type and any payload length, which is what the
/// device end of the link needs.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<(RawFrame, usize)>> {
    match bytes.first() {
        None => return Ok(None),
        Some(&START_OF_HEADING) => {}
        Some(_) => return Err(Error::InvalidFrame("missing start marker")),
    }
    if bytes.len() < HEADER_LEN {
        return Ok(None);
    }
    if bytes[1..HEADER_LEN].contains(&START_OF_HEADING) {
        return Err(Error::InvalidFrame("start marker inside header"));
    }

    let message_type = MessageType::try_from(bytes[1])?;
    let length =
        decode_length(bytes[2], bytes[3]).ok_or(Error::InvalidFrame("length parity bit set"))?;

    let mut payload = Vec::with_capacity(length);
    let mut offset = HEADER_LEN;
    while payload.len() < length {
        let Some(&byte) = bytes.get(offset) else {
            return Ok(None);
        };
        match byte {
            START_OF_HEADING => return Err(Error::InvalidFrame("truncated payload")),
            ESCAPE => {
                let Some(&next) = bytes.get(offset + 1) else {
                    return Ok(None);
                };
                if is_reserved(next) {
                    return Err(Error::InvalidFrame("escape followed by marker"));
                }
                payload.push(next ^ 1);
                offset += 2;
            }
            _ => {
                payload.push(byte);
                offset += 1;
            }
        }
    }

    match bytes.get(offset) {
        None => Ok(None),
        Some(&END_OF_TRANSMISSION) => Ok(Some((
            RawFrame {
                message_type,
                payload,
            },
            offset + 1,
        ))),
        Some(_) => Err(Error::InvalidFrame("missing end marker")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_lengths() {
        for value in 0..=u8::MAX {
            let mut out = Vec::new();
            escape_into(value, &mut out);

            if value == START_OF_HEADING || value == ESCAPE {
                assert_eq!(out, vec![ESCAPE, value ^ 1]);
            } else {
                assert_eq!(out, vec![value]);
            }
            assert_eq!(unescape(&out).unwrap(), vec![value]);
        }
    }

    #[test]
    fn test_write_escaped_offsets() {
        let mut buffer = [0u8; 4];
        let offset = write_escaped(&mut buffer, 0, 0x42);
        assert_eq!(offset, 1);
        let offset = write_escaped(&mut buffer, offset, START_OF_HEADING);
        assert_eq!(offset, 3);
        assert_eq!(buffer, [0x42, ESCAPE, 0x00, 0x00]);
    }

    #[test]
    fn test_unescape_rejects_bad_sequences() {
        assert!(unescape(&[0x10, ESCAPE]).is_err());
        assert!(unescape(&[ESCAPE, ESCAPE]).is_err());
        assert!(unescape(&[ESCAPE, START_OF_HEADING]).is_err());
        assert!(unescape(&[0x10, START_OF_HEADING]).is_err());
    }

    #[test]
    fn test_length_round_trip() {
        for length in 0..=MAX_PAYLOAD_LENGTH {
            let [low, high] = encode_length(length);
            assert_eq!(low & 1, 0);
            assert_eq!(high & 1, 0);
            assert_eq!(decode_length(low, high), Some(length));
        }
    }

    #[test]
    fn test_decode_length_parity() {
        assert_eq!(decode_length(0x03, 0x00), None);
        assert_eq!(decode_length(0x02, 0x01), None);
        assert_eq!(decode_length(0x02, 0x00), Some(1));
        assert_eq!(decode_length(0x00, 0x02), Some(128));
    }

    #[test]
    fn test_encode_frame_layout() {
        let frame = encode_frame(MessageType::PlayerCommand, &[0xD1, 0x1B]);
        assert_eq!(
            frame,
            vec![START_OF_HEADING, 0x32, 0x04, 0x00, 0xD1, ESCAPE, 0x1A, END_OF_TRANSMISSION]
        );
    }

    #[test]
    fn test_decode_frame() {
        let mut bytes = encode_frame(MessageType::PlayerState, &[0x01, 0x02, 0x1B, 0x04]);
        let frame_len = bytes.len();
        bytes.extend_from_slice(&[START_OF_HEADING, 0x31]);

        let (frame, consumed) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(consumed, frame_len);
        assert_eq!(frame.message_type, MessageType::PlayerState);
        assert_eq!(frame.payload, vec![0x01, 0x02, 0x1B, 0x04]);

        // Second frame is incomplete
        assert!(decode_frame(&bytes[consumed..]).unwrap().is_none());
    }

    #[test]
    fn test_decode_frame_errors() {
        assert!(decode_frame(&[0x30, 0x00]).is_err());
        assert!(decode_frame(&[START_OF_HEADING, 0x7F, 0x00, 0x00]).is_err());
        assert!(decode_frame(&[START_OF_HEADING, 0x31, 0x01, 0x00]).is_err());
        assert!(decode_frame(&[START_OF_HEADING, 0x31, 0x00, 0x00, 0x05]).is_err());
        assert!(decode_frame(&[START_OF_HEADING, 0x30, 0x02, 0x00, START_OF_HEADING]).is_err());
    }
}
