// ABOUTME: Receive-side frame decoder
// ABOUTME: Byte-at-a-time state machine with start-marker resynchronization

use super::framing::decode_length;
use super::messages::MessageType;
use super::{END_OF_TRANSMISSION, ESCAPE, START_OF_HEADING};

/// Decoder progress through a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Next byte is the message type
    AwaitingType,
    /// Next byte is the low half of the length
    AwaitingLengthLow,
    /// Next byte is the high half of the length
    AwaitingLengthHigh,
    /// Collecting payload bytes
    AwaitingPayload,
    /// Next byte must be the end marker
    AwaitingEnd,
    /// Sink: everything is ignored until a start marker
    Error,
}

/// A validated host-bound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedFrame {
    /// Message type
    pub message_type: MessageType,
    /// Payload bytes as a big-endian integer
    pub payload: u16,
    /// Number of payload bytes (0, 1 or 2)
    pub payload_length: usize,
}

/// Host-side frame decoder.
///
/// Accepts only the frames a device may send: start/stop transmission and
/// player commands, each with its fixed payload length. A start marker resets
/// the machine from any state. After a frame completes (or fails at the end
/// marker) the decoder sits in [`DecoderState::Error`] until the next start
/// marker, so every frame needs its own start marker.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    state: DecoderState,
    message_type: MessageType,
    length_low: u8,
    payload_length: usize,
    remaining: usize,
    payload: u16,
}

impl FrameDecoder {
    /// Create a decoder waiting for the first start marker
    pub fn new() -> Self {
        Self {
            state: DecoderState::Error,
            message_type: MessageType::StopBinTransmission,
            length_low: 0,
            payload_length: 0,
            remaining: 0,
            payload: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Feed one byte, returning a frame when one completes
    pub fn push(&mut self, byte: u8) -> Option<ReceivedFrame> {
        if byte == START_OF_HEADING {
            self.state = DecoderState::AwaitingType;
            self.payload = 0;
            return None;
        }

        match self.state {
            DecoderState::Error => {}
            DecoderState::AwaitingType => {
                self.state = match MessageType::try_from(byte) {
                    Ok(MessageType::PlayerState) | Err(_) => DecoderState::Error,
                    Ok(message_type) => {
                        self.message_type = message_type;
                        DecoderState::AwaitingLengthLow
                    }
                };
            }
            DecoderState::AwaitingLengthLow => {
                if byte & 1 != 0 {
                    self.state = DecoderState::Error;
                } else {
                    self.length_low = byte;
                    self.state = DecoderState::AwaitingLengthHigh;
                }
            }
            DecoderState::AwaitingLengthHigh => {
                self.state = match decode_length(self.length_low, byte) {
                    None => DecoderState::Error,
                    Some(length) => self.check_length(length),
                };
            }
            DecoderState::AwaitingPayload => {
                if byte == ESCAPE {
                    self.state = DecoderState::Error;
                } else {
                    self.payload = (self.payload << 8) | byte as u16;
                    self.remaining -= 1;
                    if self.remaining == 0 {
                        self.state = DecoderState::AwaitingEnd;
                    }
                }
            }
            DecoderState::AwaitingEnd => {
                self.state = DecoderState::Error;
                if byte == END_OF_TRANSMISSION {
                    return Some(ReceivedFrame {
                        message_type: self.message_type,
                        payload: self.payload,
                        payload_length: self.payload_length,
                    });
                }
            }
        }

        None
    }

    /// Feed a run of bytes, calling `on_frame` for each completed frame
    pub fn feed<F>(&mut self, bytes: &[u8], mut on_frame: F)
    where
        F: FnMut(ReceivedFrame),
    {
        for &byte in bytes {
            if let Some(frame) = self.push(byte) {
                on_frame(frame);
            }
        }
    }

    fn check_length(&mut self, length: usize) -> DecoderState {
        let valid = match self.message_type {
            MessageType::StopBinTransmission => length == 0,
            MessageType::PlayerCommand => length == 1 || length == 2,
            _ => length == 1,
        };
        if !valid {
            return DecoderState::Error;
        }

        self.payload_length = length;
        self.remaining = length;
        if length == 0 {
            DecoderState::AwaitingEnd
        } else {
            DecoderState::AwaitingPayload
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
