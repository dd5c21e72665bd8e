// ABOUTME: Wire protocol for the visualizer link
// ABOUTME: Reserved marker bytes plus framing, message and decoder submodules

/// Byte stuffing, length fields and whole-frame encoding
pub mod framing;
/// Message types, commands and player state payloads
pub mod messages;
/// Byte-at-a-time receive state machine
pub mod decoder;

/// Start of heading. Begins every frame and resynchronizes the decoder.
pub const START_OF_HEADING: u8 = 0x01;

/// Escape marker. The following byte is the original value XOR 1.
pub const ESCAPE: u8 = 0x1B;

/// End of transmission. Terminates host-bound frames.
pub const END_OF_TRANSMISSION: u8 = 0x04;

/// Largest payload length the 14-bit length field can carry
pub const MAX_PAYLOAD_LENGTH: usize = 0x3FFF;
