// ABOUTME: Protocol message type definitions and payload encoding
// ABOUTME: Message types, bin counts, player commands and the player state frame

use super::framing::{encode_frame, encode_length, max_frame_len, write_escaped, HEADER_LEN};
use super::{END_OF_TRANSMISSION, START_OF_HEADING};
use crate::error::Error;
use crate::Result;
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

/// Message type byte following the start marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Start visualization transmission (request), or a visualization frame
    StartBinTransmission = 0x30,
    /// Stop visualization transmission
    StopBinTransmission = 0x31,
    /// Remote-control command
    PlayerCommand = 0x32,
    /// Player state snapshot, sent to the device only
    PlayerState = 0x33,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x30 => Ok(MessageType::StartBinTransmission),
            0x31 => Ok(MessageType::StopBinTransmission),
            0x32 => Ok(MessageType::PlayerCommand),
            0x33 => Ok(MessageType::PlayerState),
            _ => Err(Error::InvalidMessageType(value)),
        }
    }
}

/// Requested visualization resolution.
///
/// The discriminant is the wire code sent in a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum BinCount {
    /// 4 bins
    Bins4 = 0x20,
    /// 8 bins
    Bins8 = 0x21,
    /// 16 bins
    Bins16 = 0x22,
    /// 32 bins
    #[default]
    Bins32 = 0x23,
    /// 64 bins
    Bins64 = 0x24,
    /// 128 bins
    Bins128 = 0x25,
    /// 256 bins
    Bins256 = 0x26,
}

impl BinCount {
    /// Every supported resolution, smallest first
    pub const ALL: [BinCount; 7] = [
        BinCount::Bins4,
        BinCount::Bins8,
        BinCount::Bins16,
        BinCount::Bins32,
        BinCount::Bins64,
        BinCount::Bins128,
        BinCount::Bins256,
    ];

    /// Largest resolution
    pub const MAX: BinCount = BinCount::Bins256;

    /// Look up a wire code
    pub fn from_code(code: u8) -> Option<Self> {
        let index = code.checked_sub(BinCount::Bins4 as u8)?;
        Self::ALL.get(index as usize).copied()
    }

    /// Look up a bin count
    pub fn from_bins(bins: usize) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.bins() == bins)
    }

    /// Wire code
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Number of bins
    #[inline]
    pub fn bins(self) -> usize {
        4 << (self as u8 - BinCount::Bins4 as u8)
    }
}

/// Bitmask of the visualization data computed on each transmit tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataType(u8);

impl DataType {
    /// Spectrum magnitude bins
    pub const FREQUENCY: DataType = DataType(0x01);
    /// Downsampled raw waveform
    pub const WAVEFORM: DataType = DataType(0x02);
    /// Spectrum followed by waveform
    pub const ALL: DataType = DataType(0x03);

    /// Build from raw bits, ignoring unknown ones
    pub fn from_bits(bits: u8) -> Self {
        DataType(bits & Self::ALL.0)
    }

    /// Raw bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Check whether every bit of `other` is set
    pub fn contains(self, other: DataType) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if no data type is selected
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Payload size for `bins` with this data type
    pub fn payload_len(self, bins: BinCount) -> usize {
        bins.bins() * self.0.count_ones() as usize
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::FREQUENCY
    }
}

impl BitOr for DataType {
    type Output = DataType;

    fn bitor(self, rhs: Self) -> Self::Output {
        DataType(self.0 | rhs.0)
    }
}

/// Flag in the start request byte asking for waveform data as well
pub const WAVEFORM_REQUEST_FLAG: u8 = 0x40;

/// Payload of a start transmission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartRequest {
    /// Requested resolution
    pub bins: BinCount,
    /// Requested data
    pub data: DataType,
}

impl StartRequest {
    /// Parse the single payload byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        let bins = BinCount::from_code(byte & !WAVEFORM_REQUEST_FLAG)?;
        let data = if byte & WAVEFORM_REQUEST_FLAG != 0 {
            DataType::ALL
        } else {
            DataType::FREQUENCY
        };
        Some(Self { bins, data })
    }

    /// Encode as the single payload byte
    pub fn to_byte(self) -> u8 {
        if self.data.contains(DataType::WAVEFORM) {
            self.bins.code() | WAVEFORM_REQUEST_FLAG
        } else {
            self.bins.code()
        }
    }
}

/// Remote-control command received from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerCommand {
    /// Re-send the player state; never rate limited
    UpdateState,
    /// Previous track
    Previous,
    /// Toggle play/pause
    PlayPause,
    /// Next track
    Next,
    /// Start playback
    Play,
    /// Pause playback
    Pause,
    /// Raise volume one step
    IncreaseVolume,
    /// Lower volume one step
    DecreaseVolume,
    /// Set volume (0-100)
    SetVolume(u8),
}

impl PlayerCommand {
    /// Command code of [`PlayerCommand::UpdateState`]
    pub const CODE_UPDATE_STATE: u8 = 0x00;
    /// Command code of [`PlayerCommand::Previous`]
    pub const CODE_PREVIOUS: u8 = 0x58;
    /// Command code of [`PlayerCommand::PlayPause`]
    pub const CODE_PLAY_PAUSE: u8 = 0x59;
    /// Command code of [`PlayerCommand::Next`]
    pub const CODE_NEXT: u8 = 0x5A;
    /// Command code of [`PlayerCommand::Play`]
    pub const CODE_PLAY: u8 = 0x5B;
    /// Command code of [`PlayerCommand::Pause`]
    pub const CODE_PAUSE: u8 = 0x5C;
    /// Command code of [`PlayerCommand::IncreaseVolume`]
    pub const CODE_INCREASE_VOLUME: u8 = 0x5D;
    /// Command code of [`PlayerCommand::DecreaseVolume`]
    pub const CODE_DECREASE_VOLUME: u8 = 0x5E;
    /// Command code of [`PlayerCommand::SetVolume`], sent as the high byte
    pub const CODE_SET_VOLUME: u8 = 0xD1;

    /// Decode a big-endian payload of `length` (1 or 2) bytes
    pub fn from_payload(payload: u16, length: usize) -> Option<Self> {
        match length {
            1 => match payload as u8 {
                Self::CODE_UPDATE_STATE => Some(PlayerCommand::UpdateState),
                Self::CODE_PREVIOUS => Some(PlayerCommand::Previous),
                Self::CODE_PLAY_PAUSE => Some(PlayerCommand::PlayPause),
                Self::CODE_NEXT => Some(PlayerCommand::Next),
                Self::CODE_PLAY => Some(PlayerCommand::Play),
                Self::CODE_PAUSE => Some(PlayerCommand::Pause),
                Self::CODE_INCREASE_VOLUME => Some(PlayerCommand::IncreaseVolume),
                Self::CODE_DECREASE_VOLUME => Some(PlayerCommand::DecreaseVolume),
                _ => None,
            },
            2 if (payload >> 8) as u8 == Self::CODE_SET_VOLUME => {
                Some(PlayerCommand::SetVolume((payload as u8).min(100)))
            }
            _ => None,
        }
    }

    /// Encode as payload bytes
    pub fn to_payload(self) -> Vec<u8> {
        match self {
            PlayerCommand::UpdateState => vec![Self::CODE_UPDATE_STATE],
            PlayerCommand::Previous => vec![Self::CODE_PREVIOUS],
            PlayerCommand::PlayPause => vec![Self::CODE_PLAY_PAUSE],
            PlayerCommand::Next => vec![Self::CODE_NEXT],
            PlayerCommand::Play => vec![Self::CODE_PLAY],
            PlayerCommand::Pause => vec![Self::CODE_PAUSE],
            PlayerCommand::IncreaseVolume => vec![Self::CODE_INCREASE_VOLUME],
            PlayerCommand::DecreaseVolume => vec![Self::CODE_DECREASE_VOLUME],
            PlayerCommand::SetVolume(level) => vec![Self::CODE_SET_VOLUME, level.min(100)],
        }
    }

    /// Whether the command is exempt from rate limiting
    pub fn is_update_state(self) -> bool {
        self == PlayerCommand::UpdateState
    }
}

impl fmt::Display for PlayerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerCommand::UpdateState => f.write_str("update"),
            PlayerCommand::Previous => f.write_str("previous"),
            PlayerCommand::PlayPause => f.write_str("play-pause"),
            PlayerCommand::Next => f.write_str("next"),
            PlayerCommand::Play => f.write_str("play"),
            PlayerCommand::Pause => f.write_str("pause"),
            PlayerCommand::IncreaseVolume => f.write_str("volume-up"),
            PlayerCommand::DecreaseVolume => f.write_str("volume-down"),
            PlayerCommand::SetVolume(level) => write!(f, "volume={}", level),
        }
    }
}

impl FromStr for PlayerCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(level) = s.strip_prefix("volume=") {
            let level = level
                .parse::<u8>()
                .map_err(|e| Error::Protocol(format!("invalid volume '{}': {}", level, e)))?;
            return Ok(PlayerCommand::SetVolume(level.min(100)));
        }

        match s {
            "update" => Ok(PlayerCommand::UpdateState),
            "previous" | "prev" => Ok(PlayerCommand::Previous),
            "play-pause" | "toggle" => Ok(PlayerCommand::PlayPause),
            "next" => Ok(PlayerCommand::Next),
            "play" => Ok(PlayerCommand::Play),
            "pause" => Ok(PlayerCommand::Pause),
            "volume-up" => Ok(PlayerCommand::IncreaseVolume),
            "volume-down" => Ok(PlayerCommand::DecreaseVolume),
            other => Err(Error::Protocol(format!("unknown player command '{}'", other))),
        }
    }
}

/// Frame sent from the device to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Start streaming visualization frames
    StartTransmission(StartRequest),
    /// Stop streaming visualization frames
    StopTransmission,
    /// Remote-control command
    Command(PlayerCommand),
}

impl Request {
    /// Encode as a complete frame
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::StartTransmission(start) => {
                encode_frame(MessageType::StartBinTransmission, &[start.to_byte()])
            }
            Request::StopTransmission => encode_frame(MessageType::StopBinTransmission, &[]),
            Request::Command(command) => {
                encode_frame(MessageType::PlayerCommand, &command.to_payload())
            }
        }
    }
}

/// Flag bits composed into every player state frame
pub const STATE_FLAGS_BASE: u8 = 0x04;
/// Player state flag: playing
pub const STATE_FLAG_PLAYING: u8 = 0x01;
/// Player state flag: loading
pub const STATE_FLAG_LOADING: u8 = 0x02;

/// Unescaped payload length of a player state frame
pub const PLAYER_STATE_PAYLOAD_LEN: usize = 10;

/// Worst-case encoded size of a player state frame
pub const PLAYER_STATE_MAX_FRAME_LEN: usize = max_frame_len(PLAYER_STATE_PAYLOAD_LEN);

/// Snapshot of the host player, sent to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerState {
    /// Volume (0-100)
    pub volume: u8,
    /// Playback position in milliseconds
    pub position_ms: i32,
    /// Track length in milliseconds, -1 if unknown
    pub length_ms: i32,
    /// Whether playback is running
    pub playing: bool,
    /// Whether a track is loading
    pub loading: bool,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            volume: 100,
            position_ms: 0,
            length_ms: -1,
            playing: false,
            loading: false,
        }
    }
}

impl PlayerState {
    /// Flags byte as sent on the wire
    pub fn flags(&self) -> u8 {
        let mut flags = STATE_FLAGS_BASE;
        if self.playing {
            flags |= STATE_FLAG_PLAYING;
        }
        if self.loading {
            flags |= STATE_FLAG_LOADING;
        }
        flags
    }

    /// Write a complete player state frame into `buffer`, returning its length.
    ///
    /// `buffer` must hold at least [`PLAYER_STATE_MAX_FRAME_LEN`] bytes.
    pub fn write_frame(&self, buffer: &mut [u8]) -> usize {
        buffer[0] = START_OF_HEADING;
        buffer[1] = MessageType::PlayerState as u8;
        buffer[2] = 0;
        buffer[3] = 0;

        let mut offset = HEADER_LEN;
        let mut fields = 0usize;
        let mut put = |buffer: &mut [u8], offset: usize, value: u8| {
            fields += 1;
            write_escaped(buffer, offset, value)
        };

        offset = put(buffer, offset, self.flags());
        offset = put(buffer, offset, self.volume.min(100));
        for byte in self.position_ms.to_le_bytes() {
            offset = put(buffer, offset, byte);
        }
        for byte in self.length_ms.to_le_bytes() {
            offset = put(buffer, offset, byte);
        }

        // Length counts fields, not escaped bytes
        let [low, high] = encode_length(fields);
        buffer[2] = low;
        buffer[3] = high;

        buffer[offset] = END_OF_TRANSMISSION;
        offset + 1
    }

    /// Encode a complete player state frame into a new vector
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = [0u8; PLAYER_STATE_MAX_FRAME_LEN];
        let len = self.write_frame(&mut buffer);
        buffer[..len].to_vec()
    }

    /// Parse an unescaped player state payload
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let payload: &[u8; PLAYER_STATE_PAYLOAD_LEN] = payload
            .try_into()
            .map_err(|_| Error::InvalidFrame("player state payload length"))?;

        let flags = payload[0];
        if flags & STATE_FLAGS_BASE == 0 {
            return Err(Error::InvalidFrame("player state flags"));
        }

        Ok(Self {
            volume: payload[1],
            position_ms: i32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]),
            length_ms: i32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]),
            playing: flags & STATE_FLAG_PLAYING != 0,
            loading: flags & STATE_FLAG_LOADING != 0,
        })
    }
}
