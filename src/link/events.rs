// ABOUTME: Events the link posts to its host and the host-side player trait
// ABOUTME: Tagged notifications stamped with the session version, plus error and change types

use crate::protocol::messages::{BinCount, DataType, PlayerCommand, PlayerState};
use std::ops::BitOr;
use thiserror::Error;

/// Player side of the host, queried by the encoder
pub trait PlayerHost: Send + Sync {
    /// Current player snapshot
    fn player_state(&self) -> PlayerState;

    /// Whether playback is running. Called on every capture tick.
    fn is_playing(&self) -> bool {
        self.player_state().playing
    }
}

/// Errors reported to the host
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The device has no suitable radio
    #[error("Bluetooth is not supported on this device")]
    NotSupported,
    /// The radio is switched off
    #[error("Bluetooth is not enabled")]
    NotEnabled,
    /// Discovery did not find the remote device
    #[error("Device discovery failed")]
    DiscoveryFailed,
    /// The connection attempt failed
    #[error("Connection failed")]
    ConnectionFailed,
    /// Read or write on an established link failed
    #[error("Communication error: {0}")]
    Communication(String),
    /// Any other transport error code
    #[error("Transport error code {0}")]
    Other(i32),
}

/// Something the host should know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Transport connected and receive task running
    Connected,
    /// Visualization frames are being sent
    TransmissionStarted {
        /// Resolution
        bins: BinCount,
        /// Data computed per frame
        data: DataType,
    },
    /// Visualization frames stopped
    TransmissionStopped,
    /// Remote-control command to apply to the player
    Command(PlayerCommand),
    /// Error, always followed by [`LinkEvent::Stopped`]
    Error(ConnectionError),
    /// Link torn down
    Stopped,
}

/// Event stamped with the session version it was produced under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Session version at the time of posting
    pub version: u32,
    /// The event
    pub event: LinkEvent,
}

/// Which parts of the player state changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateChange(u32);

impl StateChange {
    /// Nothing changed
    pub const NONE: StateChange = StateChange(0);
    /// Volume changed
    pub const VOLUME: StateChange = StateChange(0x01);
    /// Position jumped
    pub const POSITION: StateChange = StateChange(0x02);
    /// Track length changed
    pub const LENGTH: StateChange = StateChange(0x04);
    /// Playing flag changed
    pub const PLAYING: StateChange = StateChange(0x08);
    /// Loading flag changed
    pub const LOADING: StateChange = StateChange(0x10);
    /// Everything
    pub const ALL: StateChange = StateChange(0x1F);

    /// Raw bits
    pub fn bits(self) -> u32 {
        self.0
    }

    /// True if nothing changed
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for StateChange {
    type Output = StateChange;

    fn bitor(self, rhs: Self) -> Self::Output {
        StateChange(self.0 | rhs.0)
    }
}
