// ABOUTME: Main library entry point for vizlink
// ABOUTME: Exports the wire protocol and the session layer that drives it

//! # vizlink
//!
//! Framed link protocol for streaming audio visualization data and player state
//! to a remote display device, and for receiving remote-control commands back.
//!
//! The link runs over any ordered byte stream (an RFCOMM socket, a TCP socket, an
//! in-memory channel). Frames are byte-stuffed so that the start marker can always
//! be used to resynchronize after corrupted or lost bytes.
//!
//! ## Features
//!
//! - **Protocol**: escaping, length encoding, frame construction and the
//!   byte-at-a-time receive state machine
//! - **Link**: session lifecycle, capture-tick encoder, receive thread and the
//!   two-tier lock that keeps teardown from racing the encoder
//!
//! ## Example: Hosting a link
//!
//! ```no_run
//! use std::sync::Arc;
//! use vizlink::link::{Link, LinkConfig, PlayerHost};
//! use vizlink::protocol::messages::PlayerState;
//!
//! struct Player;
//!
//! impl PlayerHost for Player {
//!     fn player_state(&self) -> PlayerState {
//!         PlayerState::default()
//!     }
//! }
//!
//! let (events_tx, events_rx) = crossbeam::channel::unbounded();
//! let link = Link::new(LinkConfig::default(), Arc::new(Player), events_tx);
//!
//! let stream = std::net::TcpStream::connect("127.0.0.1:7777").unwrap();
//! link.on_connected(Box::new(stream)).unwrap();
//!
//! for notification in events_rx {
//!     if let Some(event) = link.accept(notification) {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

#![warn(missing_docs)]

/// Session layer: encoder, receive task, lock and lifecycle
pub mod link;
/// Wire protocol: markers, framing and decoding
pub mod protocol;

pub use link::{Link, LinkConfig, LinkEvent, Notification};
pub use protocol::decoder::FrameDecoder;

/// Result type for vizlink operations
pub type Result<T> = std::result::Result<T, error::Error>;

/// Error types for vizlink
pub mod error {
    use thiserror::Error;

    /// Error types for vizlink operations
    #[derive(Error, Debug)]
    pub enum Error {
        /// Transport read/write failure
        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        /// Protocol violation or parsing error
        #[error("Protocol error: {0}")]
        Protocol(String),

        /// Message type byte outside the known set
        #[error("Invalid message type: {0:#04x}")]
        InvalidMessageType(u8),

        /// Structurally invalid frame
        #[error("Invalid frame: {0}")]
        InvalidFrame(&'static str),

        /// Operation requires a connected session
        #[error("Link is not connected")]
        NotConnected,

        /// Connection-related error
        #[error("Connection error: {0}")]
        Connection(String),
    }
}
