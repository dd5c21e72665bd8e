// ABOUTME: Session layer for the visualizer link
// ABOUTME: Wires encoder, receive thread, transports and lifecycle into Link

/// Waveform capture sources
pub mod capture;
/// Shared CLI arguments
pub mod cli;
/// Time sources for rate limiting
pub mod clock;
/// Link configuration
pub mod config;
/// Send-side frame encoder
pub mod encoder;
/// Host-facing events and player trait
pub mod events;
/// Visualization processors
pub mod processor;
mod receiver;
/// Session lifecycle
pub mod session;
/// Two-tier lock guarding the encoder
pub mod slim_lock;
/// Byte stream transports
pub mod transport;

pub use capture::{CaptureSource, SilenceCapture, ToneCapture};
pub use cli::LinkArgs;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::LinkConfig;
pub use encoder::{LinkEncoder, TickSettings};
pub use events::{ConnectionError, LinkEvent, Notification, PlayerHost, StateChange};
pub use processor::{SpectrumProcessor, VisualizerProcessor, WAVEFORM_MIDPOINT};
pub use session::{Link, LinkBuilder, LinkState, ProcessorFactory};
pub use slim_lock::SlimLock;
pub use transport::{pair, ChannelTransport, Transport};
