// ABOUTME: Link configuration
// ABOUTME: Defines tunable parameters for the encoder, receive task and command handling

/// Link configuration
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Capture ticks skipped between transmitted visualization frames
    pub frames_to_skip: u32,
    /// Minimum spacing between accepted player commands in milliseconds
    pub command_interval_ms: u64,
    /// Blank the waveform on alternate ticks while the player is not playing
    pub blank_idle_waveform: bool,
    /// Size of the receive task's read buffer
    pub read_buffer_size: usize,
    /// Name of the receive thread
    pub receiver_thread_name: String,
}

impl LinkConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of capture ticks skipped between transmitted frames
    pub fn frames_to_skip(mut self, frames: u32) -> Self {
        self.frames_to_skip = frames;
        self
    }

    /// Set the minimum spacing between accepted player commands
    pub fn command_interval_ms(mut self, ms: u64) -> Self {
        self.command_interval_ms = ms;
        self
    }

    /// Enable or disable idle waveform blanking
    pub fn blank_idle_waveform(mut self, blank: bool) -> Self {
        self.blank_idle_waveform = blank;
        self
    }

    /// Set the receive buffer size (at least one byte)
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set the receive thread name
    pub fn receiver_thread_name(mut self, name: impl Into<String>) -> Self {
        self.receiver_thread_name = name.into();
        self
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            frames_to_skip: 0,
            command_interval_ms: 50,
            blank_idle_waveform: true,
            read_buffer_size: 64,
            receiver_thread_name: "vizlink-rx".to_string(),
        }
    }
}
