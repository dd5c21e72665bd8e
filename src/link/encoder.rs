// ABOUTME: Send-side frame encoder for the capture tick
// ABOUTME: Visualization and player state frames built in one reusable scratch buffer

use crate::link::processor::{VisualizerProcessor, WAVEFORM_MIDPOINT};
use crate::protocol::framing::{encode_length, max_frame_len, write_escaped, HEADER_LEN};
use crate::protocol::messages::{BinCount, DataType, MessageType, PlayerState};
use crate::protocol::{END_OF_TRANSMISSION, START_OF_HEADING};
use std::io::{self, Write};

/// Largest visualization payload: spectrum plus waveform at 256 bins
pub const MAX_VISUALIZATION_PAYLOAD: usize = 2 * 256;

/// Scratch buffer size, enough for a fully escaped maximum frame
pub const SCRATCH_LEN: usize = max_frame_len(MAX_VISUALIZATION_PAYLOAD);

/// Per-tick inputs read from the session
#[derive(Debug, Clone, Copy)]
pub struct TickSettings {
    /// Whether the host player is playing
    pub playing: bool,
    /// Blank idle waveforms on alternate ticks
    pub blank_idle: bool,
    /// Ticks to skip between transmitted frames
    pub frames_to_skip: u32,
    /// Requested resolution
    pub bins: BinCount,
    /// Requested data
    pub data: DataType,
}

/// Frame encoder owning the transport writer and the scratch buffer
pub struct LinkEncoder {
    writer: Box<dyn Write + Send>,
    scratch: Box<[u8]>,
    processor: Box<dyn VisualizerProcessor>,
    blank_toggle: bool,
    skip_countdown: u32,
}

impl LinkEncoder {
    /// Create an encoder writing to `writer`
    pub fn new(writer: Box<dyn Write + Send>, processor: Box<dyn VisualizerProcessor>) -> Self {
        Self {
            writer,
            scratch: vec![0u8; SCRATCH_LEN].into_boxed_slice(),
            processor,
            blank_toggle: false,
            skip_countdown: 0,
        }
    }

    /// Run the visualization half of a capture tick.
    ///
    /// Returns `Ok(true)` when a frame was written, `Ok(false)` on a skipped tick.
    pub fn write_visualization(
        &mut self,
        waveform: &mut [u8],
        settings: &TickSettings,
    ) -> io::Result<bool> {
        self.blank_toggle = !self.blank_toggle;
        if settings.blank_idle && !settings.playing && self.blank_toggle {
            waveform.fill(WAVEFORM_MIDPOINT);
        }

        if self.skip_countdown > 0 {
            self.skip_countdown -= 1;
            self.processor.skip(waveform);
            return Ok(false);
        }
        self.skip_countdown = settings.frames_to_skip;

        let payload_len = settings
            .data
            .payload_len(settings.bins)
            .min(MAX_VISUALIZATION_PAYLOAD);
        let tail = self.scratch.len() - payload_len;
        let produced = self.processor.process(
            waveform,
            settings.bins,
            settings.data,
            &mut self.scratch[tail..],
        );
        let produced = produced.min(payload_len);

        let [low, high] = encode_length(produced);
        self.scratch[0] = START_OF_HEADING;
        self.scratch[1] = MessageType::StartBinTransmission as u8;
        self.scratch[2] = low;
        self.scratch[3] = high;

        // The payload sits at the tail; escaped output grows from the front
        // and cannot reach a byte before it has been read.
        let mut offset = HEADER_LEN;
        for i in tail..tail + produced {
            let value = self.scratch[i];
            offset = write_escaped(&mut self.scratch, offset, value);
        }
        self.scratch[offset] = END_OF_TRANSMISSION;

        self.send(offset + 1)?;
        Ok(true)
    }

    /// Write a player state frame
    pub fn write_player_state(&mut self, state: &PlayerState) -> io::Result<()> {
        let len = state.write_frame(&mut self.scratch);
        self.send(len)
    }

    fn send(&mut self, len: usize) -> io::Result<()> {
        self.writer.write_all(&self.scratch[..len])?;
        self.writer.flush()
    }
}
