// ABOUTME: Waveform capture sources feeding the capture tick
// ABOUTME: Provides test tone and silence sources producing unsigned 8-bit waveforms

use crate::link::processor::WAVEFORM_MIDPOINT;
use std::f64::consts::PI;

/// Trait for waveform capture sources
pub trait CaptureSource: Send {
    /// Fill `buffer` with the next unsigned 8-bit capture
    fn capture(&mut self, buffer: &mut [u8]);

    /// Get the sample rate in Hz
    fn sample_rate(&self) -> u32;
}

/// Test tone source (generates a sine wave)
pub struct ToneCapture {
    frequency: f64,
    sample_rate: u32,
    phase: f64,
    amplitude: f64,
}

impl ToneCapture {
    /// Create a new tone capture
    ///
    /// # Arguments
    /// * `frequency` - Tone frequency in Hz
    /// * `sample_rate` - Sample rate in Hz
    pub fn new(frequency: f64, sample_rate: u32) -> Self {
        Self {
            frequency,
            sample_rate,
            phase: 0.0,
            amplitude: 0.5 * 127.0,
        }
    }

    /// Set the amplitude (0.0 to 1.0)
    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0) * 127.0;
        self
    }

    /// Change the tone frequency without resetting the phase
    pub fn set_frequency(&mut self, frequency: f64) {
        self.frequency = frequency.max(0.0);
    }
}

impl CaptureSource for ToneCapture {
    fn capture(&mut self, buffer: &mut [u8]) {
        let phase_increment = 2.0 * PI * self.frequency / self.sample_rate as f64;

        for slot in buffer.iter_mut() {
            let value = WAVEFORM_MIDPOINT as f64 + self.phase.sin() * self.amplitude;
            *slot = value.round().clamp(0.0, 255.0) as u8;

            self.phase += phase_increment;
            if self.phase >= 2.0 * PI {
                self.phase -= 2.0 * PI;
            }
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Silence source
pub struct SilenceCapture {
    sample_rate: u32,
}

impl SilenceCapture {
    /// Create a new silence source
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl CaptureSource for SilenceCapture {
    fn capture(&mut self, buffer: &mut [u8]) {
        buffer.fill(WAVEFORM_MIDPOINT);
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
