// ABOUTME: Visualization processors turning captured waveforms into bin payloads
// ABOUTME: Processor trait plus an FFT spectrum implementation with peak decay

use crate::protocol::messages::{BinCount, DataType};
use realfft::num_complex::Complex;
use realfft::RealFftPlanner;

/// Neutral value of an unsigned 8-bit capture
pub const WAVEFORM_MIDPOINT: u8 = 0x80;

/// Per-tick decay applied to displayed bin levels
const PEAK_DECAY: f32 = 0.82;

/// Trait for visualization processors
pub trait VisualizerProcessor: Send {
    /// Compute `data.payload_len(bins)` bytes into `out`, returning the count.
    ///
    /// `waveform` is unsigned 8-bit audio centered on [`WAVEFORM_MIDPOINT`].
    fn process(&mut self, waveform: &[u8], bins: BinCount, data: DataType, out: &mut [u8])
        -> usize;

    /// Reduced work on capture ticks that are not transmitted
    fn skip(&mut self, _waveform: &[u8]) {}
}

/// Spectrum analyzer with falling peaks.
///
/// Frequency bins are FFT magnitudes grouped linearly into the requested
/// number of bands and compressed to 0-255. Each band holds its peak and
/// decays on every tick, transmitted or not.
pub struct SpectrumProcessor {
    planner: RealFftPlanner<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    levels: Vec<f32>,
}

impl SpectrumProcessor {
    /// Create a new spectrum processor
    pub fn new() -> Self {
        Self {
            planner: RealFftPlanner::new(),
            input: Vec::new(),
            spectrum: Vec::new(),
            levels: vec![0.0; BinCount::MAX.bins()],
        }
    }

    fn decay(&mut self) {
        for level in &mut self.levels {
            *level *= PEAK_DECAY;
        }
    }

    fn frequency_bins(&mut self, waveform: &[u8], bins: usize, out: &mut [u8]) {
        self.decay();

        let n = waveform.len();
        if n < 2 {
            for (slot, level) in out[..bins].iter_mut().zip(&self.levels) {
                *slot = *level as u8;
            }
            return;
        }

        let fft = self.planner.plan_fft_forward(n);
        self.input.clear();
        self.input.extend(
            waveform
                .iter()
                .map(|&s| (s as f32 - WAVEFORM_MIDPOINT as f32) / WAVEFORM_MIDPOINT as f32),
        );
        self.spectrum
            .resize(n / 2 + 1, Complex::new(0.0, 0.0));

        if let Err(e) = fft.process(&mut self.input, &mut self.spectrum) {
            log::warn!("FFT failed on {} samples: {}", n, e);
            return;
        }

        // Skip DC, group the remaining magnitudes
        let usable = self.spectrum.len() - 1;
        let scale = 2.0 / n as f32;
        for band in 0..bins {
            let start = 1 + band * usable / bins;
            let end = (1 + (band + 1) * usable / bins).clamp(start + 1, usable + 1);
            let peak = self.spectrum[start..end]
                .iter()
                .map(|c| c.norm() * scale)
                .fold(0.0f32, f32::max);

            let level = peak.sqrt().min(1.0) * 255.0;
            let held = &mut self.levels[band];
            if level > *held {
                *held = level;
            }
            out[band] = *held as u8;
        }
    }
}

impl Default for SpectrumProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl VisualizerProcessor for SpectrumProcessor {
    fn process(
        &mut self,
        waveform: &[u8],
        bins: BinCount,
        data: DataType,
        out: &mut [u8],
    ) -> usize {
        let count = bins.bins();
        let mut written = 0;

        if data.contains(DataType::FREQUENCY) {
            self.frequency_bins(waveform, count, &mut out[..count]);
            written += count;
        }

        if data.contains(DataType::WAVEFORM) {
            let slots = &mut out[written..written + count];
            if waveform.is_empty() {
                slots.fill(WAVEFORM_MIDPOINT);
            } else {
                for (i, slot) in slots.iter_mut().enumerate() {
                    *slot = waveform[i * waveform.len() / count];
                }
            }
            written += count;
        }

        written
    }

    fn skip(&mut self, _waveform: &[u8]) {
        self.decay();
    }
}
