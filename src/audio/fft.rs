//! Spectrum analysis for the visualizer: log-spaced bands with peak-hold

use super::BlockQueue;
use parking_lot::Mutex;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Samples kept for each transform
pub const SPECTRUM_BUFFER_LEN: usize = 1024;

/// Number of displayed bands
pub const SPECTRUM_BANDS: usize = 40;

/// Loudest band is scaled to this after self-normalization
const NORMALIZE_HEADROOM: f32 = 0.9;

/// Floor for the normalization divisor so silence stays at zero
const PEAK_GUARD: f32 = 1e-6;

/// RMS to overall level factor
const RMS_SCALE: f32 = 8.0;

/// Blend toward a rising value per tick
const ATTACK: f32 = 0.6;

/// Blend toward a falling value per tick
const RELEASE: f32 = 0.15;

/// Ticks a peak is held before it starts to fall (~0.5 s at 30 Hz)
const PEAK_HOLD_TICKS: u32 = 15;

/// Linear peak fall per tick once the hold expires
const PEAK_DECAY: f32 = 0.02;

/// One visualizer frame: smoothed magnitudes and peak-hold markers, all in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumFrame {
    pub bands: [f32; SPECTRUM_BANDS],
    pub peaks: [f32; SPECTRUM_BANDS],
}

impl Default for SpectrumFrame {
    fn default() -> Self {
        Self {
            bands: [0.0; SPECTRUM_BANDS],
            peaks: [0.0; SPECTRUM_BANDS],
        }
    }
}

/// Read side of the analyzer, cheap to clone and safe to poll from any thread
#[derive(Clone, Default)]
pub struct SpectrumHandle {
    latest: Arc<Mutex<SpectrumFrame>>,
}

impl SpectrumHandle {
    /// Latest frame; all zeros before the first tick.
    pub fn poll_latest_frame(&self) -> SpectrumFrame {
        *self.latest.lock()
    }
}

/// Circular sample buffer holding the most recent samples
pub struct RollingBuffer {
    samples: Vec<f32>,
    write_pos: usize,
    capacity: usize,
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            write_pos: 0,
            capacity,
        }
    }

    /// Append samples; only the newest `capacity` are kept.
    pub fn push_samples(&mut self, data: &[f32]) {
        let data = if data.len() >= self.capacity {
            // Incoming data alone fills the buffer: replace outright
            self.write_pos = 0;
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        for &sample in data {
            self.samples[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }
    }

    /// Copy the buffer into `out`, oldest first, newest at the end.
    pub fn copy_ordered(&self, out: &mut [f32]) {
        let (older, newer) = self.samples.split_at(self.write_pos);
        out[..newer.len()].copy_from_slice(newer);
        out[newer.len()..self.capacity].copy_from_slice(older);
    }
}

/// Log-spaced `[start, end)` bin ranges clamped to `bins`. Bin 0 (DC) is
/// skipped. Each band starts where the previous one ended and is at least
/// one bin wide, so low bands never share a bin.
fn band_ranges(bins: usize, bands: usize) -> Vec<(usize, usize)> {
    let last = bins.max(2) - 1;
    let edge = |i: usize| -> usize {
        let exponent = i as f32 / bands as f32;
        ((bins as f32).powf(exponent).round() as usize).clamp(1, last + 1)
    };

    let mut ranges = Vec::with_capacity(bands);
    let mut prev_end = 1;
    for i in 0..bands {
        let start = edge(i).max(prev_end).min(last);
        let end = edge(i + 1).max(start + 1).min(last + 1);
        ranges.push((start, end));
        prev_end = end;
    }
    ranges
}

/// Spectrum analyzer for the visualizer.
///
/// Each `tick` drains the spectrum queue, slides the samples into the
/// rolling buffer and publishes a new frame.
pub struct SpectrumAnalyzer {
    queue: BlockQueue,
    buffer: RollingBuffer,

    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    band_ranges: Vec<(usize, usize)>,

    // Scratch space reused across ticks
    incoming: Vec<f32>,
    ordered: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,

    smoothed: [f32; SPECTRUM_BANDS],
    peaks: [f32; SPECTRUM_BANDS],
    hold: [u32; SPECTRUM_BANDS],

    latest: SpectrumHandle,
}

impl SpectrumAnalyzer {
    pub fn new(queue: BlockQueue) -> Self {
        let size = SPECTRUM_BUFFER_LEN;

        // Hann window
        let window: Vec<f32> = (0..size)
            .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos()))
            .collect();

        // Real input: bins 0..=N/2 carry all the information
        let bins = size / 2 + 1;

        Self {
            queue,
            buffer: RollingBuffer::new(size),
            fft: FftPlanner::new().plan_fft_forward(size),
            window,
            band_ranges: band_ranges(bins, SPECTRUM_BANDS),
            incoming: Vec::with_capacity(size * 2),
            ordered: vec![0.0; size],
            spectrum: vec![Complex::new(0.0, 0.0); size],
            magnitudes: vec![0.0; bins],
            smoothed: [0.0; SPECTRUM_BANDS],
            peaks: [0.0; SPECTRUM_BANDS],
            hold: [0; SPECTRUM_BANDS],
            latest: SpectrumHandle::default(),
        }
    }

    /// Handle for polling frames from another thread.
    pub fn handle(&self) -> SpectrumHandle {
        self.latest.clone()
    }

    /// Run one refresh: drain, transform, band, smooth, publish.
    pub fn tick(&mut self) -> SpectrumFrame {
        self.incoming.clear();
        for block in self.queue.drain() {
            self.incoming.extend_from_slice(block.as_slice());
        }
        if !self.incoming.is_empty() {
            self.buffer.push_samples(&self.incoming);
        }

        let instant = self.instant_levels();
        let frame = self.apply_dynamics(&instant);
        *self.latest.latest.lock() = frame;
        frame
    }

    /// Normalized per-band levels of the current buffer, before smoothing.
    fn instant_levels(&mut self) -> [f32; SPECTRUM_BANDS] {
        self.buffer.copy_ordered(&mut self.ordered);

        let rms = (self.ordered.iter().map(|s| s * s).sum::<f32>() / self.ordered.len() as f32).sqrt();

        for ((slot, &sample), &w) in self.spectrum.iter_mut().zip(&self.ordered).zip(&self.window) {
            *slot = Complex::new(sample * w, 0.0);
        }
        self.fft.process(&mut self.spectrum);

        for (mag, c) in self.magnitudes.iter_mut().zip(&self.spectrum) {
            *mag = c.norm();
        }

        let mut levels = [0.0f32; SPECTRUM_BANDS];
        for (level, &(start, end)) in levels.iter_mut().zip(&self.band_ranges) {
            let end = end.min(self.magnitudes.len());
            if start < end {
                let sum: f32 = self.magnitudes[start..end].iter().sum();
                *level = sum / (end - start) as f32;
            }
        }

        // Self-normalize to the loudest band, then scale by overall energy
        let peak = levels.iter().cloned().fold(0.0f32, f32::max);
        let scale = NORMALIZE_HEADROOM / peak.max(PEAK_GUARD);
        let energy = (rms * RMS_SCALE).min(1.0);

        for level in levels.iter_mut() {
            let value = *level * scale * energy;
            *level = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
        }
        levels
    }

    /// Attack/release smoothing and peak-hold.
    fn apply_dynamics(&mut self, instant: &[f32; SPECTRUM_BANDS]) -> SpectrumFrame {
        for i in 0..SPECTRUM_BANDS {
            let target = instant[i];
            let current = self.smoothed[i];
            let rate = if target > current { ATTACK } else { RELEASE };
            self.smoothed[i] = (current + (target - current) * rate).clamp(0.0, 1.0);

            if target >= self.peaks[i] {
                self.peaks[i] = target;
                self.hold[i] = PEAK_HOLD_TICKS;
            } else if self.hold[i] > 0 {
                self.hold[i] -= 1;
            } else {
                self.peaks[i] -= PEAK_DECAY;
            }
            self.peaks[i] = self.peaks[i].max(self.smoothed[i]).clamp(0.0, 1.0);
        }

        SpectrumFrame {
            bands: self.smoothed,
            peaks: self.peaks,
        }
    }
}
