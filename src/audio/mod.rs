//! Audio capture, monitoring and analysis module

mod capture;
mod fft;
mod gain;
mod monitor;
mod queue;
mod sources;

pub use capture::{apply_gain_and_clip, BlockProcessor, CaptureEngine, CaptureError, EngineEvent};
pub use fft::{SpectrumAnalyzer, SpectrumFrame, SpectrumHandle, SPECTRUM_BANDS};
pub use gain::{control_text, db_text, gain, gain_for_control, CONTROL_MAX, CONTROL_UNITY};
pub use monitor::MonitorPlayer;
pub use queue::BlockQueue;
pub use sources::{
    find_best_output, host_api_rank, DeviceCapability, DeviceCatalog, DeviceDescriptor,
    OutputRoute, SourceError,
};

use cpal::{BufferSize, SampleRate, StreamConfig};
use std::time::Duration;

/// Stream sample rate in Hz (input, transmission output and monitor)
pub const SAMPLE_RATE: u32 = 48_000;

/// Mono everywhere
pub const CHANNELS: u16 = 1;

/// Frames per real-time callback block (~5.3 ms at 48 kHz)
pub const BLOCK_FRAMES: usize = 256;

/// Capacity of the monitor and spectrum block queues
pub const QUEUE_CAPACITY: usize = 16;

/// Refresh cadence of the spectrum analyzer (~30 Hz)
pub const SPECTRUM_REFRESH_INTERVAL: Duration = Duration::from_millis(33);

/// One block of mono samples as produced by the capture callback.
///
/// Stored inline so publishing a copy to a queue never touches the heap.
#[derive(Debug, Clone, Copy)]
pub struct AudioBlock {
    samples: [f32; BLOCK_FRAMES],
    len: usize,
}

impl AudioBlock {
    /// Copy up to `BLOCK_FRAMES` samples into a new block.
    pub fn from_slice(data: &[f32]) -> Self {
        let len = data.len().min(BLOCK_FRAMES);
        let mut samples = [0.0; BLOCK_FRAMES];
        samples[..len].copy_from_slice(&data[..len]);
        Self { samples, len }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.samples[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Stream configuration shared by every stream the crate opens.
///
/// `buffer_frames` of `None` leaves buffer sizing to the host.
pub fn stream_config(buffer_frames: Option<u32>) -> StreamConfig {
    StreamConfig {
        channels: CHANNELS,
        sample_rate: SampleRate(SAMPLE_RATE),
        buffer_size: match buffer_frames {
            Some(frames) => BufferSize::Fixed(frames),
            None => BufferSize::Default,
        },
    }
}
