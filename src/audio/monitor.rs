//! Live monitoring: plays the processed signal on a second output device

use super::capture::CaptureError;
use super::sources::{locate_device, DeviceCatalog};
use super::{stream_config, BlockQueue, SAMPLE_RATE};
use crate::state::SharedControls;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream};
use crossbeam_channel::{bounded, Receiver, Sender};
use ringbuf::{HeapProducer, HeapRb};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Frames accumulated before a write to the playback stream
pub const MONITOR_BATCH_FRAMES: usize = 2048;

/// How long the consumer waits for the next block
const MONITOR_WAIT: Duration = Duration::from_millis(100);

/// Samples buffered ahead of the playback callback (~170 ms)
const PLAYBACK_FIFO_SAMPLES: usize = MONITOR_BATCH_FRAMES * 4;

/// Longest a single batch write may block on a stalled stream
const WRITE_TIMEOUT: Duration = Duration::from_millis(250);

/// Sleep between attempts while the playback fifo is full
const WRITE_RETRY: Duration = Duration::from_millis(5);

/// Monitoring playback. Consumes the monitor queue on its own thread.
pub struct MonitorPlayer {
    controls: Arc<SharedControls>,
    queue: BlockQueue,
    thread_handle: Option<JoinHandle<()>>,
}

impl MonitorPlayer {
    pub fn new(controls: Arc<SharedControls>, queue: BlockQueue) -> Self {
        Self {
            controls,
            queue,
            thread_handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.controls.monitor_running()
    }

    /// Start monitoring on the named output, or the system default for `None`.
    ///
    /// Stale audio queued while monitoring was off is discarded first.
    pub fn enable(&mut self, device_name: Option<&str>) -> Result<(), CaptureError> {
        if self.is_running() {
            self.disable();
        }
        // Wait for a previous consumer to finish its last wait.
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }

        let stale = self.queue.clear();
        log::debug!("Monitor queue reset, {} stale blocks discarded", stale);

        let (ready_tx, ready_rx) = bounded(1);
        let controls = self.controls.clone();
        let queue = self.queue.clone();
        let device_name = device_name.map(str::to_string);

        controls.set_monitor_running(true);
        let handle = thread::Builder::new()
            .name("monitor-playback".to_string())
            .spawn(move || run_monitor_thread(device_name, queue, controls, ready_tx))
            .map_err(|e| {
                self.controls.set_monitor_running(false);
                CaptureError::ThreadError(e.to_string())
            })?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(CaptureError::ThreadError("monitor thread exited".to_string())));
        if let Err(e) = ready {
            self.controls.set_monitor_running(false);
            let _ = handle.join();
            log::error!("Monitor start failed: {}", e);
            return Err(e);
        }

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop monitoring. The consumer exits after its current wait.
    pub fn disable(&mut self) {
        if self.controls.monitor_running() {
            log::info!("Monitoring disabled");
        }
        self.controls.set_monitor_running(false);
    }
}

impl Drop for MonitorPlayer {
    fn drop(&mut self) {
        self.disable();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Pull blocks until at least `MONITOR_BATCH_FRAMES` frames are gathered or
/// no block arrives within `wait`.
pub(crate) fn collect_batch(queue: &BlockQueue, wait: Duration, batch: &mut Vec<f32>) {
    batch.clear();
    while batch.len() < MONITOR_BATCH_FRAMES {
        match queue.pop_timeout(wait) {
            Some(block) => batch.extend_from_slice(block.as_slice()),
            None => break,
        }
    }
}

/// Push a batch into the playback fifo, waiting while the stream catches up.
///
/// Returns false if the stream stalled for `timeout` and the rest of the
/// batch was dropped.
pub(crate) fn write_batch(playback: &mut HeapProducer<f32>, batch: &[f32], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut remaining = batch;
    loop {
        let written = playback.push_slice(remaining);
        remaining = &remaining[written..];
        if remaining.is_empty() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(WRITE_RETRY);
    }
}

/// Feed the playback fifo until monitoring is disabled or the stream faults.
///
/// A fault clears the running flag and is returned.
pub(crate) fn pump_playback(
    queue: &BlockQueue,
    playback: &mut HeapProducer<f32>,
    faults: &Receiver<String>,
    controls: &SharedControls,
) -> Option<String> {
    let mut batch = Vec::with_capacity(MONITOR_BATCH_FRAMES * 2);
    while controls.monitor_running() {
        if let Ok(fault) = faults.try_recv() {
            controls.set_monitor_running(false);
            return Some(fault);
        }

        collect_batch(queue, MONITOR_WAIT, &mut batch);
        if batch.is_empty() {
            continue;
        }
        if !write_batch(playback, &batch, WRITE_TIMEOUT) {
            log::warn!("Monitor playback stalled, dropping audio");
        }
    }
    None
}

fn run_monitor_thread(
    device_name: Option<String>,
    queue: BlockQueue,
    controls: Arc<SharedControls>,
    ready_tx: Sender<Result<(), CaptureError>>,
) {
    let (fault_tx, fault_rx) = bounded::<String>(1);

    let (stream, mut playback) = match open_device(device_name.as_deref())
        .and_then(|d| open_playback(&d, fault_tx))
    {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    log::info!(
        "Monitoring on {} ({} Hz)",
        device_name.as_deref().unwrap_or("system default"),
        SAMPLE_RATE
    );
    let _ = ready_tx.send(Ok(()));

    if let Some(fault) = pump_playback(&queue, &mut playback, &fault_rx, &controls) {
        log::error!("Monitor stream error: {}", fault);
    }

    drop(stream);
    log::debug!("Monitor thread stopped");
}

fn open_device(device_name: Option<&str>) -> Result<Device, CaptureError> {
    match device_name {
        Some(name) => {
            let catalog = DeviceCatalog::enumerate()
                .map_err(|e| CaptureError::StreamOpenFailure(e.to_string()))?;
            let descriptor = catalog
                .resolve_output_index(name)
                .and_then(|index| catalog.descriptor(index))
                .ok_or_else(|| CaptureError::DeviceUnavailable(name.to_string()))?;
            Ok(locate_device(descriptor)?.1)
        }
        None => cpal::default_host()
            .default_output_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("system default output".to_string())),
    }
}

/// Open the playback stream in high-latency mode, falling back to the
/// host's default buffering if the large buffer is refused.
///
/// Returns the stream and the write side of its fifo. Stream errors are
/// forwarded to `fault_tx`.
fn open_playback(
    device: &Device,
    fault_tx: Sender<String>,
) -> Result<(Stream, HeapProducer<f32>), CaptureError> {
    let build = |buffer_frames: Option<u32>| {
        let (producer, mut consumer) = HeapRb::<f32>::new(PLAYBACK_FIFO_SAMPLES).split();
        let fault_tx = fault_tx.clone();
        device
            .build_output_stream(
                &stream_config(buffer_frames),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let filled = consumer.pop_slice(data);
                    data[filled..].fill(0.0);
                },
                move |err| {
                    let _ = fault_tx.try_send(err.to_string());
                },
                None,
            )
            .map(|stream| (stream, producer))
    };

    let (stream, producer) = build(Some(MONITOR_BATCH_FRAMES as u32))
        .or_else(|e| {
            log::debug!("High-latency monitor buffer refused ({}), using default", e);
            build(None)
        })
        .map_err(|e| CaptureError::StreamOpenFailure(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::StreamOpenFailure(e.to_string()))?;
    Ok((stream, producer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioBlock, BLOCK_FRAMES};

    #[test]
    fn collect_batch_stops_at_batch_size() {
        let queue = BlockQueue::new(16);
        for _ in 0..10 {
            queue.try_publish(AudioBlock::from_slice(&[0.3; BLOCK_FRAMES]));
        }

        let mut batch = Vec::new();
        collect_batch(&queue, Duration::from_millis(5), &mut batch);

        assert_eq!(batch.len(), MONITOR_BATCH_FRAMES);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn collect_batch_returns_partial_batch_when_queue_dries_up() {
        let queue = BlockQueue::new(16);
        queue.try_publish(AudioBlock::from_slice(&[0.3; BLOCK_FRAMES]));

        let mut batch = vec![9.0; 3];
        collect_batch(&queue, Duration::from_millis(5), &mut batch);
        assert_eq!(batch.len(), BLOCK_FRAMES);
        assert!(batch.iter().all(|&s| s == 0.3));

        collect_batch(&queue, Duration::from_millis(5), &mut batch);
        assert!(batch.is_empty());
    }

    #[test]
    fn write_batch_gives_up_on_stalled_stream() {
        let (mut tx, rx) = HeapRb::<f32>::new(4).split();
        let timeout = Duration::from_millis(20);
        assert!(write_batch(&mut tx, &[0.1, 0.2], timeout));
        assert!(!write_batch(&mut tx, &[0.1; 8], timeout));
        assert_eq!(rx.len(), 4);
    }

    #[test]
    fn write_batch_waits_for_playback_to_drain() {
        let (mut tx, mut rx) = HeapRb::<f32>::new(4).split();
        let reader = thread::spawn(move || {
            let mut out = [0.0f32; 4];
            let mut total = 0;
            while total < 8 {
                total += rx.pop_slice(&mut out);
                thread::sleep(Duration::from_millis(1));
            }
            total
        });

        assert!(write_batch(&mut tx, &[0.5; 8], Duration::from_secs(5)));
        assert_eq!(reader.join().unwrap(), 8);
    }

    #[test]
    fn stream_fault_ends_playback_and_clears_flag() {
        let controls = SharedControls::default();
        controls.set_monitor_running(true);
        let queue = BlockQueue::new(4);
        let (mut tx, _rx) = HeapRb::<f32>::new(PLAYBACK_FIFO_SAMPLES).split();
        let (fault_tx, fault_rx) = bounded(1);

        fault_tx.send("device unplugged".to_string()).unwrap();
        let fault = pump_playback(&queue, &mut tx, &fault_rx, &controls);

        assert_eq!(fault.as_deref(), Some("device unplugged"));
        assert!(!controls.monitor_running());
    }

    #[test]
    fn disabled_monitor_stops_pumping_without_fault() {
        let controls = SharedControls::default();
        let queue = BlockQueue::new(4);
        queue.try_publish(AudioBlock::from_slice(&[0.3; BLOCK_FRAMES]));
        let (mut tx, rx) = HeapRb::<f32>::new(PLAYBACK_FIFO_SAMPLES).split();
        let (_fault_tx, fault_rx) = bounded::<String>(1);

        assert_eq!(pump_playback(&queue, &mut tx, &fault_rx, &controls), None);
        assert_eq!(rx.len(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn disable_clears_running_flag() {
        let controls = Arc::new(SharedControls::default());
        let mut player = MonitorPlayer::new(controls.clone(), BlockQueue::new(4));

        controls.set_monitor_running(true);
        assert!(player.is_running());
        player.disable();
        assert!(!player.is_running());
    }
}
