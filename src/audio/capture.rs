//! Capture engine: real-time gain stage feeding transmission, monitor and spectrum

use super::sources::{default_output_of, locate_device, DeviceCatalog, DeviceDescriptor, OutputRoute};
use super::{stream_config, AudioBlock, BlockQueue, BLOCK_FRAMES};
use crate::state::SharedControls;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::Stream;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Samples buffered between the input and the transmission output callback
const TRANSMIT_FIFO_SAMPLES: usize = BLOCK_FRAMES * 8;

/// Capacity of the engine event channel
const EVENT_CAPACITY: usize = 8;

/// Audio capture errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to open audio stream: {0}")]
    StreamOpenFailure(String),

    #[error("Audio stream fault: {0}")]
    RuntimeStreamFault(String),

    #[error("Thread error: {0}")]
    ThreadError(String),
}

/// Notifications from the engine to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// `start` failed; the engine stayed stopped
    StreamOpenFailed(String),

    /// The running stream faulted and was torn down
    StreamFault(String),

    /// The engine stopped on request
    Stopped,
}

/// Commands sent to the engine thread
#[derive(Debug)]
enum EngineCommand {
    Stop,
}

/// Multiply `input` by `gain` and clip each sample to `[-1, 1]`.
///
/// `output` must be at least as long as `input`.
pub fn apply_gain_and_clip(input: &[f32], gain: f32, output: &mut [f32]) {
    for (out, &sample) in output.iter_mut().zip(input) {
        *out = (sample * gain).clamp(-1.0, 1.0);
    }
}

/// Per-callback work of the capture stream.
///
/// Owns a pre-allocated scratch block; `process` does not allocate,
/// lock or block.
pub struct BlockProcessor {
    controls: Arc<SharedControls>,
    transmit: HeapProducer<f32>,
    monitor: BlockQueue,
    spectrum: BlockQueue,
    scratch: [f32; BLOCK_FRAMES],
}

impl BlockProcessor {
    pub fn new(
        controls: Arc<SharedControls>,
        transmit: HeapProducer<f32>,
        monitor: BlockQueue,
        spectrum: BlockQueue,
    ) -> Self {
        Self {
            controls,
            transmit,
            monitor,
            spectrum,
            scratch: [0.0; BLOCK_FRAMES],
        }
    }

    /// Gain, clip and publish one callback's worth of mono samples.
    pub fn process(&mut self, data: &[f32]) {
        let gain = self.controls.gain();

        for chunk in data.chunks(BLOCK_FRAMES) {
            let boosted = &mut self.scratch[..chunk.len()];
            apply_gain_and_clip(chunk, gain, boosted);

            // Full fifo: output side is behind, drop the excess rather than wait
            self.transmit.push_slice(boosted);

            let block = AudioBlock::from_slice(boosted);
            self.monitor.try_publish(block);
            self.spectrum.try_publish(block);
        }
    }
}

/// Owner of the live capture/transmission streams.
///
/// cpal streams are not `Send`, so they live on a dedicated thread; this
/// handle talks to it over a command channel.
pub struct CaptureEngine {
    controls: Arc<SharedControls>,
    monitor_queue: BlockQueue,
    spectrum_queue: BlockQueue,

    command_tx: Option<Sender<EngineCommand>>,
    thread_handle: Option<JoinHandle<()>>,

    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
}

impl CaptureEngine {
    pub fn new(controls: Arc<SharedControls>, monitor_queue: BlockQueue, spectrum_queue: BlockQueue) -> Self {
        let (events_tx, events_rx) = bounded(EVENT_CAPACITY);
        Self {
            controls,
            monitor_queue,
            spectrum_queue,
            command_tx: None,
            thread_handle: None,
            events_tx,
            events_rx,
        }
    }

    /// Engine events (open failures, runtime faults, stops).
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.events_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.controls.capture_running()
    }

    /// Resolve the devices by name and start streaming.
    ///
    /// `output_name` of `None` routes to the input host's default output.
    /// On failure one `StreamOpenFailed` event is emitted and the engine
    /// stays stopped.
    pub fn start(&mut self, input_name: &str, output_name: Option<&str>) -> Result<(), CaptureError> {
        if self.is_running() {
            return Ok(());
        }
        // A previous run may have ended on a fault; reap its thread.
        self.join_thread();

        let result = DeviceCatalog::enumerate()
            .map_err(|e| CaptureError::StreamOpenFailure(e.to_string()))
            .and_then(|catalog| resolve_route(&catalog, input_name, output_name))
            .and_then(|(input, route)| self.spawn(input, route));

        if let Err(ref e) = result {
            log::error!("Capture start failed: {}", e);
            let _ = self.events_tx.try_send(EngineEvent::StreamOpenFailed(e.to_string()));
        }
        result
    }

    fn spawn(&mut self, input: DeviceDescriptor, route: OutputRoute) -> Result<(), CaptureError> {
        let (command_tx, command_rx) = bounded(1);
        let (ready_tx, ready_rx) = bounded(1);
        let (transmit_tx, transmit_rx) = HeapRb::<f32>::new(TRANSMIT_FIFO_SAMPLES).split();

        let processor = BlockProcessor::new(
            self.controls.clone(),
            transmit_tx,
            self.monitor_queue.clone(),
            self.spectrum_queue.clone(),
        );
        let controls = self.controls.clone();
        let events_tx = self.events_tx.clone();

        let handle = thread::Builder::new()
            .name("capture-engine".to_string())
            .spawn(move || {
                run_engine_thread(
                    input, route, processor, transmit_rx, command_rx, ready_tx, controls, events_tx,
                )
            })
            .map_err(|e| CaptureError::ThreadError(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(CaptureError::ThreadError("capture thread exited".to_string())));

        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        self.command_tx = Some(command_tx);
        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop streaming. Blocks until both streams are closed; no callback
    /// runs after this returns.
    pub fn stop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(EngineCommand::Stop);
        }
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Turn names into a concrete input descriptor and output route.
fn resolve_route(
    catalog: &DeviceCatalog,
    input_name: &str,
    output_name: Option<&str>,
) -> Result<(DeviceDescriptor, OutputRoute), CaptureError> {
    let input = catalog
        .resolve_input_index(input_name)
        .and_then(|index| catalog.descriptor(index))
        .cloned()
        .ok_or_else(|| CaptureError::DeviceUnavailable(input_name.to_string()))?;

    let route = catalog.resolve_output_for(input.index, output_name);
    match (&route, output_name) {
        (OutputRoute::Device(d), Some(wanted)) if d.name != wanted => {
            log::warn!(
                "Output '{}' not available on {}; using '{}'",
                wanted,
                input.host_api,
                d.name
            );
        }
        (OutputRoute::SystemDefault, Some(wanted)) => {
            log::warn!(
                "No output on {} pairs with '{}'; using system default instead of '{}'",
                input.host_api,
                input.name,
                wanted
            );
        }
        _ => {}
    }

    Ok((input, route))
}

/// Open both streams, then wait for a stop command or a stream fault.
#[allow(clippy::too_many_arguments)]
fn run_engine_thread(
    input: DeviceDescriptor,
    route: OutputRoute,
    processor: BlockProcessor,
    transmit_rx: HeapConsumer<f32>,
    command_rx: Receiver<EngineCommand>,
    ready_tx: Sender<Result<(), CaptureError>>,
    controls: Arc<SharedControls>,
    events_tx: Sender<EngineEvent>,
) {
    let (fault_tx, fault_rx) = bounded::<String>(4);

    let streams = match open_streams(&input, &route, processor, transmit_rx, fault_tx) {
        Ok(streams) => streams,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    controls.set_capture_running(true);
    log::info!(
        "Capture started: '{}' -> {} ({})",
        input.name,
        match &route {
            OutputRoute::Device(d) => d.name.as_str(),
            OutputRoute::SystemDefault => "system default",
        },
        input.host_api
    );
    let _ = ready_tx.send(Ok(()));

    wait_for_shutdown(streams, &command_rx, &fault_rx, &controls, &events_tx);
}

/// Block until a stop command or the first stream fault, then tear down.
///
/// Either way the engine ends up stopped and exactly one event is sent;
/// a fault is never retried.
fn wait_for_shutdown<S>(
    streams: S,
    command_rx: &Receiver<EngineCommand>,
    fault_rx: &Receiver<String>,
    controls: &SharedControls,
    events_tx: &Sender<EngineEvent>,
) -> EngineEvent {
    let event = select! {
        recv(command_rx) -> _ => EngineEvent::Stopped,
        recv(fault_rx) -> fault => {
            let message = fault.unwrap_or_else(|_| "stream closed".to_string());
            log::error!("{}", CaptureError::RuntimeStreamFault(message.clone()));
            EngineEvent::StreamFault(message)
        }
    };

    // Dropping the streams blocks until the host has closed them.
    drop(streams);
    controls.set_capture_running(false);
    log::info!("Capture stopped");
    let _ = events_tx.try_send(event.clone());
    event
}

fn open_failure(e: impl std::fmt::Display) -> CaptureError {
    CaptureError::StreamOpenFailure(e.to_string())
}

/// Build and start the input and transmission output streams.
fn open_streams(
    input: &DeviceDescriptor,
    route: &OutputRoute,
    mut processor: BlockProcessor,
    mut transmit_rx: HeapConsumer<f32>,
    fault_tx: Sender<String>,
) -> Result<(Stream, Stream), CaptureError> {
    let (host_id, input_device) = locate_device(input)?;
    let output_device = match route {
        OutputRoute::Device(descriptor) => locate_device(descriptor)?.1,
        OutputRoute::SystemDefault => default_output_of(host_id)?,
    };

    let config = stream_config(Some(BLOCK_FRAMES as u32));

    let output_fault = fault_tx.clone();
    let output_stream = output_device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                // Underrun plays silence
                let filled = transmit_rx.pop_slice(data);
                data[filled..].fill(0.0);
            },
            move |err| {
                let _ = output_fault.try_send(format!("output: {}", err));
            },
            None,
        )
        .map_err(open_failure)?;

    let input_stream = input_device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| processor.process(data),
            move |err| {
                let _ = fault_tx.try_send(format!("input: {}", err));
            },
            None,
        )
        .map_err(open_failure)?;

    output_stream.play().map_err(open_failure)?;
    input_stream.play().map_err(open_failure)?;

    Ok((input_stream, output_stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{gain_for_control, DeviceCapability, QUEUE_CAPACITY};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn processor_with(control: f32) -> (BlockProcessor, HeapConsumer<f32>, BlockQueue, BlockQueue) {
        let controls = Arc::new(SharedControls::new(control));
        let (tx, rx) = HeapRb::<f32>::new(TRANSMIT_FIFO_SAMPLES).split();
        let monitor = BlockQueue::new(QUEUE_CAPACITY);
        let spectrum = BlockQueue::new(QUEUE_CAPACITY);
        let processor = BlockProcessor::new(controls, tx, monitor.clone(), spectrum.clone());
        (processor, rx, monitor, spectrum)
    }

    fn drain_fifo(fifo: &mut HeapConsumer<f32>) -> Vec<f32> {
        let mut out = vec![0.0; fifo.len()];
        let n = fifo.pop_slice(&mut out);
        out.truncate(n);
        out
    }

    /// Stands in for the stream pair; records when it is dropped.
    struct StreamGuard(Arc<AtomicBool>);

    impl Drop for StreamGuard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn clip_holds_output_in_range_for_extreme_gain() {
        let input = [1.0f32; BLOCK_FRAMES];
        let mut output = [0.0f32; BLOCK_FRAMES];
        apply_gain_and_clip(&input, 800.0, &mut output);
        assert!(output.iter().all(|&s| s == 1.0));

        let input = [-0.3f32; 8];
        apply_gain_and_clip(&input, 800.0, &mut output);
        assert!(output[..8].iter().all(|&s| s == -1.0));
    }

    #[test]
    fn unity_control_passes_signal_through() {
        let (mut processor, mut transmit, monitor, spectrum) = processor_with(100.0);
        processor.process(&[0.5f32; BLOCK_FRAMES]);

        let sent = drain_fifo(&mut transmit);
        assert_eq!(sent.len(), BLOCK_FRAMES);
        assert!(sent.iter().all(|&s| s == 0.5));

        let monitored = monitor.try_pop().map(|b| b.as_slice().to_vec());
        assert_eq!(monitored, Some(vec![0.5f32; BLOCK_FRAMES]));
        assert_eq!(spectrum.len(), 1);
    }

    #[test]
    fn max_control_clips_boosted_signal() {
        assert_eq!(gain_for_control(250.0), 6.0);
        let (mut processor, mut transmit, _monitor, spectrum) = processor_with(250.0);
        processor.process(&[0.5f32; BLOCK_FRAMES]);

        assert!(drain_fifo(&mut transmit).iter().all(|&s| s == 1.0));
        let analysed = spectrum.try_pop().map(|b| b.as_slice().to_vec());
        assert_eq!(analysed, Some(vec![1.0f32; BLOCK_FRAMES]));
    }

    #[test]
    fn oversized_callback_is_split_into_blocks() {
        let (mut processor, _transmit, monitor, _spectrum) = processor_with(100.0);
        processor.process(&[0.1f32; BLOCK_FRAMES * 2 + 10]);

        let lengths: Vec<usize> = monitor.drain().map(|b| b.len()).collect();
        assert_eq!(lengths, vec![BLOCK_FRAMES, BLOCK_FRAMES, 10]);
    }

    #[test]
    fn full_queues_never_block_the_processor() {
        let (mut processor, _transmit, monitor, spectrum) = processor_with(100.0);
        for _ in 0..(QUEUE_CAPACITY * 4) {
            processor.process(&[0.2f32; BLOCK_FRAMES]);
        }
        assert_eq!(monitor.len(), QUEUE_CAPACITY);
        assert_eq!(spectrum.len(), QUEUE_CAPACITY);
        assert_eq!(monitor.dropped(), (QUEUE_CAPACITY * 3) as u64);
    }

    #[test]
    fn gain_change_is_seen_on_next_block() {
        let controls = Arc::new(SharedControls::new(100.0));
        let (tx, mut rx) = HeapRb::<f32>::new(TRANSMIT_FIFO_SAMPLES).split();
        let mut processor =
            BlockProcessor::new(controls.clone(), tx, BlockQueue::new(4), BlockQueue::new(4));

        processor.process(&[0.1f32; 4]);
        controls.set_control(50.0);
        processor.process(&[0.1f32; 4]);

        let sent = drain_fifo(&mut rx);
        assert_eq!(&sent[..4], &[0.1f32; 4]);
        assert!(sent[4..].iter().all(|&s| (s - 0.05).abs() < 1e-6));
    }

    #[test]
    fn resolve_route_reports_missing_input() {
        let catalog = DeviceCatalog::from_descriptors(vec![DeviceDescriptor {
            name: "Speakers".to_string(),
            capability: DeviceCapability::OUTPUT,
            host_api: "WASAPI".to_string(),
            index: 0,
        }]);
        assert_eq!(
            resolve_route(&catalog, "Mic", None).unwrap_err(),
            CaptureError::DeviceUnavailable("Mic".to_string())
        );
    }

    #[test]
    fn resolve_route_pairs_on_input_host_api() {
        let catalog = DeviceCatalog::from_descriptors(vec![
            DeviceDescriptor {
                name: "Mic".to_string(),
                capability: DeviceCapability::INPUT,
                host_api: "WASAPI".to_string(),
                index: 0,
            },
            DeviceDescriptor {
                name: "CABLE Input".to_string(),
                capability: DeviceCapability::OUTPUT,
                host_api: "MME".to_string(),
                index: 1,
            },
        ]);
        let (input, route) = resolve_route(&catalog, "Mic", Some("CABLE Input")).unwrap();
        assert_eq!(input.index, 0);
        assert_eq!(route, OutputRoute::SystemDefault);
    }

    #[test]
    fn full_transmit_fifo_drops_excess_samples() {
        let controls = Arc::new(SharedControls::new(100.0));
        let (tx, mut rx) = HeapRb::<f32>::new(BLOCK_FRAMES + 10).split();
        let mut processor =
            BlockProcessor::new(controls, tx, BlockQueue::new(4), BlockQueue::new(4));

        processor.process(&[0.2f32; BLOCK_FRAMES]);
        processor.process(&[0.4f32; BLOCK_FRAMES]);

        let sent = drain_fifo(&mut rx);
        assert_eq!(sent.len(), BLOCK_FRAMES + 10);
        assert!(sent[..BLOCK_FRAMES].iter().all(|&s| s == 0.2));
        assert!(sent[BLOCK_FRAMES..].iter().all(|&s| s == 0.4));
    }

    #[test]
    fn stream_fault_stops_engine_with_single_event() {
        let controls = SharedControls::default();
        controls.set_capture_running(true);
        let (_command_tx, command_rx) = bounded(1);
        let (fault_tx, fault_rx) = bounded(4);
        let (events_tx, events_rx) = bounded(EVENT_CAPACITY);
        let dropped = Arc::new(AtomicBool::new(false));

        fault_tx.send("input: device removed".to_string()).unwrap();
        fault_tx.send("output: device removed".to_string()).unwrap();

        let event = wait_for_shutdown(
            StreamGuard(dropped.clone()),
            &command_rx,
            &fault_rx,
            &controls,
            &events_tx,
        );

        let expected = EngineEvent::StreamFault("input: device removed".to_string());
        assert_eq!(event, expected);
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!controls.capture_running());
        assert_eq!(events_rx.try_recv(), Ok(expected));
        assert!(events_rx.try_recv().is_err());
    }

    #[test]
    fn stop_command_stops_engine_with_stopped_event() {
        let controls = SharedControls::default();
        controls.set_capture_running(true);
        let (command_tx, command_rx) = bounded(1);
        let (_fault_tx, fault_rx) = bounded::<String>(4);
        let (events_tx, events_rx) = bounded(EVENT_CAPACITY);
        let dropped = Arc::new(AtomicBool::new(false));

        command_tx.send(EngineCommand::Stop).unwrap();
        let event = wait_for_shutdown(
            StreamGuard(dropped.clone()),
            &command_rx,
            &fault_rx,
            &controls,
            &events_tx,
        );

        assert_eq!(event, EngineEvent::Stopped);
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!controls.capture_running());
        assert_eq!(events_rx.try_iter().collect::<Vec<_>>(), vec![EngineEvent::Stopped]);
    }
}
