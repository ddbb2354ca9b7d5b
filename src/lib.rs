//! MicBoost Library
//!
//! Live microphone gain stage: captures an input device, applies gain with
//! hard clipping, and feeds a transmission output, an optional monitor
//! output and a spectrum visualizer.

pub mod audio;
mod cli;
pub mod settings;
pub mod state;

use audio::{
    find_best_output, BlockQueue, CaptureEngine, CaptureError, DeviceCatalog, EngineEvent,
    MonitorPlayer, SpectrumAnalyzer, SpectrumFrame, SpectrumHandle, QUEUE_CAPACITY,
    SPECTRUM_REFRESH_INTERVAL,
};
use clap::Parser;
use crossbeam_channel::Receiver;
use settings::Settings;
use state::{SessionStatus, SharedControls, StatusMessage};

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Event handling and message expiry cadence
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(250);

/// Bar glyphs for the text meter, lowest to highest
const METER_GLYPHS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// One capture session: the engine, its consumers and the shared controls
pub struct Session {
    controls: Arc<SharedControls>,
    engine: CaptureEngine,
    monitor: MonitorPlayer,
    analyzer: SpectrumAnalyzer,
    events: Receiver<EngineEvent>,
    message: Option<StatusMessage>,
    monitor_queue: BlockQueue,
    spectrum_queue: BlockQueue,
}

impl Session {
    /// Wire up queues and components. Nothing is started yet.
    pub fn new(initial_control: f32) -> Self {
        let controls = Arc::new(SharedControls::new(initial_control));
        let monitor_queue = BlockQueue::new(QUEUE_CAPACITY);
        let spectrum_queue = BlockQueue::new(QUEUE_CAPACITY);

        let engine = CaptureEngine::new(controls.clone(), monitor_queue.clone(), spectrum_queue.clone());
        let events = engine.events();

        Self {
            monitor: MonitorPlayer::new(controls.clone(), monitor_queue.clone()),
            analyzer: SpectrumAnalyzer::new(spectrum_queue.clone()),
            controls,
            engine,
            events,
            message: None,
            monitor_queue,
            spectrum_queue,
        }
    }

    pub fn controls(&self) -> &Arc<SharedControls> {
        &self.controls
    }

    pub fn set_control(&self, value: f32) {
        self.controls.set_control(value);
    }

    pub fn start(&mut self, input_name: &str, output_name: Option<&str>) -> Result<(), CaptureError> {
        self.engine.start(input_name, output_name)
    }

    pub fn stop(&mut self) {
        self.engine.stop();
    }

    pub fn enable_monitor(&mut self, device_name: Option<&str>) -> Result<(), CaptureError> {
        self.monitor.enable(device_name).inspect_err(|e| {
            self.message = Some(StatusMessage::new(e.to_string()));
        })
    }

    pub fn disable_monitor(&mut self) {
        self.monitor.disable();
    }

    /// Run one spectrum refresh.
    pub fn refresh_spectrum(&mut self) -> SpectrumFrame {
        self.analyzer.tick()
    }

    pub fn spectrum(&self) -> SpectrumHandle {
        self.analyzer.handle()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::capture(&self.controls, self.message.as_ref())
    }

    /// Handle engine events and expire old messages.
    ///
    /// Returns false once capture has stopped on its own.
    pub fn housekeeping(&mut self, now: Instant) -> bool {
        let mut ended = false;
        for event in self.events.try_iter() {
            match event {
                EngineEvent::StreamOpenFailed(message) | EngineEvent::StreamFault(message) => {
                    self.message = Some(StatusMessage::new(message));
                    ended = true;
                }
                EngineEvent::Stopped => ended = true,
            }
        }

        if self.message.as_ref().is_some_and(|m| m.is_expired(now)) {
            self.message = None;
        }

        !ended || self.engine.is_running()
    }

    /// Tear everything down: monitor first, then the capture streams.
    pub fn shutdown(&mut self) {
        self.monitor.disable();
        self.engine.stop();
        log::debug!(
            "Blocks dropped: monitor {}, spectrum {}",
            self.monitor_queue.dropped(),
            self.spectrum_queue.dropped()
        );
    }
}

/// Render one line of the text spectrum meter.
pub fn render_meter(frame: &SpectrumFrame, status: &SessionStatus) -> String {
    let top = METER_GLYPHS.len() - 1;
    let bars: String = frame
        .bands
        .iter()
        .zip(&frame.peaks)
        .map(|(&band, &peak)| {
            let level = (band.clamp(0.0, 1.0) * top as f32).round() as usize;
            let peak_level = (peak.clamp(0.0, 1.0) * top as f32).round() as usize;
            if peak_level > level && peak_level == top {
                '▔'
            } else {
                METER_GLYPHS[level]
            }
        })
        .collect();

    format!(
        "{} gain {} ({}) |{}|{}",
        status.label(),
        status.control_text,
        status.db_text,
        bars,
        status.error.as_deref().map(|e| format!(" ! {}", e)).unwrap_or_default()
    )
}

fn print_devices() -> Result<(), Box<dyn std::error::Error>> {
    let catalog = DeviceCatalog::enumerate()?;
    let (inputs, outputs) = catalog.list_devices();

    println!("Inputs:");
    for name in &inputs {
        println!("  {}", name);
    }
    println!("Outputs:");
    for name in &outputs {
        println!("  {}", name);
    }
    Ok(())
}

/// Command-line values override persisted ones for this session.
fn apply_overrides(settings: &mut Settings, args: &cli::Args) {
    if let Some(input) = &args.input {
        settings.input_device = Some(input.clone());
    }
    if let Some(output) = &args.output {
        settings.output_device = Some(output.clone());
    }
    if let Some(monitor) = args.monitor_device() {
        settings.monitor_enabled = true;
        settings.monitor_device = monitor;
    }
    if let Some(gain) = args.gain {
        settings.gain_control = gain as f32;
    }
}

async fn run_session(session: &mut Session, meter: bool) {
    let mut refresh = tokio::time::interval(SPECTRUM_REFRESH_INTERVAL);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    log::info!("Session running, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                log::info!("Interrupted");
                break;
            }
            _ = refresh.tick() => {
                let frame = session.refresh_spectrum();
                if meter {
                    let mut stdout = std::io::stdout();
                    let _ = write!(stdout, "\r{}", render_meter(&frame, &session.status()));
                    let _ = stdout.flush();
                }
            }
            _ = housekeeping.tick() => {
                if !session.housekeeping(Instant::now()) {
                    if let Some(error) = session.status().error {
                        log::error!("Capture ended: {}", error);
                    }
                    break;
                }
            }
        }
    }

    if meter {
        println!();
    }
}

/// Run the command-line application
pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = cli::Args::parse();
    cli::init_logging(&args);

    if args.list_devices {
        return print_devices();
    }

    let settings_path = match &args.config {
        Some(path) => path.clone(),
        None => settings::default_path()?,
    };
    let mut settings = settings::load_settings(&settings_path);
    apply_overrides(&mut settings, &args);

    let catalog = DeviceCatalog::enumerate()?;
    let (inputs, outputs) = catalog.list_devices();

    let input = settings
        .input_device
        .clone()
        .or_else(|| inputs.first().cloned())
        .ok_or("No input device available")?;
    let output = find_best_output(&outputs, settings.output_device.as_deref());

    let mut session = Session::new(settings.gain_control);
    log::info!(
        "Gain {} ({})",
        session.controls().control_text(),
        session.controls().db_text()
    );

    session.start(&input, output.as_deref())?;

    if settings.monitor_enabled {
        // Monitoring is secondary; keep transmitting if it fails.
        if let Err(e) = session.enable_monitor(settings.monitor_device.as_deref()) {
            log::warn!("Monitoring unavailable: {}", e);
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_session(&mut session, args.meter));

    session.shutdown();

    if !args.no_save {
        settings.input_device = Some(input);
        settings.output_device = output;
        settings.gain_control = session.controls().control();
        if let Err(e) = settings::save_settings(&settings_path, &settings) {
            log::warn!("Settings: {}", e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio::SPECTRUM_BANDS;

    #[test]
    fn new_session_is_idle_with_zeroed_spectrum() {
        let session = Session::new(100.0);
        let status = session.status();

        assert!(!status.running);
        assert!(!status.monitoring);
        assert_eq!(status.control_text, "100");
        assert!(status.error.is_none());
        assert_eq!(session.spectrum().poll_latest_frame(), SpectrumFrame::default());
    }

    #[test]
    fn housekeeping_keeps_idle_session_alive_without_events() {
        let mut session = Session::new(100.0);
        assert!(session.housekeeping(Instant::now()));
    }

    #[test]
    fn set_control_updates_status_text() {
        let session = Session::new(100.0);
        session.set_control(250.0);
        assert_eq!(session.status().db_text, "+15.6 dB");
    }

    #[test]
    fn meter_renders_one_glyph_per_band() {
        let mut frame = SpectrumFrame::default();
        frame.bands[0] = 1.0;
        frame.peaks[0] = 1.0;
        frame.peaks[1] = 1.0;
        let status = SessionStatus {
            running: true,
            control_text: "100".to_string(),
            db_text: "+0.0 dB".to_string(),
            ..Default::default()
        };

        let line = render_meter(&frame, &status);
        let bars: Vec<char> = line
            .split('|')
            .nth(1)
            .map(|b| b.chars().collect())
            .unwrap_or_default();

        assert!(line.starts_with("LIVE gain 100 (+0.0 dB)"));
        assert_eq!(bars.len(), SPECTRUM_BANDS);
        assert_eq!(bars[0], '█');
        assert_eq!(bars[1], '▔');
        assert_eq!(bars[2], ' ');
    }

    #[test]
    fn cli_overrides_replace_settings() {
        let mut settings = Settings::default();
        let args = cli::Args::parse_from(["mic-boost", "-i", "Mic", "-g", "150", "--monitor"]);

        apply_overrides(&mut settings, &args);
        assert_eq!(settings.input_device.as_deref(), Some("Mic"));
        assert_eq!(settings.gain_control, 150.0);
        assert!(settings.monitor_enabled);
        assert!(settings.monitor_device.is_none());
    }
}
