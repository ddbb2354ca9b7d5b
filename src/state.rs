//! Shared control state and session status

use crate::audio::{control_text, db_text, gain_for_control, CONTROL_MAX};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// How long an error message stays visible
pub const ERROR_DISPLAY_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared between the control surface, the capture callback and the
/// consumer threads. Passed around as `Arc<SharedControls>`.
///
/// Every field is a single atomic word, so readers may see a stale value
/// but never a half-written one.
#[derive(Debug)]
pub struct SharedControls {
    /// Control value as f32 bits. Writer: control surface. Reader: UI.
    control_bits: AtomicU32,

    /// Linear gain as f32 bits. Writer: control surface. Reader: capture callback.
    gain_bits: AtomicU32,

    /// Writer: capture engine thread. Reader: orchestrator.
    capture_running: AtomicBool,

    /// Writer: `MonitorPlayer::enable`/`disable`. Reader: monitor thread.
    monitor_running: AtomicBool,
}

impl SharedControls {
    pub fn new(control: f32) -> Self {
        let controls = Self {
            control_bits: AtomicU32::new(0f32.to_bits()),
            gain_bits: AtomicU32::new(0f32.to_bits()),
            capture_running: AtomicBool::new(false),
            monitor_running: AtomicBool::new(false),
        };
        controls.set_control(control);
        controls
    }

    /// Set the gain control. Out-of-range values are clamped to `[0, 250]`.
    pub fn set_control(&self, value: f32) {
        let control = if value.is_finite() {
            value.clamp(0.0, CONTROL_MAX)
        } else {
            0.0
        };
        self.control_bits.store(control.to_bits(), Ordering::Relaxed);
        self.gain_bits
            .store(gain_for_control(control).to_bits(), Ordering::Relaxed);
    }

    pub fn control(&self) -> f32 {
        f32::from_bits(self.control_bits.load(Ordering::Relaxed))
    }

    /// Current linear multiplier. Lock-free; safe in the real-time callback.
    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    pub fn db_text(&self) -> String {
        db_text(self.gain())
    }

    pub fn control_text(&self) -> String {
        control_text(self.control())
    }

    pub fn capture_running(&self) -> bool {
        self.capture_running.load(Ordering::Acquire)
    }

    pub(crate) fn set_capture_running(&self, running: bool) {
        self.capture_running.store(running, Ordering::Release);
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor_running.load(Ordering::Acquire)
    }

    pub(crate) fn set_monitor_running(&self, running: bool) {
        self.monitor_running.store(running, Ordering::Release);
    }
}

impl Default for SharedControls {
    fn default() -> Self {
        Self::new(100.0)
    }
}

/// Transient message shown to the user, cleared after a timeout
#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub text: String,
    raised_at: Instant,
}

impl StatusMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            raised_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.raised_at) >= ERROR_DISPLAY_TIMEOUT
    }
}

/// Snapshot of the session for display
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub running: bool,
    pub monitoring: bool,
    pub control_text: String,
    pub db_text: String,
    pub error: Option<String>,
}

impl SessionStatus {
    pub fn capture(controls: &SharedControls, message: Option<&StatusMessage>) -> Self {
        Self {
            running: controls.capture_running(),
            monitoring: controls.monitor_running(),
            control_text: controls.control_text(),
            db_text: controls.db_text(),
            error: message.map(|m| m.text.clone()),
        }
    }

    /// Short label, "LIVE" or "IDLE"
    pub fn label(&self) -> &'static str {
        if self.running {
            "LIVE"
        } else {
            "IDLE"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_controls_are_unity_and_stopped() {
        let controls = SharedControls::default();

        assert_eq!(controls.gain(), 1.0);
        assert_eq!(controls.db_text(), "+0.0 dB");
        assert_eq!(controls.control_text(), "100");
        assert!(!controls.capture_running());
        assert!(!controls.monitor_running());
    }

    #[test]
    fn set_control_clamps_out_of_range_values() {
        let controls = SharedControls::new(100.0);

        controls.set_control(900.0);
        assert_eq!(controls.control(), 250.0);
        assert_eq!(controls.gain(), 6.0);

        controls.set_control(-5.0);
        assert_eq!(controls.gain(), 0.0);
        assert_eq!(controls.db_text(), "-inf dB");

        controls.set_control(f32::NAN);
        assert_eq!(controls.gain(), 0.0);
    }

    #[test]
    fn status_message_expires_after_timeout() {
        let message = StatusMessage::new("Failed to open audio stream");
        let now = Instant::now();

        assert!(!message.is_expired(now));
        assert!(message.is_expired(now + ERROR_DISPLAY_TIMEOUT));
    }

    #[test]
    fn session_status_reflects_controls() {
        let controls = SharedControls::new(250.0);
        controls.set_capture_running(true);
        let message = StatusMessage::new("boom");

        let status = SessionStatus::capture(&controls, Some(&message));
        assert!(status.running);
        assert!(!status.monitoring);
        assert_eq!(status.label(), "LIVE");
        assert_eq!(status.control_text, "250");
        assert_eq!(status.db_text, "+15.6 dB");
        assert_eq!(status.error.as_deref(), Some("boom"));
    }
}
