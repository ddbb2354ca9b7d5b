//! Persisted session settings (device choices and gain)
//!
//! Stored as JSON under the platform config directory, e.g.
//! `~/.config/mic-boost/settings.json`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SETTINGS_DIR_NAME: &str = "mic-boost";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Settings persistence errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Settings IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Capture device name. `None` picks the first available input.
    pub input_device: Option<String>,

    /// Transmission output name. `None` picks the best available output.
    pub output_device: Option<String>,

    /// Monitor output name. `None` uses the system default output.
    pub monitor_device: Option<String>,

    /// Gain control in `[0, 250]`, 100 is unity.
    pub gain_control: f32,

    /// Whether monitoring starts with the session.
    pub monitor_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            monitor_device: None,
            gain_control: 100.0,
            monitor_enabled: false,
        }
    }
}

/// Default location of the settings file.
pub fn default_path() -> Result<PathBuf, SettingsError> {
    dirs::config_dir()
        .map(|dir| dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
        .ok_or(SettingsError::NoConfigDir)
}

/// Load settings, falling back to defaults when the file is missing or unreadable.
pub fn load_settings(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                Settings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            Settings::default()
        }
    }
}

/// Write settings atomically (temp file in the same directory, then rename).
pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| SettingsError::Io { path, source }
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let contents = serde_json::to_string_pretty(settings)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, contents).map_err(io_err(&tmp_path))?;

    // Windows refuses to rename over an existing file.
    if cfg!(windows) && path.exists() {
        std::fs::remove_file(path).map_err(io_err(path))?;
    }
    std::fs::rename(&tmp_path, path).map_err(io_err(path))?;
    Ok(())
}
