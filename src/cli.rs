//! Command-line interface
//!
//! Handles argument parsing and logging configuration.

use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

/// MicBoost - live microphone gain with monitoring and spectrum display
#[derive(Parser, Debug, Default)]
#[command(name = "mic-boost")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Input (microphone) device name
    #[arg(short, long)]
    pub input: Option<String>,

    /// Transmission output device name (e.g. a virtual cable)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Enable monitoring, optionally on a named output device
    #[arg(short, long, num_args = 0..=1, default_missing_value = "default")]
    pub monitor: Option<String>,

    /// Gain control, 0-250 (100 = unity)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(0..=250))]
    pub gain: Option<u16>,

    /// Print available devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Render a text spectrum meter
    #[arg(long)]
    pub meter: bool,

    /// Do not write settings on exit
    #[arg(long)]
    pub no_save: bool,

    /// Settings file (defaults to the platform config directory)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Increase logging verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Log level for this crate's modules
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Monitor device requested on the command line.
    ///
    /// `None` if not requested, `Some(None)` for the system default.
    pub fn monitor_device(&self) -> Option<Option<String>> {
        self.monitor
            .as_ref()
            .map(|name| (name != "default").then(|| name.clone()))
    }
}

/// Initialize logging from the CLI flags
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Keep dependencies quiet unless something is wrong
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module("mic_boost_lib", args.log_level());

    builder.format_timestamp_millis().init();
}
