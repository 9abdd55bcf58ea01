//! Command-line interface for the Tuning Fork simulator.
//!
//! `tuningfork-sim` drives a synthetic game session through the aggregation
//! driver so settings files and backends can be tried without a game.

use crate::annotation::write_varint;
use crate::core::{ikeys, LoggingConfig, Result, Settings, SettingsBuilder, SteppingClock, TuningForkError};
use crate::driver::TuningFork;
use crate::export::write_output;
use crate::upload::{DebugBackend, FileBackend};
use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Drive a synthetic frame loop through Tuning Fork
#[derive(Parser, Debug)]
#[command(name = "tuningfork-sim")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Settings file (YAML)
    #[arg(short, long, env = "TUNINGFORK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of frames to simulate
    #[arg(long, default_value_t = 1000)]
    pub frames: u64,

    /// Nominal frame time in milliseconds
    #[arg(long, default_value_t = 16.7)]
    pub frame_time_ms: f64,

    /// Uniform random jitter added to each frame, in milliseconds
    #[arg(long, default_value_t = 0.0)]
    pub jitter_ms: f64,

    /// Frames spent on a loading screen before the session starts
    #[arg(long, default_value_t = 0)]
    pub loading_frames: u64,

    /// Value of the first annotation field
    #[arg(long, default_value_t = 1)]
    pub level: u64,

    /// Enable debug logging
    #[arg(short, long, env = "TUNINGFORK_DEBUG")]
    pub debug: bool,

    /// Validate settings, print them and exit
    #[arg(long)]
    pub check_config: bool,

    /// Append reports to this file instead of logging them
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load settings from the file, or use the defaults
    pub fn load_settings(&self) -> Result<Settings> {
        let builder = SettingsBuilder::new();
        let builder = match &self.config {
            Some(path) => {
                let builder = builder.from_file(path)?;
                tracing::info!("Loaded settings from: {:?}", path);
                builder
            },
            None => builder.annotation_enum_size(vec![self.level.max(1) as u32]),
        };
        builder.build()
    }

    /// Initialize logging from the settings and `TUNINGFORK_LOG` / `RUST_LOG`.
    pub fn init_logging(&self, logging: &LoggingConfig) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let log_level = if self.debug {
            "debug"
        } else {
            logging.level.as_str()
        };

        let filter = EnvFilter::try_from_env("TUNINGFORK_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(log_level));

        let fmt_layer = if logging.structured {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .compact()
        } else {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact()
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TuningForkError::config(format!("Failed to initialize logging: {}", e)))?;

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(self.frame_time_ms > 0.0) {
            return Err(TuningForkError::bad_parameter("--frame-time-ms must be positive"));
        }
        if !(self.jitter_ms >= 0.0) {
            return Err(TuningForkError::bad_parameter("--jitter-ms must not be negative"));
        }
        Ok(())
    }
}

/// Serialized annotation with `level` in field 1 and, if given, a loading state
pub fn simulation_annotation(level: u64, loading: Option<(usize, u64)>) -> Vec<u8> {
    let mut ser = Vec::new();
    if level > 0 {
        ser.push(1 << 3);
        write_varint(level, &mut ser);
    }
    if let Some((index, state)) = loading {
        ser.push(((index + 1) << 3) as u8);
        write_varint(state, &mut ser);
    }
    ser
}

/// Run the simulator.
pub fn execute(cli: Cli) -> Result<()> {
    cli.validate()?;
    let settings = cli.load_settings()?;
    cli.init_logging(&settings.logging)?;

    if cli.check_config {
        let yaml = serde_yaml::to_string(&settings)
            .map_err(|e| TuningForkError::config(format!("Failed to render settings: {}", e)))?;
        println!("Settings are valid!");
        println!("  Prong slots per cache: {}", settings.max_prongs()?);
        return write_output(&yaml, None);
    }

    let frame_time = Duration::from_secs_f64(cli.frame_time_ms / 1000.0);
    let clock = Arc::new(SteppingClock::new(frame_time));
    let loading_index = settings.loading_annotation_index;
    let builder = TuningFork::builder(settings).time_provider(clock.clone());
    let mut tf = match &cli.output {
        Some(path) => builder.backend(FileBackend::new(path)?).build()?,
        None => builder.backend(DebugBackend).build()?,
    };

    if cli.loading_frames > 0 {
        match loading_index {
            Some(index) => {
                tf.set_current_annotation(&simulation_annotation(cli.level, Some((index, 2))))?;
                clock.advance(cli.loading_frames);
                tf.set_current_annotation(&simulation_annotation(cli.level, Some((index, 1))))?;
            },
            None => tracing::warn!("--loading-frames needs loading_annotation_index in the settings"),
        }
    } else if let Err(e) = tf.set_current_annotation(&simulation_annotation(cli.level, None)) {
        tracing::warn!("Running without annotation: {}", e);
    }

    let mut rng = rand::thread_rng();
    for _ in 0..cli.frames {
        let jitter = if cli.jitter_ms > 0.0 {
            rng.gen_range(-cli.jitter_ms..=cli.jitter_ms)
        } else {
            0.0
        };
        let dt = Duration::from_secs_f64((cli.frame_time_ms + jitter).max(0.0) / 1000.0);
        match tf.frame_delta_time(ikeys::RAW_FRAME_TIME, dt) {
            Ok(()) => {},
            Err(e) if e.is_recoverable() => tracing::warn!("Frame dropped: {}", e),
            Err(e) => return Err(e),
        }
    }

    // The final flush has to wait for any upload still in flight
    let timeout = Duration::from_secs(10);
    tf.wait_for_upload(timeout);
    tf.flush()?;
    tf.wait_for_upload(timeout);

    let stats = tf.upload_stats();
    tracing::info!(
        "Simulated {} frames: {} uploads, {} failures",
        cli.frames,
        stats.uploads,
        stats.failures
    );
    Ok(())
}
