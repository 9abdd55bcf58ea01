//! Tuning Fork - frame-time telemetry aggregation.
//!
//! Tuning Fork records how long frames (and other timed segments) take,
//! grouped by the game's current *annotation*: a small set of enum fields
//! such as the level or the loading state. Samples land in preallocated
//! histograms and are periodically serialized to JSON and handed to an upload
//! backend on a background thread, without blocking the frame loop.
//!
//! # Architecture
//!
//! - `core`: errors, configuration, identifier types and clocks
//! - `annotation`: the mixed-radix annotation encoding
//! - `metrics`: histograms, prongs and the prong cache
//! - `driver`: the per-frame API and the double-buffered flush
//! - `upload`: the upload thread, backends and persistence
//! - `export`: the JSON report format
//! - `global`: an optional process-wide session
//! - `cli`: the `tuningfork-sim` simulator
//!
//! # Example
//!
//! ```no_run
//! use tuningfork::core::{ikeys, SettingsBuilder, Submission};
//! use tuningfork::TuningFork;
//!
//! fn main() -> tuningfork::Result<()> {
//!     let settings = SettingsBuilder::new()
//!         .method(Submission::TickBased)
//!         .intervalms_or_count(600)
//!         .annotation_enum_size(vec![3])
//!         .build()?;
//!     let mut tf = TuningFork::builder(settings).build()?;
//!     tf.set_current_annotation(&[0x08, 0x01])?;
//!     loop {
//!         // render a frame
//!         tf.frame_tick(ikeys::RAW_FRAME_TIME)?;
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod annotation;
pub mod cli;
pub mod core;
pub mod driver;
pub mod export;
pub mod global;
pub mod metrics;
pub mod upload;

// Re-export core types for convenience
pub use crate::core::{Result, Settings, SettingsBuilder, TuningForkError};
pub use crate::driver::{TuningFork, TuningForkBuilder};
