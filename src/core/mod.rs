//! Core types shared by every Tuning Fork subsystem.
//!
//! This module contains the error type, configuration, identifier
//! aliases and the injectable clocks.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod time;
pub mod types;

// Re-export commonly used types
pub use config::{
    AggregationStrategy, HistogramSettings, LogLevel, LoggingConfig, Settings, SettingsBuilder,
    Submission, UploadConfig,
};
pub use error::{Result, TuningForkError, ANNOTATION_ERROR};
pub use time::{SteppingClock, SystemClock, TimeProvider};
pub use types::{
    ikeys, AnnotationId, CompoundId, InstrumentationKey, SerializedAnnotation, TraceHandle,
};
