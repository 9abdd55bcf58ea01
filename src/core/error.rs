//! Error type for the crate.

use crate::core::types::{AnnotationId, InstrumentationKey};
use thiserror::Error;

/// Numeric sentinel for an annotation that failed to decode.
pub const ANNOTATION_ERROR: AnnotationId = 0xffff_ffff;

/// Everything that can go wrong in a Tuning Fork session
#[derive(Error, Debug)]
pub enum TuningForkError {
    /// Annotation bytes that do not decode against the enum sizes
    #[error("Invalid annotation: {0}")]
    InvalidAnnotation(String),

    /// Argument or stored value out of range
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// Annotation field index past the last field
    #[error("Annotation field index {index} out of range ({len} fields)")]
    BadIndex {
        /// Requested field index
        index: usize,
        /// Number of annotation fields
        len: usize,
    },

    /// Every key index is already taken by another key
    #[error("Instrument key {key} rejected: limit of {max} distinct keys reached")]
    InvalidInstrumentKey {
        /// Rejected key
        key: InstrumentationKey,
        /// Key limit of the session
        max: usize,
    },

    /// Trace handle that was never started or already ended
    #[error("Invalid trace handle: {0}")]
    InvalidTraceHandle(u64),

    /// No prong slot allocated for a compound id
    #[error("No prong for compound id {0}")]
    ProngNotFound(u64),

    /// The spare cache is still with the upload thread
    #[error("Previous upload still pending")]
    PreviousUploadPending,

    /// No global session is running
    #[error("Tuning Fork is not initialized")]
    NotInitialized,

    /// A global session is already running
    #[error("Tuning Fork is already initialized")]
    AlreadyInitialized,

    /// Invalid settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend failed to process a report
    #[error("Backend error: {0}")]
    Backend(String),

    /// The upload thread exited or could not be spawned
    #[error("Upload thread is not running")]
    UploadThreadStopped,

    /// Persister or backend I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Report JSON that does not parse
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bad base64 in a stored report
    #[error("Base64 decode error: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Result type alias for Tuning Fork operations
pub type Result<T> = std::result::Result<T, TuningForkError>;

impl TuningForkError {
    /// Creates a new invalid annotation error
    pub fn annotation<S: Into<String>>(msg: S) -> Self {
        Self::InvalidAnnotation(msg.into())
    }

    /// Creates a new bad parameter error
    pub fn bad_parameter<S: Into<String>>(msg: S) -> Self {
        Self::BadParameter(msg.into())
    }

    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new backend error
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Self::Backend(msg.into())
    }

    /// Returns true if the caller can drop the sample and keep going
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidAnnotation(_)
            | Self::BadParameter(_)
            | Self::BadIndex { .. }
            | Self::InvalidInstrumentKey { .. }
            | Self::InvalidTraceHandle(_)
            | Self::ProngNotFound(_)
            | Self::PreviousUploadPending
            | Self::Backend(_) => true,
            _ => false,
        }
    }

    /// Returns the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidAnnotation(_) | Self::BadParameter(_) | Self::BadIndex { .. } => {
                "validation"
            },
            Self::InvalidInstrumentKey { .. } | Self::ProngNotFound(_) => "capacity",
            Self::InvalidTraceHandle(_) => "trace",
            Self::PreviousUploadPending => "backpressure",
            Self::NotInitialized | Self::AlreadyInitialized => "lifecycle",
            Self::Config(_) => "config",
            Self::Backend(_) | Self::UploadThreadStopped => "upload",
            Self::Io(_) => "io",
            Self::Serialization(_) | Self::Decode(_) => "serialization",
        }
    }
}
