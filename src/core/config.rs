//! Configuration management for Tuning Fork.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - Programmatic construction through [`SettingsBuilder`]
//! - Validation and defaults

use crate::annotation::descriptor::AnnotationDescriptor;
use crate::core::types::InstrumentationKey;
use crate::core::{Result, TuningForkError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on `max_instrumentation_keys * annotation combinations`.
pub const MAX_PRONG_SLOTS: u64 = 1 << 22;

/// Complete configuration for a Tuning Fork session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// When and how histograms are submitted
    pub aggregation_strategy: AggregationStrategy,
    /// Histogram ranges, one per instrumentation key index
    pub histograms: Vec<HistogramSettings>,
    /// Annotation field (0-based) holding the loading state
    pub loading_annotation_index: Option<usize>,
    /// Annotation field (0-based) holding the level, kept while loading
    pub level_annotation_index: Option<usize>,
    /// Descriptor file used to discover annotation enum sizes
    pub annotation_descriptor: Option<PathBuf>,
    /// Upload worker configuration
    pub upload: UploadConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Submission policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationStrategy {
    /// Submission method
    pub method: Submission,
    /// Interval in milliseconds for time-based, sample count for tick-based
    pub intervalms_or_count: u32,
    /// Maximum number of distinct instrumentation keys
    pub max_instrumentation_keys: u32,
    /// Cardinality of each annotation enum field, in field order
    pub annotation_enum_size: Vec<u32>,
}

/// When a flush is triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Submission {
    /// Flush once a prong has collected `intervalms_or_count` samples
    TickBased,
    /// Flush once `intervalms_or_count` milliseconds have elapsed
    TimeBased,
}

/// Bucket layout for one instrumentation key.
///
/// A zero `bucket_min` and `bucket_max` selects auto-ranging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSettings {
    /// Key this histogram belongs to
    pub instrument_key: InstrumentationKey,
    /// Lower edge of the first interior bucket, in milliseconds
    pub bucket_min: f64,
    /// Upper edge of the last interior bucket, in milliseconds
    pub bucket_max: f64,
    /// Number of interior buckets
    pub n_buckets: u32,
}

/// Upload worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// How long the worker sleeps between shutdown checks
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
    /// Directory for paused histograms, if persistence is wanted
    pub persistence_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Include targets, thread ids and line numbers
    pub structured: bool,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything, including per-prong details
    Trace,
    /// Settings and key layout at start-up
    Debug,
    /// Session lifecycle
    Info,
    /// Dropped samples and rejected input
    Warn,
    /// Failures only
    Error,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            aggregation_strategy: AggregationStrategy::default(),
            histograms: Vec::new(),
            loading_annotation_index: None,
            level_annotation_index: None,
            annotation_descriptor: None,
            upload: UploadConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for AggregationStrategy {
    fn default() -> Self {
        AggregationStrategy {
            method: Submission::TimeBased,
            intervalms_or_count: 600_000, // 10 minutes
            max_instrumentation_keys: 2,
            annotation_enum_size: Vec::new(),
        }
    }
}

impl Default for HistogramSettings {
    fn default() -> Self {
        HistogramSettings {
            instrument_key: 0,
            bucket_min: 10.0,
            bucket_max: 40.0,
            n_buckets: 30,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            wait_timeout: Duration::from_secs(1),
            persistence_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            structured: false,
        }
    }
}

impl HistogramSettings {
    /// Fixed-range settings for `key`
    pub fn new(instrument_key: InstrumentationKey, bucket_min: f64, bucket_max: f64, n_buckets: u32) -> Self {
        Self {
            instrument_key,
            bucket_min,
            bucket_max,
            n_buckets,
        }
    }

    /// True when the range is left for the histogram to discover
    pub fn is_auto_range(&self) -> bool {
        self.bucket_min == 0.0 && self.bucket_max == 0.0
    }
}

impl Settings {
    /// Create new settings with defaults
    pub fn new() -> Result<Self> {
        let settings = Settings::default();
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let strategy = &self.aggregation_strategy;

        if strategy.max_instrumentation_keys == 0 {
            return Err(TuningForkError::config("max_instrumentation_keys must be greater than 0"));
        }

        if strategy.intervalms_or_count == 0 {
            return Err(TuningForkError::config("intervalms_or_count must be greater than 0"));
        }

        for h in &self.histograms {
            if h.n_buckets == 0 {
                return Err(TuningForkError::config(format!(
                    "Histogram for key {} needs at least one bucket",
                    h.instrument_key
                )));
            }
            if !h.is_auto_range() && h.bucket_max <= h.bucket_min {
                return Err(TuningForkError::config(format!(
                    "Histogram for key {}: bucket_max ({}) must be larger than bucket_min ({})",
                    h.instrument_key, h.bucket_max, h.bucket_min
                )));
            }
        }

        let n_fields = strategy.annotation_enum_size.len();
        for (name, index) in [
            ("loading_annotation_index", self.loading_annotation_index),
            ("level_annotation_index", self.level_annotation_index),
        ] {
            if let Some(i) = index {
                if i >= n_fields {
                    return Err(TuningForkError::config(format!(
                        "{name} {i} is out of range for {n_fields} annotation fields"
                    )));
                }
            }
        }

        self.max_prongs()?;

        Ok(())
    }

    /// Number of prong slots needed for every (key, annotation) pair
    pub fn max_prongs(&self) -> Result<u64> {
        let strategy = &self.aggregation_strategy;
        let annotations = strategy
            .annotation_enum_size
            .iter()
            .try_fold(1u64, |acc, &size| acc.checked_mul(u64::from(size) + 1));
        let total = annotations
            .and_then(|a| a.checked_mul(u64::from(strategy.max_instrumentation_keys)))
            .filter(|&total| total <= MAX_PRONG_SLOTS);
        total.ok_or_else(|| {
            TuningForkError::config(format!(
                "Annotation enum sizes {:?} with {} keys exceed the limit of {} prongs",
                strategy.annotation_enum_size, strategy.max_instrumentation_keys, MAX_PRONG_SLOTS
            ))
        })
    }

    /// Read the annotation descriptor file, if one is configured
    pub fn load_annotation_descriptor(&self) -> Result<Option<AnnotationDescriptor>> {
        self.annotation_descriptor
            .as_deref()
            .map(AnnotationDescriptor::from_file)
            .transpose()
    }

    /// Fill `annotation_enum_size` from the descriptor file when it was left empty
    pub fn resolve_annotation_enum_sizes(&mut self) -> Result<()> {
        if !self.aggregation_strategy.annotation_enum_size.is_empty() {
            return Ok(());
        }
        if let Some(descriptor) = self.load_annotation_descriptor()? {
            self.apply_annotation_descriptor(&descriptor);
        }
        Ok(())
    }

    /// Take enum sizes from `descriptor` unless they were set explicitly
    pub fn apply_annotation_descriptor(&mut self, descriptor: &AnnotationDescriptor) {
        if !self.aggregation_strategy.annotation_enum_size.is_empty() {
            return;
        }
        let sizes = descriptor.enum_sizes();
        tracing::info!("Found annotation enum sizes in descriptor: {:?}", sizes);
        self.aggregation_strategy.annotation_enum_size = sizes;
    }

    /// Histogram settings for every key index, padded with defaults
    pub fn complete_histograms(&self) -> Vec<HistogramSettings> {
        let max_keys = self.aggregation_strategy.max_instrumentation_keys as usize;
        let mut histograms = self.histograms.clone();
        if histograms.len() < max_keys {
            tracing::warn!(
                "Only {} histogram settings for {} keys, using defaults for the rest",
                histograms.len(),
                max_keys
            );
            histograms.resize(max_keys, HistogramSettings::default());
        }
        histograms
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Settings builder for programmatic construction
pub struct SettingsBuilder {
    settings: Settings,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings::default(),
        }
    }

    /// Load settings from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.settings = serde_yaml::from_str(yaml)
            .map_err(|e| TuningForkError::config(format!("Failed to parse YAML settings: {}", e)))?;
        Ok(self)
    }

    /// Load settings from a YAML file
    pub fn from_file(self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TuningForkError::config(format!("Failed to read settings file {:?}: {}", path, e))
        })?;
        self.from_yaml(&content)
    }

    /// Set submission method
    pub fn method(mut self, method: Submission) -> Self {
        self.settings.aggregation_strategy.method = method;
        self
    }

    /// Set interval (ms) or count, depending on the method
    pub fn intervalms_or_count(mut self, value: u32) -> Self {
        self.settings.aggregation_strategy.intervalms_or_count = value;
        self
    }

    /// Set maximum number of instrumentation keys
    pub fn max_instrumentation_keys(mut self, n: u32) -> Self {
        self.settings.aggregation_strategy.max_instrumentation_keys = n;
        self
    }

    /// Set annotation enum sizes
    pub fn annotation_enum_size(mut self, sizes: Vec<u32>) -> Self {
        self.settings.aggregation_strategy.annotation_enum_size = sizes;
        self
    }

    /// Add a histogram setting
    pub fn histogram(mut self, histogram: HistogramSettings) -> Self {
        self.settings.histograms.push(histogram);
        self
    }

    /// Set the loading-state annotation field
    pub fn loading_annotation_index(mut self, index: usize) -> Self {
        self.settings.loading_annotation_index = Some(index);
        self
    }

    /// Set the level annotation field
    pub fn level_annotation_index(mut self, index: usize) -> Self {
        self.settings.level_annotation_index = Some(index);
        self
    }

    /// Set the descriptor file
    pub fn annotation_descriptor(mut self, path: PathBuf) -> Self {
        self.settings.annotation_descriptor = Some(path);
        self
    }

    /// Set the persistence directory
    pub fn persistence_dir(mut self, path: PathBuf) -> Self {
        self.settings.upload.persistence_dir = Some(path);
        self
    }

    /// Set the upload worker wait timeout
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.settings.upload.wait_timeout = timeout;
        self
    }

    /// Set log level
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.settings.logging.level = level;
        self
    }

    /// Resolve descriptor-driven fields, then build and validate the settings
    pub fn build(mut self) -> Result<Settings> {
        self.settings.resolve_annotation_enum_sizes()?;
        self.settings.validate()?;
        Ok(self.settings)
    }
}
