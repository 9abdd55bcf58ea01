//! Common test utilities and fixtures.

#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tuningfork::core::{ikeys, HistogramSettings, Result, Settings, SettingsBuilder, SteppingClock, Submission};
use tuningfork::export::TelemetryRequest;
use tuningfork::upload::Backend;
use tuningfork::{TuningFork, TuningForkBuilder, TuningForkError};

/// How long tests wait for the upload thread
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend that forwards every report to a channel.
pub struct TestBackend {
    tx: Sender<String>,
}

impl Backend for TestBackend {
    fn process(&mut self, payload: &str) -> Result<()> {
        self.tx
            .send(payload.to_string())
            .map_err(|e| TuningForkError::backend(e.to_string()))
    }
}

pub fn test_backend() -> (TestBackend, Receiver<String>) {
    let (tx, rx) = unbounded();
    (TestBackend { tx }, rx)
}

/// Backend that holds each report until the test releases it.
pub struct BlockingBackend {
    gate: Receiver<()>,
    tx: Sender<String>,
}

impl Backend for BlockingBackend {
    fn process(&mut self, payload: &str) -> Result<()> {
        // A dropped gate releases everything
        let _ = self.gate.recv();
        self.tx
            .send(payload.to_string())
            .map_err(|e| TuningForkError::backend(e.to_string()))
    }
}

pub fn blocking_backend() -> (BlockingBackend, Sender<()>, Receiver<String>) {
    let (gate_tx, gate) = unbounded();
    let (tx, rx) = unbounded();
    (BlockingBackend { gate, tx }, gate_tx, rx)
}

/// Builder for test settings with sensible defaults.
pub struct TestSettings {
    method: Submission,
    intervalms_or_count: u32,
    max_keys: u32,
    enum_sizes: Vec<u32>,
    loading_index: Option<usize>,
}

impl TestSettings {
    /// One frame-time key, one three-valued annotation field, flushing
    /// after `count` ticks
    pub fn tick_based(count: u32) -> Self {
        Self {
            method: Submission::TickBased,
            intervalms_or_count: count,
            max_keys: 1,
            enum_sizes: vec![3],
            loading_index: None,
        }
    }

    pub fn time_based(interval_ms: u32) -> Self {
        Self {
            method: Submission::TimeBased,
            ..Self::tick_based(interval_ms)
        }
    }

    pub fn max_keys(mut self, n: u32) -> Self {
        self.max_keys = n;
        self
    }

    /// Add a two-state loading field after the level field
    pub fn with_loading(mut self) -> Self {
        self.enum_sizes = vec![3, 2];
        self.loading_index = Some(1);
        self
    }

    pub fn build(self) -> Settings {
        let mut builder = SettingsBuilder::new()
            .method(self.method)
            .intervalms_or_count(self.intervalms_or_count)
            .max_instrumentation_keys(self.max_keys)
            .annotation_enum_size(self.enum_sizes)
            .histogram(HistogramSettings::new(ikeys::RAW_FRAME_TIME, 10.0, 40.0, 30))
            .wait_timeout(Duration::from_millis(10));
        if let Some(index) = self.loading_index {
            builder = builder.loading_annotation_index(index).level_annotation_index(0);
        }
        builder.build().unwrap()
    }
}

/// Clock advancing 20 ms per reading
pub fn clock() -> Arc<SteppingClock> {
    Arc::new(SteppingClock::new(Duration::from_millis(20)))
}

/// Driver on a stepping clock with a channel backend.
pub fn driver(settings: Settings) -> (TuningFork, Arc<SteppingClock>, Receiver<String>) {
    let (backend, rx) = test_backend();
    let clock = clock();
    let tf = builder(settings, &clock).backend(backend).build().unwrap();
    (tf, clock, rx)
}

pub fn builder(settings: Settings, clock: &Arc<SteppingClock>) -> TuningForkBuilder {
    TuningFork::builder(settings).time_provider(clock.clone())
}

/// Next uploaded report, parsed
pub fn next_report(rx: &Receiver<String>) -> TelemetryRequest {
    let json = rx.recv_timeout(UPLOAD_TIMEOUT).expect("no report uploaded");
    serde_json::from_str(&json).expect("report is not valid JSON")
}

/// Macro for checking a single rendering histogram in a report.
#[macro_export]
macro_rules! assert_rendering {
    ($telemetry:expr, key: $key:expr, bucket: $bucket:expr => $count:expr) => {
        let rendering = $telemetry
            .report
            .rendering
            .as_ref()
            .expect("no rendering report");
        let histogram = rendering
            .render_time_histogram
            .iter()
            .find(|h| h.instrument_id == $key)
            .expect("no histogram for key");
        assert_eq!(histogram.counts[$bucket], $count, "Incorrect bucket count");
    };
}
