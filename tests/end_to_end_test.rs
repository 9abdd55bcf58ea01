//! End-to-end tests: frames in, JSON reports out.

mod common;

use common::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;
use tuningfork::core::ikeys;
use tuningfork::upload::{FilePersister, Persister, HISTOGRAMS_PAUSED};
use tuningfork::TuningForkError;

#[test]
fn test_tick_based_report() {
    let (mut tf, _clock, rx) = driver(TestSettings::tick_based(100).build());
    tf.set_current_annotation(&[0x08, 0x01]).unwrap();

    // 101 ticks give 100 frame times of 20 ms
    for _ in 0..101 {
        tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
    }
    assert_eq!(tf.active_cache_index(), 1);

    let report = next_report(&rx);
    assert_eq!(report.name, "applications/unknown/apks/0");
    assert_eq!(report.session_context.time_period.start_time, "1970-01-01T00:00:00.020000Z");
    assert_eq!(report.session_context.time_period.end_time, "1970-01-01T00:00:02.020000Z");
    assert_eq!(report.telemetry.len(), 1);

    let telemetry = &report.telemetry[0];
    assert_eq!(telemetry.context.annotations, "CAE=");
    assert_eq!(telemetry.context.duration, "2s");
    assert!(telemetry.report.loading.is_none());
    let histogram = &telemetry.report.rendering.as_ref().unwrap().render_time_histogram[0];
    assert_eq!(histogram.instrument_id, ikeys::RAW_FRAME_TIME);
    assert_eq!(histogram.counts.len(), 32);
    assert_rendering!(telemetry, key: ikeys::RAW_FRAME_TIME, bucket: 11 => 100);
    assert_eq!(histogram.counts.iter().sum::<u32>(), 100);

    assert!(tf.wait_for_upload(UPLOAD_TIMEOUT));
    assert_eq!(tf.upload_stats().uploads, 1);
}

#[test]
fn test_time_based_report() {
    let (mut tf, _clock, rx) = driver(TestSettings::time_based(100).build());
    tf.set_current_annotation(&[0x08, 0x02]).unwrap();

    // The clock reads 20 ms later on every call, and the fifth tick is the
    // first one 100 ms after start-up
    for _ in 0..4 {
        tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
    }
    assert_eq!(tf.active_cache_index(), 0);
    tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
    assert_eq!(tf.active_cache_index(), 1);

    let report = next_report(&rx);
    assert_eq!(report.session_context.time_period.end_time, "1970-01-01T00:00:00.100000Z");
    let telemetry = &report.telemetry[0];
    assert_eq!(telemetry.context.annotations, "CAI=");
    assert_eq!(telemetry.context.duration, "0.08s");
    assert_rendering!(telemetry, key: ikeys::RAW_FRAME_TIME, bucket: 11 => 4);
}

#[test]
fn test_flush_while_upload_pending() {
    let (backend, gate, rx) = blocking_backend();
    let clock = clock();
    let mut tf = builder(TestSettings::tick_based(1000).build(), &clock)
        .backend(backend)
        .build()
        .unwrap();

    tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
    tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
    tf.flush().unwrap();
    assert_eq!(tf.active_cache_index(), 1);

    // The upload thread still owns the first cache
    tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
    tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
    assert!(matches!(tf.flush(), Err(TuningForkError::PreviousUploadPending)));
    assert_eq!(tf.active_cache_index(), 1);
    assert_eq!(tf.active_cache().prongs().map(|p| p.count()).sum::<usize>(), 1);

    gate.send(()).unwrap();
    let first = next_report(&rx);
    assert_rendering!(first.telemetry[0], key: ikeys::RAW_FRAME_TIME, bucket: 11 => 1);
    assert!(tf.wait_for_upload(UPLOAD_TIMEOUT));

    tf.flush().unwrap();
    assert_eq!(tf.active_cache_index(), 0);
    gate.send(()).unwrap();
    let second = next_report(&rx);
    assert_rendering!(second.telemetry[0], key: ikeys::RAW_FRAME_TIME, bucket: 11 => 1);
    assert!(tf.wait_for_upload(UPLOAD_TIMEOUT));
}

#[test]
fn test_loading_time_report() {
    let (mut tf, clock, rx) = driver(TestSettings::tick_based(1000).with_loading().build());
    tf.set_current_annotation(&[0x08, 0x01]).unwrap();
    for _ in 0..3 {
        tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
    }

    // Level 1, loading
    tf.set_current_annotation(&[0x08, 0x01, 0x10, 0x02]).unwrap();
    clock.advance(49);
    tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
    // Level 1, loaded
    tf.set_current_annotation(&[0x08, 0x01, 0x10, 0x01]).unwrap();
    tf.flush().unwrap();

    let report = next_report(&rx);
    assert_eq!(report.telemetry.len(), 2);

    let frames = &report.telemetry[0];
    assert_eq!(frames.context.annotations, "CAE=");
    assert_rendering!(frames, key: ikeys::RAW_FRAME_TIME, bucket: 11 => 2);

    let loading = &report.telemetry[1];
    assert_eq!(loading.context.annotations, "CAEQAg==");
    assert_eq!(loading.context.duration, "1s");
    assert!(loading.report.rendering.is_none());
    let events = &loading.report.loading.as_ref().unwrap().loading_events;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].times_ms, vec![1000]);
    assert!(events[0].counts.is_empty());
}

#[test]
fn test_bad_annotation_ends_loading_screen() {
    let (mut tf, clock, rx) = driver(TestSettings::tick_based(1000).with_loading().build());
    tf.set_current_annotation(&[0x08, 0x01, 0x10, 0x02]).unwrap();
    clock.advance(49);

    let err = tf.set_current_annotation(&[0x08, 0x07]).unwrap_err();
    assert!(matches!(err, TuningForkError::InvalidAnnotation(_)));
    assert!(!tf.is_loading());

    // Frames count under the empty annotation
    for _ in 0..3 {
        tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
    }
    tf.set_current_annotation(&[0x08, 0x01, 0x10, 0x01]).unwrap();
    tf.flush().unwrap();

    let report = next_report(&rx);
    assert_eq!(report.telemetry.len(), 1);
    let frames = &report.telemetry[0];
    assert_eq!(frames.context.annotations, "");
    assert!(frames.report.loading.is_none());
    assert_rendering!(frames, key: ikeys::RAW_FRAME_TIME, bucket: 11 => 2);
}

#[test]
fn test_trace_segments_reported_per_key() {
    let (mut tf, _clock, rx) = driver(TestSettings::tick_based(1000).max_keys(2).build());
    let handle = tf.start_trace(ikeys::CPU_TIME).unwrap();
    tf.end_trace(handle).unwrap();
    tf.flush().unwrap();

    let report = next_report(&rx);
    let rendering = report.telemetry[0].report.rendering.as_ref().unwrap();
    assert_eq!(rendering.render_time_histogram.len(), 1);
    assert_rendering!(report.telemetry[0], key: ikeys::CPU_TIME, bucket: 11 => 1);
}

#[test]
fn test_callback_and_fidelity_parameters() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let (backend, rx) = test_backend();
    let clock = clock();
    let mut tf = builder(TestSettings::tick_based(1000).build(), &clock)
        .backend(backend)
        .upload_callback(move |json| sink.lock().push(json.to_string()))
        .build()
        .unwrap();
    tf.set_fidelity_parameters(vec![1, 2, 3], "experiment-7");

    tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
    tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
    tf.flush().unwrap();

    let json = rx.recv_timeout(UPLOAD_TIMEOUT).unwrap();
    assert!(tf.wait_for_upload(UPLOAD_TIMEOUT));
    assert_eq!(seen.lock().as_slice(), &[json.clone()]);

    let report: tuningfork::export::TelemetryRequest = serde_json::from_str(&json).unwrap();
    let params = &report.telemetry[0].context.tuning_parameters;
    assert_eq!(params.experiment_id, "experiment-7");
    assert_eq!(params.serialized_fidelity_parameters, "AQID");
}

#[test]
fn test_paused_histograms_carry_over() {
    let dir = TempDir::new().unwrap();
    let persister: Arc<dyn Persister> = Arc::new(FilePersister::new(dir.path()).unwrap());

    {
        let (backend, rx) = test_backend();
        let clock = clock();
        let mut tf = builder(TestSettings::tick_based(1000).build(), &clock)
            .backend(backend)
            .persister(Arc::clone(&persister))
            .build()
            .unwrap();
        tf.set_current_annotation(&[0x08, 0x01]).unwrap();
        for _ in 0..11 {
            tf.frame_tick(ikeys::RAW_FRAME_TIME).unwrap();
        }
        tf.flush_to_persister().unwrap();
        assert!(tf.wait_for_upload(UPLOAD_TIMEOUT));
        assert_eq!(tf.upload_stats().persisted, 1);
        assert!(rx.try_recv().is_err());
    }
    assert!(persister.get(HISTOGRAMS_PAUSED).unwrap().is_some());

    // A new session picks the stored histograms up and forgets them
    let (backend, rx) = test_backend();
    let clock = clock();
    let mut tf = builder(TestSettings::tick_based(1000).build(), &clock)
        .backend(backend)
        .persister(Arc::clone(&persister))
        .build()
        .unwrap();
    assert!(persister.get(HISTOGRAMS_PAUSED).unwrap().is_none());

    tf.set_current_annotation(&[0x08, 0x01]).unwrap();
    let id = tf.make_compound_id(ikeys::RAW_FRAME_TIME).unwrap();
    assert_eq!(tf.active_cache().prong(id).unwrap().count(), 10);

    tf.flush().unwrap();
    let report = next_report(&rx);
    assert_eq!(report.session_context.time_period.start_time, "1970-01-01T00:00:00.020000Z");
    assert_eq!(report.session_context.time_period.end_time, "1970-01-01T00:00:00.220000Z");
    assert_eq!(report.telemetry[0].context.duration, "0.2s");
    assert_rendering!(report.telemetry[0], key: ikeys::RAW_FRAME_TIME, bucket: 11 => 10);
}

#[test]
fn test_corrupt_paused_histograms_are_dropped() {
    let dir = TempDir::new().unwrap();
    let persister: Arc<dyn Persister> = Arc::new(FilePersister::new(dir.path()).unwrap());
    persister.set(HISTOGRAMS_PAUSED, b"{not json").unwrap();

    let clock = clock();
    let (backend, _rx) = test_backend();
    let tf = builder(TestSettings::tick_based(1000).build(), &clock)
        .backend(backend)
        .persister(Arc::clone(&persister))
        .build()
        .unwrap();
    assert!(persister.get(HISTOGRAMS_PAUSED).unwrap().is_none());
    assert_eq!(tf.active_cache().prongs().map(|p| p.count()).sum::<usize>(), 0);
}
