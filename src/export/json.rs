//! JSON telemetry report.
//!
//! The report follows the proto3 JSON mapping of the telemetry upload
//! request: one `telemetry` entry per distinct annotation, byte strings in
//! base64, durations as decimal seconds with an `s` suffix and timestamps in
//! RFC 3339.

use crate::driver::IdProvider;
use crate::metrics::{HistogramMode, Prong, ProngCache};
use crate::core::{Result, TuningForkError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Device and session details attached to every report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestInfo {
    /// Application package name
    pub package_name: String,
    /// Application version code
    pub version_code: u32,
    /// OS build version
    pub build_version: String,
    /// Device build fingerprint
    pub fingerprint: String,
    /// Maximum frequency of each CPU core
    pub cpu_core_freqs_hz: Vec<u64>,
    /// OpenGL ES major version
    pub gles_version_major: u32,
    /// OpenGL ES minor version
    pub gles_version_minor: u32,
    /// Total device memory
    pub total_memory_bytes: u64,
    /// Unique per session, see [`new_session_id`]
    pub session_id: String,
    /// Version of this library
    pub tuningfork_version: String,
    /// Experiment the fidelity parameters belong to
    pub experiment_id: String,
    /// Serialized fidelity parameters in use
    pub current_fidelity_parameters: Vec<u8>,
}

impl Default for RequestInfo {
    fn default() -> Self {
        Self {
            package_name: "unknown".to_string(),
            version_code: 0,
            build_version: String::new(),
            fingerprint: String::new(),
            cpu_core_freqs_hz: Vec::new(),
            gles_version_major: 0,
            gles_version_minor: 0,
            total_memory_bytes: 0,
            session_id: new_session_id(),
            tuningfork_version: env!("CARGO_PKG_VERSION").to_string(),
            experiment_id: String::new(),
            current_fidelity_parameters: Vec::new(),
        }
    }
}

/// Random version 4 UUID string
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Body of one upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRequest {
    /// `applications/<package>/apks/<version code>`
    pub name: String,
    /// Device and reporting period
    pub session_context: SessionContext,
    /// One entry per annotation with samples
    #[serde(default)]
    pub telemetry: Vec<Telemetry>,
}

/// Device, SDK and reporting period of a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Device the report came from
    #[serde(default)]
    pub device: DeviceSpec,
    /// Library details
    #[serde(default)]
    pub game_sdk_info: GameSdkInfo,
    /// Span covered by the samples
    pub time_period: TimePeriod,
}

/// Device details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSpec {
    /// OS build version
    pub build_version: String,
    /// Maximum frequency of each CPU core
    pub cpu_core_freqs_hz: Vec<u64>,
    /// Device build fingerprint
    pub fingerprint: String,
    /// OpenGL ES version
    pub gles_version: GlesVersion,
    /// 64-bit integers travel as strings in proto3 JSON
    pub total_memory_bytes: String,
}

/// OpenGL ES version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlesVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
}

/// Library version and session id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSdkInfo {
    /// Session the report belongs to
    pub session_id: String,
    /// Library version
    pub version: String,
}

/// RFC 3339 interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePeriod {
    /// First sample time
    pub start_time: String,
    /// Last sample time
    pub end_time: String,
}

/// Samples recorded under one annotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Annotation, duration and fidelity parameters
    pub context: TelemetryContext,
    /// The samples
    #[serde(default)]
    pub report: TelemetryReport,
}

/// What the samples were recorded under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryContext {
    /// Base64 of the serialized annotation
    #[serde(default)]
    pub annotations: String,
    /// Average time covered by the prongs, e.g. `1.5s`
    pub duration: String,
    /// Fidelity parameters in use
    #[serde(default)]
    pub tuning_parameters: TuningParameters,
}

/// Fidelity parameters in use
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningParameters {
    /// Experiment the fidelity parameters belong to
    pub experiment_id: String,
    /// Base64 of the fidelity parameter bytes
    pub serialized_fidelity_parameters: String,
}

/// Rendering and loading samples of one annotation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    /// Frame-time histograms, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendering: Option<RenderingReport>,
    /// Loading times, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loading: Option<LoadingReport>,
}

/// Frame-time histograms
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderingReport {
    /// One histogram per instrumentation key
    #[serde(default)]
    pub render_time_histogram: Vec<RenderTimeHistogram>,
}

/// Bucket counts for one instrumentation key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderTimeHistogram {
    /// Instrumentation key
    pub instrument_id: u16,
    /// Including both overflow buckets
    #[serde(default)]
    pub counts: Vec<u32>,
}

/// Loading-screen times
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadingReport {
    /// One event per loading annotation
    #[serde(default)]
    pub loading_events: Vec<LoadingEvent>,
}

/// Loading times, raw while the histogram is still choosing its range
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadingEvent {
    /// Raw times while no range is chosen
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times_ms: Vec<u64>,
    /// Bucket counts once the range is fixed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub counts: Vec<u32>,
}

/// Format a time as RFC 3339 UTC with microseconds
pub fn time_to_rfc3339(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp
pub fn rfc3339_to_time(s: &str) -> Result<SystemTime> {
    DateTime::parse_from_rfc3339(s)
        .map(SystemTime::from)
        .map_err(|e| TuningForkError::bad_parameter(format!("Bad timestamp {:?}: {}", s, e)))
}

/// Seconds with at most 9 decimals and no trailing zeros, e.g. `2.5s`
pub fn duration_to_seconds_string(d: Duration) -> String {
    let mut s = format!("{:.9}", d.as_secs_f64());
    if s.contains('.') {
        let trimmed = s.trim_end_matches('0').trim_end_matches('.').len();
        s.truncate(trimmed);
    }
    s.push('s');
    s
}

/// Inverse of [`duration_to_seconds_string`]
pub fn seconds_string_to_duration(s: &str) -> Result<Duration> {
    let secs = s.strip_suffix('s').unwrap_or(s);
    secs.parse::<f64>()
        .ok()
        .and_then(|x| Duration::try_from_secs_f64(x).ok())
        .ok_or_else(|| TuningForkError::bad_parameter(format!("Bad duration {:?}", s)))
}

/// Build and encode telemetry reports
pub struct JsonSerializer;

impl JsonSerializer {
    /// Serialize every non-empty prong of `cache`
    pub fn serialize_event(cache: &ProngCache, info: &RequestInfo) -> Result<String> {
        Ok(serde_json::to_string(&Self::build_request(cache, info))?)
    }

    /// Assemble the report without encoding it
    pub fn build_request(cache: &ProngCache, info: &RequestInfo) -> TelemetryRequest {
        let mut by_annotation: BTreeMap<&[u8], Vec<&Prong>> = BTreeMap::new();
        for prong in cache.prongs().filter(|p| p.count() > 0) {
            by_annotation.entry(prong.annotation()).or_default().push(prong);
        }
        let telemetry = by_annotation
            .into_iter()
            .filter_map(|(annotation, prongs)| telemetry_for(annotation, &prongs, info))
            .collect();

        let (start, end) = cache.time_interval();
        TelemetryRequest {
            name: format!("applications/{}/apks/{}", info.package_name, info.version_code),
            session_context: SessionContext {
                device: DeviceSpec {
                    build_version: info.build_version.clone(),
                    cpu_core_freqs_hz: info.cpu_core_freqs_hz.clone(),
                    fingerprint: info.fingerprint.clone(),
                    gles_version: GlesVersion {
                        major: info.gles_version_major,
                        minor: info.gles_version_minor,
                    },
                    total_memory_bytes: info.total_memory_bytes.to_string(),
                },
                game_sdk_info: GameSdkInfo {
                    session_id: info.session_id.clone(),
                    version: info.tuningfork_version.clone(),
                },
                time_period: TimePeriod {
                    start_time: time_to_rfc3339(start.unwrap_or(UNIX_EPOCH)),
                    end_time: time_to_rfc3339(end.unwrap_or(UNIX_EPOCH)),
                },
            },
            telemetry,
        }
    }
}

fn telemetry_for(annotation: &[u8], prongs: &[&Prong], info: &RequestInfo) -> Option<Telemetry> {
    let mut render_time_histogram = Vec::new();
    let mut loading_events = Vec::new();
    let mut total = Duration::ZERO;
    for prong in prongs {
        let histogram = prong.histogram();
        if prong.is_loading() {
            let event = if histogram.mode() == HistogramMode::Histogram {
                LoadingEvent {
                    times_ms: Vec::new(),
                    counts: histogram.buckets().to_vec(),
                }
            } else {
                LoadingEvent {
                    times_ms: histogram.samples().iter().map(|&ms| ms as u64).collect(),
                    counts: Vec::new(),
                }
            };
            if event.times_ms.is_empty() && event.counts.is_empty() {
                tracing::warn!("Loading prong {:?} has a count but nothing to report", annotation);
                continue;
            }
            loading_events.push(event);
        } else {
            render_time_histogram.push(RenderTimeHistogram {
                instrument_id: prong.instrumentation_key(),
                counts: histogram.buckets().to_vec(),
            });
        }
        total += prong.duration();
    }
    if render_time_histogram.is_empty() && loading_events.is_empty() {
        return None;
    }
    let duration = total / prongs.len() as u32;
    Some(Telemetry {
        context: TelemetryContext {
            annotations: STANDARD.encode(annotation),
            duration: duration_to_seconds_string(duration),
            tuning_parameters: TuningParameters {
                experiment_id: info.experiment_id.clone(),
                serialized_fidelity_parameters: STANDARD.encode(&info.current_fidelity_parameters),
            },
        },
        report: TelemetryReport {
            rendering: (!render_time_histogram.is_empty())
                .then_some(RenderingReport { render_time_histogram }),
            loading: (!loading_events.is_empty()).then_some(LoadingReport { loading_events }),
        },
    })
}

/// Merge a stored report back into `cache`.
///
/// Rendering counts are added bucket by bucket; loading times are replayed
/// as samples. Counts aimed at a histogram that has not fixed its range yet
/// are dropped with a warning, since their bucket boundaries are unknown.
/// Fails without touching later entries on the first entry that does not fit
/// the cache.
pub fn deserialize_and_merge(json: &str, ids: &dyn IdProvider, cache: &mut ProngCache) -> Result<()> {
    let request: TelemetryRequest = serde_json::from_str(json)?;
    tracing::info!("Merging {} stored telemetry entries", request.telemetry.len());

    let period = &request.session_context.time_period;
    cache.ping(rfc3339_to_time(&period.start_time)?);
    cache.ping(rfc3339_to_time(&period.end_time)?);

    for telemetry in &request.telemetry {
        let annotation = STANDARD.decode(&telemetry.context.annotations)?;
        let duration = seconds_string_to_duration(&telemetry.context.duration)?;
        let annotation_id = ids.decode_annotation_serialization(&annotation)?.id;

        if let Some(rendering) = &telemetry.report.rendering {
            for h in rendering.render_time_histogram.iter().filter(|h| !h.counts.is_empty()) {
                let id = ids.make_compound_id(h.instrument_id, annotation_id)?;
                let prong = cache.get(id).ok_or(TuningForkError::ProngNotFound(id))?;
                merge_counts(prong, &h.counts, duration)?;
            }
        }

        if let Some(loading) = &telemetry.report.loading {
            for event in &loading.loading_events {
                // Loading prongs always sit at key index 0
                let prong = cache
                    .get(annotation_id)
                    .filter(|p| p.is_loading())
                    .ok_or(TuningForkError::ProngNotFound(annotation_id))?;
                if !event.counts.is_empty() {
                    merge_counts(prong, &event.counts, duration)?;
                    continue;
                }
                for &ms in &event.times_ms {
                    prong.histogram_mut().add(ms as f64);
                }
                prong.add_duration(duration);
            }
        }
    }
    Ok(())
}

fn merge_counts(prong: &mut Prong, counts: &[u32], duration: Duration) -> Result<()> {
    if prong.histogram().mode() != HistogramMode::Histogram {
        tracing::warn!(
            "Dropping {} stored samples: histogram for {:?} has no fixed range",
            counts.iter().map(|&c| u64::from(c)).sum::<u64>(),
            prong.annotation()
        );
        return Ok(());
    }
    prong.histogram_mut().add_counts(counts)?;
    prong.add_duration(duration);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HistogramSettings, SettingsBuilder};
    use crate::driver::IdMapper;
    use pretty_assertions::assert_eq;

    fn setup() -> (IdMapper, ProngCache) {
        let settings = SettingsBuilder::new()
            .max_instrumentation_keys(1)
            .annotation_enum_size(vec![3, 2])
            .loading_annotation_index(1)
            .histogram(HistogramSettings::new(64000, 10.0, 40.0, 30))
            .build()
            .unwrap();
        let ids = IdMapper::new(&settings);
        ids.registry().get_or_create(64000).unwrap();
        let cache = ProngCache::new(
            ids.num_prongs(),
            1,
            &settings.complete_histograms(),
            |id| ids.serialize_id(id),
            |id| ids.is_loading_id(id),
        );
        (ids, cache)
    }

    #[test]
    fn test_duration_strings() {
        assert_eq!(duration_to_seconds_string(Duration::from_secs(2)), "2s");
        assert_eq!(duration_to_seconds_string(Duration::from_millis(1500)), "1.5s");
        assert_eq!(duration_to_seconds_string(Duration::from_nanos(1)), "0.000000001s");
        assert_eq!(duration_to_seconds_string(Duration::ZERO), "0s");
        assert_eq!(seconds_string_to_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(seconds_string_to_duration("soon").is_err());
        assert!(seconds_string_to_duration("-1s").is_err());
    }

    #[test]
    fn test_rfc3339() {
        let t = UNIX_EPOCH + Duration::from_millis(20);
        assert_eq!(time_to_rfc3339(t), "1970-01-01T00:00:00.020000Z");
        assert_eq!(rfc3339_to_time("1970-01-01T00:00:00.020000Z").unwrap(), t);
    }

    #[test]
    fn test_session_id_shape() {
        let id = new_session_id();
        assert_eq!(id.len(), 36);
        assert_eq!(&id[14..15], "4");
        assert_eq!(Uuid::parse_str(&id).unwrap().get_version_num(), 4);
        assert_ne!(id, new_session_id());
    }

    #[test]
    fn test_empty_cache_has_no_telemetry() {
        let (_, cache) = setup();
        let request = JsonSerializer::build_request(&cache, &RequestInfo::default());
        assert!(request.telemetry.is_empty());
        assert_eq!(request.name, "applications/unknown/apks/0");
    }

    #[test]
    fn test_serialize_groups_by_annotation() {
        let (ids, mut cache) = setup();
        // level 1
        let a = ids.decode_annotation_serialization(&[0x08, 0x01]).unwrap().id;
        cache.get(a).unwrap().trace(Duration::from_millis(20));
        // level 2
        let b = ids.decode_annotation_serialization(&[0x08, 0x02]).unwrap().id;
        cache.get(b).unwrap().trace(Duration::from_millis(30));
        cache.get(b).unwrap().trace(Duration::from_millis(30));

        let request = JsonSerializer::build_request(&cache, &RequestInfo::default());
        assert_eq!(request.telemetry.len(), 2);
        assert_eq!(request.telemetry[0].context.annotations, "CAE=");
        assert_eq!(request.telemetry[0].context.duration, "0.02s");
        assert_eq!(request.telemetry[1].context.annotations, "CAI=");
        let rendering = request.telemetry[1].report.rendering.as_ref().unwrap();
        assert_eq!(rendering.render_time_histogram[0].instrument_id, 64000);
        assert_eq!(rendering.render_time_histogram[0].counts[21], 2);
        assert!(request.telemetry[1].report.loading.is_none());
    }

    #[test]
    fn test_loading_times_reported_raw() {
        let (ids, mut cache) = setup();
        let loading = ids.decode_annotation_serialization(&[0x10, 0x02]).unwrap();
        assert!(loading.loading);
        cache.get(loading.id).unwrap().trace(Duration::from_millis(1234));

        let json = JsonSerializer::serialize_event(&cache, &RequestInfo::default()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let event = &value["telemetry"][0]["report"]["loading"]["loading_events"][0];
        assert_eq!(event["times_ms"], serde_json::json!([1234]));
        assert!(event.get("counts").is_none());
        assert!(value["telemetry"][0]["report"].get("rendering").is_none());
    }

    #[test]
    fn test_merge_restores_counts() {
        let (ids, mut cache) = setup();
        let a = ids.decode_annotation_serialization(&[0x08, 0x03]).unwrap().id;
        for _ in 0..5 {
            cache.get(a).unwrap().trace(Duration::from_millis(25));
        }
        let loading = ids.decode_annotation_serialization(&[0x10, 0x02]).unwrap().id;
        cache.get(loading).unwrap().trace(Duration::from_millis(900));
        cache.ping(UNIX_EPOCH + Duration::from_secs(10));
        let json = JsonSerializer::serialize_event(&cache, &RequestInfo::default()).unwrap();

        let (_, mut restored) = setup();
        deserialize_and_merge(&json, &ids, &mut restored).unwrap();
        assert_eq!(restored.prong(a).unwrap().histogram(), cache.prong(a).unwrap().histogram());
        assert_eq!(restored.prong(a).unwrap().count(), 5);
        assert_eq!(restored.prong(loading).unwrap().histogram().samples(), &[900.0]);
        assert_eq!(
            restored.time_interval().0,
            Some(UNIX_EPOCH + Duration::from_secs(10))
        );
    }

    #[test]
    fn test_bucketed_loading_times_round_trip() {
        let (ids, mut cache) = setup();
        let a = ids.decode_annotation_serialization(&[0x08, 0x01]).unwrap().id;
        for _ in 0..3 {
            cache.get(a).unwrap().trace(Duration::from_millis(20));
        }
        let loading = ids.decode_annotation_serialization(&[0x10, 0x02]).unwrap().id;
        // Enough loading screens for the histogram to pick its range
        for i in 0..200 {
            cache.get(loading).unwrap().trace(Duration::from_millis(1000 + i * 10));
        }
        assert_eq!(cache.prong(loading).unwrap().histogram().mode(), HistogramMode::Histogram);

        let json = JsonSerializer::serialize_event(&cache, &RequestInfo::default()).unwrap();
        let request: TelemetryRequest = serde_json::from_str(&json).unwrap();
        let event = &request.telemetry[1].report.loading.as_ref().unwrap().loading_events[0];
        assert!(event.times_ms.is_empty());
        assert_eq!(event.counts.iter().sum::<u32>(), 200);

        // A fresh loading histogram has no range, so the stored counts cannot
        // be placed; rendering still merges
        let (_, mut restored) = setup();
        deserialize_and_merge(&json, &ids, &mut restored).unwrap();
        assert_eq!(restored.prong(a).unwrap().count(), 3);
        let prong = restored.prong(loading).unwrap();
        assert_eq!(prong.count(), 0);
        assert_eq!(prong.histogram().count(), 0);
        assert_eq!(prong.duration(), Duration::ZERO);

        let again = JsonSerializer::build_request(&restored, &RequestInfo::default());
        assert_eq!(again.telemetry.len(), 1);
        assert!(again.telemetry[0].report.loading.is_none());
        let again = serde_json::to_string(&again).unwrap();
        assert!(!again.contains("{}"));
    }

    #[test]
    fn test_loading_counts_merge_into_ranged_histogram() {
        let (ids, mut cache) = setup();
        let loading = ids.decode_annotation_serialization(&[0x10, 0x02]).unwrap().id;
        for i in 0..200 {
            cache.get(loading).unwrap().trace(Duration::from_millis(1000 + i * 10));
        }
        let json = JsonSerializer::serialize_event(&cache, &RequestInfo::default()).unwrap();

        // Same samples, so the target picks the same range
        let (_, mut restored) = setup();
        for i in 0..200 {
            restored.get(loading).unwrap().trace(Duration::from_millis(1000 + i * 10));
        }
        deserialize_and_merge(&json, &ids, &mut restored).unwrap();
        let histogram = restored.prong(loading).unwrap().histogram();
        assert_eq!(histogram.count(), 400);
        assert_eq!(histogram.buckets().iter().sum::<u32>(), 400);
    }

    #[test]
    fn test_merge_rejects_bad_payloads() {
        let (ids, mut cache) = setup();
        assert!(deserialize_and_merge("not json", &ids, &mut cache).is_err());

        let wrong_buckets = r#"{
            "name": "applications/x/apks/1",
            "session_context": {"time_period": {"start_time": "1970-01-01T00:00:00Z", "end_time": "1970-01-01T00:00:01Z"}},
            "telemetry": [{
                "context": {"annotations": "CAE=", "duration": "1s"},
                "report": {"rendering": {"render_time_histogram": [{"instrument_id": 64000, "counts": [1, 2]}]}}
            }]
        }"#;
        let err = deserialize_and_merge(wrong_buckets, &ids, &mut cache).unwrap_err();
        assert!(matches!(err, TuningForkError::BadParameter(_)));

        let bad_annotation = wrong_buckets.replace("CAE=", "CAk=");
        let err = deserialize_and_merge(&bad_annotation, &ids, &mut cache).unwrap_err();
        assert!(matches!(err, TuningForkError::InvalidAnnotation(_)));
    }
}
