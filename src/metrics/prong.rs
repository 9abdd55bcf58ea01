//! Prongs and the fixed-size prong cache.
//!
//! A prong holds the histogram for one (instrumentation key, annotation)
//! pair. The cache allocates every prong up front and addresses them by
//! compound id, so recording a sample never allocates.

use super::histogram::Histogram;
use crate::core::{CompoundId, HistogramSettings, InstrumentationKey, SerializedAnnotation};
use std::time::{Duration, Instant, SystemTime};

/// Histogram for one instrumentation key under one annotation
#[derive(Debug, Clone)]
pub struct Prong {
    instrumentation_key: InstrumentationKey,
    annotation: SerializedAnnotation,
    histogram: Histogram,
    last_time: Option<Instant>,
    duration: Duration,
    loading: bool,
}

impl Prong {
    /// Create an empty prong
    pub fn new(
        instrumentation_key: InstrumentationKey,
        annotation: SerializedAnnotation,
        settings: &HistogramSettings,
        loading: bool,
    ) -> Self {
        Self {
            instrumentation_key,
            annotation,
            histogram: Histogram::from_settings(settings, false),
            last_time: None,
            duration: Duration::ZERO,
            loading,
        }
    }

    /// Record a point in time; the gap since the previous tick becomes a sample
    pub fn tick(&mut self, t: Instant) {
        if let Some(last) = self.last_time {
            self.trace(t.saturating_duration_since(last));
        }
        self.last_time = Some(t);
    }

    /// Record a duration
    pub fn trace(&mut self, dt: Duration) {
        self.histogram.add(dt.as_nanos() as f64 / 1_000_000.0);
        self.duration += dt;
    }

    /// Forget all samples and the last tick
    pub fn clear(&mut self) {
        self.histogram.clear();
        self.last_time = None;
        self.duration = Duration::ZERO;
    }

    /// Samples recorded since the last clear
    pub fn count(&self) -> usize {
        self.histogram.count()
    }

    /// Key reported with this prong
    pub fn instrumentation_key(&self) -> InstrumentationKey {
        self.instrumentation_key
    }

    /// Relabel the prong with its registered key
    pub fn set_instrumentation_key(&mut self, key: InstrumentationKey) {
        self.instrumentation_key = key;
    }

    /// Serialized annotation this prong records under
    pub fn annotation(&self) -> &[u8] {
        &self.annotation
    }

    /// Samples recorded by this prong
    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    /// Mutable access for merging stored counts
    pub fn histogram_mut(&mut self) -> &mut Histogram {
        &mut self.histogram
    }

    /// Sum of every recorded duration
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Add time merged from a stored report
    pub fn add_duration(&mut self, dt: Duration) {
        self.duration += dt;
    }

    /// True for prongs recording loading times
    pub fn is_loading(&self) -> bool {
        self.loading
    }
}

/// Dense table of prongs indexed by compound id.
#[derive(Debug)]
pub struct ProngCache {
    prongs: Vec<Option<Prong>>,
    max_instrumentation_keys: usize,
    start_time: Option<SystemTime>,
    end_time: Option<SystemTime>,
    buffer_index: usize,
}

impl ProngCache {
    /// Allocate `size` slots.
    ///
    /// Slot `i` records key index `i % max_instrumentation_keys` under the
    /// annotation `serialize_id(i)`. Loading annotations only get a slot for
    /// key index 0, with an auto-ranging histogram.
    pub fn new<S, L>(
        size: usize,
        max_instrumentation_keys: usize,
        histogram_settings: &[HistogramSettings],
        serialize_id: S,
        is_loading_id: L,
    ) -> Self
    where
        S: Fn(CompoundId) -> SerializedAnnotation,
        L: Fn(CompoundId) -> bool,
    {
        let max_keys = max_instrumentation_keys.max(1);
        let default_settings = HistogramSettings::default();
        let prongs = (0..size)
            .map(|i| {
                let id = i as CompoundId;
                let key_index = i % max_keys;
                if is_loading_id(id) {
                    if key_index != 0 {
                        return None;
                    }
                    let key = histogram_settings.first().map_or(0, |h| h.instrument_key);
                    let settings = HistogramSettings::new(key, 0.0, 0.0, 0);
                    return Some(Prong::new(key, serialize_id(id), &settings, true));
                }
                let settings = histogram_settings
                    .get(key_index)
                    .or_else(|| histogram_settings.first())
                    .unwrap_or(&default_settings);
                Some(Prong::new(settings.instrument_key, serialize_id(id), settings, false))
            })
            .collect();
        Self {
            prongs,
            max_instrumentation_keys: max_keys,
            start_time: None,
            end_time: None,
            buffer_index: 0,
        }
    }

    /// Tag the cache so callers can tell the two buffers apart
    pub fn with_buffer_index(mut self, index: usize) -> Self {
        self.buffer_index = index;
        self
    }

    /// 0 or 1, set by [`ProngCache::with_buffer_index`]
    pub fn buffer_index(&self) -> usize {
        self.buffer_index
    }

    /// Prong for `id`, or `None` if the id is out of range or unallocated
    pub fn get(&mut self, id: CompoundId) -> Option<&mut Prong> {
        let len = self.prongs.len();
        match usize::try_from(id).ok().and_then(|i| self.prongs.get_mut(i)) {
            Some(Some(prong)) => Some(prong),
            Some(None) => {
                tracing::warn!("No prong allocated for compound id {}", id);
                None
            },
            None => {
                tracing::warn!("Compound id {} out of range ({} prongs)", id, len);
                None
            },
        }
    }

    /// Read-only lookup
    pub fn prong(&self, id: CompoundId) -> Option<&Prong> {
        usize::try_from(id).ok().and_then(|i| self.prongs.get(i)).and_then(Option::as_ref)
    }

    /// Reset every prong and the recorded time interval
    pub fn clear(&mut self) {
        for prong in self.prongs.iter_mut().flatten() {
            prong.clear();
        }
        self.start_time = None;
        self.end_time = None;
    }

    /// Assign the real instrumentation keys to every key index
    pub fn set_instrument_keys(&mut self, keys: &[InstrumentationKey]) {
        let max_keys = self.max_instrumentation_keys;
        for (i, slot) in self.prongs.iter_mut().enumerate() {
            if let (Some(prong), Some(&key)) = (slot.as_mut(), keys.get(i % max_keys)) {
                prong.set_instrumentation_key(key);
            }
        }
    }

    /// Extend the recorded time interval to `t`
    pub fn ping(&mut self, t: SystemTime) {
        if self.start_time.is_none() {
            self.start_time = Some(t);
        }
        self.end_time = Some(t);
    }

    /// First and last ping since the last clear
    pub fn time_interval(&self) -> (Option<SystemTime>, Option<SystemTime>) {
        (self.start_time, self.end_time)
    }

    /// Allocated prongs in compound id order
    pub fn prongs(&self) -> impl Iterator<Item = &Prong> {
        self.prongs.iter().flatten()
    }

    /// Number of slots, allocated or not
    pub fn len(&self) -> usize {
        self.prongs.len()
    }

    /// True for a cache with no slots
    pub fn is_empty(&self) -> bool {
        self.prongs.is_empty()
    }

    /// Slots per annotation
    pub fn max_instrumentation_keys(&self) -> usize {
        self.max_instrumentation_keys
    }
}
