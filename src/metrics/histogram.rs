//! Frame-time histogram with optional auto-ranging.

use crate::core::{HistogramSettings, Result, TuningForkError};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Interior bucket count used when zero is requested.
pub const DEFAULT_NUM_BUCKETS: u32 = 200;

/// Range of an auto-ranged histogram, in standard deviations either side of the mean.
pub const AUTO_RANGE_NUM_STD_DEV: f64 = 3.0;

/// Smallest bucket width an auto-ranged histogram may pick, in milliseconds.
pub const AUTO_RANGE_MIN_BUCKET_WIDTH_MS: f64 = 0.1;

/// How samples are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistogramMode {
    /// Samples go straight into buckets
    Histogram,
    /// Samples are buffered until there are enough to choose a range
    AutoRange,
    /// Samples are kept in a circular buffer and never bucketed
    EventsOnly,
}

/// Bucketed distribution of millisecond samples.
///
/// Bucket 0 and the last bucket catch samples below the start and at or above
/// the end of the range, so there are always two more buckets than requested.
#[derive(Debug, Clone)]
pub struct Histogram {
    mode: HistogramMode,
    start_ms: f64,
    end_ms: f64,
    bucket_width: f64,
    buckets: Vec<u32>,
    samples: Vec<f64>,
    count: usize,
    next_event_index: usize,
}

impl Histogram {
    /// Create a histogram with `num_buckets_between` interior buckets over
    /// `[start_ms, end_ms)`.
    ///
    /// Zero bounds select auto-ranging and `never_bucket` selects a plain
    /// event buffer of `num_buckets_between` entries.
    pub fn new(start_ms: f64, end_ms: f64, num_buckets_between: u32, never_bucket: bool) -> Self {
        let between = if num_buckets_between == 0 {
            DEFAULT_NUM_BUCKETS
        } else {
            num_buckets_between
        } as usize;
        let mode = if never_bucket {
            HistogramMode::EventsOnly
        } else if start_ms == 0.0 && end_ms == 0.0 {
            HistogramMode::AutoRange
        } else {
            HistogramMode::Histogram
        };
        let bucket_width = (end_ms - start_ms) / between as f64;
        let samples = match mode {
            HistogramMode::Histogram => Vec::new(),
            HistogramMode::AutoRange => Vec::with_capacity(between),
            HistogramMode::EventsOnly => vec![0.0; between],
        };
        if mode == HistogramMode::Histogram && bucket_width <= 0.0 {
            tracing::error!("Histogram end ({}) needs to be larger than its start ({})", end_ms, start_ms);
        }
        Self {
            mode,
            start_ms,
            end_ms,
            bucket_width,
            buckets: vec![0; between + 2],
            samples,
            count: 0,
            next_event_index: 0,
        }
    }

    /// Create a histogram from configured settings
    pub fn from_settings(settings: &HistogramSettings, never_bucket: bool) -> Self {
        Self::new(settings.bucket_min, settings.bucket_max, settings.n_buckets, never_bucket)
    }

    /// Record a sample in milliseconds
    pub fn add(&mut self, sample: f64) {
        match self.mode {
            HistogramMode::Histogram => {
                let last = self.buckets.len() - 1;
                let i = ((sample - self.start_ms) / self.bucket_width).floor();
                let index = if i.is_nan() || i < 0.0 {
                    0
                } else if i + 1.0 >= last as f64 {
                    last
                } else {
                    i as usize + 1
                };
                self.buckets[index] += 1;
            },
            HistogramMode::AutoRange => {
                self.samples.push(sample);
                if self.samples.len() >= self.buckets.len() - 2 {
                    self.calc_buckets_from_samples();
                    // The replay above already counted every buffered sample
                    return;
                }
            },
            HistogramMode::EventsOnly => {
                self.samples[self.next_event_index] = sample;
                self.next_event_index = (self.next_event_index + 1) % self.samples.len();
            },
        }
        self.count += 1;
    }

    /// Pick the range from the buffered samples and switch to bucketing.
    ///
    /// Does nothing unless the histogram is auto-ranging with at least one
    /// buffered sample.
    pub fn calc_buckets_from_samples(&mut self) {
        if self.mode != HistogramMode::AutoRange || self.samples.is_empty() {
            return;
        }
        let n = self.samples.len() as f64;
        let (sum, sum2) = self
            .samples
            .iter()
            .fold((0.0, 0.0), |(s, s2), &x| (s + x, s2 + x * x));
        let mean = sum / n;
        // Rounding can push the variance slightly below zero
        let variance = (sum2 / n - mean * mean).max(0.0);
        let spread = AUTO_RANGE_NUM_STD_DEV * variance.sqrt();

        let between = (self.buckets.len() - 2) as f64;
        self.start_ms = if mean > spread { mean - spread } else { 0.0 };
        self.end_ms = mean + spread;
        self.bucket_width = (self.end_ms - self.start_ms) / between;
        if self.bucket_width < AUTO_RANGE_MIN_BUCKET_WIDTH_MS {
            self.bucket_width = AUTO_RANGE_MIN_BUCKET_WIDTH_MS;
            let width = AUTO_RANGE_MIN_BUCKET_WIDTH_MS * between;
            self.start_ms = (mean - width / 2.0).max(0.0);
            self.end_ms = self.start_ms + width;
        }
        tracing::debug!(
            "Auto-ranged histogram to [{:.3}, {:.3}) ms from {} samples",
            self.start_ms,
            self.end_ms,
            self.samples.len()
        );

        self.mode = HistogramMode::Histogram;
        self.count = 0;
        let samples = std::mem::take(&mut self.samples);
        for &s in &samples {
            self.add(s);
        }
        self.samples = samples;
    }

    /// Forget every sample; the mode and range stay as they are
    pub fn clear(&mut self) {
        self.buckets.fill(0);
        if self.mode == HistogramMode::EventsOnly {
            self.samples.fill(0.0);
            self.next_event_index = 0;
        } else {
            self.samples.clear();
        }
        self.count = 0;
    }

    /// Samples added since the last clear
    pub fn count(&self) -> usize {
        self.count
    }

    /// Merge bucket counts from another histogram with the same layout.
    ///
    /// Only a histogram with a fixed range can take counts.
    pub fn add_counts(&mut self, counts: &[u32]) -> Result<()> {
        if self.mode != HistogramMode::Histogram {
            return Err(TuningForkError::bad_parameter(format!(
                "Cannot add counts to a histogram in {:?} mode",
                self.mode
            )));
        }
        if counts.len() != self.buckets.len() {
            return Err(TuningForkError::bad_parameter(format!(
                "{} counts for a histogram with {} buckets",
                counts.len(),
                self.buckets.len()
            )));
        }
        for (bucket, &c) in self.buckets.iter_mut().zip(counts) {
            *bucket = bucket.saturating_add(c);
        }
        self.count += counts.iter().map(|&c| c as usize).sum::<usize>();
        Ok(())
    }

    /// Current mode
    pub fn mode(&self) -> HistogramMode {
        self.mode
    }

    /// Start of the bucketed range
    pub fn start_ms(&self) -> f64 {
        self.start_ms
    }

    /// End of the bucketed range
    pub fn end_ms(&self) -> f64 {
        self.end_ms
    }

    /// Width of each interior bucket
    pub fn bucket_width(&self) -> f64 {
        self.bucket_width
    }

    /// Bucket counts, including both overflow buckets
    pub fn buckets(&self) -> &[u32] {
        &self.buckets
    }

    /// Buffered samples
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Compact JSON rendering for logs and tests.
    ///
    /// Bucketed histograms give the upper edge of each bucket as `pmax`, with
    /// `99999` standing in for the open-ended last bucket.
    pub fn to_debug_json(&self) -> String {
        let mut out = String::new();
        if self.mode != HistogramMode::Histogram {
            let events: Vec<String> = self.samples.iter().map(|s| format!("{:.2}", s)).collect();
            let _ = write!(out, "{{\"events\":[{}]}}", events.join(","));
        } else {
            let mut pmax: Vec<String> = (0..self.buckets.len() - 1)
                .map(|i| format!("{:.2}", self.start_ms + self.bucket_width * i as f64))
                .collect();
            pmax.push("99999".to_string());
            let counts: Vec<String> = self.buckets.iter().map(u32::to_string).collect();
            let _ = write!(out, "{{\"pmax\":[{}],\"cnts\":[{}]}}", pmax.join(","), counts.join(","));
        }
        out
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::from_settings(&HistogramSettings::default(), false)
    }
}

impl PartialEq for Histogram {
    fn eq(&self, other: &Self) -> bool {
        self.buckets == other.buckets && self.samples == other.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_range_bucketing() {
        let mut h = Histogram::new(10.0, 40.0, 30, false);
        assert_eq!(h.buckets().len(), 32);
        h.add(20.0);
        h.add(10.0);
        h.add(39.99);
        assert_eq!(h.buckets()[11], 1);
        assert_eq!(h.buckets()[1], 1);
        assert_eq!(h.buckets()[30], 1);
        assert_eq!(h.count(), 3);
    }

    #[test]
    fn test_out_of_range_goes_to_overflow_buckets() {
        let mut h = Histogram::new(10.0, 40.0, 30, false);
        h.add(9.5);
        h.add(0.0);
        h.add(40.0);
        h.add(1000.0);
        assert_eq!(h.buckets()[0], 2);
        assert_eq!(h.buckets()[31], 2);
        assert_eq!(h.buckets().iter().sum::<u32>(), 4);
    }

    #[test]
    fn test_zero_buckets_uses_default() {
        let h = Histogram::new(0.0, 100.0, 0, false);
        assert_eq!(h.buckets().len(), DEFAULT_NUM_BUCKETS as usize + 2);
    }

    #[test]
    fn test_auto_range_switches_after_buffer_fills() {
        let mut h = Histogram::new(0.0, 0.0, 10, false);
        assert_eq!(h.mode(), HistogramMode::AutoRange);
        for i in 0..9 {
            h.add(15.0 + (i % 3) as f64);
        }
        assert_eq!(h.mode(), HistogramMode::AutoRange);
        assert_eq!(h.count(), 9);

        h.add(16.0);
        assert_eq!(h.mode(), HistogramMode::Histogram);
        assert_eq!(h.count(), 10);
        assert_eq!(h.buckets().iter().sum::<u32>(), 10);
    }

    #[test]
    fn test_auto_range_brackets_three_sigma() {
        let samples = [18.0, 22.0, 19.0, 21.0, 20.0, 20.0, 17.0, 23.0, 20.0, 20.0];
        let mut h = Histogram::new(0.0, 0.0, samples.len() as u32, false);
        for &s in &samples {
            h.add(s);
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let sd = (samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt();
        assert!((h.start_ms() - (mean - 3.0 * sd)).abs() < 1e-9);
        assert!((h.end_ms() - (mean + 3.0 * sd)).abs() < 1e-9);
        assert!(h.bucket_width() >= AUTO_RANGE_MIN_BUCKET_WIDTH_MS);
    }

    #[test]
    fn test_auto_range_constant_samples_hit_min_width() {
        let mut h = Histogram::new(0.0, 0.0, 20, false);
        for _ in 0..20 {
            h.add(16.0);
        }
        assert_eq!(h.bucket_width(), AUTO_RANGE_MIN_BUCKET_WIDTH_MS);
        assert!(h.start_ms() <= 16.0 && h.end_ms() > 16.0);
        assert_eq!(h.count(), 20);
    }

    #[test]
    fn test_auto_range_start_clamped_at_zero() {
        let mut h = Histogram::new(0.0, 0.0, 4, false);
        for s in [0.5, 100.0, 0.5, 100.0] {
            h.add(s);
        }
        assert_eq!(h.start_ms(), 0.0);
    }

    #[test]
    fn test_clear_keeps_computed_range() {
        let mut h = Histogram::new(0.0, 0.0, 5, false);
        for s in [10.0, 11.0, 12.0, 13.0, 14.0] {
            h.add(s);
        }
        let start = h.start_ms();
        h.clear();
        assert_eq!(h.mode(), HistogramMode::Histogram);
        assert_eq!(h.start_ms(), start);
        assert_eq!(h.count(), 0);
        assert!(h.buckets().iter().all(|&c| c == 0));
        assert!(h.samples().is_empty());
    }

    #[test]
    fn test_events_only_is_circular() {
        let mut h = Histogram::new(0.0, 0.0, 3, true);
        for s in [1.0, 2.0, 3.0, 4.0] {
            h.add(s);
        }
        assert_eq!(h.samples(), &[4.0, 2.0, 3.0]);
        assert_eq!(h.count(), 4);

        h.clear();
        assert_eq!(h.samples(), &[0.0, 0.0, 0.0]);
        h.add(5.0);
        assert_eq!(h.samples()[0], 5.0);
    }

    #[test]
    fn test_add_counts() {
        let mut h = Histogram::new(0.0, 10.0, 2, false);
        h.add(1.0);
        h.add_counts(&[1, 0, 2, 3]).unwrap();
        assert_eq!(h.buckets(), &[1, 1, 2, 3]);
        assert_eq!(h.count(), 7);

        let err = h.add_counts(&[1, 2]).unwrap_err();
        assert!(matches!(err, TuningForkError::BadParameter(_)));
        assert_eq!(h.count(), 7);
    }

    #[test]
    fn test_add_counts_needs_a_range() {
        let mut h = Histogram::new(0.0, 0.0, 2, false);
        h.add(1.0);
        let err = h.add_counts(&[1, 0, 2, 3]).unwrap_err();
        assert!(matches!(err, TuningForkError::BadParameter(_)));
        assert_eq!(h.count(), 1);
        assert_eq!(h.buckets(), &[0, 0, 0, 0]);

        // Once the range is chosen the layout is fixed
        h.add(3.0);
        assert_eq!(h.mode(), HistogramMode::Histogram);
        h.add_counts(&[1, 0, 0, 0]).unwrap();
        assert_eq!(h.count(), 3);

        let mut e = Histogram::new(0.0, 0.0, 2, true);
        assert!(e.add_counts(&[0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_debug_json() {
        let mut h = Histogram::new(0.0, 2.0, 2, false);
        h.add(0.5);
        assert_eq!(h.to_debug_json(), r#"{"pmax":[0.00,1.00,2.00,99999],"cnts":[0,1,0,0]}"#);

        let mut e = Histogram::new(0.0, 0.0, 2, true);
        e.add(1.5);
        assert_eq!(e.to_debug_json(), r#"{"events":[1.50,0.00]}"#);
    }

    #[test]
    fn test_equality_ignores_range() {
        let mut a = Histogram::new(0.0, 10.0, 2, false);
        let mut b = Histogram::new(0.0, 20.0, 2, false);
        a.add(1.0);
        b.add(1.0);
        assert_eq!(a, b);
        b.add(1.0);
        assert_ne!(a, b);
    }
}
