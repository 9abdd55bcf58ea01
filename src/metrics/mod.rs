//! Sample aggregation.
//!
//! - [`Histogram`]: fixed-range, auto-ranging or event-buffer distributions
//! - [`Prong`]: one histogram per (instrumentation key, annotation)
//! - [`ProngCache`]: the preallocated table of prongs written on every frame

pub mod histogram;
pub mod prong;

pub use histogram::{Histogram, HistogramMode, DEFAULT_NUM_BUCKETS};
pub use prong::{Prong, ProngCache};
