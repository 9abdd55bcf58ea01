//! Report serialization.
//!
//! Flushed prong caches are turned into the JSON telemetry request consumed by
//! upload backends, and stored reports can be merged back into a cache.

pub mod json;

pub use json::{deserialize_and_merge, JsonSerializer, RequestInfo, TelemetryRequest};

use crate::core::Result;
use std::io::Write;
use std::path::Path;

/// Write a report to a file, or to stdout when no path is given
pub fn write_output(content: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            let mut file = std::fs::File::create(path)?;
            file.write_all(content.as_bytes())?;
            Ok(())
        },
        None => {
            println!("{}", content);
            Ok(())
        },
    }
}
