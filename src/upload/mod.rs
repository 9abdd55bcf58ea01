//! Delivery of flushed prong caches.
//!
//! A flush hands the whole cache to the [`UploadThread`], which serializes it
//! and passes the JSON to a [`Backend`] (or to a [`Persister`] when the flush
//! only pauses the session). The cache is then sent back for reuse.

pub mod persist;
pub mod worker;

pub use persist::{FilePersister, MemoryPersister, Persister, HISTOGRAMS_PAUSED};
pub use worker::UploadThread;

use crate::core::{Result, TuningForkError};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Longest log line written by [`DebugBackend`].
pub const DEBUG_CHUNK_LEN: usize = 128;

/// Destination of serialized reports
pub trait Backend: Send {
    /// Deliver one JSON report
    fn process(&mut self, payload: &str) -> Result<()>;
}

/// Logs every report in numbered chunks
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugBackend;

impl Backend for DebugBackend {
    fn process(&mut self, payload: &str) -> Result<()> {
        if payload.is_empty() {
            return Err(TuningForkError::bad_parameter("empty report"));
        }
        let chunks = debug_chunks(payload);
        let n = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            tracing::info!("(TJS{}/{}){}", i + 1, n, chunk);
        }
        Ok(())
    }
}

/// Split on character boundaries into pieces of at most [`DEBUG_CHUNK_LEN`] characters
pub fn debug_chunks(payload: &str) -> Vec<String> {
    let chars: Vec<char> = payload.chars().collect();
    chars.chunks(DEBUG_CHUNK_LEN).map(|c| c.iter().collect()).collect()
}

/// Appends each report as one line of a file
#[derive(Debug)]
pub struct FileBackend {
    file: File,
}

impl FileBackend {
    /// Open `path` for appending, creating it if needed
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl Backend for FileBackend {
    fn process(&mut self, payload: &str) -> Result<()> {
        writeln!(self.file, "{}", payload)
            .map_err(|e| TuningForkError::backend(format!("Failed to write report: {}", e)))
    }
}
