//! Key-value storage for reports that could not be uploaded yet.

use crate::core::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Key of the report stored by a flush without upload
pub const HISTOGRAMS_PAUSED: u64 = 0x5446_0001;

/// Byte storage addressed by `u64` keys
pub trait Persister: Send + Sync {
    /// Stored bytes, or `None` if nothing is stored under `key`
    fn get(&self, key: u64) -> Result<Option<Vec<u8>>>;
    /// Store `value`, replacing whatever was there
    fn set(&self, key: u64, value: &[u8]) -> Result<()>;
    /// Removing a missing key is not an error
    fn remove(&self, key: u64) -> Result<()>;
}

/// Process-local persister, lost on exit
#[derive(Debug, Default)]
pub struct MemoryPersister {
    values: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemoryPersister {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn get(&self, key: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().get(&key).cloned())
    }

    fn set(&self, key: u64, value: &[u8]) -> Result<()> {
        self.values.lock().insert(key, value.to_vec());
        Ok(())
    }

    fn remove(&self, key: u64) -> Result<()> {
        self.values.lock().remove(&key);
        Ok(())
    }
}

/// One file per key inside a directory
#[derive(Debug, Clone)]
pub struct FilePersister {
    dir: PathBuf,
}

impl FilePersister {
    /// Use `dir`, creating it if needed
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, key: u64) -> PathBuf {
        self.dir.join(format!("{:016x}.bin", key))
    }
}

impl Persister for FilePersister {
    fn get(&self, key: u64) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: u64, value: &[u8]) -> Result<()> {
        // Readers only ever see a complete file
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!("Stored {} bytes at {:?}", value.len(), path);
        Ok(())
    }

    fn remove(&self, key: u64) -> Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
