//! Background upload worker.
//!
//! Ownership of a flushed [`ProngCache`] moves to the worker through a
//! bounded channel and comes back through a second one once the report has
//! been delivered. The driver can therefore never write to a cache the worker
//! is reading.

use super::persist::{Persister, HISTOGRAMS_PAUSED};
use super::Backend;
use crate::core::Result;
use crate::export::{JsonSerializer, RequestInfo};
use crate::metrics::ProngCache;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Called with every serialized report before it is delivered
pub type UploadCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct UploadJob {
    cache: ProngCache,
    upload: bool,
}

/// State the driver may change while the worker runs
struct Shared {
    request_info: Mutex<RequestInfo>,
    callback: Mutex<Option<UploadCallback>>,
    uploads: AtomicU64,
    persisted: AtomicU64,
    failures: AtomicU64,
}

/// Worker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    /// Reports accepted by the backend
    pub uploads: u64,
    /// Reports written to the persister
    pub persisted: u64,
    /// Reports that failed to serialize, upload or persist
    pub failures: u64,
}

/// Handle to the upload thread
pub struct UploadThread {
    jobs: Sender<UploadJob>,
    returned: Receiver<ProngCache>,
    shared: Arc<Shared>,
    quit: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UploadThread {
    /// Spawn the worker. `wait_timeout` bounds how long it takes to notice a stop.
    pub fn start(
        backend: Box<dyn Backend>,
        persister: Arc<dyn Persister>,
        request_info: RequestInfo,
        wait_timeout: Duration,
    ) -> Result<Self> {
        let (jobs, job_rx) = bounded::<UploadJob>(1);
        let (return_tx, returned) = bounded::<ProngCache>(1);
        let shared = Arc::new(Shared {
            request_info: Mutex::new(request_info),
            callback: Mutex::new(None),
            uploads: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });
        let quit = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            backend,
            persister,
            shared: Arc::clone(&shared),
        };
        let worker_quit = Arc::clone(&quit);
        let handle = std::thread::Builder::new()
            .name("tuningfork-upload".to_string())
            .spawn(move || worker.run(job_rx, return_tx, worker_quit, wait_timeout))?;

        Ok(Self {
            jobs,
            returned,
            shared,
            quit,
            handle: Some(handle),
        })
    }

    /// Hand a cache to the worker.
    ///
    /// Gives the cache back if the worker is busy or gone.
    pub fn submit(&self, cache: ProngCache, upload: bool) -> std::result::Result<(), ProngCache> {
        match self.jobs.try_send(UploadJob { cache, upload }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err(job.cache),
            Err(TrySendError::Disconnected(job)) => {
                tracing::error!("Upload thread has stopped");
                Err(job.cache)
            },
        }
    }

    /// A processed cache, if one is waiting
    pub fn try_reclaim(&self) -> Option<ProngCache> {
        self.returned.try_recv().ok()
    }

    /// Wait up to `timeout` for a processed cache
    pub fn reclaim_timeout(&self, timeout: Duration) -> Option<ProngCache> {
        self.returned.recv_timeout(timeout).ok()
    }

    /// Replace or remove the callback run after every upload
    pub fn set_upload_callback(&self, callback: Option<UploadCallback>) {
        *self.shared.callback.lock() = callback;
    }

    /// Record the fidelity parameters reported with every following upload
    pub fn set_fidelity_parameters(&self, params: Vec<u8>, experiment_id: String) {
        let mut info = self.shared.request_info.lock();
        info.current_fidelity_parameters = params;
        info.experiment_id = experiment_id;
    }

    /// Snapshot of the details sent with reports
    pub fn request_info(&self) -> RequestInfo {
        self.shared.request_info.lock().clone()
    }

    /// Counters of uploads, persisted reports and failures
    pub fn stats(&self) -> UploadStats {
        UploadStats {
            uploads: self.shared.uploads.load(Ordering::Relaxed),
            persisted: self.shared.persisted.load(Ordering::Relaxed),
            failures: self.shared.failures.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker after it has processed any submitted cache
    pub fn stop(&mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Upload thread panicked");
            }
        }
    }
}

impl Drop for UploadThread {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    backend: Box<dyn Backend>,
    persister: Arc<dyn Persister>,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(
        mut self,
        jobs: Receiver<UploadJob>,
        returned: Sender<ProngCache>,
        quit: Arc<AtomicBool>,
        wait_timeout: Duration,
    ) {
        tracing::debug!("Upload thread started");
        while !quit.load(Ordering::Acquire) {
            match jobs.recv_timeout(wait_timeout) {
                Ok(job) => self.finish(job, &returned),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        while let Ok(job) = jobs.try_recv() {
            self.finish(job, &returned);
        }
        tracing::debug!("Upload thread stopped");
    }

    fn finish(&mut self, job: UploadJob, returned: &Sender<ProngCache>) {
        self.process(&job);
        // The driver may already be gone
        let _ = returned.try_send(job.cache);
    }

    fn process(&mut self, job: &UploadJob) {
        let info = self.shared.request_info.lock().clone();
        let json = match JsonSerializer::serialize_event(&job.cache, &info) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize report: {}", e);
                self.shared.failures.fetch_add(1, Ordering::Relaxed);
                return;
            },
        };

        let callback = self.shared.callback.lock().clone();
        if let Some(callback) = callback {
            callback(&json);
        }

        let result = if job.upload {
            self.backend.process(&json).map(|()| &self.shared.uploads)
        } else {
            self.persister
                .set(HISTOGRAMS_PAUSED, json.as_bytes())
                .map(|()| &self.shared.persisted)
        };
        match result {
            Ok(counter) => {
                counter.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Delivered {} byte report (upload: {})", json.len(), job.upload);
            },
            Err(e) => {
                self.shared.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Report delivery failed: {}", e);
            },
        }
    }
}
