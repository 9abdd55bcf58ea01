//! The aggregation driver.
//!
//! [`TuningFork`] is called from the game thread on every frame. It turns the
//! current annotation and an instrumentation key into a compound id, records
//! the sample in the active [`ProngCache`] and, when the submission policy
//! says so, swaps in the spare cache and hands the full one to the
//! [`UploadThread`].

pub mod ids;

pub use ids::{IdMapper, IdProvider, InstrumentKeyRegistry};

use crate::annotation::descriptor::{human_readable_annotation, AnnotationDescriptor};
use crate::core::{
    AnnotationId, CompoundId, InstrumentationKey, Result, Settings, Submission, SystemClock,
    TimeProvider, TraceHandle, TuningForkError,
};
use crate::export::{deserialize_and_merge, RequestInfo};
use crate::metrics::ProngCache;
use crate::upload::worker::{UploadCallback, UploadStats};
use crate::upload::{
    Backend, DebugBackend, FilePersister, MemoryPersister, Persister, UploadThread,
    HISTOGRAMS_PAUSED,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Builder for [`TuningFork`]
pub struct TuningForkBuilder {
    settings: Settings,
    backend: Option<Box<dyn Backend>>,
    persister: Option<Arc<dyn Persister>>,
    time_provider: Option<Arc<dyn TimeProvider>>,
    request_info: RequestInfo,
    upload_callback: Option<UploadCallback>,
}

impl TuningForkBuilder {
    /// Start from `settings` with default backend, persister and clock
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            backend: None,
            persister: None,
            time_provider: None,
            request_info: RequestInfo::default(),
            upload_callback: None,
        }
    }

    /// Where reports go; defaults to [`DebugBackend`]
    pub fn backend<B: Backend + 'static>(mut self, backend: B) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Storage for paused reports; defaults to a [`FilePersister`] in the
    /// configured persistence directory, or memory
    pub fn persister(mut self, persister: Arc<dyn Persister>) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Clock; defaults to [`SystemClock`]
    pub fn time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = Some(time_provider);
        self
    }

    /// Device and session details sent with every report
    pub fn request_info(mut self, request_info: RequestInfo) -> Self {
        self.request_info = request_info;
        self
    }

    /// Called with the JSON of every uploaded report
    pub fn upload_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.upload_callback = Some(Arc::new(callback));
        self
    }

    /// Validate the settings, allocate both caches and start the upload thread
    pub fn build(self) -> Result<TuningFork> {
        let mut settings = self.settings;
        // Kept for human-readable annotation logging
        let descriptor = settings.load_annotation_descriptor()?;
        if let Some(descriptor) = &descriptor {
            settings.apply_annotation_descriptor(descriptor);
        }
        settings.validate()?;

        let strategy = &settings.aggregation_strategy;
        tracing::info!(
            "Tuning Fork settings: method {:?}, interval/count {}, {} keys, enum sizes {:?}, {} histograms",
            strategy.method,
            strategy.intervalms_or_count,
            strategy.max_instrumentation_keys,
            strategy.annotation_enum_size,
            settings.histograms.len()
        );

        let persister: Arc<dyn Persister> = match (self.persister, &settings.upload.persistence_dir) {
            (Some(persister), _) => persister,
            (None, Some(dir)) => Arc::new(FilePersister::new(dir)?),
            (None, None) => Arc::new(MemoryPersister::new()),
        };
        let time = self.time_provider.unwrap_or_else(|| Arc::new(SystemClock));
        let backend = self.backend.unwrap_or_else(|| Box::new(DebugBackend));

        let ids = IdMapper::new(&settings);
        let max_keys = strategy.max_instrumentation_keys as usize;
        // Configured keys take the key index of their histogram settings
        for h in settings.histograms.iter().take(max_keys) {
            ids.registry().get_or_create(h.instrument_key)?;
        }
        let histograms = settings.complete_histograms();
        for (i, h) in histograms.iter().enumerate() {
            tracing::debug!(
                "Key index {}: key {} [{}, {}) ms in {} buckets",
                i,
                h.instrument_key,
                h.bucket_min,
                h.bucket_max,
                h.n_buckets
            );
        }

        let num_prongs = ids.num_prongs();
        let new_cache = |index: usize| {
            ProngCache::new(
                num_prongs,
                max_keys,
                &histograms,
                |id| ids.serialize_id(id),
                |id| ids.is_loading_id(id),
            )
            .with_buffer_index(index)
        };
        let mut active = new_cache(0);
        let spare = new_cache(1);

        let upload = UploadThread::start(
            backend,
            Arc::clone(&persister),
            self.request_info,
            settings.upload.wait_timeout,
        )?;
        upload.set_upload_callback(self.upload_callback);

        merge_paused_histograms(persister.as_ref(), &ids, &mut active);

        let last_submit_time = time.now();
        tracing::info!("Tuning Fork initialized with {} prongs per cache", num_prongs);
        Ok(TuningFork {
            settings,
            ids,
            descriptor,
            time,
            active,
            spare: Some(spare),
            upload,
            current_annotation_id: 0,
            loading_start: None,
            last_submit_time,
            live_traces: vec![None; num_prongs],
        })
    }
}

/// Fold a report stored by an earlier pause into `cache`, then drop it
fn merge_paused_histograms(persister: &dyn Persister, ids: &IdMapper, cache: &mut ProngCache) {
    let stored = match persister.get(HISTOGRAMS_PAUSED) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("Could not read paused histograms: {}", e);
            return;
        },
    };
    match String::from_utf8(stored) {
        Ok(json) => match deserialize_and_merge(&json, ids, cache) {
            Ok(()) => tracing::info!("Merged paused histograms"),
            Err(e) => tracing::warn!("Discarding paused histograms: {}", e),
        },
        Err(e) => tracing::warn!("Paused histograms are not UTF-8: {}", e),
    }
    if let Err(e) = persister.remove(HISTOGRAMS_PAUSED) {
        tracing::warn!("Could not remove paused histograms: {}", e);
    }
}

/// Frame-time aggregation session.
///
/// Two prong caches alternate: the active one takes samples while the other
/// is either idle or owned by the upload thread.
pub struct TuningFork {
    settings: Settings,
    ids: IdMapper,
    descriptor: Option<AnnotationDescriptor>,
    time: Arc<dyn TimeProvider>,
    active: ProngCache,
    spare: Option<ProngCache>,
    upload: UploadThread,
    current_annotation_id: AnnotationId,
    loading_start: Option<Instant>,
    last_submit_time: Instant,
    live_traces: Vec<Option<Instant>>,
}

impl TuningFork {
    /// Shorthand for [`TuningForkBuilder::new`]
    pub fn builder(settings: Settings) -> TuningForkBuilder {
        TuningForkBuilder::new(settings)
    }

    /// Switch the annotation used by later ticks and traces.
    ///
    /// Leaving a loading annotation records the loading time under it. On a
    /// decode error the current annotation falls back to the empty one and
    /// any loading screen in progress is abandoned.
    pub fn set_current_annotation(&mut self, ser: &[u8]) -> Result<AnnotationId> {
        let decoded = match self.ids.decode_annotation_serialization(ser) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("Error setting annotation of size {}: {}", ser.len(), e);
                if self.loading_start.take().is_some() {
                    tracing::debug!("Abandoning loading time of annotation {}", self.current_annotation_id);
                }
                self.current_annotation_id = 0;
                return Err(e);
            },
        };

        match self.loading_start {
            Some(start) if !decoded.loading => {
                let dt = self.time.now().saturating_duration_since(start);
                self.trace_compound(self.current_annotation_id, dt);
                tracing::info!(
                    "Scene loading {} took {} ms",
                    self.current_annotation_id,
                    dt.as_millis()
                );
                self.loading_start = None;
            },
            None if decoded.loading => {
                self.loading_start = Some(self.time.now());
            },
            _ => {},
        }

        if let Some(descriptor) = &self.descriptor {
            tracing::debug!(
                "Set annotation {} ({})",
                decoded.id,
                human_readable_annotation(ser, descriptor)
            );
        } else {
            tracing::trace!("Set annotation id to {}", decoded.id);
        }
        self.current_annotation_id = decoded.id;
        Ok(decoded.id)
    }

    /// Record a tick for `key`; consecutive ticks give the frame time
    pub fn frame_tick(&mut self, key: InstrumentationKey) -> Result<()> {
        if self.is_loading() {
            return Ok(());
        }
        let id = self.make_compound_id(key)?;
        self.active.ping(self.time.system_now());
        let t = self.time.now();
        let count = match self.active.get(id) {
            Some(prong) => {
                prong.tick(t);
                prong.count()
            },
            None => return Err(TuningForkError::ProngNotFound(id)),
        };
        self.check_for_submit(t, count);
        Ok(())
    }

    /// Record a frame time measured by the caller
    pub fn frame_delta_time(&mut self, key: InstrumentationKey, dt: Duration) -> Result<()> {
        if self.is_loading() {
            return Ok(());
        }
        let id = self.make_compound_id(key)?;
        self.active.ping(self.time.system_now());
        let count = self
            .trace_compound(id, dt)
            .ok_or(TuningForkError::ProngNotFound(id))?;
        self.check_for_submit(self.time.now(), count);
        Ok(())
    }

    /// Start timing a segment for `key` under the current annotation
    pub fn start_trace(&mut self, key: InstrumentationKey) -> Result<TraceHandle> {
        let handle = self.make_compound_id(key)?;
        if self.is_loading() {
            return Ok(handle);
        }
        let slot = usize::try_from(handle)
            .ok()
            .and_then(|i| self.live_traces.get_mut(i))
            .ok_or(TuningForkError::ProngNotFound(handle))?;
        *slot = Some(self.time.now());
        Ok(handle)
    }

    /// Finish the segment started with `handle`
    pub fn end_trace(&mut self, handle: TraceHandle) -> Result<()> {
        if self.is_loading() {
            return Ok(());
        }
        let start = usize::try_from(handle)
            .ok()
            .and_then(|i| self.live_traces.get_mut(i))
            .and_then(Option::take)
            .ok_or(TuningForkError::InvalidTraceHandle(handle))?;
        let dt = self.time.now().saturating_duration_since(start);
        self.trace_compound(handle, dt)
            .ok_or(TuningForkError::ProngNotFound(handle))?;
        Ok(())
    }

    /// Upload everything recorded so far
    pub fn flush(&mut self) -> Result<()> {
        self.flush_at(self.time.now(), true)
    }

    /// Store everything recorded so far for the next session instead of uploading
    pub fn flush_to_persister(&mut self) -> Result<()> {
        self.flush_at(self.time.now(), false)
    }

    /// Swap caches and hand the full one to the upload thread.
    ///
    /// Fails with [`TuningForkError::PreviousUploadPending`] while the upload
    /// thread still owns the other cache; the active cache then keeps its
    /// samples.
    pub fn flush_at(&mut self, t: Instant, upload: bool) -> Result<()> {
        tracing::debug!("Flush (upload: {})", upload);
        self.active.set_instrument_keys(&self.ids.registry().keys());
        if self.spare.is_none() {
            self.spare = self.upload.try_reclaim();
        }
        let result = match self.spare.take() {
            None => Err(TuningForkError::PreviousUploadPending),
            Some(mut next) => {
                next.clear();
                let full = std::mem::replace(&mut self.active, next);
                match self.upload.submit(full, upload) {
                    Ok(()) => Ok(()),
                    Err(full) => {
                        self.spare = Some(std::mem::replace(&mut self.active, full));
                        Err(TuningForkError::UploadThreadStopped)
                    },
                }
            },
        };
        if upload {
            self.last_submit_time = t;
        }
        result
    }

    /// Wait up to `timeout` for the upload thread to give back its cache
    pub fn wait_for_upload(&mut self, timeout: Duration) -> bool {
        if self.spare.is_none() {
            self.spare = self.upload.reclaim_timeout(timeout);
        }
        self.spare.is_some()
    }

    /// Replace the upload callback of a running session
    pub fn set_upload_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.upload.set_upload_callback(Some(Arc::new(callback)));
    }

    /// Fidelity parameters and experiment reported with later uploads
    pub fn set_fidelity_parameters(&self, params: Vec<u8>, experiment_id: impl Into<String>) {
        self.upload.set_fidelity_parameters(params, experiment_id.into());
    }

    /// `key_index + current annotation id`, registering `key` if needed
    pub fn make_compound_id(&self, key: InstrumentationKey) -> Result<CompoundId> {
        self.ids.make_compound_id(key, self.current_annotation_id)
    }

    /// True between entering and leaving a loading annotation
    pub fn is_loading(&self) -> bool {
        self.loading_start.is_some()
    }

    /// Id of the annotation set last, scaled by the key limit
    pub fn current_annotation_id(&self) -> AnnotationId {
        self.current_annotation_id
    }

    /// Cache taking samples right now
    pub fn active_cache(&self) -> &ProngCache {
        &self.active
    }

    /// Which of the two caches is taking samples
    pub fn active_cache_index(&self) -> usize {
        self.active.buffer_index()
    }

    /// Settings after validation and descriptor lookup
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Annotation and key mapping of this session
    pub fn ids(&self) -> &IdMapper {
        &self.ids
    }

    /// Upload counters since start-up
    pub fn upload_stats(&self) -> UploadStats {
        self.upload.stats()
    }

    fn trace_compound(&mut self, id: CompoundId, dt: Duration) -> Option<usize> {
        let prong = self.active.get(id)?;
        prong.trace(dt);
        Some(prong.count())
    }

    fn should_submit(&self, t: Instant, count: usize) -> bool {
        let strategy = &self.settings.aggregation_strategy;
        let threshold = strategy.intervalms_or_count;
        match strategy.method {
            Submission::TimeBased => {
                t.saturating_duration_since(self.last_submit_time)
                    >= Duration::from_millis(u64::from(threshold))
            },
            Submission::TickBased => count >= threshold as usize,
        }
    }

    fn check_for_submit(&mut self, t: Instant, count: usize) {
        if self.should_submit(t, count) {
            if let Err(e) = self.flush_at(t, true) {
                tracing::debug!("Submission skipped: {}", e);
            }
        }
    }
}
