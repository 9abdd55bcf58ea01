//! Optional process-wide session.
//!
//! Code that cannot thread a [`TuningFork`] handle through to its frame loop
//! can install one here and use the free functions instead. Every call takes
//! a lock, so the owned handle remains the better choice on hot paths.

use crate::core::{AnnotationId, InstrumentationKey, Result, TraceHandle, TuningForkError};
use crate::driver::{TuningFork, TuningForkBuilder};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::time::Duration;

static INSTANCE: Lazy<Mutex<Option<TuningFork>>> = Lazy::new(|| Mutex::new(None));

/// Build and install the global session
pub fn init(builder: TuningForkBuilder) -> Result<()> {
    let mut instance = INSTANCE.lock();
    if instance.is_some() {
        return Err(TuningForkError::AlreadyInitialized);
    }
    *instance = Some(builder.build()?);
    Ok(())
}

/// Remove the global session and stop its upload thread
pub fn destroy() -> Result<()> {
    let taken = INSTANCE.lock().take();
    match taken {
        Some(tf) => {
            drop(tf);
            Ok(())
        },
        None => Err(TuningForkError::NotInitialized),
    }
}

/// True while a global session is running
pub fn is_initialized() -> bool {
    INSTANCE.lock().is_some()
}

/// Run `f` against the global session
pub fn with<R>(f: impl FnOnce(&mut TuningFork) -> Result<R>) -> Result<R> {
    let mut instance = INSTANCE.lock();
    let tf = instance.as_mut().ok_or(TuningForkError::NotInitialized)?;
    f(tf)
}

/// See [`TuningFork::set_current_annotation`]
pub fn set_current_annotation(ser: &[u8]) -> Result<AnnotationId> {
    with(|tf| tf.set_current_annotation(ser))
}

/// See [`TuningFork::frame_tick`]
pub fn frame_tick(key: InstrumentationKey) -> Result<()> {
    with(|tf| tf.frame_tick(key))
}

/// See [`TuningFork::frame_delta_time`]
pub fn frame_delta_time(key: InstrumentationKey, dt: Duration) -> Result<()> {
    with(|tf| tf.frame_delta_time(key, dt))
}

/// See [`TuningFork::start_trace`]
pub fn start_trace(key: InstrumentationKey) -> Result<TraceHandle> {
    with(|tf| tf.start_trace(key))
}

/// See [`TuningFork::end_trace`]
pub fn end_trace(handle: TraceHandle) -> Result<()> {
    with(|tf| tf.end_trace(handle))
}

/// Upload the active cache now
pub fn flush() -> Result<()> {
    with(TuningFork::flush)
}

/// See [`TuningFork::set_fidelity_parameters`]
pub fn set_fidelity_parameters(params: Vec<u8>, experiment_id: &str) -> Result<()> {
    with(|tf| {
        tf.set_fidelity_parameters(params, experiment_id);
        Ok(())
    })
}

/// See [`TuningFork::set_upload_callback`]
pub fn set_upload_callback<F>(callback: F) -> Result<()>
where
    F: Fn(&str) + Send + Sync + 'static,
{
    with(|tf| {
        tf.set_upload_callback(callback);
        Ok(())
    })
}
