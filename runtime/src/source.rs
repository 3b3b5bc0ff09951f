//! Process-wide override of ambient wall-clock time.
//!
//! Subsystems that need "the current date" call [now] instead of [SystemTime::now]. When a
//! [TimeSource] is installed (typically the [crate::VirtualClock] of a domain created with
//! `override_time_source`), they observe the virtual timeline instead.

use crate::Error;
use std::{
    sync::{Arc, RwLock},
    time::SystemTime,
};
use tracing::debug;

/// Anything that can report the current wall-clock time.
pub trait TimeSource: Send + Sync {
    /// Returns the current wall-clock time according to this source.
    fn current(&self) -> SystemTime;
}

static OVERRIDE: RwLock<Option<Arc<dyn TimeSource>>> = RwLock::new(None);

/// Returns the current wall-clock time, honoring any installed override.
pub fn now() -> SystemTime {
    // Release the lock before consulting the source
    let source = OVERRIDE.read().unwrap().clone();
    match source {
        Some(source) => source.current(),
        None => SystemTime::now(),
    }
}

/// Returns whether an override is currently installed.
pub fn is_overridden() -> bool {
    OVERRIDE.read().unwrap().is_some()
}

/// Install `source` as the process-wide time source until the returned guard is dropped.
///
/// Only one override may be installed at a time.
pub fn install(source: Arc<dyn TimeSource>) -> Result<OverrideGuard, Error> {
    let mut current = OVERRIDE.write().unwrap();
    if current.is_some() {
        return Err(Error::OverrideInstalled);
    }
    *current = Some(source);
    debug!("installed time source override");
    Ok(OverrideGuard { _private: () })
}

/// Removes the installed override when dropped.
#[must_use = "the override is removed as soon as the guard is dropped"]
pub struct OverrideGuard {
    _private: (),
}

impl Drop for OverrideGuard {
    fn drop(&mut self) {
        // Avoid a double panic if a test failed while holding the lock
        let mut current = match OVERRIDE.write() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = None;
        debug!("removed time source override");
    }
}

/// Serializes tests that touch the process-wide override.
#[cfg(test)]
pub(crate) fn serial() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
