//! Echo suppression for the watcher.
//!
//! Every file the device service writes on behalf of the database comes back
//! through the watcher a moment later. The service marks the path before
//! writing; the watcher consumes the mark and skips the event instead of
//! re-importing the file.
//!
//! Marks expire after [`ECHO_TTL`] so that a watcher event which never
//! arrives cannot swallow a later edit made by the user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const ECHO_TTL: Duration = Duration::from_secs(5);

/// Paths recently written by the service, keyed by absolute path.
#[derive(Clone, Default)]
pub struct EchoTracker {
    written: Arc<Mutex<HashMap<String, Instant>>>,
}

impl EchoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.written.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Call before writing `path` to disk.
    pub fn mark_written(&self, path: &str) {
        self.lock().insert(path.to_string(), Instant::now());
    }

    /// True once for a marked path, false after the mark expired.
    pub fn consume(&self, path: &str) -> bool {
        match self.lock().remove(path) {
            Some(at) => at.elapsed() < ECHO_TTL,
            None => false,
        }
    }

    /// Drop expired marks.
    pub fn cleanup_expired(&self) {
        self.lock().retain(|_, at| at.elapsed() < ECHO_TTL);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
