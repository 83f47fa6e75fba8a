//! Progress reporters for batch jobs (imports, re-encryption sweeps,
//! protocol transfers). Counters are incremental: `progress(n)` adds `n`.

use crate::events::{now_millis, EventBus, ProgressKind, VaultEvent};
use std::sync::{Arc, Mutex};
use web_time::Instant;

pub trait Reporter: Send + Sync {
    /// Reset counters and restart the clock.
    fn start(&self);

    /// Add `loaded` finished items, optionally replacing the total.
    fn progress(&self, loaded: usize, total: Option<usize>);

    fn increase_total(&self, total: usize);

    /// Count items that were skipped as unsupported.
    fn unsupported(&self, _count: usize) {}

    /// Emit the completion event and reset.
    fn done(&self);
}

struct Counters {
    loaded: usize,
    total: usize,
    unsupported: usize,
    started: Instant,
}

impl Counters {
    fn new() -> Self {
        Self {
            loaded: 0,
            total: 0,
            unsupported: 0,
            started: Instant::now(),
        }
    }

    fn reset(&mut self) {
        self.loaded = 0;
        self.total = 0;
        self.unsupported = 0;
    }

    fn advance(&mut self, loaded: usize, total: Option<usize>) {
        if let Some(total) = total {
            self.total = total;
        }
        self.loaded += loaded;
    }

    /// Progress event with the estimate extrapolated from the rate so far.
    fn progress_event(&self, vault_id: &str, kind: ProgressKind) -> VaultEvent {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let remaining_ms = if self.loaded == 0 {
            0
        } else {
            let left = self.total.saturating_sub(self.loaded) as u64;
            (elapsed_ms * left).div_ceil(self.loaded as u64)
        };
        VaultEvent::Progress {
            vault_id: vault_id.to_string(),
            kind,
            total: self.total,
            loaded: self.loaded,
            time_remaining: remaining_ms.div_ceil(1000),
            time_elapsed: elapsed_ms / 1000,
            timestamp: now_millis(),
        }
    }

    fn complete_event(&self, vault_id: &str, kind: ProgressKind) -> VaultEvent {
        VaultEvent::Complete {
            vault_id: vault_id.to_string(),
            kind,
            total: self.total,
            loaded: self.loaded,
            unsupported: self.unsupported,
            timestamp: now_millis(),
        }
    }
}

/// Shared body of the reporters below.
struct Progress {
    vault_id: String,
    kind: ProgressKind,
    events: Arc<EventBus>,
    counters: Mutex<Counters>,
}

impl Progress {
    fn new(events: Arc<EventBus>, vault_id: &str, kind: ProgressKind) -> Self {
        Self {
            vault_id: vault_id.to_string(),
            kind,
            events,
            counters: Mutex::new(Counters::new()),
        }
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start(&self) {
        let mut counters = self.counters();
        counters.reset();
        counters.started = Instant::now();
    }

    fn increase_total(&self, total: usize) {
        self.counters().total += total;
    }

    /// Advance and build the event; `None` when nothing should be emitted.
    fn advance(&self, loaded: usize, total: Option<usize>, skip_empty: bool) -> Option<VaultEvent> {
        let mut counters = self.counters();
        counters.advance(loaded, total);
        if skip_empty && counters.loaded == 0 {
            return None;
        }
        Some(counters.progress_event(&self.vault_id, self.kind))
    }

    fn emit(&self, event: Option<VaultEvent>) {
        if let Some(event) = event {
            self.events.emit(event);
        }
    }
}

/// Reports file imports from the device.
pub struct DeviceReporter {
    inner: Progress,
}

impl DeviceReporter {
    pub fn new(events: Arc<EventBus>, vault_id: &str) -> Self {
        Self {
            inner: Progress::new(events, vault_id, ProgressKind::Import),
        }
    }
}

impl Reporter for DeviceReporter {
    fn start(&self) {
        self.inner.start();
    }

    fn progress(&self, loaded: usize, total: Option<usize>) {
        let event = self.inner.advance(loaded, total, false);
        self.inner.emit(event);
    }

    fn increase_total(&self, total: usize) {
        self.inner.increase_total(total);
    }

    fn unsupported(&self, count: usize) {
        self.inner.counters().unsupported += count;
    }

    fn done(&self) {
        let event = {
            let mut counters = self.inner.counters();
            let event = counters.complete_event(&self.inner.vault_id, self.inner.kind);
            counters.reset();
            event
        };
        self.inner.emit(Some(event));
    }
}

/// Reports attachment re-encryption passes.
pub struct EncryptionReporter {
    inner: Progress,
}

impl EncryptionReporter {
    pub fn new(events: Arc<EventBus>, vault_id: &str) -> Self {
        Self {
            inner: Progress::new(events, vault_id, ProgressKind::Encryption),
        }
    }
}

impl Reporter for EncryptionReporter {
    fn start(&self) {
        self.inner.start();
    }

    fn progress(&self, loaded: usize, total: Option<usize>) {
        let event = self.inner.advance(loaded, total, false);
        self.inner.emit(event);
    }

    fn increase_total(&self, total: usize) {
        self.inner.increase_total(total);
    }

    fn done(&self) {
        let event = {
            let mut counters = self.inner.counters();
            let event = counters.complete_event(&self.inner.vault_id, self.inner.kind);
            counters.reset();
            event
        };
        self.inner.emit(Some(event));
    }
}

/// Reports protocol transfers. Announces itself on start and stays quiet
/// until something has loaded.
pub struct ProtocolReporter {
    inner: Progress,
}

impl ProtocolReporter {
    pub fn new(events: Arc<EventBus>, vault_id: &str) -> Self {
        Self {
            inner: Progress::new(events, vault_id, ProgressKind::Protocol),
        }
    }
}

impl Reporter for ProtocolReporter {
    fn start(&self) {
        self.inner.start();
        let event = self
            .inner
            .counters()
            .progress_event(&self.inner.vault_id, self.inner.kind);
        self.inner.emit(Some(event));
    }

    fn progress(&self, loaded: usize, total: Option<usize>) {
        let event = self.inner.advance(loaded, total, true);
        self.inner.emit(event);
    }

    fn increase_total(&self, total: usize) {
        self.inner.increase_total(total);
    }

    fn done(&self) {
        let event = {
            let mut counters = self.inner.counters();
            counters.reset();
            counters.complete_event(&self.inner.vault_id, self.inner.kind)
        };
        self.inner.emit(Some(event));
    }
}
