//! Event infrastructure for vault-db.
//!
//! Provides `VaultEvent` for progress and change notifications and `EventBus`
//! for subscriptions. Store writes, importer runs, encryption sweeps and
//! migrations all publish here; hosts subscribe to forward events to a UI.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Which batch job a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressKind {
    Import,
    Encryption,
    Protocol,
}

/// Mutation kind carried by change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Events emitted by the store and its batch jobs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum VaultEvent {
    /// A batch job advanced.
    Progress {
        vault_id: String,
        kind: ProgressKind,
        total: usize,
        loaded: usize,
        /// Estimated seconds left, rounded up.
        time_remaining: u64,
        /// Seconds since the job started, rounded down.
        time_elapsed: u64,
        /// Milliseconds since Unix epoch.
        timestamp: u64,
    },
    /// A batch job finished.
    Complete {
        vault_id: String,
        kind: ProgressKind,
        total: usize,
        loaded: usize,
        unsupported: usize,
        timestamp: u64,
    },
    /// Rows of a table were written.
    ///
    /// `source` is the originating client id, or `device` for changes that
    /// came from the filesystem.
    Changed {
        vault_id: String,
        table: String,
        change: ChangeKind,
        ids: Vec<String>,
        source: String,
    },
}

impl VaultEvent {
    pub fn vault_id(&self) -> &str {
        match self {
            VaultEvent::Progress { vault_id, .. }
            | VaultEvent::Complete { vault_id, .. }
            | VaultEvent::Changed { vault_id, .. } => vault_id,
        }
    }
}

/// Milliseconds since Unix epoch.
pub fn now_millis() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(VaultEvent) + Send + Sync>;

/// Event bus for publishing vault events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(VaultEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: VaultEvent) {
        // Snapshot the list so callbacks may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn changed(id: &str) -> VaultEvent {
        VaultEvent::Changed {
            vault_id: "v1".into(),
            table: "documents".into(),
            change: ChangeKind::Created,
            ids: vec![id.into()],
            source: "client-a".into(),
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(changed("a"));

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        {
            let _sub = bus.subscribe(move |event| {
                if let VaultEvent::Changed { ids, .. } = event {
                    seen_clone.lock().unwrap().extend(ids);
                }
            });
            bus.emit(changed("a"));
        }

        bus.emit(changed("b"));

        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_progress_event_serialization() {
        let event = VaultEvent::Progress {
            vault_id: "v1".into(),
            kind: ProgressKind::Import,
            total: 10,
            loaded: 4,
            time_remaining: 3,
            time_elapsed: 2,
            timestamp: 1234,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"progress\""));
        assert!(json.contains("\"vaultId\":\"v1\""));
        assert!(json.contains("\"timeRemaining\":3"));
        assert!(json.contains("\"kind\":\"import\""));
    }
}
