//! File watcher with debouncing for vault changes.
//!
//! Uses notify-debouncer-mini for efficient file change detection. Events
//! for blacklisted directories and for files the device service just wrote
//! (see [`EchoTracker`]) never reach the receiver.

use crate::echo::EchoTracker;
use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};
use vault_db::ImportConfig;

/// File event from the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path relative to vault root
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// Created or modified
    Modified,
    Deleted,
}

/// Track last seen mtime to filter spurious events (Docker volume bug workaround)
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// Filters applied to raw events before they are delivered.
#[derive(Clone)]
struct EventFilter {
    vault_path: PathBuf,
    config: ImportConfig,
    echoes: EchoTracker,
    mtimes: MtimeCache,
}

pub struct VaultWatcher {
    vault_path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl VaultWatcher {
    /// Watch `vault_path` recursively with a 200ms debounce.
    pub fn new(vault_path: PathBuf, config: ImportConfig, echoes: EchoTracker) -> Result<Self> {
        // Canonicalize the path to resolve symlinks. On macOS, /var/folders/...
        // is actually /private/var/folders/..., and FSEvents needs the real path.
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let filter = EventFilter {
            vault_path: vault_path.clone(),
            config,
            echoes,
            mtimes: Arc::new(Mutex::new(HashMap::new())),
        };

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) = filter.process(&event.path) {
                            if event_tx.send(file_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&vault_path, RecursiveMode::Recursive)?;

        Ok(Self {
            vault_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    /// Wait for the next event, then take whatever else is already queued.
    /// Paths are deduplicated, keeping the latest kind. `None` once the
    /// watcher has stopped.
    pub async fn next_batch(&mut self) -> Option<Vec<FileEvent>> {
        let first = self.event_rx.recv().await?;
        let mut batch = vec![first];
        while let Ok(event) = self.event_rx.try_recv() {
            batch.retain(|queued: &FileEvent| queued.path != event.path);
            batch.push(event);
        }
        Some(batch)
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }
}

impl EventFilter {
    fn process(&self, path: &Path) -> Option<FileEvent> {
        let relative = path.strip_prefix(&self.vault_path).ok()?;
        let relative_str = relative.to_str()?.replace('\\', "/");
        if relative_str.is_empty() {
            return None;
        }

        // Deleted paths cannot be told apart from directories, so the last
        // segment is checked too.
        if self.config.in_blacklisted_dir(&relative_str, true) {
            return None;
        }
        let metadata = std::fs::metadata(path).ok();
        let is_dir = metadata.as_ref().is_some_and(|m| m.is_dir());

        if self.echoes.consume(&path.to_string_lossy()) {
            debug!("Skipping own write: {}", relative_str);
            return None;
        }

        let kind = if metadata.is_some() {
            FileEventKind::Modified
        } else {
            FileEventKind::Deleted
        };

        let mut cache = self.mtimes.lock().unwrap_or_else(|e| e.into_inner());
        let key = relative.to_path_buf();
        match (&kind, metadata.and_then(|m| m.modified().ok())) {
            (FileEventKind::Modified, Some(mtime)) if !is_dir => {
                if cache.get(&key) == Some(&mtime) {
                    // Mtime unchanged - spurious event, skip it
                    return None;
                }
                cache.insert(key, mtime);
            }
            (FileEventKind::Deleted, _) => {
                cache.remove(&key);
            }
            _ => {}
        }

        debug!("File event: {:?} - {}", kind, relative_str);

        Some(FileEvent {
            path: relative_str,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn filter(temp_dir: &TempDir, echoes: EchoTracker) -> EventFilter {
        EventFilter {
            vault_path: temp_dir.path().to_path_buf(),
            config: ImportConfig::default(),
            echoes,
            mtimes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[test]
    fn test_modified_then_deleted() {
        let temp_dir = TempDir::new().unwrap();
        let filter = filter(&temp_dir, EchoTracker::new());
        let file = temp_dir.path().join("notes/a.md");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "# A").unwrap();

        let modified = filter.process(&file).unwrap();
        std::fs::remove_file(&file).unwrap();
        let deleted = filter.process(&file).unwrap();

        assert_eq!(modified.path, "notes/a.md");
        assert_eq!(modified.kind, FileEventKind::Modified);
        assert_eq!(deleted.kind, FileEventKind::Deleted);
    }

    #[test]
    fn test_unchanged_mtime_is_spurious() {
        let temp_dir = TempDir::new().unwrap();
        let filter = filter(&temp_dir, EchoTracker::new());
        let file = temp_dir.path().join("a.md");
        std::fs::write(&file, "# A").unwrap();

        assert!(filter.process(&file).is_some());
        assert!(filter.process(&file).is_none());
    }

    #[test]
    fn test_blacklisted_directories_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let filter = filter(&temp_dir, EchoTracker::new());
        let git = temp_dir.path().join(".git/HEAD");
        let day = temp_dir.path().join("My Day/today.md");
        for path in [&git, &day] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, "x").unwrap();
        }

        assert!(filter.process(&git).is_none());
        assert!(filter.process(&day).is_none());
        assert!(filter.process(&temp_dir.path().join(".obsidian")).is_none());
    }

    #[test]
    fn test_own_writes_are_skipped_once() {
        let temp_dir = TempDir::new().unwrap();
        let echoes = EchoTracker::new();
        let filter = filter(&temp_dir, echoes.clone());
        let file = temp_dir.path().join("a.md");
        std::fs::write(&file, "# A").unwrap();

        echoes.mark_written(&file.to_string_lossy());

        assert!(filter.process(&file).is_none());
        assert!(filter.process(&file).is_some());
    }
}
