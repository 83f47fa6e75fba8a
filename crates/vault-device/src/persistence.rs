//! On-disk persistence for vault databases.
//!
//! Each vault is written as one JSON document, `<state_dir>/<vault_id>.json`,
//! holding a [`DatabaseSnapshot`] of every table. Encrypted rows are stored
//! as they are held in memory, so nothing is decrypted on the way to disk.
//!
//! Writes go to a sibling temp file first and are renamed into place, so a
//! crash mid-save leaves the previous snapshot intact.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use vault_db::{DatabaseSnapshot, LocalStore};

pub struct SnapshotStore {
    state_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn path(&self, vault_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", vault_id))
    }

    /// The persisted snapshot of `vault_id`, if one was ever saved.
    pub fn load(&self, vault_id: &str) -> Result<Option<DatabaseSnapshot>> {
        let path = self.path(vault_id);
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        let snapshot: DatabaseSnapshot = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))?;
        Ok(Some(snapshot))
    }

    pub fn save(&self, snapshot: &DatabaseSnapshot) -> Result<()> {
        fs::create_dir_all(&self.state_dir)?;

        let path = self.path(&snapshot.vault_id);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(snapshot)?;
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;

        debug!(
            "Saved snapshot of {} ({} documents)",
            snapshot.vault_id,
            snapshot.documents.len()
        );
        Ok(())
    }

    /// Load the vault's snapshot into `store`. Returns whether one existed.
    pub fn restore(&self, store: &LocalStore, vault_id: &str) -> Result<bool> {
        let Some(snapshot) = self.load(vault_id)? else {
            return Ok(false);
        };
        info!(
            "Restoring {}: {} documents, {} folders",
            vault_id,
            snapshot.documents.len(),
            snapshot.folders.len()
        );
        store.database(vault_id).restore(snapshot);
        Ok(true)
    }

    /// Snapshot the vault's database out of `store` and save it.
    pub fn persist(&self, store: &LocalStore, vault_id: &str) -> Result<()> {
        self.save(&store.database(vault_id).snapshot())
    }
}
