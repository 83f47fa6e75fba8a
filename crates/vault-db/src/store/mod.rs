//! Local object store: typed tables per vault and per-kind storage services.

pub mod attachments;
pub mod database;
pub mod hooks;
pub mod storage;
pub mod table;

pub use attachments::ImageResolver;
pub use database::{DatabaseSnapshot, LocalStore, Stored, VaultDatabase};
pub use hooks::{ConflictHooks, DocumentHooks, FolderHooks, NoHooks, StorageHooks};
pub use storage::{EntityStorage, RemoteOutcome, StoreMeta};
pub use table::Table;

use crate::content::ParseError;
use crate::crypto::CryptoError;
use crate::events::VaultEvent;
use crate::protocol::ProtocolError;
use crate::writer::WriterError;
use thiserror::Error;

/// Change source of writes that came from the filesystem.
pub const DEVICE_SOURCE: &str = "device";

/// Change source of rows applied from the cloud.
pub const REMOTE_SOURCE: &str = "remote";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{table} {id} not found")]
    NotFound { table: &'static str, id: String },

    #[error("Store queue dropped the job for vault {0}")]
    QueueDropped(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Device write failed: {0}")]
    Writer(#[from] WriterError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Skips change events a listener caused itself.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    client_id: String,
}

impl ChangeFilter {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    /// True for change events from neither the device nor this client.
    pub fn is_foreign(&self, event: &VaultEvent) -> bool {
        match event {
            VaultEvent::Changed { source, .. } => {
                source != DEVICE_SOURCE && *source != self.client_id
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeKind;

    fn changed(source: &str) -> VaultEvent {
        VaultEvent::Changed {
            vault_id: "v1".into(),
            table: "documents".into(),
            change: ChangeKind::Updated,
            ids: vec!["d1".into()],
            source: source.into(),
        }
    }

    #[test]
    fn test_change_filter_skips_own_and_device_changes() {
        let filter = ChangeFilter::new("client-1");

        assert!(!filter.is_foreign(&changed("client-1")));
        assert!(!filter.is_foreign(&changed(DEVICE_SOURCE)));
        assert!(filter.is_foreign(&changed("client-2")));
        assert!(filter.is_foreign(&changed(REMOTE_SOURCE)));
    }
}
