//! Device service: answers `entity:*`, `project:*` and `attachment:*`
//! requests against a [`FileSystem`].
//!
//! Record filepaths are vault-relative. Each vault's root comes from the
//! [`VaultRegistry`]; vaults without a filepath are served from the
//! filesystem root.

use crate::echo::EchoTracker;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use vault_db::fs::{self, FileSystem, FsError, WalkEntry};
use vault_db::protocol::{
    BatchPayload, DeviceRecord, DeviceRequest, PathPayload, ProtocolError, ReadBatchPayload,
    Request, ServiceHandler, UpdatePayload,
};
use vault_db::VaultRegistry;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Unknown vault: {0}")]
    UnknownVault(String),

    #[error("Attachment {0} has no data")]
    MissingData(String),

    #[error("Invalid attachment data for {filepath}: {message}")]
    InvalidData { filepath: String, message: String },

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

pub struct DeviceService<F> {
    fs: F,
    vaults: Arc<VaultRegistry>,
    echoes: EchoTracker,
}

impl<F: FileSystem> DeviceService<F> {
    pub fn new(fs: F, vaults: Arc<VaultRegistry>) -> Self {
        Self {
            fs,
            vaults,
            echoes: EchoTracker::new(),
        }
    }

    /// Share write marks with a watcher.
    pub fn with_echoes(mut self, echoes: EchoTracker) -> Self {
        self.echoes = echoes;
        self
    }

    pub fn echoes(&self) -> &EchoTracker {
        &self.echoes
    }

    fn root(&self, vault_id: &str) -> Result<String> {
        let vault = self
            .vaults
            .get(vault_id)
            .ok_or_else(|| ServiceError::UnknownVault(vault_id.to_string()))?;
        Ok(vault.filepath.unwrap_or_default())
    }

    fn absolute(&self, vault_id: &str, filepath: &str) -> Result<String> {
        let root = self.root(vault_id)?;
        Ok(if filepath.is_empty() {
            root
        } else {
            fs::join(&root, filepath)
        })
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        self.echoes.mark_written(path);
        self.fs.write(path, content).await?;
        Ok(())
    }

    /// Missing targets count as deleted.
    async fn remove(&self, path: &str) -> Result<()> {
        self.echoes.mark_written(path);
        match self.fs.delete(path).await {
            Ok(()) | Err(FsError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_tree(&self, path: &str) -> Result<()> {
        let entries = match fs::walk(&self.fs, path, |_| false).await {
            Ok(entries) => entries,
            Err(FsError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        // Sorted by path, so reversing visits children before their parent.
        for entry in entries.iter().rev() {
            self.remove(&entry.filepath).await?;
        }
        self.remove(path).await
    }

    /// Move `old` to `new` when the path changed and the old one exists.
    async fn relocate(&self, vault_id: &str, old: &DeviceRecord, new: &DeviceRecord) -> Result<()> {
        if old.filepath.is_empty() || old.filepath == new.filepath {
            return Ok(());
        }
        let from = self.absolute(vault_id, &old.filepath)?;
        let to = self.absolute(vault_id, &new.filepath)?;
        self.echoes.mark_written(&from);
        self.echoes.mark_written(&to);
        match self.fs.rename(&from, &to).await {
            Ok(()) => Ok(()),
            Err(FsError::NotFound(_)) => {
                debug!("Nothing to move at {}", old.filepath);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ==================== Documents ====================

    async fn write_document(&self, record: &DeviceRecord) -> Result<()> {
        let path = self.absolute(&record.vault_id, &record.filepath)?;
        let content = record.content.as_deref().unwrap_or_default();
        self.write(&path, content.as_bytes()).await
    }

    async fn update_document(&self, payload: &UpdatePayload) -> Result<()> {
        let vault_id = &payload.mods.vault_id;
        self.relocate(vault_id, &payload.old_obj, &payload.mods).await?;
        if payload.mods.content.is_some() {
            self.write_document(&payload.mods).await?;
        }
        Ok(())
    }

    async fn read_document(&self, vault_id: &str, filepath: &str) -> Result<Option<DeviceRecord>> {
        let path = self.absolute(vault_id, filepath)?;
        match self.fs.read(&path).await {
            Ok(bytes) => Ok(Some(DeviceRecord {
                vault_id: vault_id.to_string(),
                filepath: filepath.to_string(),
                content: Some(String::from_utf8_lossy(&bytes).into_owned()),
                ..Default::default()
            })),
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_documents(&self, payload: &ReadBatchPayload) -> Result<Vec<DeviceRecord>> {
        let mut records = Vec::with_capacity(payload.filepaths.len());
        for filepath in &payload.filepaths {
            match self.read_document(&payload.vault_id, filepath).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => debug!("Skipping missing file {}", filepath),
                Err(e) => warn!("Failed to read {}: {}", filepath, e),
            }
        }
        Ok(records)
    }

    // ==================== Folders ====================

    async fn create_folder(&self, record: &DeviceRecord) -> Result<()> {
        let path = self.absolute(&record.vault_id, &record.filepath)?;
        self.echoes.mark_written(&path);
        self.fs.mkdir(&path).await?;
        Ok(())
    }

    async fn is_dir(&self, payload: &PathPayload) -> Result<bool> {
        let path = self.absolute(&payload.vault_id, &payload.filepath)?;
        match self.fs.stat(&path).await {
            Ok(stat) => Ok(stat.is_dir),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_recursive(&self, payload: &PathPayload) -> Result<Vec<WalkEntry>> {
        let root = self.root(&payload.vault_id)?;
        let start = self.absolute(&payload.vault_id, &payload.filepath)?;
        let prefix = format!("{}/", root.trim_end_matches('/'));

        let entries = fs::walk(&self.fs, &start, |_| false).await?;
        Ok(entries
            .into_iter()
            .map(|entry| WalkEntry {
                filepath: match entry.filepath.strip_prefix(&prefix) {
                    Some(rest) if !root.is_empty() => rest.to_string(),
                    _ => entry.filepath.clone(),
                },
                is_dir: entry.is_dir,
            })
            .collect())
    }

    // ==================== Attachments ====================

    async fn write_attachment(&self, record: &DeviceRecord) -> Result<()> {
        let data = record
            .data
            .as_deref()
            .ok_or_else(|| ServiceError::MissingData(record.filepath.clone()))?;
        let bytes = STANDARD.decode(data).map_err(|e| ServiceError::InvalidData {
            filepath: record.filepath.clone(),
            message: e.to_string(),
        })?;
        let path = self.absolute(&record.vault_id, &record.filepath)?;
        self.write(&path, &bytes).await
    }

    async fn read_attachment(&self, payload: &PathPayload) -> Result<Option<DeviceRecord>> {
        let path = self.absolute(&payload.vault_id, &payload.filepath)?;
        match self.fs.read(&path).await {
            Ok(bytes) => Ok(Some(DeviceRecord {
                vault_id: payload.vault_id.clone(),
                filepath: payload.filepath.clone(),
                data: Some(STANDARD.encode(bytes)),
                ..Default::default()
            })),
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_documents(&self, batch: &BatchPayload) -> Result<()> {
        for record in &batch.entities {
            self.write_document(record).await?;
        }
        Ok(())
    }

    async fn create_folders(&self, batch: &BatchPayload) -> Result<()> {
        for record in &batch.entities {
            self.create_folder(record).await?;
        }
        Ok(())
    }

    async fn write_attachments(&self, batch: &BatchPayload) -> Result<()> {
        for record in &batch.entities {
            self.write_attachment(record).await?;
        }
        Ok(())
    }

    /// Answer one device request. Writes respond with `null`.
    pub async fn dispatch(&self, request: DeviceRequest) -> Result<Value> {
        use DeviceRequest::*;

        match request {
            EntityCreate(record) => self.write_document(&record).await?,
            EntityCreateBatch(batch) => self.write_documents(&batch).await?,
            EntityUpdate(payload) => self.update_document(&payload).await?,
            EntityDelete(record) | AttachmentDelete(record) => {
                let path = self.absolute(&record.vault_id, &record.filepath)?;
                self.remove(&path).await?
            }
            EntityRead(payload) => {
                let record = self
                    .read_document(&payload.vault_id, &payload.filepath)
                    .await?;
                return Ok(serde_json::to_value(record)?);
            }
            EntityBatchRead(payload) => {
                return Ok(serde_json::to_value(self.read_documents(&payload).await?)?);
            }
            ProjectCreate(record) => self.create_folder(&record).await?,
            ProjectCreateBatch(batch) => self.create_folders(&batch).await?,
            ProjectUpdate(payload) => {
                self.relocate(&payload.mods.vault_id, &payload.old_obj, &payload.mods)
                    .await?
            }
            ProjectDelete(record) => {
                let path = self.absolute(&record.vault_id, &record.filepath)?;
                self.remove_tree(&path).await?
            }
            ProjectIsDir(payload) => return Ok(Value::Bool(self.is_dir(&payload).await?)),
            ProjectListRecursive(payload) => {
                return Ok(serde_json::to_value(self.list_recursive(&payload).await?)?);
            }
            AttachmentCreate(record) => self.write_attachment(&record).await?,
            AttachmentCreateBatch(batch) => self.write_attachments(&batch).await?,
            AttachmentRead(payload) => {
                return Ok(serde_json::to_value(self.read_attachment(&payload).await?)?);
            }
        }
        Ok(Value::Null)
    }
}

#[async_trait]
impl<F: FileSystem> ServiceHandler for DeviceService<F> {
    async fn handle(&self, request: Request) -> vault_db::protocol::Result<Value> {
        let operation = request.operation();
        let Request::Device(request) = request else {
            return Err(ProtocolError::UnknownOperation {
                service: request.service(),
                operation: operation.to_string(),
            });
        };
        self.dispatch(request)
            .await
            .map_err(|e| ProtocolError::Remote {
                operation: operation.to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_db::{InMemoryFs, Vault};

    fn service(fs: InMemoryFs) -> DeviceService<InMemoryFs> {
        let vaults = Arc::new(VaultRegistry::new());
        vaults.insert(Vault::local("v1", "Notes").with_filepath("/vault"));
        DeviceService::new(fs, vaults)
    }

    fn record(filepath: &str, content: Option<&str>) -> DeviceRecord {
        DeviceRecord {
            id: "doc-1".into(),
            vault_id: "v1".into(),
            filepath: filepath.into(),
            content: content.map(String::from),
            data: None,
        }
    }

    fn path(filepath: &str) -> PathPayload {
        PathPayload {
            vault_id: "v1".into(),
            filepath: filepath.into(),
        }
    }

    // ==================== Documents ====================

    #[tokio::test]
    async fn test_create_writes_below_vault_root_and_marks_echo() {
        let service = service(InMemoryFs::new());

        service
            .dispatch(DeviceRequest::EntityCreate(record("notes/a.md", Some("# A"))))
            .await
            .unwrap();

        assert_eq!(service.fs.read("/vault/notes/a.md").await.unwrap(), b"# A");
        assert!(service.echoes().consume("/vault/notes/a.md"));
    }

    #[tokio::test]
    async fn test_update_moves_then_rewrites() {
        let fs = InMemoryFs::new();
        fs.write("/vault/old.md", b"old").await.unwrap();
        let service = service(fs);

        service
            .dispatch(DeviceRequest::EntityUpdate(UpdatePayload {
                mods: record("new/renamed.md", Some("new")),
                old_obj: record("old.md", None),
            }))
            .await
            .unwrap();

        assert!(!service.fs.exists("/vault/old.md").await.unwrap());
        assert_eq!(
            service.fs.read("/vault/new/renamed.md").await.unwrap(),
            b"new"
        );
    }

    #[tokio::test]
    async fn test_read_missing_document_is_null() {
        let service = service(InMemoryFs::new());

        let value = service
            .dispatch(DeviceRequest::EntityRead(path("gone.md")))
            .await
            .unwrap();

        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn test_batch_read_skips_missing_files() {
        let fs = InMemoryFs::new();
        fs.write("/vault/a.md", b"A").await.unwrap();
        let service = service(fs);

        let value = service
            .dispatch(DeviceRequest::EntityBatchRead(ReadBatchPayload {
                vault_id: "v1".into(),
                filepaths: vec!["a.md".into(), "gone.md".into()],
            }))
            .await
            .unwrap();
        let records: Vec<DeviceRecord> = serde_json::from_value(value).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].filepath, "a.md");
        assert_eq!(records[0].content.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_deleting_missing_document_succeeds() {
        let service = service(InMemoryFs::new());

        let result = service
            .dispatch(DeviceRequest::EntityDelete(record("gone.md", None)))
            .await;

        assert!(result.is_ok());
    }

    // ==================== Folders ====================

    #[tokio::test]
    async fn test_list_recursive_is_vault_relative() {
        let fs = InMemoryFs::new();
        fs.write("/vault/a.md", b"").await.unwrap();
        fs.write("/vault/sub/b.md", b"").await.unwrap();
        let service = service(fs);

        let entries = service.list_recursive(&path("")).await.unwrap();
        let sub = service.list_recursive(&path("sub")).await.unwrap();

        let paths: Vec<_> = entries.iter().map(|e| e.filepath.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "sub", "sub/b.md"]);
        assert_eq!(sub[0].filepath, "sub/b.md");
        assert!(service.is_dir(&path("sub")).await.unwrap());
        assert!(!service.is_dir(&path("a.md")).await.unwrap());
        assert!(!service.is_dir(&path("missing")).await.unwrap());
    }

    #[tokio::test]
    async fn test_folder_delete_removes_contents() {
        let fs = InMemoryFs::new();
        fs.write("/vault/sub/b.md", b"").await.unwrap();
        fs.write("/vault/sub/deep/c.md", b"").await.unwrap();
        let service = service(fs);

        service
            .dispatch(DeviceRequest::ProjectDelete(record("sub", None)))
            .await
            .unwrap();

        assert!(!service.fs.exists("/vault/sub").await.unwrap());
        assert!(!service.fs.exists("/vault/sub/deep/c.md").await.unwrap());
    }

    // ==================== Attachments ====================

    #[tokio::test]
    async fn test_attachment_bytes_are_decoded_and_read_back() {
        let service = service(InMemoryFs::new());
        let mut image = record("assets/a.png", None);
        image.data = Some(STANDARD.encode([0x89, b'P', b'N', b'G']));

        service
            .dispatch(DeviceRequest::AttachmentCreate(image.clone()))
            .await
            .unwrap();
        let value = service
            .dispatch(DeviceRequest::AttachmentRead(path("assets/a.png")))
            .await
            .unwrap();
        let read: DeviceRecord = serde_json::from_value(value).unwrap();

        assert_eq!(
            service.fs.read("/vault/assets/a.png").await.unwrap(),
            vec![0x89, b'P', b'N', b'G']
        );
        assert_eq!(read.data, image.data);
    }

    #[tokio::test]
    async fn test_attachment_without_data_is_rejected() {
        let service = service(InMemoryFs::new());

        let err = service
            .dispatch(DeviceRequest::AttachmentCreate(record("a.png", None)))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::MissingData(_)));
    }

    // ==================== Handler ====================

    #[tokio::test]
    async fn test_unknown_vault_becomes_remote_error() {
        let service = service(InMemoryFs::new());
        let mut doc = record("a.md", Some(""));
        doc.vault_id = "nope".into();

        let err = service
            .handle(Request::Device(DeviceRequest::EntityCreate(doc)))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Unknown vault: nope"));
    }
}
