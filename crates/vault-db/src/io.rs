//! Entity I/O: per-kind transport to the device service.
//!
//! Each call becomes one typed [`DeviceRequest`] sent through the
//! [`ServiceClient`]. A timeout rejects the call; the write must then be
//! treated as not confirmed.

use crate::fs::WalkEntry;
use crate::protocol::{
    BatchPayload, DeviceRecord, DeviceRequest, PathPayload, ProtocolError, ReadBatchPayload,
    Request, ServiceClient, UpdatePayload,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("{operation} is not implemented for {kind}")]
    NotImplemented {
        operation: &'static str,
        kind: &'static str,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, IoError>;

#[async_trait]
pub trait EntityIo: Send + Sync {
    async fn create(&self, record: DeviceRecord) -> Result<()>;

    async fn create_batch(&self, vault_id: &str, records: Vec<DeviceRecord>) -> Result<()>;

    async fn update(&self, mods: DeviceRecord, old: DeviceRecord) -> Result<()>;

    async fn delete(&self, record: DeviceRecord) -> Result<()>;

    async fn read(&self, vault_id: &str, filepath: &str) -> Result<Option<DeviceRecord>>;

    async fn read_batch(&self, vault_id: &str, filepaths: Vec<String>)
    -> Result<Vec<DeviceRecord>>;
}

fn batch(vault_id: &str, records: Vec<DeviceRecord>) -> BatchPayload {
    BatchPayload {
        vault_id: vault_id.to_string(),
        entities: records,
    }
}

fn path(vault_id: &str, filepath: &str) -> PathPayload {
    PathPayload {
        vault_id: vault_id.to_string(),
        filepath: filepath.to_string(),
    }
}

/// Markdown documents (`entity:*`).
pub struct DocumentIo {
    client: Arc<ServiceClient>,
}

impl DocumentIo {
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self { client }
    }

    async fn send(&self, request: DeviceRequest) -> Result<()> {
        self.client.invoke(Request::Device(request)).await?;
        Ok(())
    }
}

#[async_trait]
impl EntityIo for DocumentIo {
    async fn create(&self, record: DeviceRecord) -> Result<()> {
        self.send(DeviceRequest::EntityCreate(record)).await
    }

    async fn create_batch(&self, vault_id: &str, records: Vec<DeviceRecord>) -> Result<()> {
        self.send(DeviceRequest::EntityCreateBatch(batch(vault_id, records)))
            .await
    }

    async fn update(&self, mods: DeviceRecord, old: DeviceRecord) -> Result<()> {
        self.send(DeviceRequest::EntityUpdate(UpdatePayload {
            mods,
            old_obj: old,
        }))
        .await
    }

    async fn delete(&self, record: DeviceRecord) -> Result<()> {
        self.send(DeviceRequest::EntityDelete(record)).await
    }

    async fn read(&self, vault_id: &str, filepath: &str) -> Result<Option<DeviceRecord>> {
        let record = self
            .client
            .invoke_as(Request::Device(DeviceRequest::EntityRead(path(
                vault_id, filepath,
            ))))
            .await?;
        Ok(record)
    }

    async fn read_batch(
        &self,
        vault_id: &str,
        filepaths: Vec<String>,
    ) -> Result<Vec<DeviceRecord>> {
        let records = self
            .client
            .invoke_as(Request::Device(DeviceRequest::EntityBatchRead(
                ReadBatchPayload {
                    vault_id: vault_id.to_string(),
                    filepaths,
                },
            )))
            .await?;
        Ok(records)
    }
}

/// Folders (`project:*`). Folders are not content-addressed, so reads are
/// unsupported; directory queries live here instead.
pub struct FolderIo {
    client: Arc<ServiceClient>,
}

impl FolderIo {
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self { client }
    }

    async fn send(&self, request: DeviceRequest) -> Result<()> {
        self.client.invoke(Request::Device(request)).await?;
        Ok(())
    }

    pub async fn is_dir(&self, vault_id: &str, filepath: &str) -> Result<bool> {
        let is_dir = self
            .client
            .invoke_as(Request::Device(DeviceRequest::ProjectIsDir(path(
                vault_id, filepath,
            ))))
            .await?;
        Ok(is_dir)
    }

    /// Every entry under `filepath`, depth first, sorted by path.
    pub async fn list_recursive(&self, vault_id: &str, filepath: &str) -> Result<Vec<WalkEntry>> {
        let entries = self
            .client
            .invoke_as(Request::Device(DeviceRequest::ProjectListRecursive(path(
                vault_id, filepath,
            ))))
            .await?;
        Ok(entries)
    }
}

#[async_trait]
impl EntityIo for FolderIo {
    async fn create(&self, record: DeviceRecord) -> Result<()> {
        self.send(DeviceRequest::ProjectCreate(record)).await
    }

    async fn create_batch(&self, vault_id: &str, records: Vec<DeviceRecord>) -> Result<()> {
        self.send(DeviceRequest::ProjectCreateBatch(batch(vault_id, records)))
            .await
    }

    async fn update(&self, mods: DeviceRecord, old: DeviceRecord) -> Result<()> {
        self.send(DeviceRequest::ProjectUpdate(UpdatePayload {
            mods,
            old_obj: old,
        }))
        .await
    }

    async fn delete(&self, record: DeviceRecord) -> Result<()> {
        self.send(DeviceRequest::ProjectDelete(record)).await
    }

    async fn read(&self, _vault_id: &str, _filepath: &str) -> Result<Option<DeviceRecord>> {
        Err(IoError::NotImplemented {
            operation: "read",
            kind: "folder",
        })
    }

    async fn read_batch(
        &self,
        _vault_id: &str,
        _filepaths: Vec<String>,
    ) -> Result<Vec<DeviceRecord>> {
        Err(IoError::NotImplemented {
            operation: "readBatch",
            kind: "folder",
        })
    }
}

/// Attachments (`attachment:*`). Write-only from the store's side.
pub struct AttachmentIo {
    client: Arc<ServiceClient>,
}

impl AttachmentIo {
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self { client }
    }

    async fn send(&self, request: DeviceRequest) -> Result<()> {
        self.client.invoke(Request::Device(request)).await?;
        Ok(())
    }

    /// Base64 bytes of the attachment at `filepath`, if the device has it.
    pub async fn read_bytes(&self, vault_id: &str, filepath: &str) -> Result<Option<String>> {
        let record: Option<DeviceRecord> = self
            .client
            .invoke_as(Request::Device(DeviceRequest::AttachmentRead(PathPayload {
                vault_id: vault_id.to_string(),
                filepath: filepath.to_string(),
            })))
            .await?;
        Ok(record.and_then(|r| r.data))
    }
}

#[async_trait]
impl EntityIo for AttachmentIo {
    async fn create(&self, record: DeviceRecord) -> Result<()> {
        self.send(DeviceRequest::AttachmentCreate(record)).await
    }

    async fn create_batch(&self, vault_id: &str, records: Vec<DeviceRecord>) -> Result<()> {
        self.send(DeviceRequest::AttachmentCreateBatch(batch(vault_id, records)))
            .await
    }

    async fn update(&self, _mods: DeviceRecord, _old: DeviceRecord) -> Result<()> {
        Err(IoError::NotImplemented {
            operation: "update",
            kind: "attachment",
        })
    }

    async fn delete(&self, record: DeviceRecord) -> Result<()> {
        self.send(DeviceRequest::AttachmentDelete(record)).await
    }

    async fn read(&self, _vault_id: &str, _filepath: &str) -> Result<Option<DeviceRecord>> {
        Err(IoError::NotImplemented {
            operation: "read",
            kind: "attachment",
        })
    }

    async fn read_batch(
        &self,
        _vault_id: &str,
        _filepaths: Vec<String>,
    ) -> Result<Vec<DeviceRecord>> {
        Err(IoError::NotImplemented {
            operation: "readBatch",
            kind: "attachment",
        })
    }
}
