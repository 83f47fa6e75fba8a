//! Where image bytes are found: on the device, in the local `imageData`
//! table, or in the cloud.

use super::storage::EntityStorage;
use super::{Result, REMOTE_SOURCE};
use crate::context::VaultContext;
use crate::entity::{Entity, Image, ImageData};
use crate::io::AttachmentIo;
use crate::protocol::{CloudRequest, Request};
use crate::writer::AttachmentSource;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ImageResolver {
    ctx: Arc<VaultContext>,
    image_data: EntityStorage<ImageData>,
}

impl ImageResolver {
    pub fn new(ctx: Arc<VaultContext>, image_data: EntityStorage<ImageData>) -> Self {
        Self { ctx, image_data }
    }

    /// Plaintext base64 bytes of `image`.
    ///
    /// Never goes through the store queue, so it is safe to call from inside
    /// a store job.
    pub async fn resolve(&self, vault_id: &str, image: &Image) -> Result<Option<String>> {
        if let Some(data) = self.from_device(vault_id, image).await {
            return Ok(Some(data));
        }

        if let Some(local) = self.image_data.retrieve(vault_id, &image.id).await? {
            if !local.is_encrypted() && local.data.is_some() {
                return Ok(local.data);
            }
        }

        self.from_cloud(vault_id, &image.id).await
    }

    async fn from_device(&self, vault_id: &str, image: &Image) -> Option<String> {
        if !image.is_on_disk {
            return None;
        }
        let filepath = image.filepath.as_deref()?;
        let client = self.ctx.client()?;
        match AttachmentIo::new(client.clone())
            .read_bytes(vault_id, filepath)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to read attachment {}: {}", filepath, e);
                None
            }
        }
    }

    /// Fetch the row from the cloud and cache it as received.
    async fn from_cloud(&self, vault_id: &str, id: &str) -> Result<Option<String>> {
        let Some(client) = self.ctx.client() else {
            return Ok(None);
        };
        if !self.ctx.vaults().is_remote(vault_id) {
            return Ok(None);
        }

        let row: Option<ImageData> = client
            .invoke_as(Request::Cloud(CloudRequest::Retrieve {
                vault_id: vault_id.to_string(),
                table: ImageData::KIND.table_name().to_string(),
                id: id.to_string(),
            }))
            .await?;
        let Some(row) = row else {
            debug!("Image {} not found in the cloud", id);
            return Ok(None);
        };

        let plain = self.image_data.encryption().decrypt(vault_id, row.clone())?;
        self.ctx
            .store()
            .database(vault_id)
            .image_data
            .put(row, REMOTE_SOURCE);
        Ok(plain.data)
    }
}

#[async_trait]
impl AttachmentSource for ImageResolver {
    async fn image_data(&self, vault_id: &str, id: &str) -> Option<String> {
        let image = self
            .ctx
            .store()
            .database(vault_id)
            .images
            .get(id)
            .unwrap_or_else(|| Image {
                id: id.to_string(),
                vault_id: vault_id.to_string(),
                ..Default::default()
            });
        match self.resolve(vault_id, &image).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to resolve image {}: {}", id, e);
                None
            }
        }
    }
}
