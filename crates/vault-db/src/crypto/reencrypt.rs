//! Re-keying of a document's image attachments when its sharing state flips.
//!
//! A pass first writes one [`ReencryptionMarker`] per attachment. Markers are
//! removed as attachments succeed, so whatever is left after a crash or a
//! failed pass is picked up by [`AttachmentReencryptor::resume_pending`].

use super::sharing::SharingHook;
use crate::context::VaultContext;
use crate::entity::{impl_entity, Document, EntityKind, Image, ImageData, Patch, Timestamp};
use crate::reporter::{EncryptionReporter, Reporter};
use crate::store::{EntityStorage, ImageResolver, StoreError, StoreMeta};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReencryptionDirection {
    /// Seal the attachment under a fresh data key.
    #[default]
    Encrypt,
    /// Store the attachment in plaintext so the share service can read it.
    Decrypt,
}

/// Pending re-encryption of one attachment. The id is the attachment id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReencryptionMarker {
    pub id: String,
    pub vault_id: String,
    pub attachment_id: String,
    pub document_id: String,
    pub direction: ReencryptionDirection,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub encryption_key: Option<String>,
    pub encrypted_data: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl_entity!(ReencryptionMarker, EntityKind::ReencryptionMarker);

const REENCRYPT_SCOPE: &str = "reencrypt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReencryptConfig {
    /// Attachments processed concurrently; batches run one after another.
    pub batch_size: usize,
}

impl Default for ReencryptConfig {
    fn default() -> Self {
        Self { batch_size: 5 }
    }
}

struct Inner {
    ctx: Arc<VaultContext>,
    images: EntityStorage<Image>,
    image_data: EntityStorage<ImageData>,
    resolver: Arc<ImageResolver>,
    config: ReencryptConfig,
}

#[derive(Clone)]
pub struct AttachmentReencryptor {
    inner: Arc<Inner>,
}

impl AttachmentReencryptor {
    pub fn new(
        ctx: Arc<VaultContext>,
        images: EntityStorage<Image>,
        image_data: EntityStorage<ImageData>,
        resolver: Arc<ImageResolver>,
        config: ReencryptConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                images,
                image_data,
                resolver,
                config,
            }),
        }
    }

    /// Record markers for `attachment_ids` and start a background pass.
    ///
    /// Markers go straight to the table, so this is safe to call from inside
    /// a store job. Without a runtime the markers wait for the next sweep.
    pub fn schedule(
        &self,
        vault_id: &str,
        document_id: &str,
        attachment_ids: Vec<String>,
        direction: ReencryptionDirection,
    ) -> Option<JoinHandle<usize>> {
        if attachment_ids.is_empty() {
            return None;
        }

        let ctx = &self.inner.ctx;
        let db = ctx.store().database(vault_id);
        let now = Utc::now();
        let markers = attachment_ids
            .iter()
            .map(|id| ReencryptionMarker {
                id: id.clone(),
                vault_id: vault_id.to_string(),
                attachment_id: id.clone(),
                document_id: document_id.to_string(),
                direction,
                created_at: Some(now),
                updated_at: Some(now),
                ..Default::default()
            })
            .collect();
        db.reencryption_markers.bulk_put(markers, ctx.client_id());

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No runtime to re-encrypt {} attachments of {}, leaving markers",
                attachment_ids.len(),
                document_id
            );
            return None;
        };
        let this = self.clone();
        let vault = vault_id.to_string();
        Some(handle.spawn(async move { this.run(&vault, attachment_ids).await }))
    }

    /// Re-run every marker left in the vault. Returns the number cleared.
    pub async fn resume_pending(&self, vault_id: &str) -> usize {
        let db = self.inner.ctx.store().database(vault_id);
        let ids: Vec<String> = db
            .reencryption_markers
            .all()
            .into_iter()
            .map(|marker| marker.id)
            .collect();
        if ids.is_empty() {
            return 0;
        }
        info!("Resuming {} attachment re-encryptions in vault {}", ids.len(), vault_id);
        self.run(vault_id, ids).await
    }

    /// Process the markers of `attachment_ids` in batches. Returns how many
    /// attachments were done.
    ///
    /// Passes of one vault run one at a time on the vault's `reencrypt`
    /// queue, so a pass never interleaves with one scheduled after it.
    pub async fn run(&self, vault_id: &str, attachment_ids: Vec<String>) -> usize {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        let vault = vault_id.to_string();
        self.inner
            .ctx
            .queues()
            .get(REENCRYPT_SCOPE, vault_id)
            .execute(move || async move {
                let _ = tx.send(this.run_pass(&vault, attachment_ids).await);
                Ok(())
            });
        rx.await.unwrap_or(0)
    }

    async fn run_pass(&self, vault_id: &str, attachment_ids: Vec<String>) -> usize {
        let ctx = &self.inner.ctx;
        let db = ctx.store().database(vault_id);
        let markers: Vec<ReencryptionMarker> = attachment_ids
            .iter()
            .filter_map(|id| db.reencryption_markers.get(id))
            .collect();
        if markers.is_empty() {
            return 0;
        }

        let reporter = EncryptionReporter::new(ctx.events().clone(), vault_id);
        reporter.start();
        reporter.progress(0, Some(markers.len()));

        let mut done = 0;
        for batch in markers.chunks(self.inner.config.batch_size.max(1)) {
            let results =
                join_all(batch.iter().map(|marker| self.process_current(vault_id, marker))).await;
            for (marker, result) in batch.iter().zip(results) {
                let same_direction = |current: &ReencryptionMarker| current.direction == marker.direction;
                match result {
                    Ok(false) => {
                        debug!("Attachment {} was rescheduled, skipping", marker.attachment_id);
                    }
                    Ok(true) => {
                        if db
                            .reencryption_markers
                            .remove_if(&marker.id, same_direction, ctx.client_id())
                            .is_some()
                        {
                            done += 1;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to re-encrypt attachment {}: {}", marker.attachment_id, e);
                        db.reencryption_markers.modify(
                            &marker.id,
                            |current| {
                                if !same_direction(current) {
                                    return false;
                                }
                                current.attempts += 1;
                                current.last_error = Some(e.to_string());
                                current.updated_at = Some(Utc::now());
                                true
                            },
                            ctx.client_id(),
                        );
                    }
                }
            }
            reporter.progress(batch.len(), None);
        }
        reporter.done();
        done
    }

    /// Process `marker` unless it was removed or flipped since the pass
    /// started. Returns whether the attachment was written.
    async fn process_current(
        &self,
        vault_id: &str,
        marker: &ReencryptionMarker,
    ) -> crate::store::Result<bool> {
        let current = self
            .inner
            .ctx
            .store()
            .database(vault_id)
            .reencryption_markers
            .get(&marker.id);
        if !current.is_some_and(|c| c.direction == marker.direction) {
            return Ok(false);
        }
        self.process(vault_id, marker).await?;
        Ok(true)
    }

    async fn process(&self, vault_id: &str, marker: &ReencryptionMarker) -> crate::store::Result<()> {
        let id = marker.attachment_id.as_str();
        let Some(image) = self.inner.images.retrieve(vault_id, id).await? else {
            debug!("Attachment {} is gone, nothing to re-encrypt", id);
            return Ok(());
        };
        let data = self
            .inner
            .resolver
            .resolve(vault_id, &image)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                table: "imageData",
                id: id.to_string(),
            })?;

        // Clearing the key makes sealing pick a fresh one.
        let meta = StoreMeta {
            write_to_device: false,
            encrypt: marker.direction == ReencryptionDirection::Encrypt,
            ..StoreMeta::default()
        };
        self.inner
            .image_data
            .save(
                vault_id,
                Patch::new()
                    .with("id", id)
                    .with("data", data)
                    .with("encryptionKey", Value::Null)
                    .with("encryptedData", Value::Null),
                meta.clone(),
            )
            .await?;
        self.inner
            .images
            .save(
                vault_id,
                Patch::new()
                    .with("id", id)
                    .with("name", image.name.as_str())
                    .with("encryptionKey", Value::Null)
                    .with("encryptedData", Value::Null),
                meta,
            )
            .await?;
        Ok(())
    }

    fn schedule_for(&self, vault_id: &str, document: &Document, direction: ReencryptionDirection) {
        let ids = document
            .content
            .as_ref()
            .map(|content| content.image_ids())
            .unwrap_or_default();
        self.schedule(vault_id, &document.id, ids, direction);
    }
}

impl SharingHook<Document> for AttachmentReencryptor {
    fn sharing_enabled(&self, vault_id: &str, document: &Document) {
        self.schedule_for(vault_id, document, ReencryptionDirection::Decrypt);
    }

    fn sharing_disabled(&self, vault_id: &str, document: &Document) {
        self.schedule_for(vault_id, document, ReencryptionDirection::Encrypt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{Block, RichDocument};
    use crate::context::Storages;
    use crate::crypto::SymmetricKey;
    use crate::entity::Entity;
    use crate::protocol::{ClientConfig, ServiceClient};
    use crate::transport::{ChannelPort, MessagePort};
    use crate::vault::Vault;
    use serde_json::json;
    use std::time::Duration;

    fn context() -> Arc<VaultContext> {
        let ctx = VaultContext::new();
        ctx.add_vault(Vault::remote("v1", "Cloud"));
        ctx.keys().set_vault_key("v1", SymmetricKey::generate());
        Arc::new(ctx)
    }

    /// Remote vault whose device answers every `attachment:read` with
    /// `data`, the first one only after 300ms.
    fn slow_device_context(data: Value) -> Arc<VaultContext> {
        let ((client_port, client_inbox), (device_port, mut device_inbox)) = ChannelPort::pair();
        let client = Arc::new(ServiceClient::new(
            Arc::new(client_port),
            ClientConfig::default(),
        ));
        client.listen(client_inbox);

        tokio::spawn(async move {
            let mut reads = 0;
            while let Some(request) = device_inbox.recv().await {
                let payload = if request.operation == "attachment:read" {
                    reads += 1;
                    if reads == 1 {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    }
                    data.clone()
                } else {
                    Value::Null
                };
                let _ = device_port.post(request.respond(payload)).await;
            }
        });

        let ctx = VaultContext::with_client(client);
        ctx.add_vault(Vault::remote("v1", "Cloud").with_filepath("/cloud"));
        ctx.keys().set_vault_key("v1", SymmetricKey::generate());
        Arc::new(ctx)
    }

    fn on_disk_image(ctx: &VaultContext) {
        ctx.store().database("v1").images.put(
            Image {
                id: "i1".into(),
                vault_id: "v1".into(),
                name: "photo.png".into(),
                filepath: Some("photo.png".into()),
                is_on_disk: true,
                ..Default::default()
            },
            "test",
        );
    }

    async fn store_image(storages: &Storages, id: &str, data: &str) {
        storages
            .images
            .save(
                "v1",
                Patch::new().with("id", id).with("name", "photo.png"),
                StoreMeta::default(),
            )
            .await
            .unwrap();
        storages
            .image_data
            .save(
                "v1",
                Patch::new().with("id", id).with("data", data),
                StoreMeta::default(),
            )
            .await
            .unwrap();
    }

    async fn wait_for_markers(ctx: &VaultContext) {
        let db = ctx.store().database("v1");
        for _ in 0..100 {
            if db.reencryption_markers.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("markers still pending: {:?}", db.reencryption_markers.all());
    }

    #[tokio::test]
    async fn test_sharing_a_document_decrypts_its_attachments() {
        let ctx = context();
        let storages = Storages::new(ctx.clone());
        store_image(&storages, "i1", "cGl4ZWxz").await;
        let db = ctx.store().database("v1");
        assert!(db.image_data.get("i1").unwrap().is_encrypted());

        let content = RichDocument::new(vec![Block::Image {
            id: Some("i1".into()),
            src: "photo.png".into(),
            alt: String::new(),
        }]);
        let doc = storages
            .documents
            .save(
                "v1",
                Patch::new()
                    .with("title", "Trip")
                    .with("content", serde_json::to_value(&content).unwrap()),
                StoreMeta::default(),
            )
            .await
            .unwrap();
        storages
            .documents
            .save(
                "v1",
                Patch::new().with("id", doc.id.as_str()).with("sharingUuid", "s-1"),
                StoreMeta::default(),
            )
            .await
            .unwrap();

        wait_for_markers(&ctx).await;
        let raw = db.image_data.get("i1").unwrap();
        assert!(!raw.is_encrypted());
        assert_eq!(raw.data.as_deref(), Some("cGl4ZWxz"));
        assert!(raw.encryption_key.is_none());
        assert_eq!(db.images.get("i1").unwrap().name, "photo.png");
    }

    #[tokio::test]
    async fn test_encrypt_pass_seals_under_a_fresh_key() {
        let ctx = context();
        let storages = Storages::new(ctx.clone());
        let db = ctx.store().database("v1");
        db.images.put(
            Image {
                id: "i1".into(),
                vault_id: "v1".into(),
                name: "photo.png".into(),
                ..Default::default()
            },
            "test",
        );
        db.image_data.put(
            ImageData {
                id: "i1".into(),
                vault_id: "v1".into(),
                data: Some("cGl4ZWxz".into()),
                ..Default::default()
            },
            "test",
        );

        let done = storages
            .reencryptor
            .schedule("v1", "d1", vec!["i1".into()], ReencryptionDirection::Encrypt)
            .unwrap()
            .await
            .unwrap();

        assert_eq!(done, 1);
        let raw = db.image_data.get("i1").unwrap();
        assert!(raw.is_encrypted());
        assert!(raw.data.is_none());
        assert!(raw.encryption_key.is_some());
        assert!(db.images.get("i1").unwrap().is_encrypted());
        let plain = storages.image_data.retrieve("v1", "i1").await.unwrap().unwrap();
        assert_eq!(plain.data.as_deref(), Some("cGl4ZWxz"));
        assert!(db.reencryption_markers.is_empty());
    }

    #[tokio::test]
    async fn test_marker_survives_a_failed_pass_and_is_cleared_by_the_sweep() {
        let ctx = context();
        let storages = Storages::new(ctx.clone());
        let db = ctx.store().database("v1");
        storages
            .images
            .save(
                "v1",
                Patch::new().with("id", "i1").with("name", "photo.png"),
                StoreMeta::default(),
            )
            .await
            .unwrap();

        // No bytes anywhere yet.
        let done = storages
            .reencryptor
            .schedule("v1", "d1", vec!["i1".into()], ReencryptionDirection::Decrypt)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(done, 0);
        let marker = db.reencryption_markers.get("i1").unwrap();
        assert_eq!(marker.attempts, 1);
        assert!(marker.last_error.is_some());
        assert_eq!(marker.document_id, "d1");

        storages
            .image_data
            .save(
                "v1",
                Patch::new().with("id", "i1").with("data", "Ynl0ZXM="),
                StoreMeta::default(),
            )
            .await
            .unwrap();

        assert_eq!(storages.reencryptor.resume_pending("v1").await, 1);
        assert!(db.reencryption_markers.is_empty());
        assert!(!db.image_data.get("i1").unwrap().is_encrypted());
    }

    #[tokio::test]
    async fn test_missing_attachments_clear_their_marker() {
        let ctx = context();
        let storages = Storages::with_config(ctx.clone(), ReencryptConfig { batch_size: 1 });

        let done = storages
            .reencryptor
            .schedule(
                "v1",
                "d1",
                vec!["gone-1".into(), "gone-2".into()],
                ReencryptionDirection::Encrypt,
            )
            .unwrap()
            .await
            .unwrap();

        assert_eq!(done, 2);
        assert!(ctx.store().database("v1").reencryption_markers.is_empty());
    }

    // ==================== Overlapping passes ====================

    #[tokio::test]
    async fn test_disabling_a_share_mid_pass_leaves_the_attachment_encrypted() {
        let ctx = slow_device_context(json!({"id": "i1", "filepath": "photo.png", "data": "aGk="}));
        let storages = Storages::new(ctx.clone());
        let db = ctx.store().database("v1");
        on_disk_image(&ctx);

        let decrypt = storages
            .reencryptor
            .schedule("v1", "d1", vec!["i1".into()], ReencryptionDirection::Decrypt)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let encrypt = storages
            .reencryptor
            .schedule("v1", "d1", vec!["i1".into()], ReencryptionDirection::Encrypt)
            .unwrap();

        assert_eq!(decrypt.await.unwrap(), 0);
        assert_eq!(encrypt.await.unwrap(), 1);
        assert!(db.reencryption_markers.is_empty());
        let raw = db.image_data.get("i1").unwrap();
        assert!(raw.is_encrypted());
        assert!(raw.data.is_none());
        let plain = storages.image_data.retrieve("v1", "i1").await.unwrap().unwrap();
        assert_eq!(plain.data.as_deref(), Some("aGk="));
    }

    #[tokio::test]
    async fn test_stale_failure_keeps_the_newer_direction() {
        // No bytes anywhere, so both passes fail.
        let ctx = slow_device_context(Value::Null);
        let storages = Storages::new(ctx.clone());
        let db = ctx.store().database("v1");
        on_disk_image(&ctx);

        let decrypt = storages
            .reencryptor
            .schedule("v1", "d1", vec!["i1".into()], ReencryptionDirection::Decrypt)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let encrypt = storages
            .reencryptor
            .schedule("v1", "d1", vec!["i1".into()], ReencryptionDirection::Encrypt)
            .unwrap();

        assert_eq!(decrypt.await.unwrap(), 0);
        assert_eq!(encrypt.await.unwrap(), 0);
        let marker = db.reencryption_markers.get("i1").unwrap();
        assert_eq!(marker.direction, ReencryptionDirection::Encrypt);
        assert_eq!(marker.attempts, 1);
        assert!(marker.last_error.is_some());
    }
}
