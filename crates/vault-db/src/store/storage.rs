//! Per-kind storage: encryption, the per-vault write queue and device
//! mirroring around a [`Table`](super::Table).
//!
//! Every write runs as one job on the vault's `store` queue, so writes to a
//! vault never interleave. Jobs must not await other store jobs of the same
//! vault.

use super::database::{Stored, VaultDatabase};
use super::hooks::{NoHooks, StorageHooks};
use super::{Result, StoreError, DEVICE_SOURCE, REMOTE_SOURCE};
use crate::context::VaultContext;
use crate::crypto::EncryptionPolicy;
use crate::entity::{timestamp_value, Entity, LocalConflict, Patch, Timestamp};
use crate::protocol::{Request, StoreRequest};
use crate::queue::JobError;
use crate::io::IoError;
use crate::writer::{ContentWriter, WriterError};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const STORE_SCOPE: &str = "store";

/// Options of a single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMeta {
    /// Mirror the change to the device. False for changes read from it.
    pub write_to_device: bool,
    pub encrypt: bool,
    /// Bump `updatedAt` on existing rows.
    pub updated_at: bool,
    pub postprocess: bool,
    /// Change source to record instead of the context's own client id.
    pub client_id: Option<String>,
}

impl Default for StoreMeta {
    fn default() -> Self {
        Self {
            write_to_device: true,
            encrypt: true,
            updated_at: true,
            postprocess: true,
            client_id: None,
        }
    }
}

impl StoreMeta {
    /// Meta for changes that originate on the device.
    pub fn from_device() -> Self {
        Self {
            write_to_device: false,
            ..Self::default()
        }
    }
}

/// A write after id resolution, before encryption.
#[derive(Debug, Clone)]
pub struct PendingWrite<T> {
    pub patch: Patch,
    /// Current row, decrypted.
    pub existing: Option<T>,
    raw: Option<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome<T> {
    Applied(T),
    Conflict(LocalConflict),
}

pub struct EntityStorage<T> {
    ctx: Arc<VaultContext>,
    encryption: Arc<dyn EncryptionPolicy<T>>,
    writer: Option<ContentWriter<T>>,
    hooks: Arc<dyn StorageHooks<T>>,
}

impl<T> Clone for EntityStorage<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            encryption: Arc::clone(&self.encryption),
            writer: self.writer.clone(),
            hooks: Arc::clone(&self.hooks),
        }
    }
}

impl<T: Stored> EntityStorage<T> {
    pub fn new(ctx: Arc<VaultContext>, encryption: Arc<dyn EncryptionPolicy<T>>) -> Self {
        Self {
            ctx,
            encryption,
            writer: None,
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn with_writer(mut self, writer: ContentWriter<T>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn StorageHooks<T>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn encryption(&self) -> &Arc<dyn EncryptionPolicy<T>> {
        &self.encryption
    }

    pub fn context(&self) -> &Arc<VaultContext> {
        &self.ctx
    }

    // ==================== Writes ====================

    /// Create or update one entity. Returns it decrypted.
    pub async fn save(&self, vault_id: &str, patch: Patch, meta: StoreMeta) -> Result<T> {
        let this = self.clone();
        let vault = vault_id.to_string();
        let mut saved = self
            .on_queue(vault_id, async move {
                this.commit(&vault, vec![patch], &meta, false).await
            })
            .await?;
        saved.pop().ok_or_else(|| StoreError::NotFound {
            table: T::KIND.table_name(),
            id: String::new(),
        })
    }

    /// Create or update many entities in one job.
    ///
    /// A patch without an id takes over the row already registered at its
    /// filepath, if any. Output order matches input order.
    pub async fn save_bulk(
        &self,
        vault_id: &str,
        patches: Vec<Patch>,
        meta: StoreMeta,
    ) -> Result<Vec<T>> {
        if patches.is_empty() {
            return Ok(Vec::new());
        }
        let this = self.clone();
        let vault = vault_id.to_string();
        self.on_queue(vault_id, async move {
            this.commit(&vault, patches, &meta, true).await
        })
        .await
    }

    pub async fn delete(&self, vault_id: &str, id: &str, meta: StoreMeta) -> Result<Option<T>> {
        let mut removed = self.delete_bulk(vault_id, vec![id.to_string()], meta).await?;
        Ok(removed.pop())
    }

    /// Delete rows, returning those that existed (decrypted).
    pub async fn delete_bulk(
        &self,
        vault_id: &str,
        ids: Vec<String>,
        meta: StoreMeta,
    ) -> Result<Vec<T>> {
        let this = self.clone();
        let vault = vault_id.to_string();
        self.on_queue(vault_id, async move {
            this.remove(&vault, ids, &meta).await
        })
        .await
    }

    /// Apply a row received from the cloud, as stored there.
    ///
    /// When the local row changed after `base_updated_at` (the version the
    /// remote edit was based on) both versions are kept in `localConflicts`
    /// and the local row is left untouched.
    pub async fn apply_remote(
        &self,
        vault_id: &str,
        remote: T,
        base_updated_at: Option<Timestamp>,
    ) -> Result<RemoteOutcome<T>> {
        let this = self.clone();
        let vault = vault_id.to_string();
        self.on_queue(vault_id, async move {
            this.merge_remote(&vault, remote, base_updated_at).await
        })
        .await
    }

    // ==================== Reads ====================

    pub async fn retrieve(&self, vault_id: &str, id: &str) -> Result<Option<T>> {
        let db = self.ctx.store().database(vault_id);
        match T::table(&db).get(id) {
            Some(raw) => Ok(Some(self.encryption.decrypt(vault_id, raw)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, vault_id: &str) -> Result<Vec<T>> {
        let db = self.ctx.store().database(vault_id);
        T::table(&db)
            .all()
            .into_iter()
            .map(|raw| Ok(self.encryption.decrypt(vault_id, raw)?))
            .collect()
    }

    /// Entities that live on the device, keyed by filepath.
    pub async fn list_by_filepath(&self, vault_id: &str) -> Result<HashMap<String, T>> {
        let mut by_path = HashMap::new();
        for entity in self.list(vault_id).await? {
            if let Some(filepath) = entity.filepath() {
                by_path.insert(filepath.to_string(), entity);
            }
        }
        Ok(by_path)
    }

    // ==================== Internals ====================

    async fn on_queue<R, Fut>(&self, vault_id: &str, job: Fut) -> Result<R>
    where
        R: Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.ctx
            .queues()
            .get(STORE_SCOPE, vault_id)
            .execute(move || async move {
                let result = job.await;
                let failure = result.as_ref().err().map(|e| e.to_string());
                let _ = tx.send(result);
                match failure {
                    Some(message) => Err(JobError::from(message)),
                    None => Ok(()),
                }
            });
        rx.await
            .map_err(|_| StoreError::QueueDropped(vault_id.to_string()))?
    }

    fn source(&self, meta: &StoreMeta) -> String {
        if meta.write_to_device {
            meta.client_id
                .clone()
                .unwrap_or_else(|| self.ctx.client_id().to_string())
        } else {
            DEVICE_SOURCE.to_string()
        }
    }

    /// The writer, when this change has to be mirrored to the device.
    fn device_writer(&self, vault_id: &str, meta: &StoreMeta) -> Option<&ContentWriter<T>> {
        if !T::STORE_LOCALLY
            || !meta.write_to_device
            || meta.client_id.as_deref() == Some(DEVICE_SOURCE)
            || !self.ctx.vaults().has_filepath(vault_id)
        {
            return None;
        }
        self.writer.as_ref()
    }

    fn decrypt_or_raw(&self, vault_id: &str, raw: T) -> T {
        match self.encryption.decrypt(vault_id, raw.clone()) {
            Ok(plain) => plain,
            Err(e) => {
                warn!("Failed to decrypt {} {}: {}", T::KIND.table_name(), raw.id(), e);
                raw
            }
        }
    }

    fn pending(
        &self,
        vault_id: &str,
        db: &VaultDatabase,
        mut patch: Patch,
        meta: &StoreMeta,
        now: &serde_json::Value,
    ) -> Result<PendingWrite<T>> {
        let table = T::table(db);
        let raw = match patch.id() {
            Some(id) => table.get(id),
            None => {
                let owner = patch
                    .filepath()
                    .and_then(|fp| self.ctx.registry().get(vault_id, fp));
                match owner.and_then(|id| table.get(&id)) {
                    Some(row) => {
                        patch.insert("id", row.id());
                        Some(row)
                    }
                    None => None,
                }
            }
        };
        let existing = match &raw {
            Some(row) => Some(self.encryption.decrypt(vault_id, row.clone())?),
            None => None,
        };

        if patch.id().is_none() {
            patch.insert("id", uuid::Uuid::new_v4().to_string());
        }
        patch.insert("vaultId", vault_id);
        if existing.is_none() {
            if !patch.contains("createdAt") {
                patch.insert("createdAt", now.clone());
            }
            if !patch.contains("updatedAt") {
                patch.insert("updatedAt", now.clone());
            }
        } else if meta.updated_at {
            patch.insert("updatedAt", now.clone());
        }

        Ok(PendingWrite {
            patch,
            existing,
            raw,
        })
    }

    fn seal_one(&self, vault_id: &str, write: &PendingWrite<T>, plain: &T) -> Result<T> {
        match self
            .encryption
            .encrypt_content(vault_id, &write.patch, write.existing.as_ref())?
        {
            Some(sealed) => Ok(sealed),
            // Untouched sensitive fields keep their ciphertext.
            None => match &write.raw {
                Some(raw) if raw.is_encrypted() => Ok(write.patch.apply_to(Some(raw))?),
                _ => Ok(plain.clone()),
            },
        }
    }

    /// Plain rows and the rows to store, in write order.
    fn seal_writes(
        &self,
        vault_id: &str,
        writes: &[PendingWrite<T>],
        meta: &StoreMeta,
        bulk: bool,
    ) -> Result<(Vec<T>, Vec<T>)> {
        let plain = writes
            .iter()
            .map(|write| write.patch.apply_to(write.existing.as_ref()))
            .collect::<std::result::Result<Vec<T>, _>>()?;

        let stored = if !meta.encrypt {
            plain.clone()
        } else if bulk {
            self.encryption.encrypt_content_bulk(vault_id, plain.clone())?
        } else {
            writes
                .iter()
                .zip(&plain)
                .map(|(write, entity)| self.seal_one(vault_id, write, entity))
                .collect::<Result<Vec<_>>>()?
        };
        Ok((plain, stored))
    }

    /// Hand back the paths preprocessing claimed for writes that were never
    /// stored.
    fn release_claims(&self, vault_id: &str, writes: &[PendingWrite<T>]) {
        let registry = self.ctx.registry();
        for write in writes {
            let Some(id) = write.patch.id() else {
                continue;
            };
            let previous = write.existing.as_ref().and_then(Entity::filepath);
            let claimed = write.patch.filepath();
            if claimed.is_none() || claimed == previous {
                continue;
            }
            match previous {
                Some(path) => registry.set(vault_id, path, id),
                None if registry.filepath_of(vault_id, id).as_deref() == claimed => {
                    registry.remove(vault_id, id);
                }
                None => {}
            }
        }
    }

    fn register(&self, vault_id: &str, previous: Option<&T>, entity: &T) {
        let registry = self.ctx.registry();
        match entity.filepath() {
            Some(filepath) => registry.set(vault_id, filepath, entity.id()),
            None if previous.and_then(Entity::filepath).is_some() => {
                registry.remove(vault_id, entity.id());
            }
            None => {}
        }
    }

    async fn commit(
        &self,
        vault_id: &str,
        patches: Vec<Patch>,
        meta: &StoreMeta,
        bulk: bool,
    ) -> Result<Vec<T>> {
        let db = self.ctx.store().database(vault_id);
        let now = timestamp_value(Utc::now());

        let mut writes = patches
            .into_iter()
            .map(|patch| self.pending(vault_id, &db, patch, meta, &now))
            .collect::<Result<Vec<_>>>()?;
        let preprocessed = self.hooks.preprocess(vault_id, &mut writes, meta).await;
        let sealed = preprocessed.and_then(|()| self.seal_writes(vault_id, &writes, meta, bulk));
        let (plain, stored) = match sealed {
            Ok(rows) => rows,
            Err(e) => {
                self.release_claims(vault_id, &writes);
                return Err(e);
            }
        };

        let source = self.source(meta);
        T::table(&db).bulk_put(stored, &source);
        for (write, entity) in writes.iter().zip(&plain) {
            self.register(vault_id, write.existing.as_ref(), entity);
        }
        self.hooks.committed(vault_id, &writes, &plain, &source);

        if meta.postprocess {
            if let Err(e) = self.hooks.postprocess(vault_id, &plain).await {
                warn!("Failed to postprocess {}: {}", T::KIND.table_name(), e);
            }
        }

        if let Some(writer) = self.device_writer(vault_id, meta) {
            if bulk {
                let created: Vec<T> = writes
                    .iter()
                    .zip(&plain)
                    .filter(|(write, _)| write.existing.is_none())
                    .map(|(_, entity)| entity.clone())
                    .collect();
                writer.create_batch(vault_id, &created).await?;
            }
            for (write, entity) in writes.iter().zip(&plain) {
                match &write.existing {
                    Some(old) => match writer.update(entity, old).await {
                        Err(WriterError::Io(IoError::NotImplemented { kind, .. })) => {
                            debug!("Device keeps {} {} as is on update", kind, entity.id());
                        }
                        result => result?,
                    },
                    None if !bulk => writer.create(entity).await?,
                    None => {}
                }
            }
        }

        Ok(plain)
    }

    async fn remove(&self, vault_id: &str, ids: Vec<String>, meta: &StoreMeta) -> Result<Vec<T>> {
        let db = self.ctx.store().database(vault_id);
        let removed = T::table(&db).bulk_remove(&ids, &self.source(meta));

        let plain: Vec<T> = removed
            .into_iter()
            .map(|raw| {
                self.ctx.registry().remove(vault_id, raw.id());
                self.decrypt_or_raw(vault_id, raw)
            })
            .collect();

        if let Some(writer) = self.device_writer(vault_id, meta) {
            for entity in &plain {
                writer.delete(entity).await?;
            }
        }
        Ok(plain)
    }

    async fn merge_remote(
        &self,
        vault_id: &str,
        remote: T,
        base_updated_at: Option<Timestamp>,
    ) -> Result<RemoteOutcome<T>> {
        let db = self.ctx.store().database(vault_id);
        let table = T::table(&db);
        let local = table.get(remote.id());

        if let Some(local) = &local {
            let modified_locally = match (local.updated_at(), base_updated_at) {
                (Some(local_at), Some(base)) => local_at > base,
                (None, Some(_)) => false,
                (_, None) => true,
            };
            if modified_locally {
                let now = Utc::now();
                let conflict = LocalConflict {
                    id: uuid::Uuid::new_v4().to_string(),
                    vault_id: vault_id.to_string(),
                    entity_id: remote.id().to_string(),
                    table: T::KIND.table_name().to_string(),
                    local: serde_json::to_value(local)?,
                    remote: serde_json::to_value(&remote)?,
                    created_at: Some(now),
                    updated_at: Some(now),
                    ..Default::default()
                };
                debug!(
                    "Conflict on {} {} in vault {}",
                    conflict.table, conflict.entity_id, vault_id
                );
                db.local_conflicts.put(conflict.clone(), REMOTE_SOURCE);
                self.ctx
                    .notify(Request::Store(StoreRequest::CheckConflicts {
                        vault_id: vault_id.to_string(),
                    }))
                    .await;
                return Ok(RemoteOutcome::Conflict(conflict));
            }
        }

        let previous = local.map(|raw| self.decrypt_or_raw(vault_id, raw));
        table.put(remote.clone(), REMOTE_SOURCE);
        let plain = self.encryption.decrypt(vault_id, remote)?;
        self.register(vault_id, previous.as_ref(), &plain);

        let meta = StoreMeta {
            client_id: Some(REMOTE_SOURCE.to_string()),
            ..StoreMeta::default()
        };
        if let Some(writer) = self.device_writer(vault_id, &meta) {
            match &previous {
                Some(old) => writer.update(&plain, old).await?,
                None => writer.create(&plain).await?,
            }
        }
        Ok(RemoteOutcome::Applied(plain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{datagram, EntityEncryption, SymmetricKey};
    use crate::entity::{Folder, Task};
    use crate::events::VaultEvent;
    use crate::io::FolderIo;
    use crate::protocol::{ClientConfig, ServiceClient};
    use crate::store::ChangeFilter;
    use crate::transport::{ChannelPort, MessagePort};
    use crate::vault::Vault;
    use crate::writer::FolderSerializer;
    use serde_json::Value;
    use std::sync::Mutex;

    fn task_storage(ctx: &Arc<VaultContext>) -> EntityStorage<Task> {
        EntityStorage::new(
            ctx.clone(),
            Arc::new(EntityEncryption::new(
                datagram::TASK,
                ctx.keys().clone(),
                ctx.vaults().clone(),
            )),
        )
    }

    fn local_context() -> Arc<VaultContext> {
        let ctx = VaultContext::new().with_client_id("client-1");
        ctx.add_vault(Vault::local("v1", "Notes"));
        Arc::new(ctx)
    }

    /// Context whose device answers every request and records operations.
    fn device_context() -> (Arc<VaultContext>, Arc<Mutex<Vec<String>>>) {
        let ((client_port, client_inbox), (server_port, mut server_inbox)) = ChannelPort::pair();
        let client = Arc::new(ServiceClient::new(
            Arc::new(client_port),
            ClientConfig::default(),
        ));
        client.listen(client_inbox);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        tokio::spawn(async move {
            while let Some(request) = server_inbox.recv().await {
                seen_clone.lock().unwrap().push(request.operation.clone());
                if request.message_id.is_some() {
                    let _ = server_port.post(request.respond(Value::Null)).await;
                }
            }
        });

        let ctx = VaultContext::with_client(client).with_client_id("client-1");
        ctx.add_vault(Vault::local("v1", "Notes").with_filepath("/notes"));
        (Arc::new(ctx), seen)
    }

    fn folder_storage(ctx: &Arc<VaultContext>) -> EntityStorage<Folder> {
        let client = ctx.client().unwrap().clone();
        EntityStorage::new(
            ctx.clone(),
            Arc::new(EntityEncryption::new(
                datagram::FOLDER,
                ctx.keys().clone(),
                ctx.vaults().clone(),
            )),
        )
        .with_writer(ContentWriter::new(
            Arc::new(FolderSerializer),
            Arc::new(FolderIo::new(client)),
        ))
    }

    // ==================== Save ====================

    #[tokio::test]
    async fn test_save_assigns_id_and_timestamps() {
        let ctx = local_context();
        let tasks = task_storage(&ctx);

        let saved = tasks
            .save("v1", Patch::new().with("text", "write tests"), StoreMeta::default())
            .await
            .unwrap();

        assert!(!saved.id.is_empty());
        assert_eq!(saved.vault_id, "v1");
        assert!(saved.created_at.is_some());
        assert_eq!(saved.created_at, saved.updated_at);

        let again = tasks.retrieve("v1", &saved.id).await.unwrap().unwrap();
        assert_eq!(again.text, "write tests");
    }

    #[tokio::test]
    async fn test_update_bumps_updated_at_only_when_asked() {
        let ctx = local_context();
        let tasks = task_storage(&ctx);
        let past = "2020-01-01T00:00:00.000Z";

        tasks
            .save(
                "v1",
                Patch::new().with("id", "t1").with("updatedAt", past),
                StoreMeta::default(),
            )
            .await
            .unwrap();

        let kept = tasks
            .save(
                "v1",
                Patch::new().with("id", "t1").with("completed", true),
                StoreMeta {
                    updated_at: false,
                    ..StoreMeta::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(timestamp_value(kept.updated_at.unwrap()), Value::from(past));

        let bumped = tasks
            .save("v1", Patch::new().with("id", "t1"), StoreMeta::default())
            .await
            .unwrap();
        assert!(bumped.updated_at > kept.updated_at);
        assert!(bumped.completed);
    }

    #[tokio::test]
    async fn test_remote_vault_rows_are_encrypted_at_rest() {
        let ctx = VaultContext::new();
        ctx.add_vault(Vault::remote("v1", "Cloud"));
        ctx.keys().set_vault_key("v1", SymmetricKey::generate());
        let ctx = Arc::new(ctx);
        let tasks = task_storage(&ctx);

        let saved = tasks
            .save(
                "v1",
                Patch::new().with("id", "t1").with("text", "secret"),
                StoreMeta::default(),
            )
            .await
            .unwrap();
        assert_eq!(saved.text, "secret");

        let raw = ctx.store().database("v1").tasks.get("t1").unwrap();
        assert!(raw.is_encrypted());
        assert_eq!(raw.text, "");

        // A patch without sensitive fields keeps the ciphertext.
        tasks
            .save(
                "v1",
                Patch::new().with("id", "t1").with("completed", true),
                StoreMeta::default(),
            )
            .await
            .unwrap();
        let raw = ctx.store().database("v1").tasks.get("t1").unwrap();
        assert!(raw.is_encrypted());
        assert!(raw.completed);
        assert_eq!(tasks.retrieve("v1", "t1").await.unwrap().unwrap().text, "secret");
    }

    #[tokio::test]
    async fn test_save_bulk_reuses_ids_by_filepath() {
        let ctx = local_context();
        let tasks = task_storage(&ctx);
        ctx.registry().set("v1", "todo.md", "t1");
        tasks
            .save("v1", Patch::new().with("id", "t1"), StoreMeta::default())
            .await
            .unwrap();

        let saved = tasks
            .save_bulk(
                "v1",
                vec![
                    Patch::new().with("filepath", "todo.md").with("text", "a"),
                    Patch::new().with("text", "b"),
                ],
                StoreMeta::default(),
            )
            .await
            .unwrap();

        assert_eq!(saved[0].id, "t1");
        assert_eq!(saved[0].text, "a");
        assert_ne!(saved[1].id, "t1");
        assert_eq!(tasks.list("v1").await.unwrap().len(), 2);
    }

    // ==================== Change feed ====================

    #[tokio::test]
    async fn test_change_source_and_echo_filter() {
        let ctx = local_context();
        let tasks = task_storage(&ctx);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let filter = ChangeFilter::new("client-1");
        let _sub = ctx.events().subscribe(move |event| {
            if let VaultEvent::Changed { source, .. } = &event {
                seen_clone
                    .lock()
                    .unwrap()
                    .push((source.clone(), filter.is_foreign(&event)));
            }
        });

        tasks
            .save("v1", Patch::new().with("id", "a"), StoreMeta::default())
            .await
            .unwrap();
        tasks
            .save("v1", Patch::new().with("id", "b"), StoreMeta::from_device())
            .await
            .unwrap();
        tasks
            .save(
                "v1",
                Patch::new().with("id", "c"),
                StoreMeta {
                    client_id: Some("client-2".into()),
                    ..StoreMeta::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("client-1".to_string(), false),
                ("device".to_string(), false),
                ("client-2".to_string(), true),
            ]
        );
    }

    // ==================== Device mirroring ====================

    #[tokio::test]
    async fn test_device_sourced_saves_never_write_back() {
        let (ctx, seen) = device_context();
        let folders = folder_storage(&ctx);

        folders
            .save(
                "v1",
                Patch::new().with("id", "f1").with("name", "Work").with("filepath", "Work"),
                StoreMeta::from_device(),
            )
            .await
            .unwrap();
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(ctx.registry().get("v1", "Work").as_deref(), Some("f1"));

        folders
            .save(
                "v1",
                Patch::new().with("id", "f1").with("filepath", "Projects"),
                StoreMeta::default(),
            )
            .await
            .unwrap();
        folders
            .delete("v1", "f1", StoreMeta::default())
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["project:update", "project:delete"]
        );
        assert!(ctx.registry().get("v1", "Projects").is_none());
    }

    #[tokio::test]
    async fn test_vault_without_filepath_is_not_mirrored() {
        let (ctx, seen) = device_context();
        ctx.add_vault(Vault::local("v2", "Scratch"));
        let folders = folder_storage(&ctx);

        folders
            .save(
                "v2",
                Patch::new().with("name", "Inbox").with("filepath", "Inbox"),
                StoreMeta::default(),
            )
            .await
            .unwrap();

        assert!(seen.lock().unwrap().is_empty());
    }

    // ==================== Remote changes ====================

    #[tokio::test]
    async fn test_remote_change_over_local_edit_becomes_conflict() {
        let ctx = local_context();
        let tasks = task_storage(&ctx);
        let base = Utc::now() - chrono::Duration::seconds(1);

        tasks
            .save("v1", Patch::new().with("id", "t1").with("text", "local"), StoreMeta::default())
            .await
            .unwrap();

        let remote = Task {
            id: "t1".into(),
            vault_id: "v1".into(),
            text: "remote".into(),
            ..Default::default()
        };
        let outcome = tasks.apply_remote("v1", remote.clone(), Some(base)).await.unwrap();

        let RemoteOutcome::Conflict(conflict) = outcome else {
            panic!("expected a conflict");
        };
        assert_eq!(conflict.entity_id, "t1");
        assert_eq!(conflict.table, "tasks");
        assert_eq!(conflict.remote["text"], "remote");
        assert_eq!(tasks.retrieve("v1", "t1").await.unwrap().unwrap().text, "local");
        assert_eq!(ctx.store().database("v1").local_conflicts.len(), 1);

        // Based on the latest local version: applies cleanly.
        let latest = tasks.retrieve("v1", "t1").await.unwrap().unwrap().updated_at;
        let outcome = tasks.apply_remote("v1", remote, latest).await.unwrap();
        assert!(matches!(outcome, RemoteOutcome::Applied(ref t) if t.text == "remote"));
    }
}
