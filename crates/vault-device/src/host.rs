//! The database and device service of one vault, wired together in-process.
//!
//! The database context talks to the [`DeviceService`] over a channel pair,
//! exactly as it would across a process boundary, so every device write and
//! every import read goes through the protocol.

use crate::echo::EchoTracker;
use crate::native_fs::NativeFs;
use crate::persistence::SnapshotStore;
use crate::service::DeviceService;
use crate::watcher::FileEvent;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vault_db::importer::ImportSummary;
use vault_db::protocol::serve;
use vault_db::{
    ChannelPort, ClientConfig, DeviceLoader, Entity, ImportConfig, Importer, MigrationEngine,
    MigrationRecord, MigrationState, ServiceClient, ServiceKey, Storages, SymmetricKey, Vault, VaultContext,
};

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub vault_path: PathBuf,
    pub vault_id: String,
    /// Remote vaults are encrypted at rest once `key` is set.
    pub remote: bool,
    pub key: Option<SymmetricKey>,
    pub state_dir: PathBuf,
    pub import: ImportConfig,
}

pub struct DeviceHost {
    config: HostConfig,
    ctx: Arc<VaultContext>,
    storages: Storages,
    importer: Importer<DeviceLoader>,
    migrations: MigrationEngine,
    snapshots: SnapshotStore,
    echoes: EchoTracker,
    /// No snapshot existed at start.
    created: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl DeviceHost {
    /// Start the device service and restore the vault's last snapshot.
    pub async fn start(mut config: HostConfig) -> Result<Self> {
        config.vault_path = tokio::fs::canonicalize(&config.vault_path)
            .await
            .with_context(|| format!("Vault not found: {}", config.vault_path.display()))?;
        let root = config.vault_path.to_string_lossy().into_owned();

        let ((db_port, db_inbox), (device_port, device_inbox)) = ChannelPort::pair();
        let client = Arc::new(ServiceClient::new(
            Arc::new(db_port),
            ClientConfig::for_caller(ServiceKey::Database),
        ));
        let listener = client.listen(db_inbox);

        let ctx = Arc::new(VaultContext::with_client(client.clone()));
        let name = config
            .vault_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| config.vault_id.clone());
        let vault = if config.remote {
            Vault::remote(config.vault_id.clone(), name)
        } else {
            Vault::local(config.vault_id.clone(), name)
        };
        ctx.add_vault(vault.with_filepath(root));
        if let Some(key) = &config.key {
            ctx.keys().set_vault_key(&config.vault_id, key.clone());
        }

        let echoes = EchoTracker::new();
        let service = DeviceService::new(NativeFs::new(PathBuf::from("/")), ctx.vaults().clone())
            .with_echoes(echoes.clone());
        let server = tokio::spawn(serve(
            Arc::new(service),
            Arc::new(device_port),
            device_inbox,
        ));

        let storages = Storages::new(ctx.clone());
        let loader = DeviceLoader::new(client);
        let importer =
            Importer::new(storages.clone(), loader).with_config(config.import.clone());
        let migrations = MigrationEngine::new(storages.clone());
        let snapshots = SnapshotStore::new(config.state_dir.clone());

        let mut host = Self {
            config,
            ctx,
            storages,
            importer,
            migrations,
            snapshots,
            echoes,
            created: false,
            tasks: vec![listener, server],
        };
        host.created = !host.restore().await?;
        Ok(host)
    }

    /// Returns whether a snapshot was restored.
    async fn restore(&self) -> Result<bool> {
        let vault_id = self.vault_id();
        if !self.snapshots.restore(self.ctx.store(), vault_id)? {
            info!("No snapshot for {}, starting empty", vault_id);
            return Ok(false);
        }

        // Rebuild the filepath registry from the restored rows.
        let registry = self.ctx.registry();
        for doc in self.storages.documents.list(vault_id).await? {
            if let Some(filepath) = &doc.filepath {
                registry.set(vault_id, filepath, doc.id());
            }
        }
        for folder in self.storages.folders.list(vault_id).await? {
            if let Some(filepath) = &folder.filepath {
                registry.set(vault_id, filepath, folder.id());
            }
        }
        for image in self.storages.images.list(vault_id).await? {
            if let Some(filepath) = &image.filepath {
                registry.set(vault_id, filepath, image.id());
            }
        }
        Ok(true)
    }

    pub fn vault_id(&self) -> &str {
        &self.config.vault_id
    }

    pub fn vault_path(&self) -> &std::path::Path {
        &self.config.vault_path
    }

    pub fn import_config(&self) -> &ImportConfig {
        &self.config.import
    }

    pub fn context(&self) -> &Arc<VaultContext> {
        &self.ctx
    }

    pub fn storages(&self) -> &Storages {
        &self.storages
    }

    pub fn migrations(&self) -> &MigrationEngine {
        &self.migrations
    }

    /// Write marks shared with the device service.
    pub fn echoes(&self) -> &EchoTracker {
        &self.echoes
    }

    /// Bring the database in line with the directory: import everything,
    /// drop rows whose files are gone, run pending migrations and finish
    /// interrupted attachment re-encryption.
    pub async fn sync_vault(&self) -> Result<ImportSummary> {
        let vault_id = self.vault_id();

        let mut summary = self
            .importer
            .import_using_filepath(vault_id, "", None)
            .await?;
        summary.deleted = self.importer.delete_missing_entities(vault_id).await?;
        info!(
            "Imported {}: {} documents, {} folders, {} attachments ({} unsupported, {} deleted)",
            vault_id,
            summary.documents,
            summary.folders,
            summary.attachments,
            summary.unsupported,
            summary.deleted
        );

        self.migrations.seed_vault(vault_id, self.created).await?;
        log_migrations(self.migrations.migrate_local(vault_id).await?);
        if self.config.remote {
            log_migrations(self.migrations.migrate_remote(vault_id).await?);
        }

        let resumed = self.storages.reencryptor.resume_pending(vault_id).await;
        if resumed > 0 {
            info!("Finished re-encrypting {} attachment(s)", resumed);
        }

        Ok(summary)
    }

    /// Re-import paths reported by the watcher.
    pub async fn apply_changes(&self, events: Vec<FileEvent>) -> Result<ImportSummary> {
        let paths = events.into_iter().map(|event| event.path).collect();
        let summary = self
            .importer
            .import_changes(self.vault_id(), paths)
            .await?;
        debug!("Applied changes to {}: {:?}", self.vault_id(), summary);
        Ok(summary)
    }

    /// Persist the vault's database.
    pub fn save(&self) -> Result<()> {
        self.echoes.cleanup_expired();
        self.snapshots.persist(self.ctx.store(), self.vault_id())
    }
}

fn log_migrations(records: Vec<MigrationRecord>) {
    for record in records {
        match record.state {
            MigrationState::Failed => warn!(
                "Migration {} failed: {}",
                record.version,
                record.error_message.as_deref().unwrap_or("unknown error")
            ),
            _ => debug!("Migration {} is {:?}", record.version, record.state),
        }
    }
}

impl Drop for DeviceHost {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
