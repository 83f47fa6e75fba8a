//! Versioned one-shot migrations of a vault's data.
//!
//! Each `(vault, version, type)` triple has one [`MigrationRecord`] that moves
//! `pending → done | failed` exactly once. Pending records run in ascending
//! version order on the vault's `migrations` queue; a failing migration is
//! recorded and the next one still runs.

use crate::context::{Storages, VaultContext};
use crate::crypto::{datagram, EntityEncryption};
use crate::entity::{impl_entity, EntityKind, IntegrationType, Patch, Timestamp};
use crate::store::{EntityStorage, StoreError, StoreMeta};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

const MIGRATION_SCOPE: &str = "migrations";
/// App setting holding the version a vault was created at.
const INITIAL_VERSION_SETTING: &str = "initialMigrationVersion";

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Invalid migration version: {0}")]
    InvalidVersion(String),

    #[error("Migration {version} failed: {message}")]
    Failed {
        version: MigrationVersion,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, MigrationError>;

/// `major.minor`, ordered numerically (`6.10` sorts after `6.9`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationVersion {
    pub major: u32,
    pub minor: u32,
}

impl MigrationVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for MigrationVersion {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || MigrationError::InvalidVersion(s.to_string());
        let (major, minor) = s.trim().split_once('.').unwrap_or((s.trim(), "0"));
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for MigrationVersion {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MigrationVersion> for String {
    fn from(version: MigrationVersion) -> Self {
        version.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationType {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationState {
    #[default]
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MigrationRecord {
    pub id: String,
    pub vault_id: String,
    #[serde(rename = "type")]
    pub migration_type: MigrationType,
    pub state: MigrationState,
    pub version: MigrationVersion,
    pub error_message: Option<String>,
    pub encryption_key: Option<String>,
    pub encrypted_data: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl_entity!(MigrationRecord, EntityKind::Migration);

/// A migration step. Must tolerate running against data it already
/// migrated, although the engine runs it at most once per triple.
#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> MigrationVersion;

    /// Whether this migration has a step for `migration_type`.
    fn applies_to(&self, migration_type: MigrationType) -> bool;

    async fn run(
        &self,
        vault_id: &str,
        migration_type: MigrationType,
        storages: &Storages,
    ) -> Result<()>;
}

/// 6.3: Jira integrations are pushed back a year and saved in plaintext
/// under a throwaway client id so they resync from scratch.
pub struct JiraResync;

#[async_trait]
impl Migration for JiraResync {
    fn version(&self) -> MigrationVersion {
        MigrationVersion::new(6, 3)
    }

    fn applies_to(&self, migration_type: MigrationType) -> bool {
        migration_type == MigrationType::Local
    }

    async fn run(&self, vault_id: &str, _: MigrationType, storages: &Storages) -> Result<()> {
        let stale = Utc::now() - Duration::days(365);
        for integration in storages.integrations.list(vault_id).await? {
            if integration.integration_type != IntegrationType::Jira {
                continue;
            }
            let mut patch = Patch::from_entity(&integration).map_err(StoreError::from)?;
            patch.insert("updatedAt", crate::entity::timestamp_value(stale));
            storages
                .integrations
                .save(
                    vault_id,
                    patch,
                    StoreMeta {
                        client_id: Some(uuid::Uuid::new_v4().to_string()),
                        write_to_device: true,
                        encrypt: false,
                        updated_at: false,
                        ..StoreMeta::default()
                    },
                )
                .await?;
        }
        Ok(())
    }
}

struct Inner {
    storages: Storages,
    records: EntityStorage<MigrationRecord>,
    migrations: BTreeMap<MigrationVersion, Arc<dyn Migration>>,
    in_flight: Mutex<HashSet<String>>,
}

#[derive(Clone)]
pub struct MigrationEngine {
    inner: Arc<Inner>,
}

impl MigrationEngine {
    /// Engine with the built-in migrations registered.
    pub fn new(storages: Storages) -> Self {
        Self::empty(storages).with_migration(Arc::new(JiraResync))
    }

    pub fn empty(storages: Storages) -> Self {
        let ctx = storages.documents.context().clone();
        let records = EntityStorage::new(
            ctx.clone(),
            Arc::new(EntityEncryption::new(
                datagram::NONE,
                ctx.keys().clone(),
                ctx.vaults().clone(),
            )),
        );
        Self {
            inner: Arc::new(Inner {
                storages,
                records,
                migrations: BTreeMap::new(),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Register `migration`, replacing any at the same version. Only valid
    /// while the engine is not shared yet.
    pub fn with_migration(mut self, migration: Arc<dyn Migration>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => {
                inner.migrations.insert(migration.version(), migration);
            }
            None => warn!(
                "Migration engine already shared, ignoring migration {}",
                migration.version()
            ),
        }
        self
    }

    fn ctx(&self) -> &Arc<VaultContext> {
        self.inner.records.context()
    }

    /// Write pending records for every registered migration newer than
    /// `since` (all of them when `None`). Remote records are only written for
    /// remote vaults. Existing triples are left alone. Returns the number of
    /// records created.
    pub async fn seed(&self, vault_id: &str, since: Option<MigrationVersion>) -> Result<usize> {
        let existing: HashSet<(MigrationVersion, MigrationType)> = self
            .inner
            .records
            .list(vault_id)
            .await?
            .into_iter()
            .map(|r| (r.version, r.migration_type))
            .collect();
        let remote = self.ctx().vaults().is_remote(vault_id);

        let mut patches = Vec::new();
        for (version, migration) in &self.inner.migrations {
            if since.is_some_and(|since| *version <= since) {
                continue;
            }
            for migration_type in [MigrationType::Local, MigrationType::Remote] {
                if migration_type == MigrationType::Remote && !remote {
                    continue;
                }
                if !migration.applies_to(migration_type)
                    || existing.contains(&(*version, migration_type))
                {
                    continue;
                }
                let record = MigrationRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    migration_type,
                    version: *version,
                    ..Default::default()
                };
                patches.push(Patch::from_entity(&record).map_err(StoreError::from)?);
            }
        }

        let created = patches.len();
        self.inner
            .records
            .save_bulk(vault_id, patches, StoreMeta::from_device())
            .await?;
        Ok(created)
    }

    /// Newest registered version.
    pub fn latest_version(&self) -> Option<MigrationVersion> {
        self.inner.migrations.keys().next_back().copied()
    }

    /// Version the vault was created at, once recorded.
    pub async fn initial_version(&self, vault_id: &str) -> Result<Option<MigrationVersion>> {
        let setting = self
            .inner
            .storages
            .app_settings
            .retrieve(vault_id, INITIAL_VERSION_SETTING)
            .await?;
        match setting.as_ref().and_then(|s| s.value.as_str()) {
            Some(version) => Ok(Some(version.parse()?)),
            None => Ok(None),
        }
    }

    /// Seed the vault with the migrations newer than the version it was
    /// created at. The first call records that version: the newest one for
    /// a vault `created` just now (it already has the current layout), none
    /// for older data, which gets every migration.
    pub async fn seed_vault(&self, vault_id: &str, created: bool) -> Result<usize> {
        let since = match self.initial_version(vault_id).await? {
            Some(version) => version,
            None => {
                let version = if created {
                    self.latest_version().unwrap_or_default()
                } else {
                    MigrationVersion::default()
                };
                self.inner
                    .storages
                    .app_settings
                    .save(
                        vault_id,
                        Patch::new()
                            .with("id", INITIAL_VERSION_SETTING)
                            .with("key", INITIAL_VERSION_SETTING)
                            .with("value", version.to_string()),
                        StoreMeta::from_device(),
                    )
                    .await?;
                info!("Vault {} starts at migration version {}", vault_id, version);
                version
            }
        };
        self.seed(vault_id, Some(since)).await
    }

    pub async fn migrate_local(&self, vault_id: &str) -> Result<Vec<MigrationRecord>> {
        self.migrate(vault_id, MigrationType::Local).await
    }

    pub async fn migrate_remote(&self, vault_id: &str) -> Result<Vec<MigrationRecord>> {
        self.migrate(vault_id, MigrationType::Remote).await
    }

    /// Every record of the vault, by version.
    pub async fn status(&self, vault_id: &str) -> Result<Vec<MigrationRecord>> {
        let mut records = self.inner.records.list(vault_id).await?;
        records.sort_by_key(|r| (r.version, r.migration_type == MigrationType::Remote));
        Ok(records)
    }

    /// Queue the pending records of `migration_type` and wait for the queue
    /// to drain. Returns the records queued by this call, as they ended.
    async fn migrate(
        &self,
        vault_id: &str,
        migration_type: MigrationType,
    ) -> Result<Vec<MigrationRecord>> {
        let mut pending: Vec<MigrationRecord> = self
            .inner
            .records
            .list(vault_id)
            .await?
            .into_iter()
            .filter(|r| r.migration_type == migration_type && r.state == MigrationState::Pending)
            .collect();
        pending.sort_by_key(|r| r.version);

        let queue = self.ctx().queues().get(MIGRATION_SCOPE, vault_id);
        let mut queued = Vec::new();
        for record in pending {
            let Some(migration) = self.inner.migrations.get(&record.version).cloned() else {
                debug!("No migration registered for {}", record.version);
                continue;
            };
            if !migration.applies_to(migration_type) {
                continue;
            }
            if !self.claim(&record.id) {
                debug!("Migration {} already running in vault {}", record.version, vault_id);
                continue;
            }

            queued.push(record.id.clone());
            let this = self.clone();
            let vault = vault_id.to_string();
            queue.execute(move || async move {
                this.run_unit(&vault, record, migration).await;
                Ok(())
            });
        }
        queue.await_queue_finish().await;

        let mut finished = Vec::with_capacity(queued.len());
        for id in queued {
            if let Some(record) = self.inner.records.retrieve(vault_id, &id).await? {
                finished.push(record);
            }
        }
        Ok(finished)
    }

    fn claim(&self, id: &str) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string())
    }

    fn release(&self, id: &str) {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    async fn run_unit(&self, vault_id: &str, record: MigrationRecord, migration: Arc<dyn Migration>) {
        info!(
            "Running {:?} migration {} in vault {}",
            record.migration_type, record.version, vault_id
        );
        let patch = match migration
            .run(vault_id, record.migration_type, &self.inner.storages)
            .await
        {
            Ok(()) => Patch::new()
                .with("id", record.id.as_str())
                .with("state", "done"),
            Err(e) => {
                warn!("Failed to run migration {}: {}", record.version, e);
                Patch::new()
                    .with("id", record.id.as_str())
                    .with("state", "failed")
                    .with("errorMessage", e.to_string())
            }
        };
        if let Err(e) = self
            .inner
            .records
            .save(vault_id, patch, StoreMeta::from_device())
            .await
        {
            warn!("Failed to record migration {}: {}", record.version, e);
        }
        self.release(&record.id);
    }
}
