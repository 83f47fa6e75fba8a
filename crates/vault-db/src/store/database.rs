//! Per-vault databases and their snapshot form.

use super::table::Table;
use crate::crypto::ReencryptionMarker;
use crate::entity::{
    AppSetting, Document, Entity, Event, Folder, Image, ImageData, Integration, LocalConflict,
    Task, Version,
};
use crate::events::EventBus;
use crate::migration::MigrationRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A kind with a table in [`VaultDatabase`].
pub trait Stored: Entity {
    /// False for kinds that never mirror to the device.
    const STORE_LOCALLY: bool = true;

    fn table(db: &VaultDatabase) -> &Table<Self>;
}

macro_rules! stored {
    ($ty:ty, $field:ident) => {
        impl Stored for $ty {
            fn table(db: &VaultDatabase) -> &Table<Self> {
                &db.$field
            }
        }
    };
}

stored!(Document, documents);
stored!(Folder, folders);
stored!(Task, tasks);
stored!(Event, events);
stored!(Integration, integrations);
stored!(Image, images);
stored!(Version, versions);
stored!(LocalConflict, local_conflicts);
stored!(MigrationRecord, migrations);
stored!(AppSetting, app_settings);
stored!(ReencryptionMarker, reencryption_markers);

impl Stored for ImageData {
    const STORE_LOCALLY: bool = false;

    fn table(db: &VaultDatabase) -> &Table<Self> {
        &db.image_data
    }
}

pub struct VaultDatabase {
    vault_id: String,
    pub documents: Table<Document>,
    pub folders: Table<Folder>,
    pub tasks: Table<Task>,
    pub events: Table<Event>,
    pub integrations: Table<Integration>,
    pub images: Table<Image>,
    pub image_data: Table<ImageData>,
    pub versions: Table<Version>,
    pub local_conflicts: Table<LocalConflict>,
    pub migrations: Table<MigrationRecord>,
    pub app_settings: Table<AppSetting>,
    pub reencryption_markers: Table<ReencryptionMarker>,
}

/// Every table of a vault, as written to disk by hosts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseSnapshot {
    pub vault_id: String,
    pub documents: Vec<Document>,
    pub folders: Vec<Folder>,
    pub tasks: Vec<Task>,
    pub events: Vec<Event>,
    pub integrations: Vec<Integration>,
    pub images: Vec<Image>,
    pub image_data: Vec<ImageData>,
    pub versions: Vec<Version>,
    pub local_conflicts: Vec<LocalConflict>,
    pub migrations: Vec<MigrationRecord>,
    pub app_settings: Vec<AppSetting>,
    pub reencryption_markers: Vec<ReencryptionMarker>,
}

impl VaultDatabase {
    pub fn new(vault_id: impl Into<String>, events: Arc<EventBus>) -> Self {
        let vault_id = vault_id.into();
        Self {
            documents: Table::new(vault_id.clone(), events.clone()),
            folders: Table::new(vault_id.clone(), events.clone()),
            tasks: Table::new(vault_id.clone(), events.clone()),
            events: Table::new(vault_id.clone(), events.clone()),
            integrations: Table::new(vault_id.clone(), events.clone()),
            images: Table::new(vault_id.clone(), events.clone()),
            image_data: Table::new(vault_id.clone(), events.clone()),
            versions: Table::new(vault_id.clone(), events.clone()),
            local_conflicts: Table::new(vault_id.clone(), events.clone()),
            migrations: Table::new(vault_id.clone(), events.clone()),
            app_settings: Table::new(vault_id.clone(), events.clone()),
            reencryption_markers: Table::new(vault_id.clone(), events),
            vault_id,
        }
    }

    pub fn vault_id(&self) -> &str {
        &self.vault_id
    }

    pub fn snapshot(&self) -> DatabaseSnapshot {
        DatabaseSnapshot {
            vault_id: self.vault_id.clone(),
            documents: self.documents.all(),
            folders: self.folders.all(),
            tasks: self.tasks.all(),
            events: self.events.all(),
            integrations: self.integrations.all(),
            images: self.images.all(),
            image_data: self.image_data.all(),
            versions: self.versions.all(),
            local_conflicts: self.local_conflicts.all(),
            migrations: self.migrations.all(),
            app_settings: self.app_settings.all(),
            reencryption_markers: self.reencryption_markers.all(),
        }
    }

    /// Replace every table with the snapshot's rows. No change events.
    pub fn restore(&self, snapshot: DatabaseSnapshot) {
        self.documents.load(snapshot.documents);
        self.folders.load(snapshot.folders);
        self.tasks.load(snapshot.tasks);
        self.events.load(snapshot.events);
        self.integrations.load(snapshot.integrations);
        self.images.load(snapshot.images);
        self.image_data.load(snapshot.image_data);
        self.versions.load(snapshot.versions);
        self.local_conflicts.load(snapshot.local_conflicts);
        self.migrations.load(snapshot.migrations);
        self.app_settings.load(snapshot.app_settings);
        self.reencryption_markers.load(snapshot.reencryption_markers);
    }
}

/// All open vault databases of a context.
pub struct LocalStore {
    events: Arc<EventBus>,
    databases: RwLock<HashMap<String, Arc<VaultDatabase>>>,
}

impl LocalStore {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            events,
            databases: RwLock::new(HashMap::new()),
        }
    }

    /// The vault's database, opened on first use.
    pub fn database(&self, vault_id: &str) -> Arc<VaultDatabase> {
        if let Some(db) = self
            .databases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(vault_id)
        {
            return Arc::clone(db);
        }
        let mut databases = self.databases.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            databases
                .entry(vault_id.to_string())
                .or_insert_with(|| Arc::new(VaultDatabase::new(vault_id, self.events.clone()))),
        )
    }

    pub fn close(&self, vault_id: &str) -> Option<Arc<VaultDatabase>> {
        self.databases
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(vault_id)
    }

    pub fn vault_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .databases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
