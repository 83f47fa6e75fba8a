//! Entity model shared by the store, encryption and the device pipeline.
//!
//! Every persisted record is a plain serde struct with camelCase wire names.
//! Partial updates travel as [`Patch`]es: JSON objects merged over the
//! stored row, so "field absent" and "field cleared" stay distinguishable.

use crate::content::RichDocument;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Debug;

pub type Timestamp = DateTime<Utc>;

/// Kinds of persisted records, one table each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Document,
    Folder,
    Task,
    Event,
    Integration,
    Image,
    ImageData,
    Version,
    LocalConflict,
    Migration,
    AppSetting,
    ReencryptionMarker,
}

impl EntityKind {
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Document => "documents",
            EntityKind::Folder => "folders",
            EntityKind::Task => "tasks",
            EntityKind::Event => "events",
            EntityKind::Integration => "integrations",
            EntityKind::Image => "images",
            EntityKind::ImageData => "imageData",
            EntityKind::Version => "versions",
            EntityKind::LocalConflict => "localConflicts",
            EntityKind::Migration => "migrations",
            EntityKind::AppSetting => "appSettings",
            EntityKind::ReencryptionMarker => "reencryptionMarkers",
        }
    }
}

/// Common accessors over every persisted record.
pub trait Entity: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;
    fn vault_id(&self) -> &str;
    fn created_at(&self) -> Option<Timestamp>;
    fn updated_at(&self) -> Option<Timestamp>;
    fn encrypted_data(&self) -> Option<&str>;
    fn encryption_key(&self) -> Option<&str>;

    fn set_created_at(&mut self, at: Option<Timestamp>);
    fn set_updated_at(&mut self, at: Option<Timestamp>);
    fn set_encrypted_data(&mut self, data: Option<String>);
    fn set_encryption_key(&mut self, key: Option<String>);

    fn filepath(&self) -> Option<&str> {
        None
    }

    fn parent_id(&self) -> Option<&str> {
        None
    }

    fn sharing_uuid(&self) -> Option<&str> {
        None
    }

    /// True when `encryptedData` is present and non-empty, i.e. the
    /// plaintext copies of sensitive fields are stale.
    fn is_encrypted(&self) -> bool {
        self.encrypted_data().is_some_and(|d| !d.is_empty())
    }
}

macro_rules! impl_entity {
    ($ty:ty, $kind:expr $(, $method:ident => $field:ident)* $(,)?) => {
        impl $crate::entity::Entity for $ty {
            const KIND: $crate::entity::EntityKind = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn vault_id(&self) -> &str {
                &self.vault_id
            }

            fn created_at(&self) -> Option<$crate::entity::Timestamp> {
                self.created_at
            }

            fn updated_at(&self) -> Option<$crate::entity::Timestamp> {
                self.updated_at
            }

            fn encrypted_data(&self) -> Option<&str> {
                self.encrypted_data.as_deref()
            }

            fn encryption_key(&self) -> Option<&str> {
                self.encryption_key.as_deref()
            }

            fn set_created_at(&mut self, at: Option<$crate::entity::Timestamp>) {
                self.created_at = at;
            }

            fn set_updated_at(&mut self, at: Option<$crate::entity::Timestamp>) {
                self.updated_at = at;
            }

            fn set_encrypted_data(&mut self, data: Option<String>) {
                self.encrypted_data = data;
            }

            fn set_encryption_key(&mut self, key: Option<String>) {
                self.encryption_key = key;
            }

            $(
                fn $method(&self) -> Option<&str> {
                    self.$field.as_deref()
                }
            )*
        }
    };
}

pub(crate) use impl_entity;

/// A page of rich content, mirrored to a markdown file when the vault has a
/// filesystem root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub vault_id: String,
    pub title: String,
    pub content: Option<RichDocument>,
    /// Markdown rendering of `content`, as written to disk.
    pub md_content: Option<String>,
    pub filepath: Option<String>,
    pub parent_id: Option<String>,
    /// Set while the document is publicly shared.
    pub sharing_uuid: Option<String>,
    pub archived: bool,
    pub pinned: bool,
    pub encryption_key: Option<String>,
    pub encrypted_data: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl_entity!(
    Document,
    EntityKind::Document,
    filepath => filepath,
    parent_id => parent_id,
    sharing_uuid => sharing_uuid,
);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub vault_id: String,
    pub name: String,
    pub filepath: Option<String>,
    pub parent_id: Option<String>,
    pub sharing_uuid: Option<String>,
    pub icon: Option<String>,
    pub encryption_key: Option<String>,
    pub encrypted_data: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl_entity!(
    Folder,
    EntityKind::Folder,
    filepath => filepath,
    parent_id => parent_id,
    sharing_uuid => sharing_uuid,
);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub vault_id: String,
    pub text: String,
    pub description: Option<String>,
    pub completed: bool,
    pub due_date: Option<Timestamp>,
    pub parent_id: Option<String>,
    pub encryption_key: Option<String>,
    pub encrypted_data: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl_entity!(Task, EntityKind::Task, parent_id => parent_id);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub vault_id: String,
    pub text: String,
    pub description: Option<String>,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub encryption_key: Option<String>,
    pub encrypted_data: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl_entity!(Event, EntityKind::Event);

/// Third-party service an integration talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    Github,
    AiAssistant,
    Jira,
    IcsCalendar,
    Linear,
    GoogleCalendar,
    #[default]
    #[serde(other)]
    Other,
}

impl IntegrationType {
    /// Integrations whose configuration holds credentials worth encrypting.
    pub fn is_encryptable(&self) -> bool {
        matches!(
            self,
            IntegrationType::Github
                | IntegrationType::AiAssistant
                | IntegrationType::Jira
                | IntegrationType::IcsCalendar
                | IntegrationType::Linear
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Integration {
    pub id: String,
    pub vault_id: String,
    #[serde(rename = "type")]
    pub integration_type: IntegrationType,
    /// Service-specific configuration, including credentials.
    pub data: Option<Value>,
    pub encryption_key: Option<String>,
    pub encrypted_data: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl_entity!(Integration, EntityKind::Integration);

/// Attachment metadata. Pixel data lives in [`ImageData`] under the same id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Image {
    pub id: String,
    pub vault_id: String,
    pub document_id: Option<String>,
    pub name: String,
    pub filepath: Option<String>,
    pub is_on_disk: bool,
    pub encryption_key: Option<String>,
    pub encrypted_data: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl_entity!(Image, EntityKind::Image, filepath => filepath);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageData {
    pub id: String,
    pub vault_id: String,
    /// Base64 image bytes.
    pub data: Option<String>,
    pub encryption_key: Option<String>,
    pub encrypted_data: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl_entity!(ImageData, EntityKind::ImageData);

/// Historical snapshot of an entity's content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Version {
    pub id: String,
    pub vault_id: String,
    pub entity_id: String,
    pub content: Option<RichDocument>,
    pub encryption_key: Option<String>,
    pub encrypted_data: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl_entity!(Version, EntityKind::Version);

/// A remote change that could not be applied over local edits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalConflict {
    pub id: String,
    pub vault_id: String,
    pub entity_id: String,
    pub table: String,
    pub local: Value,
    pub remote: Value,
    pub encryption_key: Option<String>,
    pub encrypted_data: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl_entity!(LocalConflict, EntityKind::LocalConflict);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSetting {
    pub id: String,
    pub vault_id: String,
    pub key: String,
    pub value: Value,
    pub encryption_key: Option<String>,
    pub encrypted_data: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

impl_entity!(AppSetting, EntityKind::AppSetting);

/// Serialize a timestamp the way patches carry it.
pub fn timestamp_value(at: Timestamp) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Partial update of an entity, as a JSON object with camelCase keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Map<String, Value>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full patch from an entity. `None` fields are left out so that
    /// applying it never clears data it did not mention.
    pub fn from_entity<T: Entity>(entity: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(entity)? {
            Value::Object(mut map) => {
                map.retain(|_, v| !v.is_null());
                Ok(Self(map))
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// The target id. An empty id counts as none.
    pub fn id(&self) -> Option<&str> {
        self.get_str("id").filter(|id| !id.is_empty())
    }

    pub fn filepath(&self) -> Option<&str> {
        self.get_str("filepath")
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Overlay this patch on `base`.
    pub fn merge_map(&self, mut base: Map<String, Value>) -> Map<String, Value> {
        for (key, value) in &self.0 {
            base.insert(key.clone(), value.clone());
        }
        base
    }

    /// Overlay this patch on an entity (or on nothing) and decode the result.
    pub fn apply_to<T: Entity>(&self, base: Option<&T>) -> Result<T, serde_json::Error> {
        let base = match base {
            Some(entity) => match serde_json::to_value(entity)? {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            None => Map::new(),
        };
        serde_json::from_value(Value::Object(self.merge_map(base)))
    }
}

impl From<Map<String, Value>> for Patch {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
