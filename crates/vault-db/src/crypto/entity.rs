//! Per-kind encryption of datagram fields.

use super::datagram::Datagram;
use super::keys::KeyRing;
use super::{CryptoError, Result};
use crate::entity::{Entity, Integration, IntegrationType, Patch};
use crate::vault::VaultRegistry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Encryption rules for one entity kind.
pub trait EncryptionPolicy<T: Entity>: Send + Sync {
    /// Encryption applies: the kind has sensitive fields, the vault is
    /// remote and its key is loaded.
    fn should_encrypt(&self, vault_id: &str) -> bool;

    fn has_encryptable_properties(&self, patch: &Patch) -> bool;

    /// Merge `patch` over `original` and seal the result.
    ///
    /// `None` means "store the patch as is": encryption does not apply or
    /// the patch touches no sensitive field. `original` must be decrypted.
    fn encrypt_content(&self, vault_id: &str, patch: &Patch, original: Option<&T>)
    -> Result<Option<T>>;

    /// Seal whole entities. Output order matches input order.
    fn encrypt_content_bulk(&self, vault_id: &str, entities: Vec<T>) -> Result<Vec<T>>;

    /// Restore sensitive fields and clear `encryptedData`.
    fn decrypt(&self, vault_id: &str, entity: T) -> Result<T>;
}

pub(crate) fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(CryptoError::Malformed("entity is not an object".into())),
    }
}

pub(crate) fn from_object<T: DeserializeOwned>(object: Map<String, Value>) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(object))?)
}

/// Base rules shared by every kind.
pub struct EntityEncryption<T> {
    datagram: Datagram,
    keys: Arc<KeyRing>,
    vaults: Arc<VaultRegistry>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Entity> EntityEncryption<T> {
    pub fn new(datagram: Datagram, keys: Arc<KeyRing>, vaults: Arc<VaultRegistry>) -> Self {
        Self {
            datagram,
            keys,
            vaults,
            _kind: PhantomData,
        }
    }

    pub fn datagram(&self) -> &Datagram {
        &self.datagram
    }

    pub fn keys(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    /// Seal an object, assigning a data key when it has none.
    pub(crate) fn seal_object(&self, vault_id: &str, mut object: Map<String, Value>) -> Result<T> {
        let wrapped = match object.get("encryptionKey").and_then(Value::as_str) {
            Some(wrapped) => wrapped.to_string(),
            None => {
                let wrapped = self.keys.create_encryption_key(vault_id)?;
                object.insert("encryptionKey".into(), Value::String(wrapped.clone()));
                wrapped
            }
        };
        let key = self.keys.unwrap_key(vault_id, &wrapped)?;
        let sealed = self.datagram.seal(&key, &object)?;

        self.datagram.clear(&mut object);
        object.insert("encryptedData".into(), Value::String(sealed));
        from_object(object)
    }

    /// Seal a whole entity regardless of vault state. Used when a caller
    /// has already decided encryption applies.
    pub fn seal(&self, vault_id: &str, entity: &T) -> Result<T> {
        self.seal_object(vault_id, to_object(entity)?)
    }
}

impl<T: Entity> EncryptionPolicy<T> for EntityEncryption<T> {
    fn should_encrypt(&self, vault_id: &str) -> bool {
        !self.datagram.is_empty() && self.vaults.is_remote(vault_id) && self.keys.has_key(vault_id)
    }

    fn has_encryptable_properties(&self, patch: &Patch) -> bool {
        self.datagram.covers(patch)
    }

    fn encrypt_content(
        &self,
        vault_id: &str,
        patch: &Patch,
        original: Option<&T>,
    ) -> Result<Option<T>> {
        if !self.should_encrypt(vault_id) || !self.has_encryptable_properties(patch) {
            return Ok(None);
        }

        let base = match original {
            Some(entity) => to_object(entity)?,
            None => Map::new(),
        };
        let merged = patch.merge_map(base);
        self.seal_object(vault_id, merged).map(Some)
    }

    fn encrypt_content_bulk(&self, vault_id: &str, entities: Vec<T>) -> Result<Vec<T>> {
        if !self.should_encrypt(vault_id) {
            return Ok(entities);
        }
        entities
            .iter()
            .map(|entity| self.seal(vault_id, entity))
            .collect()
    }

    fn decrypt(&self, vault_id: &str, entity: T) -> Result<T> {
        if !entity.is_encrypted() {
            return Ok(entity);
        }
        if self.datagram.is_empty() || !self.keys.has_key(vault_id) {
            debug!(
                "Leaving {} {} sealed: no key for vault {}",
                T::KIND.table_name(),
                entity.id(),
                vault_id
            );
            return Ok(entity);
        }

        let wrapped = entity
            .encryption_key()
            .ok_or_else(|| CryptoError::MissingEntityKey(entity.id().to_string()))?;
        let key = self.keys.unwrap_key(vault_id, wrapped)?;
        let fields = self
            .datagram
            .open(&key, entity.encrypted_data().unwrap_or_default())?;

        let mut object = to_object(&entity)?;
        object.extend(fields);
        object.remove("encryptedData");
        from_object(object)
    }
}

/// Integrations: only credential-bearing types are sealed, and any change
/// to such an integration re-seals its whole `data` blob.
pub struct IntegrationEncryption {
    base: EntityEncryption<Integration>,
}

impl IntegrationEncryption {
    pub fn new(base: EntityEncryption<Integration>) -> Self {
        Self { base }
    }
}

fn patch_integration_type(patch: &Patch) -> Option<IntegrationType> {
    patch
        .get("type")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

impl EncryptionPolicy<Integration> for IntegrationEncryption {
    fn should_encrypt(&self, vault_id: &str) -> bool {
        self.base.should_encrypt(vault_id)
    }

    fn has_encryptable_properties(&self, _patch: &Patch) -> bool {
        true
    }

    fn encrypt_content(
        &self,
        vault_id: &str,
        patch: &Patch,
        original: Option<&Integration>,
    ) -> Result<Option<Integration>> {
        if !self.should_encrypt(vault_id) {
            return Ok(None);
        }
        if original.is_some_and(|o| !o.integration_type.is_encryptable()) {
            return Ok(None);
        }
        let integration_type = patch_integration_type(patch)
            .or(original.map(|o| o.integration_type))
            .unwrap_or_default();
        if !integration_type.is_encryptable() {
            return Ok(None);
        }

        let base = match original {
            Some(entity) => to_object(entity)?,
            None => Map::new(),
        };
        self.base
            .seal_object(vault_id, patch.merge_map(base))
            .map(Some)
    }

    fn encrypt_content_bulk(
        &self,
        vault_id: &str,
        entities: Vec<Integration>,
    ) -> Result<Vec<Integration>> {
        if !self.should_encrypt(vault_id) {
            return Ok(entities);
        }
        entities
            .into_iter()
            .map(|entity| {
                if entity.integration_type.is_encryptable() {
                    self.base.seal(vault_id, &entity)
                } else {
                    Ok(entity)
                }
            })
            .collect()
    }

    fn decrypt(&self, vault_id: &str, entity: Integration) -> Result<Integration> {
        self.base.decrypt(vault_id, entity)
    }
}
