//! Encryption for kinds that can be publicly shared.
//!
//! A shared entity has to be readable by the share service, so while
//! `sharingUuid` is set its sensitive fields stay in plaintext and
//! `encryptedData` is the empty string. Turning sharing off seals it again.

use super::entity::{EncryptionPolicy, EntityEncryption};
use super::Result;
use crate::entity::{Entity, Patch};
use serde_json::Value;
use std::sync::Arc;

/// Side effects of a sharing transition, e.g. re-keying attachments.
pub trait SharingHook<T>: Send + Sync {
    fn sharing_enabled(&self, vault_id: &str, entity: &T);
    fn sharing_disabled(&self, vault_id: &str, entity: &T);
}

fn is_active(uuid: Option<&str>) -> bool {
    uuid.is_some_and(|u| !u.is_empty())
}

fn patch_sharing_active(patch: &Patch) -> bool {
    match patch.get("sharingUuid") {
        Some(Value::String(uuid)) => !uuid.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

pub struct SharedEntityEncryption<T> {
    base: EntityEncryption<T>,
    hook: Option<Arc<dyn SharingHook<T>>>,
}

impl<T: Entity> SharedEntityEncryption<T> {
    pub fn new(base: EntityEncryption<T>) -> Self {
        Self { base, hook: None }
    }

    pub fn with_hook(mut self, hook: Arc<dyn SharingHook<T>>) -> Self {
        self.hook = Some(hook);
        self
    }

    fn shared_copy(mut entity: T) -> T {
        entity.set_encrypted_data(Some(String::new()));
        entity
    }
}

impl<T: Entity> EncryptionPolicy<T> for SharedEntityEncryption<T> {
    fn should_encrypt(&self, vault_id: &str) -> bool {
        self.base.should_encrypt(vault_id)
    }

    fn has_encryptable_properties(&self, patch: &Patch) -> bool {
        patch.contains("sharingUuid") || self.base.has_encryptable_properties(patch)
    }

    fn encrypt_content(
        &self,
        vault_id: &str,
        patch: &Patch,
        original: Option<&T>,
    ) -> Result<Option<T>> {
        let originally_shared = is_active(original.and_then(|o| o.sharing_uuid()));
        let enabling = patch_sharing_active(patch) && !originally_shared;
        let disabling =
            patch.contains("sharingUuid") && !patch_sharing_active(patch) && originally_shared;

        if enabling || (!disabling && originally_shared) {
            let merged: T = patch.apply_to(original)?;
            if enabling {
                if let Some(hook) = &self.hook {
                    hook.sharing_enabled(vault_id, &merged);
                }
            }
            return Ok(Some(Self::shared_copy(merged)));
        }

        if disabling {
            let merged: T = patch.apply_to(original)?;
            if let Some(hook) = &self.hook {
                hook.sharing_disabled(vault_id, &merged);
            }
            // The whole entity gets sealed, not only the touched fields.
            if self.should_encrypt(vault_id) {
                return self.base.seal(vault_id, &merged).map(Some);
            }
            return Ok(None);
        }

        self.base.encrypt_content(vault_id, patch, original)
    }

    fn encrypt_content_bulk(&self, vault_id: &str, entities: Vec<T>) -> Result<Vec<T>> {
        let should_encrypt = self.should_encrypt(vault_id);
        entities
            .into_iter()
            .map(|entity| {
                if is_active(entity.sharing_uuid()) {
                    Ok(Self::shared_copy(entity))
                } else if should_encrypt {
                    self.base.seal(vault_id, &entity)
                } else {
                    Ok(entity)
                }
            })
            .collect()
    }

    fn decrypt(&self, vault_id: &str, entity: T) -> Result<T> {
        self.base.decrypt(vault_id, entity)
    }
}
