//! Vault master keys and wrapped per-entity data keys.
//!
//! Each encrypted entity carries its own random data key in
//! `encryptionKey`, sealed under the vault's master key and base64 encoded.

use super::cipher::SymmetricKey;
use super::{CryptoError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::sync::RwLock;

const WRAP_CONTEXT: &[u8] = b"vault-db:data-key";

#[derive(Debug, Default)]
pub struct KeyRing {
    keys: RwLock<HashMap<String, SymmetricKey>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_vault_key(&self, vault_id: &str, key: SymmetricKey) {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(vault_id.to_string(), key);
    }

    pub fn remove_vault_key(&self, vault_id: &str) {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(vault_id);
    }

    pub fn has_key(&self, vault_id: &str) -> bool {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(vault_id)
    }

    fn vault_key(&self, vault_id: &str) -> Result<SymmetricKey> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(vault_id)
            .cloned()
            .ok_or_else(|| CryptoError::MissingVaultKey(vault_id.to_string()))
    }

    /// New data key for an entity, returned wrapped.
    pub fn create_encryption_key(&self, vault_id: &str) -> Result<String> {
        let master = self.vault_key(vault_id)?;
        let data_key = SymmetricKey::generate();
        let wrapped = master.encrypt(data_key.as_bytes(), WRAP_CONTEXT)?;
        Ok(STANDARD.encode(wrapped))
    }

    /// Recover the data key from an entity's `encryptionKey`.
    pub fn unwrap_key(&self, vault_id: &str, wrapped: &str) -> Result<SymmetricKey> {
        let master = self.vault_key(vault_id)?;
        let sealed = STANDARD
            .decode(wrapped)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        SymmetricKey::from_bytes(&master.decrypt(&sealed, WRAP_CONTEXT)?)
    }
}
