//! Vaults: the unit of storage, key, migration and database scope.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultKind {
    /// Lives only on this device.
    #[default]
    Local,
    /// Synced with the cloud; eligible for encryption at rest.
    Remote,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Vault {
    pub id: String,
    pub name: String,
    /// Filesystem root, when the vault mirrors a directory.
    pub filepath: Option<String>,
    #[serde(rename = "type")]
    pub kind: VaultKind,
}

impl Vault {
    pub fn local(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            filepath: None,
            kind: VaultKind::Local,
        }
    }

    pub fn remote(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: VaultKind::Remote,
            ..Self::local(id, name)
        }
    }

    pub fn with_filepath(mut self, filepath: impl Into<String>) -> Self {
        self.filepath = Some(filepath.into());
        self
    }

    pub fn is_remote(&self) -> bool {
        self.kind == VaultKind::Remote
    }
}

/// Known vaults of this context.
#[derive(Debug, Default)]
pub struct VaultRegistry {
    vaults: RwLock<HashMap<String, Vault>>,
}

impl VaultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, vault: Vault) {
        self.vaults
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(vault.id.clone(), vault);
    }

    pub fn get(&self, vault_id: &str) -> Option<Vault> {
        self.vaults
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(vault_id)
            .cloned()
    }

    pub fn remove(&self, vault_id: &str) -> Option<Vault> {
        self.vaults
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(vault_id)
    }

    pub fn is_remote(&self, vault_id: &str) -> bool {
        self.get(vault_id).is_some_and(|v| v.is_remote())
    }

    /// Whether the vault mirrors a directory on this device.
    pub fn has_filepath(&self, vault_id: &str) -> bool {
        self.get(vault_id).is_some_and(|v| v.filepath.is_some())
    }

    pub fn list(&self) -> Vec<Vault> {
        let mut vaults: Vec<Vault> = self
            .vaults
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        vaults.sort_by(|a, b| a.id.cmp(&b.id));
        vaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_wire_format() {
        let vault = Vault::remote("v1", "Work").with_filepath("/home/me/work");
        let json = serde_json::to_value(&vault).unwrap();

        assert_eq!(json["type"], "remote");
        assert_eq!(json["filepath"], "/home/me/work");
    }

    #[test]
    fn test_registry_queries() {
        let registry = VaultRegistry::new();
        registry.insert(Vault::local("v1", "Notes").with_filepath("/notes"));
        registry.insert(Vault::remote("v2", "Cloud"));

        assert!(!registry.is_remote("v1"));
        assert!(registry.is_remote("v2"));
        assert!(registry.has_filepath("v1"));
        assert!(!registry.has_filepath("v2"));
        assert!(!registry.is_remote("missing"));
        assert_eq!(registry.list().len(), 2);
    }
}
