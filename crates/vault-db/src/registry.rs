//! Filepath registry: vault-relative path ⇄ entity id.
//!
//! The forward index answers "who owns this path", the reverse index answers
//! "where does this entity live". The reverse index is bucketed by the first
//! two and the next two characters of the id so lookups for ids sharing a
//! prefix stay local to one bucket.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Reverse index id → filepath, bucketed two levels deep by id prefix.
#[derive(Debug, Default)]
struct PrefixIndex {
    buckets: BTreeMap<String, BTreeMap<String, HashMap<String, String>>>,
}

impl PrefixIndex {
    fn shard(id: &str) -> (String, String) {
        let first: String = id.chars().take(2).collect();
        let second: String = id.chars().skip(2).take(2).collect();
        (first, second)
    }

    fn get(&self, id: &str) -> Option<&String> {
        let (first, second) = Self::shard(id);
        self.buckets.get(&first)?.get(&second)?.get(id)
    }

    fn insert(&mut self, id: &str, filepath: String) -> Option<String> {
        let (first, second) = Self::shard(id);
        self.buckets
            .entry(first)
            .or_default()
            .entry(second)
            .or_default()
            .insert(id.to_string(), filepath)
    }

    fn remove(&mut self, id: &str) -> Option<String> {
        let (first, second) = Self::shard(id);
        let level = self.buckets.get_mut(&first)?;
        let bucket = level.get_mut(&second)?;
        let removed = bucket.remove(id);
        if bucket.is_empty() {
            level.remove(&second);
        }
        if level.is_empty() {
            self.buckets.remove(&first);
        }
        removed
    }
}

#[derive(Debug, Default)]
struct VaultPaths {
    by_path: HashMap<String, String>,
    by_id: PrefixIndex,
}

/// Per-vault filepath ownership, shared by every storage of a context.
#[derive(Debug, Default)]
pub struct FilepathRegistry {
    vaults: RwLock<HashMap<String, VaultPaths>>,
}

impl FilepathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` lives at `filepath`.
    ///
    /// A previous path of the same id is released, and a previous owner of
    /// the path loses its reverse entry.
    pub fn set(&self, vault_id: &str, filepath: &str, id: &str) {
        let mut vaults = self.vaults.write().unwrap_or_else(|e| e.into_inner());
        let paths = vaults.entry(vault_id.to_string()).or_default();

        if let Some(previous) = paths.by_id.insert(id, filepath.to_string()) {
            if previous != filepath && paths.by_path.get(&previous).map(String::as_str) == Some(id) {
                paths.by_path.remove(&previous);
            }
        }
        if let Some(owner) = paths.by_path.insert(filepath.to_string(), id.to_string()) {
            if owner != id {
                paths.by_id.remove(&owner);
            }
        }
    }

    pub fn get(&self, vault_id: &str, filepath: &str) -> Option<String> {
        let vaults = self.vaults.read().unwrap_or_else(|e| e.into_inner());
        vaults.get(vault_id)?.by_path.get(filepath).cloned()
    }

    /// Path currently registered for `id`.
    pub fn filepath_of(&self, vault_id: &str, id: &str) -> Option<String> {
        let vaults = self.vaults.read().unwrap_or_else(|e| e.into_inner());
        vaults.get(vault_id)?.by_id.get(id).cloned()
    }

    /// First free markdown path for `filepath`, probing `base.md`,
    /// `base 1.md`, `base 2.md`, …
    ///
    /// A path already owned by `id` counts as free, so the owner always gets
    /// its own path back. Nothing is registered.
    pub fn get_available(&self, vault_id: &str, filepath: &str, id: &str) -> String {
        let base = filepath.strip_suffix(".md").unwrap_or(filepath);
        self.probe(vault_id, id, format!("{}.md", base), |i| format!("{} {}.md", base, i))
    }

    /// Directory flavour of [`get_available`](Self::get_available): probes
    /// `dir`, `dir 1`, `dir 2`, …
    pub fn get_available_dir(&self, vault_id: &str, dirpath: &str, id: &str) -> String {
        let base = dirpath.trim_end_matches('/');
        self.probe(vault_id, id, base.to_string(), |i| format!("{} {}", base, i))
    }

    fn probe(
        &self,
        vault_id: &str,
        id: &str,
        first: String,
        nth: impl Fn(usize) -> String,
    ) -> String {
        let vaults = self.vaults.read().unwrap_or_else(|e| e.into_inner());
        let Some(paths) = vaults.get(vault_id) else {
            return first;
        };
        let is_available =
            |candidate: &str| paths.by_path.get(candidate).is_none_or(|owner| owner == id);

        let mut candidate = first;
        let mut i = 1;
        while !is_available(&candidate) {
            candidate = nth(i);
            i += 1;
        }
        candidate
    }

    /// Forget `id`, returning the path it owned.
    pub fn remove(&self, vault_id: &str, id: &str) -> Option<String> {
        let mut vaults = self.vaults.write().unwrap_or_else(|e| e.into_inner());
        let paths = vaults.get_mut(vault_id)?;
        let filepath = paths.by_id.remove(id)?;
        if paths.by_path.get(&filepath).map(String::as_str) == Some(id) {
            paths.by_path.remove(&filepath);
        }
        Some(filepath)
    }

    /// Drop everything known about a vault.
    pub fn clear(&self, vault_id: &str) {
        let mut vaults = self.vaults.write().unwrap_or_else(|e| e.into_inner());
        vaults.remove(vault_id);
    }
}
