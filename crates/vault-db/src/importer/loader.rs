//! Where the importer reads the vault from: a [`FileSystem`] directly, or
//! the device service over the protocol.

use super::{ImportConfig, Result};
use crate::fs::{self, FileSystem, FsError, WalkEntry};
use crate::io::{DocumentIo, EntityIo, FolderIo};
use crate::protocol::{DeviceRecord, ServiceClient};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

#[async_trait]
pub trait Loader: Send + Sync {
    async fn is_dir(&self, vault_id: &str, filepath: &str) -> Result<bool>;

    /// Every entry below `filepath` (`""` is the vault root), blacklisted
    /// directories and their contents left out.
    async fn list_dir(
        &self,
        vault_id: &str,
        filepath: &str,
        config: &ImportConfig,
    ) -> Result<Vec<WalkEntry>>;

    /// Text of the given files. Unreadable files are left out, so callers
    /// match results by filepath.
    async fn read_batch(&self, vault_id: &str, filepaths: Vec<String>)
    -> Result<Vec<DeviceRecord>>;
}

/// Reads straight from a filesystem. Vault paths are resolved below `root`.
pub struct FsLoader<F> {
    fs: F,
    root: String,
}

impl<F: FileSystem> FsLoader<F> {
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            root: String::new(),
        }
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    fn absolute(&self, filepath: &str) -> String {
        if filepath.is_empty() {
            self.root.clone()
        } else {
            fs::join(&self.root, filepath)
        }
    }

    fn relative(&self, absolute: &str) -> String {
        if self.root.is_empty() {
            return absolute.to_string();
        }
        absolute
            .strip_prefix(self.root.trim_end_matches('/'))
            .map(|rest| rest.trim_start_matches('/').to_string())
            .unwrap_or_else(|| absolute.to_string())
    }
}

#[async_trait]
impl<F: FileSystem> Loader for FsLoader<F> {
    async fn is_dir(&self, _vault_id: &str, filepath: &str) -> Result<bool> {
        match self.fs.stat(&self.absolute(filepath)).await {
            Ok(stat) => Ok(stat.is_dir),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_dir(
        &self,
        _vault_id: &str,
        filepath: &str,
        config: &ImportConfig,
    ) -> Result<Vec<WalkEntry>> {
        let entries = fs::walk(&self.fs, &self.absolute(filepath), |name| {
            config.is_blacklisted(name)
        })
        .await?;
        Ok(entries
            .into_iter()
            .map(|entry| WalkEntry {
                filepath: self.relative(&entry.filepath),
                is_dir: entry.is_dir,
            })
            .collect())
    }

    async fn read_batch(
        &self,
        vault_id: &str,
        filepaths: Vec<String>,
    ) -> Result<Vec<DeviceRecord>> {
        let mut records = Vec::with_capacity(filepaths.len());
        for filepath in filepaths {
            match self.fs.read(&self.absolute(&filepath)).await {
                Ok(bytes) => records.push(DeviceRecord {
                    vault_id: vault_id.to_string(),
                    content: Some(String::from_utf8_lossy(&bytes).into_owned()),
                    filepath,
                    ..Default::default()
                }),
                Err(e) => warn!("Failed to read {}: {}", filepath, e),
            }
        }
        Ok(records)
    }
}

/// Reads through the device service (`project:*`, `entity:batchRead`).
pub struct DeviceLoader {
    folders: FolderIo,
    documents: DocumentIo,
}

impl DeviceLoader {
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self {
            folders: FolderIo::new(client.clone()),
            documents: DocumentIo::new(client),
        }
    }
}

#[async_trait]
impl Loader for DeviceLoader {
    async fn is_dir(&self, vault_id: &str, filepath: &str) -> Result<bool> {
        Ok(self.folders.is_dir(vault_id, filepath).await?)
    }

    async fn list_dir(
        &self,
        vault_id: &str,
        filepath: &str,
        config: &ImportConfig,
    ) -> Result<Vec<WalkEntry>> {
        let entries = self.folders.list_recursive(vault_id, filepath).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| !config.in_blacklisted_dir(&entry.filepath, entry.is_dir))
            .collect())
    }

    async fn read_batch(
        &self,
        vault_id: &str,
        filepaths: Vec<String>,
    ) -> Result<Vec<DeviceRecord>> {
        Ok(self.documents.read_batch(vault_id, filepaths).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    async fn vault_fs() -> InMemoryFs {
        let fs = InMemoryFs::new();
        fs.write("/home/notes/a.md", b"# A").await.unwrap();
        fs.write("/home/notes/.git/HEAD", b"ref").await.unwrap();
        fs.write("/home/notes/My Day/today.md", b"").await.unwrap();
        fs.write("/home/notes/sub/b.md", b"B").await.unwrap();
        fs
    }

    #[tokio::test]
    async fn test_fs_loader_lists_relative_paths_without_blacklisted_dirs() {
        let loader = FsLoader::new(vault_fs().await).with_root("/home/notes");

        let entries = loader.list_dir("v1", "", &ImportConfig::default()).await.unwrap();

        let paths: Vec<_> = entries.iter().map(|e| e.filepath.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "sub", "sub/b.md"]);
        assert!(loader.is_dir("v1", "sub").await.unwrap());
        assert!(!loader.is_dir("v1", "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_loader_skips_unreadable_files() {
        let loader = FsLoader::new(vault_fs().await).with_root("/home/notes");

        let records = loader
            .read_batch("v1", vec!["a.md".into(), "gone.md".into(), "sub/b.md".into()])
            .await
            .unwrap();

        let read: Vec<_> = records
            .iter()
            .map(|r| (r.filepath.as_str(), r.content.as_deref()))
            .collect();
        assert_eq!(read, vec![("a.md", Some("# A")), ("sub/b.md", Some("B"))]);
    }
}
