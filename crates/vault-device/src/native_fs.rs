//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use vault_db::fs::{FileEntry, FileStat, FileSystem, FsError, Result};

/// Filesystem rooted at `base_path`. Absolute paths pass through unchanged,
/// so a root of `/` serves every vault on the machine.
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn fs_error(path: &str, e: std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, e)),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path);
        if fs::metadata(&full_path)
            .await
            .map_err(|e| fs_error(path, e))?
            .is_dir()
        {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        fs::read(&full_path).await.map_err(|e| fs_error(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| fs_error(path, e))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| fs_error(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let full_path = self.full_path(path);
        let mut entries = Vec::new();

        let mut dir = fs::read_dir(&full_path).await.map_err(|e| match e.kind() {
            ErrorKind::NotADirectory => FsError::NotDirectory(path.to_string()),
            _ => fs_error(path, e),
        })?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| fs_error(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = entry.metadata().await.map_err(|e| fs_error(path, e))?;

            entries.push(FileEntry {
                name,
                is_dir: metadata.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| fs_error(path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path).await.map_err(|e| fs_error(path, e))
        } else {
            fs::remove_file(&full_path)
                .await
                .map_err(|e| fs_error(path, e))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| fs_error(path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| fs_error(path, e))?;

        let mtime_millis = metadata
            .modified()
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        Ok(FileStat {
            mtime_millis,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.full_path(path))
            .await
            .map_err(|e| fs_error(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.full_path(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| fs_error(to, e))?;
        }
        fs::rename(self.full_path(from), &target)
            .await
            .map_err(|e| fs_error(from, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn native(temp_dir: &TempDir) -> NativeFs {
        NativeFs::new(temp_dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_reads_back() {
        let temp_dir = TempDir::new().unwrap();
        let fs = native(&temp_dir);

        fs.write("notes/deep/a.md", b"# A").await.unwrap();

        assert_eq!(fs.read("notes/deep/a.md").await.unwrap(), b"# A");
        assert!(fs.stat("notes/deep").await.unwrap().is_dir);
        assert!(fs.exists("notes/deep/a.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_paths_map_to_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let fs = native(&temp_dir);

        assert!(matches!(fs.read("gone.md").await, Err(FsError::NotFound(_))));
        assert!(matches!(fs.delete("gone.md").await, Err(FsError::NotFound(_))));
        assert!(!fs.exists("gone.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_moves_into_new_directory() {
        let temp_dir = TempDir::new().unwrap();
        let fs = native(&temp_dir);
        fs.write("a.md", b"A").await.unwrap();

        fs.rename("a.md", "archive/2024/a.md").await.unwrap();

        assert!(!fs.exists("a.md").await.unwrap());
        assert_eq!(fs.read("archive/2024/a.md").await.unwrap(), b"A");
    }

    #[tokio::test]
    async fn test_list_reports_directories() {
        let temp_dir = TempDir::new().unwrap();
        let fs = native(&temp_dir);
        fs.write("a.md", b"").await.unwrap();
        fs.mkdir("sub").await.unwrap();

        let mut entries = fs.list("").await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let listed: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.is_dir)).collect();
        assert_eq!(listed, vec![("a.md", false), ("sub", true)]);
    }
}
