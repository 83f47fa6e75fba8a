//! FileSystem trait abstraction for vault file access.
//!
//! Implementations:
//! - `InMemoryFs` - For testing and in-process device services
//! - `NativeFs` (in vault-device) - Uses tokio::fs
//!
//! Paths are vault-relative and use `/` as separator.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Entry produced by [`walk`], carrying its full vault-relative path.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkEntry {
    pub filepath: String,
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Move a file or directory. Parent directories of `to` are created.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Join two vault-relative path segments.
pub fn join(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

/// Recursively list everything below `root`, depth first, sorted by path.
///
/// `skip` is consulted for every directory; returning true prunes it.
pub async fn walk<F, S>(fs: &F, root: &str, skip: S) -> Result<Vec<WalkEntry>>
where
    F: FileSystem + ?Sized,
    S: Fn(&str) -> bool,
{
    let mut out = Vec::new();
    let mut stack = vec![root.trim_end_matches('/').to_string()];

    while let Some(dir) = stack.pop() {
        let mut entries = fs.list(&dir).await?;
        entries.sort_by(|a, b| b.name.cmp(&a.name));
        for entry in entries {
            let filepath = join(&dir, &entry.name);
            if entry.is_dir {
                if skip(&entry.name) {
                    continue;
                }
                stack.push(filepath.clone());
            }
            out.push(WalkEntry {
                filepath,
                is_dir: entry.is_dir,
            });
        }
    }

    out.sort_by(|a, b| a.filepath.cmp(&b.filepath));
    Ok(out)
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
    /// Tracks file modification times (path -> mtime in ms)
    mtimes: RwLock<HashMap<String, u64>>,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(dirs),
            mtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Set a specific mtime for testing change detection
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = Self::normalize_path(path);
        write_lock(&self.mtimes).insert(path, mtime);
    }

    /// Number of files currently stored.
    pub fn file_count(&self) -> usize {
        read_lock(&self.files).len()
    }

    fn current_time_ms() -> u64 {
        web_time::SystemTime::now()
            .duration_since(web_time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }

    fn insert_dirs(&self, path: &str) {
        let mut dirs = write_lock(&self.dirs);
        let mut current = Some(Self::normalize_path(path));
        while let Some(dir) = current {
            if !dirs.insert(dir.clone()) {
                break;
            }
            current = Self::parent_path(&dir);
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        if read_lock(&self.dirs).contains(&path) {
            return Err(FsError::IsDirectory(path));
        }
        read_lock(&self.files)
            .get(&path)
            .cloned()
            .ok_or(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if read_lock(&self.dirs).contains(&path) {
            return Err(FsError::IsDirectory(path));
        }

        if let Some(parent) = Self::parent_path(&path) {
            self.insert_dirs(&parent);
        }

        write_lock(&self.files).insert(path.clone(), content.to_vec());
        write_lock(&self.mtimes).insert(path, Self::current_time_ms());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let dirs = read_lock(&self.dirs);
        if !dirs.contains(&path) {
            if read_lock(&self.files).contains_key(&path) {
                return Err(FsError::NotDirectory(path));
            }
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for file_path in read_lock(&self.files).keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: false,
                    });
                }
            }
        }

        for dir_path in dirs.iter() {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: true,
                    });
                }
            }
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        if write_lock(&self.files).remove(&path).is_some() {
            write_lock(&self.mtimes).remove(&path);
            return Ok(());
        }

        let prefix = format!("{}/", path);
        let mut dirs = write_lock(&self.dirs);
        if !dirs.contains(&path) || path.is_empty() {
            return Err(FsError::NotFound(path));
        }
        let has_children = dirs.iter().any(|d| d.starts_with(&prefix))
            || read_lock(&self.files).keys().any(|f| f.starts_with(&prefix));
        if has_children {
            return Err(FsError::Io(format!("Directory not empty: {}", path)));
        }
        dirs.remove(&path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        Ok(read_lock(&self.files).contains_key(&path) || read_lock(&self.dirs).contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        if let Some(content) = read_lock(&self.files).get(&path) {
            let mtime = read_lock(&self.mtimes).get(&path).copied().unwrap_or(0);
            return Ok(FileStat {
                mtime_millis: mtime,
                size: content.len() as u64,
                is_dir: false,
            });
        }

        if read_lock(&self.dirs).contains(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if read_lock(&self.files).contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        self.insert_dirs(&path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::normalize_path(from);
        let to = Self::normalize_path(to);
        if from == to {
            return Ok(());
        }
        if self.exists(&to).await? {
            return Err(FsError::AlreadyExists(to));
        }
        if let Some(parent) = Self::parent_path(&to) {
            self.insert_dirs(&parent);
        }

        {
            let mut files = write_lock(&self.files);
            if let Some(content) = files.remove(&from) {
                files.insert(to.clone(), content);
                let mut mtimes = write_lock(&self.mtimes);
                mtimes.remove(&from);
                mtimes.insert(to, Self::current_time_ms());
                return Ok(());
            }
        }

        let mut dirs = write_lock(&self.dirs);
        if !dirs.contains(&from) {
            return Err(FsError::NotFound(from));
        }
        let prefix = format!("{}/", from);
        let moved_dirs: Vec<String> = dirs
            .iter()
            .filter(|d| **d == from || d.starts_with(&prefix))
            .cloned()
            .collect();
        for dir in moved_dirs {
            dirs.remove(&dir);
            dirs.insert(format!("{}{}", to, &dir[from.len()..]));
        }

        let mut files = write_lock(&self.files);
        let moved_files: Vec<String> = files
            .keys()
            .filter(|f| f.starts_with(&prefix))
            .cloned()
            .collect();
        for file in moved_files {
            if let Some(content) = files.remove(&file) {
                files.insert(format!("{}{}", to, &file[from.len()..]), content);
            }
        }
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows sharing one filesystem between a device service and its tests
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }
}
