//! Device → store import of markdown files, folders and attachments.
//!
//! A run lists the target through a [`Loader`], classifies the entries,
//! saves folders level by level so parents exist before their children,
//! then reads and parses documents in batches. One failing batch is logged
//! and the rest of the import continues.

pub mod loader;

pub use loader::{DeviceLoader, FsLoader, Loader};

use crate::content::{MarkdownParser, ParseError, Parser};
use crate::context::Storages;
use crate::entity::{Entity, Patch};
use crate::fs::{FsError, WalkEntry};
use crate::io::IoError;
use crate::reporter::{DeviceReporter, Reporter};
use crate::store::{StoreError, StoreMeta, DEVICE_SOURCE};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ImportError>;

/// Trash kept by the app itself.
const INTERNAL_FOLDERS: &[&str] = &[".trash"];

const BLACKLISTED_FOLDERS: &[&str] = &[
    ".tasks", ".events", ".obsidian", ".git", ".github", ".vscode", ".idea",
];

const DOCUMENT_EXTENSIONS: &[&str] = &["md", "txt"];

const ATTACHMENT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "bmp"];

/// Change source of rows created by a copying import.
const IMPORTER_SOURCE: &str = "importer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportConfig {
    /// Import as new entities written back to the vault, instead of indexing
    /// the files in place.
    pub copy: bool,
    pub batch_size: usize,
    pub separator: char,
    /// Daily notes folder, never imported.
    pub my_day_folder: String,
    /// Parent of entries directly below the import root.
    pub root_parent_id: Option<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            copy: false,
            batch_size: 50,
            separator: '/',
            my_day_folder: "My Day".to_string(),
            root_parent_id: None,
        }
    }
}

impl ImportConfig {
    /// Whether a directory called `name` is skipped.
    pub fn is_blacklisted(&self, name: &str) -> bool {
        INTERNAL_FOLDERS.contains(&name)
            || BLACKLISTED_FOLDERS.contains(&name)
            || name == self.my_day_folder
    }

    /// Whether `filepath` is, or lies below, a skipped directory.
    pub fn in_blacklisted_dir(&self, filepath: &str, is_dir: bool) -> bool {
        let mut segments: Vec<&str> = filepath.split(self.separator).collect();
        if !is_dir {
            segments.pop();
        }
        segments.into_iter().any(|segment| self.is_blacklisted(segment))
    }

    fn parent_dir<'a>(&self, filepath: &'a str) -> &'a str {
        filepath
            .rsplit_once(self.separator)
            .map_or("", |(dir, _)| dir)
    }

    fn file_name<'a>(&self, filepath: &'a str) -> &'a str {
        filepath
            .rsplit_once(self.separator)
            .map_or(filepath, |(_, name)| name)
    }

    fn depth(&self, filepath: &str) -> usize {
        filepath.matches(self.separator).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Folder,
    Document,
    Attachment,
    Unsupported,
}

fn extension(name: &str) -> Option<String> {
    name.rsplit_once('.')
        .filter(|(stem, _)| !stem.is_empty())
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

fn classify(config: &ImportConfig, entry: &WalkEntry) -> EntryKind {
    if entry.is_dir {
        return EntryKind::Folder;
    }
    let dir = config.file_name(config.parent_dir(&entry.filepath));
    if dir == ".tasks" || dir == ".events" {
        return EntryKind::Unsupported;
    }
    match extension(config.file_name(&entry.filepath)) {
        Some(ext) if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) => EntryKind::Document,
        Some(ext) if ATTACHMENT_EXTENSIONS.contains(&ext.as_str()) => EntryKind::Attachment,
        _ => EntryKind::Unsupported,
    }
}

fn title_of(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

/// Entries of one import run, by kind.
#[derive(Default)]
struct Classified {
    folders: Vec<WalkEntry>,
    documents: Vec<WalkEntry>,
    attachments: Vec<WalkEntry>,
    unsupported: usize,
}

/// Outcome of an import run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub folders: usize,
    pub documents: usize,
    pub attachments: usize,
    pub unsupported: usize,
    pub deleted: usize,
}

pub struct Importer<L> {
    storages: Storages,
    loader: L,
    parser: MarkdownParser,
    config: ImportConfig,
}

impl<L: Loader> Importer<L> {
    pub fn new(storages: Storages, loader: L) -> Self {
        let parser = MarkdownParser::new(storages.documents.context().converter().clone());
        Self {
            storages,
            loader,
            parser,
            config: ImportConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ImportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    fn reporter(&self, vault_id: &str) -> DeviceReporter {
        let events = self.storages.documents.context().events().clone();
        DeviceReporter::new(events, vault_id)
    }

    /// Import `root` (a directory, `""` for the whole vault, or one file).
    pub async fn import_using_filepath(
        &self,
        vault_id: &str,
        root: &str,
        options: Option<ImportConfig>,
    ) -> Result<ImportSummary> {
        let config = options.unwrap_or_else(|| self.config.clone());
        let entries = if root.is_empty() || self.loader.is_dir(vault_id, root).await? {
            self.loader.list_dir(vault_id, root, &config).await?
        } else {
            vec![WalkEntry {
                filepath: root.to_string(),
                is_dir: false,
            }]
        };
        info!("Importing {} entries from '{}' into vault {}", entries.len(), root, vault_id);

        let reporter = self.reporter(vault_id);
        reporter.start();
        let summary = self.import_entries(vault_id, entries, &config, &reporter).await;
        reporter.done();
        summary
    }

    /// Re-import the given paths after they changed on disk. Paths that no
    /// longer exist delete their entities; new directories bring their
    /// contents along.
    pub async fn import_changes(
        &self,
        vault_id: &str,
        changed_paths: Vec<String>,
    ) -> Result<ImportSummary> {
        let config = self.config.clone();
        let listing: BTreeMap<String, WalkEntry> = self
            .loader
            .list_dir(vault_id, "", &config)
            .await?
            .into_iter()
            .map(|entry| (entry.filepath.clone(), entry))
            .collect();

        let mut present: BTreeMap<String, WalkEntry> = BTreeMap::new();
        let mut gone = Vec::new();
        for path in changed_paths {
            match listing.get(&path) {
                Some(entry) => {
                    if entry.is_dir {
                        let prefix = format!("{}{}", path, config.separator);
                        for (child_path, child) in listing.range(prefix.clone()..) {
                            if !child_path.starts_with(&prefix) {
                                break;
                            }
                            present.insert(child_path.clone(), child.clone());
                        }
                    }
                    present.insert(path, entry.clone());
                }
                None if config.in_blacklisted_dir(&path, false) => {}
                None => gone.push(path),
            }
        }
        debug!(
            "Vault {} changed: {} present, {} gone",
            vault_id,
            present.len(),
            gone.len()
        );

        let reporter = self.reporter(vault_id);
        reporter.start();
        let deleted = self.delete_paths(vault_id, &gone, &config).await;
        let summary = self
            .import_entries(vault_id, present.into_values().collect(), &config, &reporter)
            .await;
        reporter.done();

        let mut summary = summary?;
        summary.deleted = deleted?;
        Ok(summary)
    }

    /// Delete every document, folder and attachment whose file is no longer
    /// in the vault. The device is not touched. Returns the number deleted.
    pub async fn delete_missing_entities(&self, vault_id: &str) -> Result<usize> {
        let on_disk: HashSet<String> = self
            .loader
            .list_dir(vault_id, "", &self.config)
            .await?
            .into_iter()
            .map(|entry| entry.filepath)
            .collect();
        let missing = |filepath: &str| !on_disk.contains(filepath);
        self.delete_where(vault_id, missing).await
    }

    async fn delete_paths(
        &self,
        vault_id: &str,
        paths: &[String],
        config: &ImportConfig,
    ) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let removed = |filepath: &str| {
            paths.iter().any(|path| {
                filepath == path
                    || filepath
                        .strip_prefix(path.as_str())
                        .is_some_and(|rest| rest.starts_with(config.separator))
            })
        };
        self.delete_where(vault_id, removed).await
    }

    async fn delete_where(&self, vault_id: &str, gone: impl Fn(&str) -> bool) -> Result<usize> {
        fn ids<T: Entity>(entities: HashMap<String, T>, gone: &impl Fn(&str) -> bool) -> Vec<String> {
            entities
                .into_iter()
                .filter(|(filepath, _)| gone(filepath))
                .map(|(_, entity)| entity.id().to_string())
                .collect()
        }

        let meta = StoreMeta::from_device();
        let documents = ids(self.storages.documents.list_by_filepath(vault_id).await?, &gone);
        let folders = ids(self.storages.folders.list_by_filepath(vault_id).await?, &gone);
        let images = ids(self.storages.images.list_by_filepath(vault_id).await?, &gone);

        let mut deleted = 0;
        deleted += self
            .storages
            .documents
            .delete_bulk(vault_id, documents, meta.clone())
            .await?
            .len();
        deleted += self
            .storages
            .folders
            .delete_bulk(vault_id, folders, meta.clone())
            .await?
            .len();
        deleted += self
            .storages
            .images
            .delete_bulk(vault_id, images, meta)
            .await?
            .len();
        if deleted > 0 {
            info!("Deleted {} entities missing from vault {}", deleted, vault_id);
        }
        Ok(deleted)
    }

    fn classify(&self, entries: Vec<WalkEntry>, config: &ImportConfig) -> Classified {
        let mut classified = Classified::default();
        for entry in entries {
            match classify(config, &entry) {
                EntryKind::Folder => classified.folders.push(entry),
                EntryKind::Document => classified.documents.push(entry),
                EntryKind::Attachment if !config.copy => classified.attachments.push(entry),
                EntryKind::Attachment | EntryKind::Unsupported => {
                    debug!("Skipping unsupported {}", entry.filepath);
                    classified.unsupported += 1;
                }
            }
        }
        classified
    }

    fn meta(config: &ImportConfig) -> StoreMeta {
        if config.copy {
            StoreMeta {
                client_id: Some(IMPORTER_SOURCE.to_string()),
                ..StoreMeta::default()
            }
        } else {
            StoreMeta {
                client_id: Some(DEVICE_SOURCE.to_string()),
                ..StoreMeta::from_device()
            }
        }
    }

    async fn import_entries(
        &self,
        vault_id: &str,
        entries: Vec<WalkEntry>,
        config: &ImportConfig,
        reporter: &DeviceReporter,
    ) -> Result<ImportSummary> {
        let classified = self.classify(entries, config);
        let total =
            classified.folders.len() + classified.documents.len() + classified.attachments.len();
        reporter.progress(0, Some(total));
        reporter.unsupported(classified.unsupported);

        let folder_ids = self.import_folders(vault_id, &classified.folders, config).await?;
        reporter.progress(classified.folders.len(), None);

        let attachments = self
            .import_attachments(vault_id, &classified.attachments, config)
            .await?;
        reporter.progress(classified.attachments.len(), None);

        let existing = if config.copy {
            HashMap::new()
        } else {
            self.storages.documents.list_by_filepath(vault_id).await?
        };
        let mut documents = 0;
        for chunk in classified.documents.chunks(config.batch_size.max(1)) {
            match self
                .import_documents(vault_id, chunk, &folder_ids, &existing, config)
                .await
            {
                Ok(saved) => documents += saved,
                Err(e) => warn!("Failed to import {} documents: {}", chunk.len(), e),
            }
            reporter.progress(chunk.len(), None);
        }

        Ok(ImportSummary {
            folders: classified.folders.len(),
            documents,
            attachments,
            unsupported: classified.unsupported,
            deleted: 0,
        })
    }

    /// Parent of an entry: the folder of its directory, else the root parent.
    fn parent_id(
        &self,
        filepath: &str,
        folder_ids: &HashMap<String, String>,
        config: &ImportConfig,
    ) -> Value {
        folder_ids
            .get(config.parent_dir(filepath))
            .cloned()
            .or_else(|| config.root_parent_id.clone())
            .map_or(Value::Null, Value::String)
    }

    /// Save folders breadth first. Returns folder ids by filepath, existing
    /// folders included.
    async fn import_folders(
        &self,
        vault_id: &str,
        dirs: &[WalkEntry],
        config: &ImportConfig,
    ) -> Result<HashMap<String, String>> {
        let mut folder_ids: HashMap<String, String> = self
            .storages
            .folders
            .list_by_filepath(vault_id)
            .await?
            .into_iter()
            .map(|(filepath, folder)| (filepath, folder.id))
            .collect();
        if dirs.is_empty() {
            return Ok(folder_ids);
        }

        for dir in dirs {
            if config.copy || !folder_ids.contains_key(&dir.filepath) {
                folder_ids.insert(dir.filepath.clone(), uuid::Uuid::new_v4().to_string());
            }
        }

        let mut levels: BTreeMap<usize, Vec<&WalkEntry>> = BTreeMap::new();
        for dir in dirs {
            levels.entry(config.depth(&dir.filepath)).or_default().push(dir);
        }
        for level in levels.into_values() {
            let patches = level
                .into_iter()
                .map(|dir| {
                    let mut patch = Patch::new()
                        .with("id", folder_ids[&dir.filepath].as_str())
                        .with("name", config.file_name(&dir.filepath))
                        .with("parentId", self.parent_id(&dir.filepath, &folder_ids, config));
                    if !config.copy {
                        patch.insert("filepath", dir.filepath.as_str());
                    }
                    patch
                })
                .collect();
            self.storages
                .folders
                .save_bulk(vault_id, patches, Self::meta(config))
                .await?;
        }
        Ok(folder_ids)
    }

    /// Index attachments in place; the bytes stay on disk.
    async fn import_attachments(
        &self,
        vault_id: &str,
        files: &[WalkEntry],
        config: &ImportConfig,
    ) -> Result<usize> {
        if files.is_empty() {
            return Ok(0);
        }
        let existing = self.storages.images.list_by_filepath(vault_id).await?;
        let patches = files
            .iter()
            .map(|file| {
                let id = existing
                    .get(&file.filepath)
                    .map(|image| image.id.clone())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                Patch::new()
                    .with("id", id)
                    .with("name", config.file_name(&file.filepath))
                    .with("filepath", file.filepath.as_str())
                    .with("isOnDisk", true)
            })
            .collect();
        let saved = self
            .storages
            .images
            .save_bulk(vault_id, patches, Self::meta(config))
            .await?;
        Ok(saved.len())
    }

    async fn import_documents(
        &self,
        vault_id: &str,
        chunk: &[WalkEntry],
        folder_ids: &HashMap<String, String>,
        existing: &HashMap<String, crate::entity::Document>,
        config: &ImportConfig,
    ) -> Result<usize> {
        let paths = chunk.iter().map(|entry| entry.filepath.clone()).collect();
        let records = self.loader.read_batch(vault_id, paths).await?;
        let texts = records
            .iter()
            .map(|record| record.content.clone().unwrap_or_default())
            .collect();
        let parsed = self.parser.parse_batch(vault_id, texts).await?;

        let patches: Vec<Patch> = records
            .iter()
            .zip(parsed)
            .map(|(record, document)| {
                let name = config.file_name(&record.filepath);
                let title = document
                    .title()
                    .map(String::from)
                    .unwrap_or_else(|| title_of(name).to_string());
                let mut patch = Patch::new()
                    .with("title", title)
                    .with("mdContent", document.md_content.as_str())
                    .with("parentId", self.parent_id(&record.filepath, folder_ids, config));
                match serde_json::to_value(&document.content) {
                    Ok(content) => patch.insert("content", content),
                    Err(e) => warn!("Failed to encode content of {}: {}", record.filepath, e),
                }
                if !config.copy {
                    patch.insert("filepath", record.filepath.as_str());
                    if let Some(current) = existing.get(&record.filepath) {
                        patch.insert("id", current.id.as_str());
                    }
                }
                patch
            })
            .collect();

        let saved = self
            .storages
            .documents
            .save_bulk(vault_id, patches, Self::meta(config))
            .await?;
        Ok(saved.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VaultContext;
    use crate::events::{ProgressKind, VaultEvent};
    use crate::fs::{FileSystem, InMemoryFs};
    use crate::vault::Vault;
    use std::sync::{Arc, Mutex};

    fn storages() -> Storages {
        let ctx = VaultContext::new();
        ctx.add_vault(Vault::local("v1", "Notes").with_filepath("/vault"));
        Storages::new(Arc::new(ctx))
    }

    async fn vault_fs() -> Arc<InMemoryFs> {
        let fs = Arc::new(InMemoryFs::new());
        for (path, text) in [
            ("test/file1.md", "# One"),
            ("test/file2.md", "---\ntitle: Second\n---\nBody"),
            ("test/file3.md", "Three"),
            ("test/folder/file4.md", "- [ ] four"),
        ] {
            fs.write(path, text.as_bytes()).await.unwrap();
        }
        fs
    }

    fn importer(storages: &Storages, fs: Arc<InMemoryFs>) -> Importer<FsLoader<Arc<InMemoryFs>>> {
        Importer::new(storages.clone(), FsLoader::new(fs))
    }

    #[test]
    fn test_classification() {
        let config = ImportConfig::default();
        let file = |path: &str| WalkEntry {
            filepath: path.into(),
            is_dir: false,
        };
        assert_eq!(classify(&config, &file("a/notes.md")), EntryKind::Document);
        assert_eq!(classify(&config, &file("a/notes.TXT")), EntryKind::Document);
        assert_eq!(classify(&config, &file("a/pic.png")), EntryKind::Attachment);
        assert_eq!(classify(&config, &file(".tasks/t.md")), EntryKind::Unsupported);
        assert_eq!(classify(&config, &file("a/data.csv")), EntryKind::Unsupported);
        assert!(config.in_blacklisted_dir("x/.obsidian/app.json", false));
        assert!(config.in_blacklisted_dir("My Day", true));
        assert!(!config.in_blacklisted_dir("x/My Day.md", false));
    }

    #[tokio::test]
    async fn test_import_directory() {
        let storages = storages();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let _sub = storages
            .documents
            .context()
            .events()
            .subscribe(move |event| {
                if matches!(event, VaultEvent::Complete { .. }) {
                    events_clone.lock().unwrap().push(event);
                }
            });

        let summary = importer(&storages, vault_fs().await)
            .import_using_filepath("v1", "test", None)
            .await
            .unwrap();

        assert_eq!(summary.documents, 4);
        assert_eq!(summary.folders, 1);
        let documents = storages.documents.list_by_filepath("v1").await.unwrap();
        let folders = storages.folders.list_by_filepath("v1").await.unwrap();
        assert_eq!(documents.len(), 4);
        assert_eq!(folders.len(), 1);

        let folder = &folders["test/folder"];
        assert_eq!(folder.name, "folder");
        assert!(folder.parent_id.is_none());
        assert_eq!(
            documents["test/folder/file4.md"].parent_id.as_deref(),
            Some(folder.id.as_str())
        );
        assert!(documents["test/file1.md"].parent_id.is_none());
        assert_eq!(documents["test/file2.md"].title, "Second");
        assert_eq!(documents["test/file3.md"].title, "file3");
        assert_eq!(documents["test/file2.md"].md_content.as_deref(), Some("Body"));

        let events = events.lock().unwrap();
        assert!(matches!(
            events[..],
            [VaultEvent::Complete {
                kind: ProgressKind::Import,
                total: 5,
                loaded: 5,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_reimport_keeps_ids() {
        let storages = storages();
        let fs = vault_fs().await;
        let importer = importer(&storages, fs.clone());
        importer.import_using_filepath("v1", "", None).await.unwrap();
        let before = storages.documents.list_by_filepath("v1").await.unwrap();

        fs.write("test/file1.md", b"# One, edited").await.unwrap();
        importer
            .import_changes("v1", vec!["test/file1.md".into()])
            .await
            .unwrap();

        let after = storages.documents.list_by_filepath("v1").await.unwrap();
        assert_eq!(after.len(), 4);
        assert_eq!(after["test/file1.md"].id, before["test/file1.md"].id);
        assert_eq!(
            after["test/file1.md"].md_content.as_deref(),
            Some("# One, edited")
        );
    }

    #[tokio::test]
    async fn test_changes_pick_up_new_dirs_and_deletions() {
        let storages = storages();
        let fs = vault_fs().await;
        let importer = importer(&storages, fs.clone());
        importer.import_using_filepath("v1", "", None).await.unwrap();

        fs.write("test/new/inner.md", b"fresh").await.unwrap();
        fs.delete("test/folder/file4.md").await.unwrap();
        fs.delete("test/folder").await.unwrap();
        let summary = importer
            .import_changes(
                "v1",
                vec!["test/new".into(), "test/folder".into(), "test/folder/file4.md".into()],
            )
            .await
            .unwrap();

        assert_eq!(summary.deleted, 2);
        let documents = storages.documents.list_by_filepath("v1").await.unwrap();
        let folders = storages.folders.list_by_filepath("v1").await.unwrap();
        assert!(documents.contains_key("test/new/inner.md"));
        assert!(!documents.contains_key("test/folder/file4.md"));
        assert_eq!(
            documents["test/new/inner.md"].parent_id.as_deref(),
            Some(folders["test/new"].id.as_str())
        );
    }

    #[tokio::test]
    async fn test_delete_missing_entities() {
        let storages = storages();
        let fs = vault_fs().await;
        let importer = importer(&storages, fs.clone());
        importer.import_using_filepath("v1", "", None).await.unwrap();

        fs.delete("test/file3.md").await.unwrap();

        assert_eq!(importer.delete_missing_entities("v1").await.unwrap(), 1);
        assert_eq!(storages.documents.list("v1").await.unwrap().len(), 3);
        assert!(storages.documents.context().registry().get("v1", "test/file3.md").is_none());
    }

    #[tokio::test]
    async fn test_attachments_are_indexed_in_place() {
        let storages = storages();
        let fs = vault_fs().await;
        fs.write("test/pic.png", &[1, 2, 3]).await.unwrap();
        fs.write("test/data.csv", b"a,b").await.unwrap();

        let summary = importer(&storages, fs)
            .import_using_filepath("v1", "test", None)
            .await
            .unwrap();

        assert_eq!((summary.attachments, summary.unsupported), (1, 1));
        let images = storages.images.list("v1").await.unwrap();
        assert_eq!(images.len(), 1);
        assert!(images[0].is_on_disk);
        assert_eq!(images[0].filepath.as_deref(), Some("test/pic.png"));
    }

    #[tokio::test]
    async fn test_copy_import_creates_unlinked_entities() {
        let storages = storages();
        let config = ImportConfig {
            copy: true,
            root_parent_id: Some("inbox".into()),
            ..ImportConfig::default()
        };

        importer(&storages, vault_fs().await)
            .import_using_filepath("v1", "test/file1.md", Some(config))
            .await
            .unwrap();

        let documents = storages.documents.list("v1").await.unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].parent_id.as_deref(), Some("inbox"));
        assert_eq!(documents[0].title, "file1");
    }
}
