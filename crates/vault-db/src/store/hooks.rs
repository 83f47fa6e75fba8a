//! Kind-specific steps around a store write.

use super::storage::{PendingWrite, StoreMeta};
use super::table::Table;
use super::{Result, DEVICE_SOURCE};
use crate::content::{Parser, RichDocument, RichTextParser};
use crate::context::VaultContext;
use crate::entity::{Document, Entity, Folder, LocalConflict, Patch};
use crate::fs;
use crate::protocol::{Request, StoreRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait StorageHooks<T: Entity>: Send + Sync {
    /// Adjust patches after id resolution, before encryption.
    async fn preprocess(
        &self,
        _vault_id: &str,
        _writes: &mut [PendingWrite<T>],
        _meta: &StoreMeta,
    ) -> Result<()> {
        Ok(())
    }

    /// Runs right after the rows are stored and registered, inside the
    /// write job, whatever the meta says.
    fn committed(&self, _vault_id: &str, _writes: &[PendingWrite<T>], _saved: &[T], _source: &str) {}

    /// Runs after the rows are committed. Failures are logged only.
    async fn postprocess(&self, _vault_id: &str, _saved: &[T]) -> Result<()> {
        Ok(())
    }
}

pub struct NoHooks;

impl<T: Entity> StorageHooks<T> for NoHooks {}

/// File name for a title: path separators and reserved characters become
/// `-`, an empty result becomes `Untitled`.
pub fn file_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').trim();
    if cleaned.is_empty() {
        "Untitled".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Whether new rows of this write get a device path assigned.
fn assigns_paths(ctx: &VaultContext, vault_id: &str, meta: &StoreMeta) -> bool {
    meta.write_to_device
        && meta.client_id.as_deref() != Some(DEVICE_SOURCE)
        && ctx.vaults().has_filepath(vault_id)
}

/// Effective parent after the patch: explicit null moves to the root.
fn parent_after<T: Entity>(write: &PendingWrite<T>) -> Option<String> {
    match write.patch.get("parentId") {
        Some(Value::String(parent)) => Some(parent.clone()),
        Some(_) => None,
        None => write
            .existing
            .as_ref()
            .and_then(Entity::parent_id)
            .map(String::from),
    }
}

/// Directory of folder `parent_id`, if it has one on disk.
fn folder_dir(ctx: &VaultContext, vault_id: &str, parent_id: Option<&str>) -> Option<String> {
    let parent_id = parent_id?;
    let db = ctx.store().database(vault_id);
    db.folders.get(parent_id)?.filepath
}

/// Needs a (new) path: no path yet, or a rename or move of an existing one.
fn needs_path<T: Entity>(write: &PendingWrite<T>, name_field: &str) -> bool {
    if write.patch.filepath().is_some() {
        return false;
    }
    match write.existing.as_ref().and_then(Entity::filepath) {
        None => true,
        Some(_) => write.patch.contains(name_field) || write.patch.contains("parentId"),
    }
}

/// Record the chosen path right away so later rows of a batch see it taken.
fn claim_path<T: Entity>(
    ctx: &VaultContext,
    vault_id: &str,
    write: &mut PendingWrite<T>,
    path: String,
) {
    let current = write.existing.as_ref().and_then(Entity::filepath);
    if current == Some(path.as_str()) {
        return;
    }
    if let Some(id) = write.patch.id() {
        ctx.registry().set(vault_id, &path, id);
    }
    write.patch.insert("filepath", path);
}

/// Point every row below directory `from` at the same place below `to`,
/// in the table and in the registry. Returns how many rows moved.
fn rebase_paths<T: Entity>(
    ctx: &VaultContext,
    vault_id: &str,
    table: &Table<T>,
    (from, to): (&str, &str),
    source: &str,
    filepath: fn(&mut T) -> &mut Option<String>,
) -> usize {
    let prefix = format!("{}/", from);
    let below: Vec<String> = table
        .filter(|row| row.filepath().is_some_and(|path| path.starts_with(&prefix)))
        .into_iter()
        .map(|row| row.id().to_string())
        .collect();

    let mut moved = 0;
    for id in &below {
        let changed = table.modify(
            id,
            |row| {
                let field = filepath(row);
                let Some(rest) = field.as_deref().and_then(|path| path.strip_prefix(&prefix)) else {
                    return false;
                };
                let path = fs::join(to, rest);
                ctx.registry().set(vault_id, &path, id);
                *field = Some(path);
                true
            },
            source,
        );
        if changed {
            moved += 1;
        }
    }
    moved
}

/// Documents: markdown derived from the rich content, and a device path
/// derived from the title and parent folder.
pub struct DocumentHooks {
    ctx: Arc<VaultContext>,
    rich: Arc<RichTextParser>,
}

impl DocumentHooks {
    pub fn new(ctx: Arc<VaultContext>, rich: Arc<RichTextParser>) -> Self {
        Self { ctx, rich }
    }

    async fn render_markdown(
        &self,
        vault_id: &str,
        writes: &mut [PendingWrite<Document>],
    ) -> Result<()> {
        let mut targets = Vec::new();
        let mut contents = Vec::new();
        for (i, write) in writes.iter().enumerate() {
            if write.patch.contains("mdContent") {
                continue;
            }
            match write.patch.get("content") {
                Some(Value::Null) | None => continue,
                Some(value) => {
                    let content: RichDocument = serde_json::from_value(value.clone())?;
                    targets.push(i);
                    contents.push(content);
                }
            }
        }
        if contents.is_empty() {
            return Ok(());
        }

        let rendered = self.rich.parse_batch(vault_id, contents).await?;
        for (i, markdown) in targets.into_iter().zip(rendered) {
            writes[i].patch.insert("mdContent", markdown);
        }
        Ok(())
    }

    fn assign_path(&self, vault_id: &str, write: &mut PendingWrite<Document>) {
        if !needs_path(write, "title") {
            return;
        }
        let title = match write.patch.get_str("title") {
            Some(title) => title.to_string(),
            None => write
                .existing
                .as_ref()
                .map(|d| d.title.clone())
                .unwrap_or_default(),
        };
        let parent = parent_after(write);
        let name = file_name(&title);
        let base = match folder_dir(&self.ctx, vault_id, parent.as_deref()) {
            Some(dir) => fs::join(&dir, &name),
            None => name,
        };
        let id = write.patch.id().unwrap_or_default().to_string();
        let path = self.ctx.registry().get_available(vault_id, &base, &id);
        claim_path(&self.ctx, vault_id, write, path);
    }
}

#[async_trait]
impl StorageHooks<Document> for DocumentHooks {
    async fn preprocess(
        &self,
        vault_id: &str,
        writes: &mut [PendingWrite<Document>],
        meta: &StoreMeta,
    ) -> Result<()> {
        self.render_markdown(vault_id, writes).await?;
        if assigns_paths(&self.ctx, vault_id, meta) {
            for write in writes.iter_mut() {
                self.assign_path(vault_id, write);
            }
        }
        Ok(())
    }
}

/// Folders: a device directory derived from the name and parent folder.
pub struct FolderHooks {
    ctx: Arc<VaultContext>,
}

impl FolderHooks {
    pub fn new(ctx: Arc<VaultContext>) -> Self {
        Self { ctx }
    }

    fn assign_path(&self, vault_id: &str, write: &mut PendingWrite<Folder>) {
        if !needs_path(write, "name") {
            return;
        }
        let name = match write.patch.get_str("name") {
            Some(name) => name.to_string(),
            None => write
                .existing
                .as_ref()
                .map(|f| f.name.clone())
                .unwrap_or_default(),
        };
        let parent = parent_after(write);
        let name = file_name(&name);
        let base = match folder_dir(&self.ctx, vault_id, parent.as_deref()) {
            Some(dir) => fs::join(&dir, &name),
            None => name,
        };
        let id = write.patch.id().unwrap_or_default().to_string();
        let path = self.ctx.registry().get_available_dir(vault_id, &base, &id);
        claim_path(&self.ctx, vault_id, write, path);
    }
}

#[async_trait]
impl StorageHooks<Folder> for FolderHooks {
    async fn preprocess(
        &self,
        vault_id: &str,
        writes: &mut [PendingWrite<Folder>],
        meta: &StoreMeta,
    ) -> Result<()> {
        if assigns_paths(&self.ctx, vault_id, meta) {
            for write in writes.iter_mut() {
                self.assign_path(vault_id, write);
            }
        }
        Ok(())
    }

    /// A renamed or moved folder takes its contents along.
    fn committed(
        &self,
        vault_id: &str,
        writes: &[PendingWrite<Folder>],
        saved: &[Folder],
        source: &str,
    ) {
        let db = self.ctx.store().database(vault_id);
        for (write, folder) in writes.iter().zip(saved) {
            let from = write.existing.as_ref().and_then(|f| f.filepath.as_deref());
            let (Some(from), Some(to)) = (from, folder.filepath.as_deref()) else {
                continue;
            };
            if from == to {
                continue;
            }
            let paths = (from, to);
            let moved = rebase_paths(&self.ctx, vault_id, &db.documents, paths, source, |d| &mut d.filepath)
                + rebase_paths(&self.ctx, vault_id, &db.folders, paths, source, |f| &mut f.filepath)
                + rebase_paths(&self.ctx, vault_id, &db.images, paths, source, |i| &mut i.filepath);
            if moved > 0 {
                debug!("Moved {} entries from {} to {}", moved, from, to);
            }
        }
    }
}

/// Local conflicts: tell the UI to re-check after every write.
pub struct ConflictHooks {
    ctx: Arc<VaultContext>,
}

impl ConflictHooks {
    pub fn new(ctx: Arc<VaultContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl StorageHooks<LocalConflict> for ConflictHooks {
    async fn postprocess(&self, _vault_id: &str, saved: &[LocalConflict]) -> Result<()> {
        let vaults: BTreeSet<&str> = saved.iter().map(|c| c.vault_id.as_str()).collect();
        for vault_id in vaults {
            self.ctx
                .notify(Request::Store(StoreRequest::CheckConflicts {
                    vault_id: vault_id.to_string(),
                }))
                .await;
        }
        Ok(())
    }
}

/// Patch moving an entity under `parent_id` (or to the root).
pub fn move_patch(id: &str, parent_id: Option<&str>) -> Patch {
    Patch::new()
        .with("id", id)
        .with("parentId", parent_id.map_or(Value::Null, Value::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{Block, Converter, LocalConverter};
    use crate::context::Storages;
    use crate::vault::Vault;

    fn context() -> Arc<VaultContext> {
        let ctx = VaultContext::new();
        ctx.add_vault(Vault::local("v1", "Notes").with_filepath("/notes"));
        Arc::new(ctx)
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("Plan: Q3/Q4"), "Plan- Q3-Q4");
        assert_eq!(file_name("  "), "Untitled");
        assert_eq!(file_name(".hidden"), "hidden");
    }

    #[tokio::test]
    async fn test_documents_get_unique_paths_inside_their_folder() {
        let ctx = context();
        let storages = Storages::new(ctx.clone());

        let folder = storages
            .folders
            .save("v1", Patch::new().with("name", "Work"), StoreMeta::default())
            .await
            .unwrap();
        assert_eq!(folder.filepath.as_deref(), Some("Work"));

        let docs = storages
            .documents
            .save_bulk(
                "v1",
                vec![
                    Patch::new().with("title", "Plan").with("parentId", folder.id.as_str()),
                    Patch::new().with("title", "Plan").with("parentId", folder.id.as_str()),
                    Patch::new().with("title", "Plan"),
                ],
                StoreMeta::default(),
            )
            .await
            .unwrap();

        let paths: Vec<_> = docs.iter().map(|d| d.filepath.clone().unwrap()).collect();
        assert_eq!(paths, vec!["Work/Plan.md", "Work/Plan 1.md", "Plan.md"]);
    }

    #[tokio::test]
    async fn test_rename_and_move_recompute_path() {
        let ctx = context();
        let storages = Storages::new(ctx.clone());
        let folder = storages
            .folders
            .save("v1", Patch::new().with("name", "Archive"), StoreMeta::default())
            .await
            .unwrap();
        let doc = storages
            .documents
            .save("v1", Patch::new().with("title", "Draft"), StoreMeta::default())
            .await
            .unwrap();

        let renamed = storages
            .documents
            .save(
                "v1",
                Patch::new().with("id", doc.id.as_str()).with("title", "Final"),
                StoreMeta::default(),
            )
            .await
            .unwrap();
        assert_eq!(renamed.filepath.as_deref(), Some("Final.md"));

        let moved = storages
            .documents
            .save("v1", move_patch(&doc.id, Some(&folder.id)), StoreMeta::default())
            .await
            .unwrap();
        assert_eq!(moved.filepath.as_deref(), Some("Archive/Final.md"));
        assert_eq!(ctx.registry().get("v1", "Archive/Final.md"), Some(doc.id.clone()));
        assert!(ctx.registry().get("v1", "Final.md").is_none());
    }

    #[tokio::test]
    async fn test_device_imports_keep_their_paths_and_get_markdown() {
        let ctx = context();
        let storages = Storages::new(ctx.clone());
        let content = RichDocument::new(vec![Block::Heading {
            level: 1,
            text: "Hello".into(),
        }]);

        let doc = storages
            .documents
            .save(
                "v1",
                Patch::new()
                    .with("title", "Hello")
                    .with("content", serde_json::to_value(&content).unwrap()),
                StoreMeta::from_device(),
            )
            .await
            .unwrap();

        assert!(doc.filepath.is_none());
        let expected = LocalConverter
            .rich_to_markdown("v1", vec![content])
            .await
            .unwrap()
            .remove(0);
        assert_eq!(doc.md_content.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_renaming_a_folder_moves_its_contents() {
        let ctx = context();
        let storages = Storages::new(ctx.clone());
        let work = storages
            .folders
            .save("v1", Patch::new().with("name", "Work"), StoreMeta::default())
            .await
            .unwrap();
        let drafts = storages
            .folders
            .save(
                "v1",
                Patch::new().with("name", "Drafts").with("parentId", work.id.as_str()),
                StoreMeta::default(),
            )
            .await
            .unwrap();
        let plan = storages
            .documents
            .save(
                "v1",
                Patch::new().with("title", "Plan").with("parentId", work.id.as_str()),
                StoreMeta::default(),
            )
            .await
            .unwrap();
        let memo = storages
            .documents
            .save(
                "v1",
                Patch::new().with("title", "Memo").with("parentId", drafts.id.as_str()),
                StoreMeta::default(),
            )
            .await
            .unwrap();
        assert_eq!(memo.filepath.as_deref(), Some("Work/Drafts/Memo.md"));

        let renamed = storages
            .folders
            .save(
                "v1",
                Patch::new().with("id", work.id.as_str()).with("name", "Jobs"),
                StoreMeta::default(),
            )
            .await
            .unwrap();
        assert_eq!(renamed.filepath.as_deref(), Some("Jobs"));

        let db = ctx.store().database("v1");
        assert_eq!(db.documents.get(&plan.id).unwrap().filepath.as_deref(), Some("Jobs/Plan.md"));
        assert_eq!(
            db.documents.get(&memo.id).unwrap().filepath.as_deref(),
            Some("Jobs/Drafts/Memo.md")
        );
        assert_eq!(db.folders.get(&drafts.id).unwrap().filepath.as_deref(), Some("Jobs/Drafts"));

        let registry = ctx.registry();
        assert_eq!(registry.get("v1", "Jobs/Plan.md"), Some(plan.id.clone()));
        assert_eq!(registry.get("v1", "Jobs/Drafts/Memo.md"), Some(memo.id.clone()));
        assert!(registry.get("v1", "Work/Plan.md").is_none());
        assert!(registry.get("v1", "Work/Drafts").is_none());

        // A new note named like the old one no longer collides
        let again = storages
            .documents
            .save(
                "v1",
                Patch::new().with("title", "Plan").with("parentId", work.id.as_str()),
                StoreMeta::default(),
            )
            .await
            .unwrap();
        assert_eq!(again.filepath.as_deref(), Some("Jobs/Plan 1.md"));
    }

    #[tokio::test]
    async fn test_failed_write_releases_its_claimed_path() {
        let ctx = context();
        let storages = Storages::new(ctx.clone());

        let result = storages
            .folders
            .save(
                "v1",
                Patch::new().with("name", "Work").with("parentId", 7),
                StoreMeta::default(),
            )
            .await;
        assert!(result.is_err());
        assert!(ctx.registry().get("v1", "Work").is_none());
        assert!(ctx.store().database("v1").folders.is_empty());

        let folder = storages
            .folders
            .save("v1", Patch::new().with("name", "Work"), StoreMeta::default())
            .await
            .unwrap();
        assert_eq!(folder.filepath.as_deref(), Some("Work"));
    }
}
