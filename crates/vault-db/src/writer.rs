//! Content writer: serializer + entity I/O.
//!
//! A serializer that yields `None` marks the entity as not writable; the
//! writer then resolves immediately without touching the device.

use crate::content::{frontmatter, Frontmatter, Parser, ParseError, RichTextParser};
use crate::entity::{Document, Entity, Folder, Image};
use crate::io::{EntityIo, IoError};
use crate::protocol::DeviceRecord;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

pub type Result<T> = std::result::Result<T, WriterError>;

#[async_trait]
pub trait Serializer<T>: Send + Sync {
    /// Device representation of `entity`, or `None` when it has none.
    async fn serialize(&self, entity: &T) -> Result<Option<DeviceRecord>>;
}

pub struct ContentWriter<T> {
    serializer: Arc<dyn Serializer<T>>,
    io: Arc<dyn EntityIo>,
}

impl<T> Clone for ContentWriter<T> {
    fn clone(&self) -> Self {
        Self {
            serializer: Arc::clone(&self.serializer),
            io: Arc::clone(&self.io),
        }
    }
}

impl<T: Send + Sync> ContentWriter<T> {
    pub fn new(serializer: Arc<dyn Serializer<T>>, io: Arc<dyn EntityIo>) -> Self {
        Self { serializer, io }
    }

    pub async fn create(&self, entity: &T) -> Result<()> {
        let Some(record) = self.serializer.serialize(entity).await? else {
            return Ok(());
        };
        self.io.create(record).await?;
        Ok(())
    }

    pub async fn create_batch(&self, vault_id: &str, entities: &[T]) -> Result<()> {
        let mut records = Vec::with_capacity(entities.len());
        for entity in entities {
            if let Some(record) = self.serializer.serialize(entity).await? {
                records.push(record);
            }
        }
        if records.is_empty() {
            return Ok(());
        }
        self.io.create_batch(vault_id, records).await?;
        Ok(())
    }

    /// Write `mods` over the file of `old`. The device uses the old record
    /// to detect renames and moves.
    pub async fn update(&self, mods: &T, old: &T) -> Result<()> {
        let Some(mods) = self.serializer.serialize(mods).await? else {
            return Ok(());
        };
        let old = self
            .serializer
            .serialize(old)
            .await?
            .unwrap_or_else(|| mods.clone());
        self.io.update(mods, old).await?;
        Ok(())
    }

    pub async fn delete(&self, entity: &T) -> Result<()> {
        let Some(record) = self.serializer.serialize(entity).await? else {
            return Ok(());
        };
        self.io.delete(record).await?;
        Ok(())
    }
}

/// Frontmatter (id, title) + markdown body.
pub struct DocumentSerializer {
    parser: Arc<RichTextParser>,
}

impl DocumentSerializer {
    pub fn new(parser: Arc<RichTextParser>) -> Self {
        Self { parser }
    }
}

#[async_trait]
impl Serializer<Document> for DocumentSerializer {
    async fn serialize(&self, doc: &Document) -> Result<Option<DeviceRecord>> {
        let Some(filepath) = doc.filepath.clone() else {
            return Ok(None);
        };

        let body = match (&doc.md_content, &doc.content) {
            (Some(md), _) => md.clone(),
            (None, Some(content)) => self.parser.parse(&doc.vault_id, content.clone()).await?,
            (None, None) => String::new(),
        };

        let mut matter = Frontmatter::new();
        matter.insert("id".into(), serde_yaml::Value::String(doc.id.clone()));
        if !doc.title.is_empty() {
            matter.insert("title".into(), serde_yaml::Value::String(doc.title.clone()));
        }

        Ok(Some(DeviceRecord {
            id: doc.id.clone(),
            vault_id: doc.vault_id.clone(),
            filepath,
            content: Some(frontmatter::join(&matter, &body)),
            data: None,
        }))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FolderSerializer;

#[async_trait]
impl Serializer<Folder> for FolderSerializer {
    async fn serialize(&self, folder: &Folder) -> Result<Option<DeviceRecord>> {
        Ok(folder.filepath.clone().map(|filepath| DeviceRecord {
            id: folder.id.clone(),
            vault_id: folder.vault_id.clone(),
            filepath,
            content: None,
            data: None,
        }))
    }
}

/// Where attachment bytes come from when an image is written to disk.
#[async_trait]
pub trait AttachmentSource: Send + Sync {
    /// Plaintext base64 payload of image `id`, if it can be found.
    async fn image_data(&self, vault_id: &str, id: &str) -> Option<String>;
}

pub struct AttachmentSerializer {
    source: Arc<dyn AttachmentSource>,
}

impl AttachmentSerializer {
    pub fn new(source: Arc<dyn AttachmentSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Serializer<Image> for AttachmentSerializer {
    async fn serialize(&self, image: &Image) -> Result<Option<DeviceRecord>> {
        let Some(filepath) = image.filepath.clone() else {
            return Ok(None);
        };
        let data = self.source.image_data(image.vault_id(), image.id()).await;
        Ok(Some(DeviceRecord {
            id: image.id.clone(),
            vault_id: image.vault_id.clone(),
            filepath,
            content: None,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{markdown, LocalConverter};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingIo {
        calls: Mutex<Vec<(String, Vec<DeviceRecord>)>>,
    }

    impl RecordingIo {
        fn record(&self, operation: &str, records: Vec<DeviceRecord>) {
            self.calls
                .lock()
                .unwrap()
                .push((operation.to_string(), records));
        }

        fn operations(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(op, _)| op.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EntityIo for RecordingIo {
        async fn create(&self, record: DeviceRecord) -> crate::io::Result<()> {
            self.record("create", vec![record]);
            Ok(())
        }

        async fn create_batch(
            &self,
            _vault_id: &str,
            records: Vec<DeviceRecord>,
        ) -> crate::io::Result<()> {
            self.record("createBatch", records);
            Ok(())
        }

        async fn update(&self, mods: DeviceRecord, old: DeviceRecord) -> crate::io::Result<()> {
            self.record("update", vec![mods, old]);
            Ok(())
        }

        async fn delete(&self, record: DeviceRecord) -> crate::io::Result<()> {
            self.record("delete", vec![record]);
            Ok(())
        }

        async fn read(
            &self,
            _vault_id: &str,
            _filepath: &str,
        ) -> crate::io::Result<Option<DeviceRecord>> {
            Ok(None)
        }

        async fn read_batch(
            &self,
            _vault_id: &str,
            _filepaths: Vec<String>,
        ) -> crate::io::Result<Vec<DeviceRecord>> {
            Ok(Vec::new())
        }
    }

    fn document_writer(io: Arc<RecordingIo>) -> ContentWriter<Document> {
        let parser = Arc::new(RichTextParser::new(Arc::new(LocalConverter)));
        ContentWriter::new(Arc::new(DocumentSerializer::new(parser)), io)
    }

    fn doc(id: &str, filepath: Option<&str>) -> Document {
        Document {
            id: id.into(),
            vault_id: "v1".into(),
            title: "Plan".into(),
            filepath: filepath.map(String::from),
            content: Some(markdown::parse("- [x] ship")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unwritable_entity_is_a_noop() {
        let io = Arc::new(RecordingIo::default());
        let writer = document_writer(Arc::clone(&io));

        writer.create(&doc("d1", None)).await.unwrap();
        writer.delete(&doc("d1", None)).await.unwrap();
        writer.update(&doc("d1", None), &doc("d1", Some("a.md"))).await.unwrap();

        assert!(io.operations().is_empty());
    }

    #[tokio::test]
    async fn test_create_batch_filters_and_skips_empty() {
        let io = Arc::new(RecordingIo::default());
        let writer = document_writer(Arc::clone(&io));

        writer
            .create_batch("v1", &[doc("d1", None), doc("d2", None)])
            .await
            .unwrap();
        assert!(io.operations().is_empty());

        writer
            .create_batch("v1", &[doc("d1", None), doc("d2", Some("b.md"))])
            .await
            .unwrap();
        let calls = io.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.len(), 1);
        assert_eq!(calls[0].1[0].id, "d2");
    }

    #[tokio::test]
    async fn test_document_record_has_frontmatter_and_markdown() {
        let io = Arc::new(RecordingIo::default());
        let writer = document_writer(Arc::clone(&io));

        writer.create(&doc("d1", Some("plan.md"))).await.unwrap();

        let calls = io.calls.lock().unwrap();
        let content = calls[0].1[0].content.clone().unwrap();
        let file = frontmatter::split(&content);
        assert_eq!(file.id(), Some("d1"));
        assert_eq!(file.title(), Some("Plan"));
        assert_eq!(file.body, "- [x] ship\n");
    }

    #[tokio::test]
    async fn test_update_sends_mods_and_old() {
        let io = Arc::new(RecordingIo::default());
        let writer = document_writer(Arc::clone(&io));

        writer
            .update(&doc("d1", Some("new.md")), &doc("d1", Some("old.md")))
            .await
            .unwrap();

        let calls = io.calls.lock().unwrap();
        assert_eq!(calls[0].0, "update");
        assert_eq!(calls[0].1[0].filepath, "new.md");
        assert_eq!(calls[0].1[1].filepath, "old.md");
    }

    #[tokio::test]
    async fn test_attachment_serializer_pulls_bytes_from_source() {
        struct Fixed;

        #[async_trait]
        impl AttachmentSource for Fixed {
            async fn image_data(&self, _vault_id: &str, id: &str) -> Option<String> {
                (id == "i1").then(|| "AQID".to_string())
            }
        }

        let serializer = AttachmentSerializer::new(Arc::new(Fixed));
        let image = Image {
            id: "i1".into(),
            vault_id: "v1".into(),
            filepath: Some("assets/a.png".into()),
            ..Default::default()
        };

        let record = serializer.serialize(&image).await.unwrap().unwrap();
        assert_eq!(record.data.as_deref(), Some("AQID"));

        let unplaced = Image {
            filepath: None,
            ..image
        };
        assert!(serializer.serialize(&unplaced).await.unwrap().is_none());
    }
}
