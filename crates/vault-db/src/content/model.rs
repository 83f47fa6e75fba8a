//! Rich document model: an ordered tree of blocks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RichDocument {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Block {
    Heading {
        level: u8,
        text: String,
    },
    Paragraph {
        text: String,
    },
    List(List),
    CodeBlock {
        language: Option<String>,
        code: String,
    },
    Table {
        header: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    Quote {
        blocks: Vec<Block>,
    },
    Rule,
    /// Embedded attachment. `id` is the attachment entity id once the image
    /// is stored; `new` marks an upload still in flight.
    Image {
        id: Option<String>,
        src: String,
        alt: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    pub ordered: bool,
    pub items: Vec<ListItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItem {
    pub text: String,
    /// `Some` for task list items.
    pub checked: Option<bool>,
    pub children: Option<List>,
}

/// Placeholder id of an image whose upload has not finished.
pub const PENDING_IMAGE_ID: &str = "new";

impl RichDocument {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Ids of stored attachments referenced by image blocks, in document
    /// order, without duplicates or pending uploads.
    pub fn image_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        collect_image_ids(&self.blocks, &mut ids);
        ids
    }

    /// First heading text, used as a fallback title.
    pub fn first_heading(&self) -> Option<&str> {
        self.blocks.iter().find_map(|block| match block {
            Block::Heading { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

fn collect_image_ids(blocks: &[Block], ids: &mut Vec<String>) {
    for block in blocks {
        match block {
            Block::Image { id: Some(id), .. } if id != PENDING_IMAGE_ID => {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
            Block::Quote { blocks } => collect_image_ids(blocks, ids),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: Option<&str>) -> Block {
        Block::Image {
            id: id.map(String::from),
            src: "pic.png".into(),
            alt: String::new(),
        }
    }

    #[test]
    fn test_image_ids_skip_pending_and_duplicates() {
        let doc = RichDocument::new(vec![
            image(Some("img-1")),
            image(Some("new")),
            image(None),
            Block::Quote {
                blocks: vec![image(Some("img-2")), image(Some("img-1"))],
            },
        ]);

        assert_eq!(doc.image_ids(), vec!["img-1", "img-2"]);
    }

    #[test]
    fn test_block_wire_format() {
        let json = serde_json::to_value(Block::CodeBlock {
            language: Some("rust".into()),
            code: "fn main() {}".into(),
        })
        .unwrap();

        assert_eq!(json["type"], "codeBlock");
        assert_eq!(json["language"], "rust");
    }
}
