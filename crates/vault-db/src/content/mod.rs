//! Content conversion between files on disk and the rich document model.

pub mod frontmatter;
pub mod markdown;
pub mod model;
pub mod parser;

pub use frontmatter::{Frontmatter, MarkdownFile};
pub use model::{Block, List, ListItem, RichDocument};
pub use parser::{
    AttachmentParser, Converter, LocalConverter, MarkdownParser, NoOpParser, ParsedDocument,
    Parser, RichTextParser, ServiceConverter,
};

use crate::protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Batch result misaligned: expected {expected} items, got {got}")]
    Misaligned { expected: usize, got: usize },

    #[error("Conversion failed: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, ParseError>;
