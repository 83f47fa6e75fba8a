//! Parser chain between files on disk and the rich model.
//!
//! Conversion itself sits behind a [`Converter`]: in-process
//! ([`LocalConverter`]) or through the `utils` service
//! ([`ServiceConverter`]). Batch results are index-aligned with their input.

use super::frontmatter::{self, Frontmatter};
use super::model::RichDocument;
use super::{markdown, ParseError, Result};
use crate::protocol::{Request, ServiceClient, UtilsRequest};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::marker::PhantomData;
use std::sync::Arc;

#[async_trait]
pub trait Converter: Send + Sync {
    async fn markdown_to_rich(&self, vault_id: &str, items: Vec<String>)
    -> Result<Vec<RichDocument>>;

    async fn rich_to_markdown(&self, vault_id: &str, items: Vec<RichDocument>)
    -> Result<Vec<String>>;
}

/// Converts in the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalConverter;

#[async_trait]
impl Converter for LocalConverter {
    async fn markdown_to_rich(
        &self,
        _vault_id: &str,
        items: Vec<String>,
    ) -> Result<Vec<RichDocument>> {
        Ok(items.iter().map(|item| markdown::parse(item)).collect())
    }

    async fn rich_to_markdown(
        &self,
        _vault_id: &str,
        items: Vec<RichDocument>,
    ) -> Result<Vec<String>> {
        Ok(items.iter().map(markdown::render).collect())
    }
}

/// Delegates conversion to the `utils` service.
pub struct ServiceConverter {
    client: Arc<ServiceClient>,
}

impl ServiceConverter {
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self { client }
    }
}

fn check_aligned<T>(expected: usize, results: Vec<T>) -> Result<Vec<T>> {
    if results.len() != expected {
        return Err(ParseError::Misaligned {
            expected,
            got: results.len(),
        });
    }
    Ok(results)
}

#[async_trait]
impl Converter for ServiceConverter {
    async fn markdown_to_rich(
        &self,
        vault_id: &str,
        items: Vec<String>,
    ) -> Result<Vec<RichDocument>> {
        let expected = items.len();
        let results = self
            .client
            .invoke_as(Request::Utils(UtilsRequest::ParseMarkdown {
                vault_id: vault_id.to_string(),
                items,
            }))
            .await?;
        check_aligned(expected, results)
    }

    async fn rich_to_markdown(
        &self,
        vault_id: &str,
        items: Vec<RichDocument>,
    ) -> Result<Vec<String>> {
        let expected = items.len();
        let results = self
            .client
            .invoke_as(Request::Utils(UtilsRequest::ParseRichText {
                vault_id: vault_id.to_string(),
                items,
            }))
            .await?;
        check_aligned(expected, results)
    }
}

#[async_trait]
pub trait Parser: Send + Sync {
    type Input: Send + 'static;
    type Output: Send + 'static;

    async fn parse(&self, vault_id: &str, input: Self::Input) -> Result<Self::Output>;

    /// Parse many inputs; `output[i]` belongs to `inputs[i]`.
    async fn parse_batch(
        &self,
        vault_id: &str,
        inputs: Vec<Self::Input>,
    ) -> Result<Vec<Self::Output>> {
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            outputs.push(self.parse(vault_id, input).await?);
        }
        Ok(outputs)
    }
}

/// A markdown file parsed into the rich model.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub frontmatter: Frontmatter,
    pub content: RichDocument,
    /// Body without frontmatter.
    pub md_content: String,
}

impl ParsedDocument {
    pub fn id(&self) -> Option<&str> {
        self.frontmatter.get("id").and_then(serde_yaml::Value::as_str)
    }

    pub fn title(&self) -> Option<&str> {
        self.frontmatter
            .get("title")
            .and_then(serde_yaml::Value::as_str)
    }
}

/// File text (frontmatter + markdown) → rich model.
pub struct MarkdownParser {
    converter: Arc<dyn Converter>,
}

impl MarkdownParser {
    pub fn new(converter: Arc<dyn Converter>) -> Self {
        Self { converter }
    }
}

#[async_trait]
impl Parser for MarkdownParser {
    type Input = String;
    type Output = ParsedDocument;

    async fn parse(&self, vault_id: &str, input: String) -> Result<ParsedDocument> {
        let mut parsed = self.parse_batch(vault_id, vec![input]).await?;
        parsed.pop().ok_or(ParseError::Misaligned {
            expected: 1,
            got: 0,
        })
    }

    async fn parse_batch(&self, vault_id: &str, inputs: Vec<String>) -> Result<Vec<ParsedDocument>> {
        let files: Vec<_> = inputs.iter().map(|text| frontmatter::split(text)).collect();
        let bodies = files.iter().map(|file| file.body.clone()).collect();
        let contents = self.converter.markdown_to_rich(vault_id, bodies).await?;
        let contents = check_aligned(files.len(), contents)?;

        Ok(files
            .into_iter()
            .zip(contents)
            .map(|(file, content)| ParsedDocument {
                frontmatter: file.frontmatter,
                content,
                md_content: file.body,
            })
            .collect())
    }
}

/// Rich model → markdown body.
pub struct RichTextParser {
    converter: Arc<dyn Converter>,
}

impl RichTextParser {
    pub fn new(converter: Arc<dyn Converter>) -> Self {
        Self { converter }
    }
}

#[async_trait]
impl Parser for RichTextParser {
    type Input = RichDocument;
    type Output = String;

    async fn parse(&self, vault_id: &str, input: RichDocument) -> Result<String> {
        let mut rendered = self.parse_batch(vault_id, vec![input]).await?;
        rendered.pop().ok_or(ParseError::Misaligned {
            expected: 1,
            got: 0,
        })
    }

    async fn parse_batch(&self, vault_id: &str, inputs: Vec<RichDocument>) -> Result<Vec<String>> {
        let expected = inputs.len();
        let rendered = self.converter.rich_to_markdown(vault_id, inputs).await?;
        check_aligned(expected, rendered)
    }
}

/// Raw attachment bytes → base64 payload stored in `imageData`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachmentParser;

#[async_trait]
impl Parser for AttachmentParser {
    type Input = Vec<u8>;
    type Output = String;

    async fn parse(&self, _vault_id: &str, input: Vec<u8>) -> Result<String> {
        Ok(STANDARD.encode(input))
    }
}

/// Identity parser for kinds with no file representation.
pub struct NoOpParser<T>(PhantomData<fn() -> T>);

impl<T> Default for NoOpParser<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<T: Send + 'static> Parser for NoOpParser<T> {
    type Input = T;
    type Output = T;

    async fn parse(&self, _vault_id: &str, input: T) -> Result<T> {
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Block;
    use crate::protocol::{ClientConfig, Envelope, ServiceKey};
    use crate::transport::ChannelPort;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_markdown_parser_batch_is_index_aligned() {
        let parser = MarkdownParser::new(Arc::new(LocalConverter));
        let inputs = vec![
            "---\nid: a\n---\n\n# First\n".to_string(),
            "plain second".to_string(),
            "# Third".to_string(),
        ];

        let parsed = parser.parse_batch("v1", inputs).await.unwrap();

        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].id(), Some("a"));
        assert_eq!(parsed[0].md_content, "# First\n");
        assert_eq!(
            parsed[1].content.blocks,
            vec![Block::Paragraph {
                text: "plain second".into()
            }]
        );
        assert_eq!(parsed[2].content.first_heading(), Some("Third"));
    }

    #[tokio::test]
    async fn test_rich_text_parser_renders_markdown() {
        let parser = RichTextParser::new(Arc::new(LocalConverter));
        let doc = markdown::parse("- [x] done");

        assert_eq!(parser.parse("v1", doc).await.unwrap(), "- [x] done\n");
    }

    #[tokio::test]
    async fn test_attachment_parser_encodes_base64() {
        let encoded = AttachmentParser.parse("v1", vec![1, 2, 3]).await.unwrap();
        assert_eq!(encoded, "AQID");
    }

    #[tokio::test]
    async fn test_noop_parser_passes_through() {
        let parser = NoOpParser::<u32>::default();
        assert_eq!(parser.parse_batch("v1", vec![4, 5]).await.unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_service_converter_rejects_misaligned_batch() {
        let ((client_port, client_inbox), (server_port, mut server_inbox)) = ChannelPort::pair();
        let client = Arc::new(ServiceClient::new(
            Arc::new(client_port),
            ClientConfig {
                caller: ServiceKey::Database,
                invoke_timeout: Duration::from_secs(5),
            },
        ));
        client.listen(client_inbox);

        // Responder that drops one result.
        tokio::spawn(async move {
            use crate::transport::MessagePort;
            while let Some(request) = server_inbox.recv().await {
                let response: Envelope = request.respond(json!([{"blocks": []}]));
                let _ = server_port.post(response).await;
            }
        });

        let converter = ServiceConverter::new(client);
        let err = converter
            .markdown_to_rich("v1", vec!["a".into(), "b".into()])
            .await
            .unwrap_err();

        assert!(matches!(err, ParseError::Misaligned { expected: 2, got: 1 }));
    }
}
