//! YAML frontmatter around a markdown body.
//!
//! Documents written to disk carry their identity in frontmatter so a file
//! can be matched back to its entity after a rename outside the app.

use serde_yaml::Value;
use std::collections::BTreeMap;

pub type Frontmatter = BTreeMap<String, Value>;

/// A markdown file split into frontmatter and body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkdownFile {
    pub frontmatter: Frontmatter,
    pub body: String,
}

impl MarkdownFile {
    fn string_field(&self, key: &str) -> Option<&str> {
        self.frontmatter.get(key).and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.string_field("id")
    }

    pub fn title(&self) -> Option<&str> {
        self.string_field("title")
    }
}

/// Split a file into frontmatter and body.
///
/// Frontmatter must open the file with `---` and close with a `---` line.
/// Missing closing delimiter or invalid YAML leaves the whole text as body.
pub fn split(content: &str) -> MarkdownFile {
    let whole = || MarkdownFile {
        frontmatter: Frontmatter::new(),
        body: content.to_string(),
    };

    let Some(rest) = content.strip_prefix("---") else {
        return whole();
    };
    let Some(end) = rest.find("\n---") else {
        return whole();
    };

    let yaml = rest[..end].trim();
    let after = &rest[end + 4..];
    // Drop the remainder of the closing line and the blank separator.
    let body = after
        .split_once('\n')
        .map_or("", |(_, body)| body)
        .trim_start_matches('\n');

    if yaml.is_empty() {
        return MarkdownFile {
            frontmatter: Frontmatter::new(),
            body: body.to_string(),
        };
    }
    match serde_yaml::from_str::<Frontmatter>(yaml) {
        Ok(frontmatter) => MarkdownFile {
            frontmatter,
            body: body.to_string(),
        },
        Err(_) => whole(),
    }
}

/// Prepend frontmatter to a body. Empty frontmatter yields the body alone.
pub fn join(frontmatter: &Frontmatter, body: &str) -> String {
    if frontmatter.is_empty() {
        return body.to_string();
    }
    let yaml = serde_yaml::to_string(frontmatter).unwrap_or_default();
    format!("---\n{}---\n\n{}", yaml, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_with_frontmatter() {
        let content = "---\nid: d-1\ntitle: Trip\ntags:\n  - travel\n---\n\n# Packing\n";
        let file = split(content);

        assert_eq!(file.id(), Some("d-1"));
        assert_eq!(file.title(), Some("Trip"));
        assert_eq!(file.body, "# Packing\n");
    }

    #[test]
    fn test_split_without_frontmatter() {
        let content = "# Just a heading\n\nSome content.";
        let file = split(content);

        assert!(file.frontmatter.is_empty());
        assert_eq!(file.body, content);
    }

    #[test]
    fn test_unclosed_or_invalid_frontmatter_is_body() {
        assert_eq!(split("---\ntitle: x\nno end").body, "---\ntitle: x\nno end");

        let invalid = "---\n: [unbalanced\n---\nbody";
        let file = split(invalid);
        assert!(file.frontmatter.is_empty());
        assert_eq!(file.body, invalid);
    }

    #[test]
    fn test_join_then_split() {
        let mut frontmatter = Frontmatter::new();
        frontmatter.insert("id".into(), Value::String("d-9".into()));
        frontmatter.insert("title".into(), Value::String("Notes".into()));

        let file = split(&join(&frontmatter, "Body text\n"));

        assert_eq!(file.frontmatter, frontmatter);
        assert_eq!(file.body, "Body text\n");
        assert_eq!(join(&Frontmatter::new(), "plain"), "plain");
    }
}
