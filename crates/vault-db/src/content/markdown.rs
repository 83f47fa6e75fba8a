//! Markdown ⇄ rich model conversion.
//!
//! Line oriented: fenced code, ATX headings, rules, block quotes, pipe
//! tables, nested bullet/ordered/task lists, standalone images and
//! paragraphs. Inline markup is kept verbatim in block text.

use super::model::{Block, List, ListItem, RichDocument};
use regex::Regex;
use std::sync::LazyLock;

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.*?)\s*$").expect("valid regex"));
static FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(`{3,}|~{3,})\s*([\w+#.-]*)\s*$").expect("valid regex"));
static RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:-{3,}|\*{3,}|_{3,})$").expect("valid regex"));
static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)([-*+]|\d+[.)])\s+(?:\[([ xX])\]\s+)?(.*)$").expect("valid regex")
});
static TABLE_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\|?\s*:?-{3,}:?\s*(?:\|\s*:?-{3,}:?\s*)*\|?$").expect("valid regex")
});
static IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^!\[([^\]]*)\]\(([^)\s]+)\)$").expect("valid regex"));

/// Parse a markdown body (frontmatter already removed).
pub fn parse(markdown: &str) -> RichDocument {
    let lines: Vec<&str> = markdown.lines().collect();
    RichDocument::new(parse_blocks(&lines))
}

/// Render a rich document as markdown, newline terminated.
pub fn render(doc: &RichDocument) -> String {
    let mut out = render_blocks(&doc.blocks);
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

struct ListLine<'a> {
    indent: usize,
    ordered: bool,
    checked: Option<bool>,
    text: &'a str,
}

fn parse_blocks(lines: &[&str]) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();

        if trimmed.is_empty() {
            flush_paragraph(&mut paragraph, &mut blocks);
            i += 1;
            continue;
        }

        if let Some(caps) = FENCE.captures(trimmed) {
            flush_paragraph(&mut paragraph, &mut blocks);
            let fence = caps[1].to_string();
            let language = Some(caps[2].to_string()).filter(|l| !l.is_empty());
            let mut code = Vec::new();
            i += 1;
            while i < lines.len() && !is_closing_fence(lines[i], &fence) {
                code.push(lines[i]);
                i += 1;
            }
            i += 1;
            blocks.push(Block::CodeBlock {
                language,
                code: code.join("\n"),
            });
            continue;
        }

        if let Some(caps) = HEADING.captures(trimmed) {
            flush_paragraph(&mut paragraph, &mut blocks);
            blocks.push(Block::Heading {
                level: caps[1].len() as u8,
                text: caps[2].to_string(),
            });
            i += 1;
            continue;
        }

        if RULE.is_match(trimmed) {
            flush_paragraph(&mut paragraph, &mut blocks);
            blocks.push(Block::Rule);
            i += 1;
            continue;
        }

        if trimmed.starts_with('>') {
            flush_paragraph(&mut paragraph, &mut blocks);
            let mut inner = Vec::new();
            while i < lines.len() {
                let Some(rest) = lines[i].trim_start().strip_prefix('>') else {
                    break;
                };
                inner.push(rest.strip_prefix(' ').unwrap_or(rest));
                i += 1;
            }
            blocks.push(Block::Quote {
                blocks: parse_blocks(&inner),
            });
            continue;
        }

        if trimmed.starts_with('|')
            && i + 1 < lines.len()
            && TABLE_SEPARATOR.is_match(lines[i + 1].trim())
        {
            flush_paragraph(&mut paragraph, &mut blocks);
            let header = split_cells(trimmed);
            i += 2;
            let mut rows = Vec::new();
            while i < lines.len() && lines[i].trim().starts_with('|') {
                rows.push(split_cells(lines[i]));
                i += 1;
            }
            blocks.push(Block::Table { header, rows });
            continue;
        }

        if LIST_ITEM.is_match(line) {
            flush_paragraph(&mut paragraph, &mut blocks);
            let mut items = Vec::new();
            while i < lines.len() {
                if lines[i].trim().is_empty() {
                    // Loose lists: blank lines between items stay in one list.
                    let next = lines[i..].iter().position(|l| !l.trim().is_empty());
                    match next {
                        Some(offset) if LIST_ITEM.is_match(lines[i + offset]) => {
                            i += offset;
                            continue;
                        }
                        _ => break,
                    }
                }
                let Some(caps) = LIST_ITEM.captures(lines[i]) else {
                    break;
                };
                items.push(ListLine {
                    indent: indent_width(caps.get(1).map_or("", |m| m.as_str())),
                    ordered: !matches!(&caps[2], "-" | "*" | "+"),
                    checked: caps.get(3).map(|m| m.as_str() != " "),
                    text: caps.get(4).map_or("", |m| m.as_str()),
                });
                i += 1;
            }

            let mut pos = 0;
            while pos < items.len() {
                blocks.push(Block::List(build_list(&items, &mut pos)));
            }
            continue;
        }

        if paragraph.is_empty() {
            if let Some(caps) = IMAGE.captures(trimmed) {
                blocks.push(Block::Image {
                    id: None,
                    src: caps[2].to_string(),
                    alt: caps[1].to_string(),
                });
                i += 1;
                continue;
            }
        }

        paragraph.push(trimmed);
        i += 1;
    }

    flush_paragraph(&mut paragraph, &mut blocks);
    blocks
}

fn flush_paragraph(paragraph: &mut Vec<&str>, blocks: &mut Vec<Block>) {
    if !paragraph.is_empty() {
        blocks.push(Block::Paragraph {
            text: paragraph.join("\n"),
        });
        paragraph.clear();
    }
}

fn is_closing_fence(line: &str, fence: &str) -> bool {
    let trimmed = line.trim();
    let fence_char = fence.chars().next().unwrap_or('`');
    trimmed.len() >= fence.len() && trimmed.chars().all(|c| c == fence_char)
}

fn indent_width(whitespace: &str) -> usize {
    whitespace
        .chars()
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

fn split_cells(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|cell| cell.trim().to_string()).collect()
}

/// Build one list starting at `lines[*pos]`. Deeper lines nest under the
/// preceding item; the list ends at a shallower line or a marker switch.
fn build_list(lines: &[ListLine<'_>], pos: &mut usize) -> List {
    let indent = lines[*pos].indent;
    let ordered = lines[*pos].ordered;
    let mut items: Vec<ListItem> = Vec::new();

    while *pos < lines.len() && lines[*pos].indent >= indent {
        let line = &lines[*pos];
        if line.indent > indent && !items.is_empty() {
            let child = build_list(lines, pos);
            if let Some(last) = items.last_mut() {
                match &mut last.children {
                    Some(existing) => existing.items.extend(child.items),
                    None => last.children = Some(child),
                }
            }
            continue;
        }
        if line.ordered != ordered {
            break;
        }
        items.push(ListItem {
            text: line.text.to_string(),
            checked: line.checked,
            children: None,
        });
        *pos += 1;
    }

    List { ordered, items }
}

fn render_blocks(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(render_block)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_block(block: &Block) -> String {
    match block {
        Block::Heading { level, text } => {
            format!("{} {}", "#".repeat((*level).clamp(1, 6) as usize), text)
        }
        Block::Paragraph { text } => text.clone(),
        Block::List(list) => {
            let mut lines = Vec::new();
            render_list(list, 0, &mut lines);
            lines.join("\n")
        }
        Block::CodeBlock { language, code } => {
            format!("```{}\n{}\n```", language.as_deref().unwrap_or(""), code)
        }
        Block::Table { header, rows } => {
            let mut lines = vec![render_row(header)];
            lines.push(render_row(&vec!["---".to_string(); header.len()]));
            lines.extend(rows.iter().map(|row| render_row(row)));
            lines.join("\n")
        }
        Block::Quote { blocks } => render_blocks(blocks)
            .lines()
            .map(|line| {
                if line.is_empty() {
                    ">".to_string()
                } else {
                    format!("> {}", line)
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Block::Rule => "---".to_string(),
        Block::Image { src, alt, .. } => format!("![{}]({})", alt, src),
    }
}

fn render_row(cells: &[String]) -> String {
    format!("| {} |", cells.join(" | "))
}

fn render_list(list: &List, indent: usize, out: &mut Vec<String>) {
    for (n, item) in list.items.iter().enumerate() {
        let marker = if list.ordered {
            format!("{}.", n + 1)
        } else {
            "-".to_string()
        };
        let checkbox = match item.checked {
            Some(true) => "[x] ",
            Some(false) => "[ ] ",
            None => "",
        };
        out.push(format!(
            "{}{} {}{}",
            " ".repeat(indent),
            marker,
            checkbox,
            item.text
        ));
        if let Some(children) = &item.children {
            render_list(children, indent + marker.len() + 1, out);
        }
    }
}
