//! Markdown parser adapter.
//!
//! The rest of the engine never touches the AST directly; everything it needs
//! from a document comes through the accessors on [`Document`] plus the two
//! raw-text helpers at the bottom. Descriptions and section text are
//! recovered from the source bytes (via sourcepos) so they match what the
//! author wrote, not a re-rendering.

use crate::errors::EngineError;
use anyhow::Result;
use comrak::nodes::{AstNode, NodeValue};
use comrak::{parse_document, Arena, Options};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Expected output attached to a code block by an
/// `<!-- expected_similarity=... -->` annotation on the following fence.
#[derive(Debug, Clone, Default)]
pub struct ExpectedOutput {
    pub language: String,
    pub content: String,
    pub expected_similarity: f64,
    pub expected_regex: Option<String>,
}

/// One executable fenced code region plus its narrative context.
#[derive(Debug, Clone, Default)]
pub struct CodeBlock {
    pub language: String,
    pub content: String,
    /// Nearest preceding heading of any level; the step grouping key.
    pub header: String,
    /// Narrative paragraph(s) immediately preceding the fence.
    pub description: String,
    /// Enclosing level-2 section name, if any.
    pub section: String,
    pub in_prerequisite_section: bool,
    pub expected_output: ExpectedOutput,
}

fn expected_similarity_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"<!--\s*expected_similarity=\s*(?:(\d+\.?\d*)|"(.*)")\s*-->"#)
            .expect("expected_similarity pattern")
    })
}

fn variables_comment_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<!--.*?```variables(.*?)```").expect("variables comment pattern")
    })
}

pub fn is_prerequisite_heading(text: &str) -> bool {
    let trimmed = text.trim().to_lowercase();
    trimmed == "prerequisites" || trimmed == "prerequisite"
}

/// A parsed markdown document. The arena is supplied by the caller so the
/// borrowed AST cannot outlive it.
pub struct Document<'a> {
    root: &'a AstNode<'a>,
    source: &'a str,
}

impl<'a> Document<'a> {
    pub fn parse(arena: &'a Arena<AstNode<'a>>, source: &'a str) -> Self {
        let mut options = Options::default();
        options.extension.front_matter_delimiter = Some("---".to_string());
        options.render.sourcepos = true;
        let root = parse_document(arena, source, &options);
        Document { root, source }
    }

    /// The first level-1 heading, used as the scenario title.
    pub fn scenario_title(&self) -> Option<String> {
        for node in self.root.descendants() {
            if let NodeValue::Heading(heading) = &node.data.borrow().value {
                if heading.level == 1 {
                    return Some(collect_inline_text(node));
                }
            }
        }
        None
    }

    /// YAML front-matter as a string-keyed map. An absent front-matter block
    /// yields an empty map; malformed YAML is a parse error.
    pub fn yaml_metadata(&self) -> Result<BTreeMap<String, serde_yaml::Value>> {
        for node in self.root.descendants() {
            if let NodeValue::FrontMatter(raw) = &node.data.borrow().value {
                return parse_front_matter(raw);
            }
        }
        Ok(BTreeMap::new())
    }

    /// Extract the code blocks whose language tag is in `allowed_languages`,
    /// binding descriptions, headers, sections, and expected outputs.
    pub fn code_blocks(
        &self,
        allowed_languages: &[&str],
        source_name: &str,
    ) -> Result<Vec<CodeBlock>> {
        let source_name = if source_name.is_empty() {
            "<unknown source>"
        } else {
            source_name
        };

        let mut blocks: Vec<CodeBlock> = Vec::new();
        let mut last_header = String::new();
        let mut current_section = String::new();
        let mut in_prerequisites_section = false;
        let mut current_paragraphs = String::new();
        let mut last_was_paragraph: Option<bool> = None;
        let mut pending_expected_output = false;
        let mut pending_similarity = 0.0_f64;
        let mut pending_regex: Option<String> = None;

        for node in self.root.descendants() {
            let data = node.data.borrow();
            match &data.value {
                NodeValue::Heading(heading) => {
                    last_header = collect_inline_text(node);
                    if heading.level == 2 {
                        current_section = last_header.clone();
                        in_prerequisites_section = is_prerequisite_heading(&last_header);
                    }
                    last_was_paragraph = Some(false);
                }
                NodeValue::Paragraph => {
                    if !current_paragraphs.is_empty() {
                        current_paragraphs.push_str("\n\n");
                    }
                    current_paragraphs.push_str(&self.raw_block_text(node));
                    last_was_paragraph = Some(true);
                }
                NodeValue::HtmlBlock(html) => {
                    // Annotation comments do not interrupt the paragraph that
                    // describes the next fence.
                    let Some(captures) = expected_similarity_regex().captures(&html.literal)
                    else {
                        continue;
                    };
                    if let Some(score) = captures.get(1) {
                        let score: f64 = score.as_str().parse().map_err(|_| {
                            EngineError::ScenarioParse(format!(
                                "invalid expected_similarity value {:?} in {source_name}",
                                captures.get(1).map(|m| m.as_str()).unwrap_or_default()
                            ))
                        })?;
                        log::debug!("Similarity score of {score} found");
                        pending_similarity = score;
                    } else {
                        let pattern = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
                        if pattern.is_empty() {
                            return Err(EngineError::ScenarioParse(format!(
                                "empty expected_similarity regex in {source_name}"
                            ))
                            .into());
                        }
                        log::debug!("Regex {pattern:?} found");
                        pending_regex = Some(pattern.to_string());
                    }
                    pending_expected_output = true;
                }
                NodeValue::CodeBlock(code) if code.fenced => {
                    let language = code
                        .info
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_string();
                    let content = code.literal.clone();

                    let description = match last_was_paragraph {
                        Some(true) => std::mem::take(&mut current_paragraphs),
                        Some(false) => {
                            log::warn!(
                                "In {source_name} the node before the code block {content:?} is not a paragraph"
                            );
                            String::new()
                        }
                        None => {
                            log::warn!(
                                "In {source_name} there are no markdown elements before the code block {content:?}"
                            );
                            String::new()
                        }
                    };
                    current_paragraphs.clear();
                    last_was_paragraph = Some(false);

                    if allowed_languages.contains(&language.as_str()) {
                        blocks.push(CodeBlock {
                            language,
                            content,
                            header: last_header.clone(),
                            description,
                            section: current_section.clone(),
                            in_prerequisite_section: in_prerequisites_section,
                            expected_output: ExpectedOutput::default(),
                        });
                    } else if pending_expected_output {
                        // An annotation before a fence that is not itself a
                        // command binds that fence to the previous command as
                        // its expected output. With no previous command the
                        // annotation is consumed and ignored.
                        if let Some(last) = blocks.last_mut() {
                            last.expected_output = ExpectedOutput {
                                language,
                                content,
                                expected_similarity: pending_similarity,
                                expected_regex: pending_regex.take(),
                            };
                        }
                        pending_expected_output = false;
                        pending_similarity = 0.0;
                        pending_regex = None;
                    }
                }
                _ => {}
            }
        }

        Ok(blocks)
    }

    /// Markdown links to other `.md` documents inside a level-2
    /// `Prerequisites` (or `Prerequisite`) section.
    pub fn prerequisite_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        let mut in_prerequisites_section = false;

        for node in self.root.descendants() {
            match &node.data.borrow().value {
                NodeValue::Heading(heading) => {
                    if heading.level == 2 {
                        let text = collect_inline_text(node);
                        in_prerequisites_section = is_prerequisite_heading(&text);
                    }
                }
                NodeValue::Link(link) => {
                    if in_prerequisites_section && link.url.ends_with(".md") {
                        urls.push(link.url.clone());
                    }
                }
                _ => {}
            }
        }

        if urls.is_empty() {
            log::debug!("No URLs found in the Prerequisites section");
        } else {
            log::debug!("Found {} URLs in the Prerequisites section", urls.len());
        }
        urls
    }

    /// Document-level variable exports declared in an HTML comment holding a
    /// ```` ```variables ```` fence.
    pub fn scenario_variables(&self) -> BTreeMap<String, String> {
        let mut variables = BTreeMap::new();

        for node in self.root.descendants() {
            if let NodeValue::HtmlBlock(html) = &node.data.borrow().value {
                log::debug!("Found HTML block with the content: {}", html.literal);
                if let Some(captures) = variables_comment_regex().captures(&html.literal) {
                    let block = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
                    for (key, value) in parse_variable_exports(block) {
                        variables.insert(key, value);
                    }
                }
            }
        }

        variables
    }

    /// First lines of fenced blocks carrying no language tag.
    pub fn untagged_fences(&self) -> Vec<String> {
        let mut snippets = Vec::new();
        for node in self.root.descendants() {
            if let NodeValue::CodeBlock(code) = &node.data.borrow().value {
                if code.fenced && code.info.trim().is_empty() {
                    let first_line = code.literal.lines().next().unwrap_or_default();
                    snippets.push(first_line.trim().to_string());
                }
            }
        }
        snippets
    }

    /// The raw source lines spanned by a block node, newline-joined.
    fn raw_block_text(&self, node: &'a AstNode<'a>) -> String {
        let sourcepos = node.data.borrow().sourcepos;
        let start = sourcepos.start.line.saturating_sub(1);
        let end = sourcepos.end.line;
        let lines: Vec<&str> = self.source.lines().collect();
        match lines.get(start..end.min(lines.len())) {
            Some(span) => span.join("\n"),
            None => String::new(),
        }
    }
}

/// Literal text of a node's inline children (heading titles, link labels).
fn collect_inline_text<'a>(node: &'a AstNode<'a>) -> String {
    let mut out = String::new();
    for child in node.descendants().skip(1) {
        match &child.data.borrow().value {
            NodeValue::Text(text) => out.push_str(text),
            NodeValue::Code(code) => out.push_str(&code.literal),
            NodeValue::SoftBreak | NodeValue::LineBreak => out.push(' '),
            _ => {}
        }
    }
    out
}

fn parse_front_matter(raw: &str) -> Result<BTreeMap<String, serde_yaml::Value>> {
    let body: String = raw
        .lines()
        .filter(|line| line.trim() != "---")
        .collect::<Vec<_>>()
        .join("\n");
    if body.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let value: serde_yaml::Value = serde_yaml::from_str(&body)
        .map_err(|err| EngineError::ScenarioParse(format!("invalid YAML front matter: {err}")))?;

    let mut metadata = BTreeMap::new();
    if let serde_yaml::Value::Mapping(mapping) = value {
        for (key, value) in mapping {
            let key = match key {
                serde_yaml::Value::String(key) => key,
                other => serde_yaml::to_string(&other)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            };
            metadata.insert(key, value);
        }
    }
    Ok(metadata)
}

/// `export FOO=bar` lines inside a variables block become `{"FOO": "bar"}`.
fn parse_variable_exports(block: &str) -> Vec<(String, String)> {
    let mut exports = Vec::new();
    for line in block.lines() {
        if !line.starts_with("export") {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim_start_matches("export").trim();
        if key.is_empty() {
            continue;
        }
        log::debug!("Found variable: {key}={value}");
        exports.push((key.to_string(), value.to_string()));
    }
    exports
}

/// The raw markdown between a matching level-2 heading and the next level-2
/// heading, preserving original formatting.
pub fn section_text(source: &str, section_title: &str) -> String {
    if section_title.is_empty() {
        return String::new();
    }

    let heading_pattern = format!(r"(?m)^##\s+{}\s*$", regex::escape(section_title));
    let Ok(heading_regex) = Regex::new(&heading_pattern) else {
        return String::new();
    };
    let Some(heading) = heading_regex.find(source) else {
        return String::new();
    };

    let mut content_start = heading.end();
    let bytes = source.as_bytes();
    if content_start < bytes.len() && bytes[content_start] == b'\r' {
        content_start += 1;
    }
    if content_start < bytes.len() && bytes[content_start] == b'\n' {
        content_start += 1;
    }

    static NEXT_HEADING: OnceLock<Regex> = OnceLock::new();
    let next_heading =
        NEXT_HEADING.get_or_init(|| Regex::new(r"(?m)^##\s+").expect("next heading pattern"));
    let content_end = next_heading
        .find(&source[content_start..])
        .map(|m| content_start + m.start())
        .unwrap_or(source.len());

    source[content_start..content_end].trim().to_string()
}

/// Everything above the matching level-2 heading, excluding the level-1
/// title line.
pub fn intro_text_before_section(source: &str, section_title: &str) -> String {
    if section_title.is_empty() {
        return String::new();
    }

    let text = source.replace("\r\n", "\n");
    let marker = format!("\n## {section_title}");
    let Some(index) = text.find(&marker) else {
        return String::new();
    };

    let intro = text[..index].trim();
    let mut lines: Vec<&str> = intro.split('\n').collect();
    while lines.first().is_some_and(|line| line.trim().is_empty()) {
        lines.remove(0);
    }
    if lines.first().is_some_and(|line| line.trim().starts_with('#')) {
        lines.remove(0);
        while lines.first().is_some_and(|line| line.trim().is_empty()) {
            lines.remove(0);
        }
    }
    lines.join("\n").trim().to_string()
}
