//! Prerequisite document injection and marker-file plumbing.
//!
//! Referenced prerequisite documents are expanded into a prefix of generated
//! blocks: a validation banner, the prerequisite's `Verification` blocks, a
//! decision banner, and its body blocks gated on a marker file. The gating is
//! expressed as generated shell so a converted script behaves identically
//! outside the engine. Each generated block carries a `# ie:auto-prereq-*`
//! sentinel comment that the runtime parses back out.

use crate::markdown::{CodeBlock, Document};
use crate::scenario::{is_remote_path, resolve_markdown_source};
use anyhow::Result;
use comrak::Arena;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

pub const PREREQUISITES_HEADER: &str = "Prerequisites";
const VERIFICATION_HEADER: &str = "Verification";

fn sentinel_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^#\s*ie:auto-prereq-([a-z-]+)\s+(.*)$").expect("sentinel pattern")
    })
}

fn sentinel_kv_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"([a-zA-Z0-9_-]+)="([^"]*)""#).expect("sentinel kv pattern"))
}

fn slug_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("[^a-z0-9]+").expect("slug pattern"))
}

/// Kind of engine-generated prerequisite block, from the sentinel comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrereqBlockKind {
    Banner,
    Verification,
    Body,
}

impl PrereqBlockKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "banner" => Some(PrereqBlockKind::Banner),
            "verification" => Some(PrereqBlockKind::Verification),
            "body" => Some(PrereqBlockKind::Body),
            _ => None,
        }
    }
}

/// Parse the sentinel comment on the first line of a block, if present.
pub fn parse_sentinel(content: &str) -> Option<(PrereqBlockKind, BTreeMap<String, String>)> {
    let first_line = content.lines().next()?.trim();
    let captures = sentinel_regex().captures(first_line)?;
    let kind = PrereqBlockKind::from_tag(captures.get(1)?.as_str())?;

    let mut metadata = BTreeMap::new();
    for kv in sentinel_kv_regex().captures_iter(captures.get(2)?.as_str()) {
        metadata.insert(kv[1].to_string(), kv[2].to_string());
    }
    Some((kind, metadata))
}

/// Remove the sentinel comment line so bash never sees the annotation.
pub fn strip_sentinel(content: &str) -> String {
    if parse_sentinel(content).is_none() {
        return content.to_string();
    }
    match content.split_once('\n') {
        Some((_, rest)) => rest.to_string(),
        None => String::new(),
    }
}

/// Marker file path for a prerequisite title.
pub fn marker_path(title: &str) -> String {
    let slug = slug_regex()
        .replace_all(&title.to_lowercase(), "_")
        .to_string();
    format!("/tmp/prereq_{slug}_skip")
}

/// Persist the marker that signals verification passed on some prior run.
pub fn write_marker(marker_path: &str, display: &str) -> Result<()> {
    if marker_path.trim().is_empty() {
        return Ok(());
    }
    if let Some(dir) = Path::new(marker_path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    std::fs::write(marker_path, display)?;
    Ok(())
}

/// Remove prior verification state so it cannot leak into the next attempt.
pub fn remove_marker(marker_path: &str) -> Result<()> {
    if marker_path.trim().is_empty() {
        return Ok(());
    }
    match std::fs::remove_file(marker_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Collector for missing/unloadable prerequisite warnings. The inspector
/// converts drained entries into errors; the runtime logs them as warnings.
/// Draining de-duplicates, sorts, and resets.
#[derive(Debug, Default)]
pub struct MissingPrereqs {
    messages: Vec<String>,
}

impl MissingPrereqs {
    pub fn register(&mut self, message: String) {
        log::debug!("Recording missing prerequisite: {message}");
        self.messages.push(message);
    }

    pub fn drain(&mut self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut unique: Vec<String> = std::mem::take(&mut self.messages)
            .into_iter()
            .filter(|message| seen.insert(message.clone()))
            .collect();
        unique.sort();
        unique
    }
}

/// Walks the prerequisite graph depth-first, splicing each referenced
/// document's execution blocks into the plan. A seen-set keyed on the
/// resolved URL makes cyclic graphs terminate; every document contributes its
/// blocks at most once.
pub struct Injector<'a> {
    allowed_languages: &'a [&'a str],
    intro_text: String,
    prerequisite_section_text: String,
    pub properties: BTreeMap<String, serde_yaml::Value>,
    pub environment: BTreeMap<String, String>,
    pub missing: MissingPrereqs,
    seen: HashSet<String>,
    section_text_used: bool,
}

impl<'a> Injector<'a> {
    pub fn new(
        allowed_languages: &'a [&'a str],
        intro_text: String,
        prerequisite_section_text: String,
        properties: BTreeMap<String, serde_yaml::Value>,
        environment: BTreeMap<String, String>,
    ) -> Self {
        Injector {
            allowed_languages,
            intro_text,
            prerequisite_section_text,
            properties,
            environment,
            missing: MissingPrereqs::default(),
            seen: HashSet::new(),
            section_text_used: false,
        }
    }

    /// Tear down the injector, handing back the merged metadata and the
    /// warning collector.
    pub fn into_parts(
        self,
    ) -> (
        BTreeMap<String, serde_yaml::Value>,
        BTreeMap<String, String>,
        MissingPrereqs,
    ) {
        (self.properties, self.environment, self.missing)
    }

    pub fn inject(
        &mut self,
        mut blocks: Vec<CodeBlock>,
        doc: &Document,
        path: &str,
    ) -> Vec<CodeBlock> {
        let urls = doc.prerequisite_urls();
        for raw_url in urls {
            blocks = self.process_prerequisite(blocks, &raw_url, path);
        }
        blocks
    }

    fn process_prerequisite(
        &mut self,
        blocks: Vec<CodeBlock>,
        raw_url: &str,
        parent_path: &str,
    ) -> Vec<CodeBlock> {
        log::info!("Preparing to execute prerequisite: {raw_url}");
        let resolved = resolve_url(raw_url, parent_path);

        if !self.seen.insert(resolved.clone()) {
            log::info!("Skipping already-processed prerequisite: {resolved}");
            return blocks;
        }

        if !is_remote_path(&resolved) && !Path::new(&resolved).exists() {
            self.missing.register(format!(
                "Prerequisite '{resolved}' not found (continuing without it)"
            ));
            return blocks;
        }

        let source = match resolve_markdown_source(&resolved) {
            Ok(source) => source,
            Err(err) => {
                self.missing.register(format!(
                    "Prerequisite '{resolved}' could not be loaded: {err:#} (continuing without it)"
                ));
                return blocks;
            }
        };

        let arena = Arena::new();
        let doc = Document::parse(&arena, &source);

        let title = doc
            .scenario_title()
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| file_base_name(&resolved));
        let display = format!("{title} [{}]", file_base_name(&resolved));
        log::info!("Executing Prerequisite: {display}");

        self.merge_prerequisite_metadata(&doc);

        // Prerequisites of the prerequisite come first in the plan.
        let blocks = self.inject(blocks, &doc, &resolved);

        let prereq_blocks = match doc.code_blocks(self.allowed_languages, &resolved) {
            Ok(blocks) => blocks,
            Err(err) => {
                self.missing.register(format!(
                    "Prerequisite '{resolved}' could not be loaded: {err:#} (continuing without it)"
                ));
                return blocks;
            }
        };
        let (verification_blocks, body_blocks) = partition_prerequisite_blocks(prereq_blocks);

        let (before, after) = split_scenario_blocks(blocks);
        let after = strip_text_from_first_description(after, &self.intro_text.clone());
        let after = strip_text_from_first_description(after, &self.prerequisite_section_text.clone());

        let marker = marker_path(&title);
        let generated = self.build_prerequisite_execution_blocks(
            &marker,
            &display,
            &resolved,
            verification_blocks,
            body_blocks,
        );

        let mut updated = before;
        updated.extend(generated);
        updated.extend(after);
        updated
    }

    fn merge_prerequisite_metadata(&mut self, doc: &Document) {
        match doc.yaml_metadata() {
            Ok(properties) => self.properties.extend(properties),
            Err(err) => log::warn!("Skipping prerequisite front matter: {err:#}"),
        }
        self.environment.extend(doc.scenario_variables());
    }

    fn build_prerequisite_execution_blocks(
        &mut self,
        marker: &str,
        display: &str,
        source: &str,
        verification_blocks: Vec<CodeBlock>,
        body_blocks: Vec<CodeBlock>,
    ) -> Vec<CodeBlock> {
        let has_verification = !verification_blocks.is_empty();
        let mut generated =
            vec![self.build_validation_banner(marker, display, has_verification)];
        generated.extend(build_verification_blocks(
            marker,
            display,
            source,
            verification_blocks,
        ));
        generated.push(build_decision_banner(marker, display, has_verification));
        generated.extend(build_body_blocks(
            marker,
            display,
            source,
            has_verification,
            body_blocks,
        ));
        generated
    }

    fn build_validation_banner(
        &mut self,
        marker: &str,
        display: &str,
        has_verification: bool,
    ) -> CodeBlock {
        let mut content =
            format!("# ie:auto-prereq-banner marker=\"{marker}\" display=\"{display}\"\n");
        if !has_verification {
            // No verification means no fresh marker evaluation; stale state
            // must be cleared before the body runs.
            content.push_str(&format!("rm -f \"{marker}\"\n"));
        }
        content.push_str(&format!("echo \"Validating Prerequisite: {display}\"\n"));

        let mut banner = generated_block(content);
        if !self.section_text_used && !self.prerequisite_section_text.trim().is_empty() {
            banner.description = self.prerequisite_section_text.trim().to_string();
            self.section_text_used = true;
        }
        banner
    }
}

fn build_verification_blocks(
    marker: &str,
    display: &str,
    source: &str,
    verification_blocks: Vec<CodeBlock>,
) -> Vec<CodeBlock> {
    let total = verification_blocks.len();
    verification_blocks
        .into_iter()
        .enumerate()
        .map(|(index, mut block)| {
            let metadata = format!(
                "# ie:auto-prereq-verification marker=\"{marker}\" display=\"{display}\" source=\"{source}\" heading=\"{}\" index=\"{}\" total=\"{total}\"\n",
                block.header,
                index + 1,
            );
            block.content = format!("{metadata}{}", block.content);
            fold_header_into_description(&mut block);
            block.section = PREREQUISITES_HEADER.to_string();
            block
        })
        .collect()
}

fn build_decision_banner(marker: &str, display: &str, has_verification: bool) -> CodeBlock {
    let sentinel = format!("# ie:auto-prereq-banner marker=\"{marker}\" display=\"{display}\"\n");
    let content = if has_verification {
        format!(
            "{sentinel}if [ -f \"{marker}\" ]; then echo \"Skipping Prerequisite: {display} (verification passed)\"; else echo \"Executing Prerequisite: {display}\"; fi\n"
        )
    } else {
        format!("{sentinel}echo \"Executing Prerequisite: {display}\"\n")
    };
    generated_block(content)
}

fn build_body_blocks(
    marker: &str,
    display: &str,
    source: &str,
    has_verification: bool,
    body_blocks: Vec<CodeBlock>,
) -> Vec<CodeBlock> {
    body_blocks
        .into_iter()
        .map(|mut block| {
            let metadata = format!(
                "# ie:auto-prereq-body marker=\"{marker}\" display=\"{display}\" source=\"{source}\" heading=\"{}\"\n",
                block.header,
            );
            block.content = if has_verification {
                format!(
                    "{metadata}if [ ! -f \"{marker}\" ]; then\n{}\nfi\n",
                    block.content
                )
            } else {
                format!("{metadata}{}", block.content)
            };
            fold_header_into_description(&mut block);
            block.section = PREREQUISITES_HEADER.to_string();
            block
        })
        .collect()
}

fn generated_block(content: String) -> CodeBlock {
    CodeBlock {
        language: "bash".to_string(),
        content,
        header: PREREQUISITES_HEADER.to_string(),
        section: PREREQUISITES_HEADER.to_string(),
        in_prerequisite_section: true,
        ..CodeBlock::default()
    }
}

/// The original heading survives the section rewrite by moving into the
/// description.
fn fold_header_into_description(block: &mut CodeBlock) {
    let original_header = std::mem::replace(&mut block.header, PREREQUISITES_HEADER.to_string());
    if original_header.is_empty() || original_header.eq_ignore_ascii_case(PREREQUISITES_HEADER) {
        return;
    }
    if block.description.trim().is_empty() {
        block.description = original_header;
    } else {
        block.description = format!("{original_header}\n\n{}", block.description);
    }
}

fn partition_prerequisite_blocks(blocks: Vec<CodeBlock>) -> (Vec<CodeBlock>, Vec<CodeBlock>) {
    blocks
        .into_iter()
        .partition(|block| block.header.eq_ignore_ascii_case(VERIFICATION_HEADER))
}

/// Blocks already in the document's own Prerequisites section keep their
/// position ahead of injected prerequisite blocks.
fn split_scenario_blocks(blocks: Vec<CodeBlock>) -> (Vec<CodeBlock>, Vec<CodeBlock>) {
    blocks
        .into_iter()
        .partition(|block| block.header == PREREQUISITES_HEADER)
}

/// The banner owns the intro and section narrative; elide it from the first
/// block description that still carries it.
fn strip_text_from_first_description(mut blocks: Vec<CodeBlock>, text: &str) -> Vec<CodeBlock> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return blocks;
    }

    for block in blocks.iter_mut() {
        if block.description.trim().is_empty() {
            continue;
        }
        let replaced = block.description.replacen(text, "", 1);
        let replaced = if replaced == block.description {
            block.description.replacen(trimmed, "", 1)
        } else {
            replaced
        };
        if replaced != block.description {
            block.description = replaced.trim().to_string();
            break;
        }
    }
    blocks
}

fn resolve_url(raw_url: &str, parent_path: &str) -> String {
    if is_remote_path(raw_url) {
        return raw_url.to_string();
    }
    let parent_dir = Path::new(parent_path).parent().unwrap_or(Path::new(""));
    parent_dir.join(raw_url).to_string_lossy().into_owned()
}

fn file_base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
