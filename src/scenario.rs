//! Scenario model and the markdown-to-plan compiler.

use crate::errors::EngineError;
use crate::markdown::{self, CodeBlock, Document};
use crate::prereq::Injector;
use anyhow::{Context, Result};
use comrak::Arena;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Header of the synthetic block that exports CLI-provided variables no
/// document block exports itself.
pub const CLI_EXPORT_HEADER: &str =
    "Exporting variables defined via the CLI and not in the markdown file.";

/// An ordered group of code blocks sharing a header.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub code_blocks: Vec<CodeBlock>,
}

/// The compiled representation of one markdown tutorial.
#[derive(Debug)]
pub struct Scenario {
    pub name: String,
    pub intro_text: String,
    pub steps: Vec<Step>,
    pub properties: BTreeMap<String, serde_yaml::Value>,
    pub environment: BTreeMap<String, String>,
    pub source: String,
    /// Missing/unloadable prerequisite warnings, drained from the injector.
    pub missing_prerequisites: Vec<String>,
}

impl Scenario {
    /// Flatten the scenario into a self-contained bash script: environment
    /// exports first, then each step's blocks prefixed by a step comment.
    pub fn to_shell_script(&self) -> String {
        let mut script = String::new();
        for (key, value) in &self.environment {
            script.push_str(&format!("export {key}=\"{value}\"\n"));
        }
        for step in &self.steps {
            script.push_str(&format!("# {}\n", step.name));
            for block in &step.code_blocks {
                script.push_str(&format!("{}\n", block.content));
            }
        }
        script
    }
}

pub fn is_remote_path(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

/// Read a markdown document from disk or over HTTP.
pub(crate) fn resolve_markdown_source(path: &str) -> Result<String> {
    if is_remote_path(path) {
        let response = ureq::get(path)
            .call()
            .map_err(|err| EngineError::ScenarioParse(format!("failed to fetch '{path}': {err}")))?;
        return response
            .into_string()
            .with_context(|| format!("failed to read response body from '{path}'"));
    }

    if !Path::new(path).exists() {
        return Err(
            EngineError::UserInput(format!("markdown file '{path}' does not exist")).into(),
        );
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read '{path}'"))
}

/// Compile a markdown document into a scenario: parse, bind variables,
/// inject prerequisites, apply CLI overrides, and group blocks into steps.
pub fn compile(
    path: &str,
    allowed_languages: &[&str],
    env_overrides: &BTreeMap<String, String>,
) -> Result<Scenario> {
    let source = resolve_markdown_source(path)?;

    let mut environment = BTreeMap::new();
    if let Some(ini_path) = sibling_ini_path(path) {
        if Path::new(&ini_path).exists() {
            log::info!("INI file '{ini_path}' exists, loading...");
            environment = parse_ini_file(&ini_path)?;
        } else {
            log::info!("INI file '{ini_path}' does not exist, skipping...");
        }
    }

    let arena = Arena::new();
    let doc = Document::parse(&arena, &source);

    let properties = doc.yaml_metadata()?;
    environment.extend(doc.scenario_variables());

    let code_blocks = doc.code_blocks(allowed_languages, path)?;
    log::debug!("Found {} code blocks", code_blocks.len());

    let prereq_heading = detect_prerequisite_heading(&source);
    let prerequisite_section_text = markdown::section_text(&source, prereq_heading);
    let intro_text = markdown::intro_text_before_section(&source, prereq_heading);

    let mut injector = Injector::new(
        allowed_languages,
        intro_text.clone(),
        prerequisite_section_text,
        properties,
        environment,
    );
    let code_blocks = injector.inject(code_blocks, &doc, path);

    let (properties, mut environment, mut missing) = injector.into_parts();

    let code_blocks = apply_env_overrides(code_blocks, env_overrides, &mut environment);

    let steps = group_code_blocks_into_steps(code_blocks);

    let title = match doc.scenario_title() {
        Some(title) => title,
        None => {
            log::warn!(
                "Failed to extract a scenario title from '{path}'. Using the file name instead"
            );
            Path::new(path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string())
        }
    };
    log::info!("Successfully built out the scenario: {title}");

    Ok(Scenario {
        name: title,
        intro_text: intro_text.trim().to_string(),
        steps,
        properties,
        environment,
        source,
        missing_prerequisites: missing.drain(),
    })
}

/// Rewrite `export KEY=...` lines for overridden keys; keys no block exports
/// accumulate into a synthetic leading block.
fn apply_env_overrides(
    mut blocks: Vec<CodeBlock>,
    env_overrides: &BTreeMap<String, String>,
    environment: &mut BTreeMap<String, String>,
) -> Vec<CodeBlock> {
    let mut vars_to_export = env_overrides.clone();

    for (key, value) in env_overrides {
        environment.insert(key.clone(), value.clone());
        log::debug!("Attempting to override {key} with {value}");

        let pattern = export_variable_regex(key);
        for block in blocks.iter_mut() {
            if !pattern.is_match(&block.content) {
                continue;
            }
            vars_to_export.remove(key);
            block.content = pattern
                .replace_all(&block.content, |caps: &regex::Captures| {
                    format!("{}{value}", &caps[1])
                })
                .into_owned();
        }
    }

    if !vars_to_export.is_empty() {
        log::debug!(
            "Found {} variables to add to the scenario as a step.",
            vars_to_export.len()
        );
        let mut content = String::new();
        for (key, value) in &vars_to_export {
            content.push_str(&format!("export {key}=\"{value}\"\n"));
        }
        let export_block = CodeBlock {
            language: "bash".to_string(),
            content,
            header: CLI_EXPORT_HEADER.to_string(),
            ..CodeBlock::default()
        };
        blocks.insert(0, export_block);
    }

    blocks
}

fn export_variable_regex(key: &str) -> Regex {
    Regex::new(&format!(
        r"(?m)^(\s*export\s+{}\s*=\s*)(.*)$",
        regex::escape(key)
    ))
    .expect("export override pattern")
}

/// Group blocks into steps by header, preserving the insertion order of each
/// header's first occurrence.
fn group_code_blocks_into_steps(blocks: Vec<CodeBlock>) -> Vec<Step> {
    let mut steps: Vec<Step> = Vec::new();
    let mut header_index: HashMap<String, usize> = HashMap::new();

    for block in blocks {
        match header_index.get(&block.header) {
            Some(&index) => steps[index].code_blocks.push(block),
            None => {
                header_index.insert(block.header.clone(), steps.len());
                steps.push(Step {
                    name: block.header.clone(),
                    code_blocks: vec![block],
                });
            }
        }
    }
    steps
}

fn detect_prerequisite_heading(source: &str) -> &'static str {
    for title in ["Prerequisites", "Prerequisite"] {
        let pattern = format!(r"(?m)^##\s+{title}\s*$");
        if Regex::new(&pattern)
            .map(|re| re.is_match(source))
            .unwrap_or(false)
        {
            return title;
        }
    }
    "Prerequisites"
}

fn sibling_ini_path(path: &str) -> Option<String> {
    if is_remote_path(path) {
        return None;
    }
    let path = Path::new(path);
    let stem = path.file_stem()?.to_string_lossy().into_owned();
    Some(
        path.with_file_name(format!("{stem}.ini"))
            .to_string_lossy()
            .into_owned(),
    )
}

/// Flat `KEY=VALUE` configuration next to the document. Section headers and
/// comment lines are skipped; surrounding quotes on values are stripped.
fn parse_ini_file(path: &str) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read INI file '{path}'"))?;

    let mut values = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('#')
            || trimmed.starts_with(';')
            || trimmed.starts_with('[')
        {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .unwrap_or(value);
        values.insert(key.trim().to_string(), value.to_string());
    }

    for (key, value) in &values {
        log::debug!("Setting {key}={value}");
    }
    Ok(values)
}
