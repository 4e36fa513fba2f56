//! Static inspection of a compiled scenario.
//!
//! All checks run without executing any code block; the same document yields
//! the same issue set regardless of marker or state-file contents.

use crate::markdown::{CodeBlock, Document};
use crate::scenario::{Scenario, Step, CLI_EXPORT_HEADER};
use comrak::Arena;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => f.write_str("error"),
            Severity::Warning => f.write_str("warning"),
        }
    }
}

/// A single inspection finding.
#[derive(Debug, Clone)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
}

impl Issue {
    fn error(message: String) -> Issue {
        Issue {
            severity: Severity::Error,
            message,
        }
    }

    fn warning(message: String) -> Issue {
        Issue {
            severity: Severity::Warning,
            message,
        }
    }
}

fn export_statement_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\s*export\s+([A-Za-z_][A-Za-z0-9_]*)").expect("export pattern")
    })
}

fn env_reference_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(\{)?([A-Za-z_][A-Za-z0-9_]*)").expect("env reference pattern")
    })
}

fn assignment_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)=").expect("assignment pattern"))
}

/// Shell externals a document may reference without exporting.
const ALLOWED_EXTERNAL_ENV_VARS: &[&str] = &[
    "HOME", "PATH", "PWD", "OLDPWD", "TMPDIR", "TMP", "TEMP", "SHELL", "USER", "USERNAME",
    "HOSTNAME", "RANDOM", "UID", "EUID", "GROUPS",
];

/// Run every structural check against a compiled scenario.
pub fn validate_scenario(scenario: &Scenario) -> Vec<Issue> {
    let mut issues = Vec::new();
    issues.extend(validate_code_block_descriptions(scenario));
    issues.extend(validate_language_tags(&scenario.source));
    issues.extend(validate_prerequisite_expected_outputs(scenario));
    let exports = collect_env_exports(&scenario.steps);
    issues.extend(validate_env_prefix_consistency(&exports));
    issues.extend(validate_env_usage(scenario, &exports));
    issues.extend(validate_undefined_env_references(scenario, &exports));
    issues.extend(validate_expected_similarity_ranges(scenario));
    issues
}

/// Missing-prerequisite warnings escalate to errors in inspect mode.
pub fn missing_prerequisite_issues(messages: &[String]) -> Vec<Issue> {
    messages
        .iter()
        .map(|message| Issue::error(message.clone()))
        .collect()
}

/// Split issues into (warnings, errors) message lists.
pub fn partition_issues(issues: &[Issue]) -> (Vec<String>, Vec<String>) {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    for issue in issues {
        match issue.severity {
            Severity::Warning => warnings.push(issue.message.clone()),
            Severity::Error => errors.push(issue.message.clone()),
        }
    }
    (warnings, errors)
}

fn validate_code_block_descriptions(scenario: &Scenario) -> Vec<Issue> {
    let mut issues = Vec::new();
    for step in &scenario.steps {
        for (index, block) in step.code_blocks.iter().enumerate() {
            if is_system_generated_block(block) {
                continue;
            }
            if block.description.trim().is_empty() {
                issues.push(Issue::error(format!(
                    "Step {:?} command #{} must include descriptive text before the code block.",
                    step.name,
                    index + 1
                )));
            }
        }
    }
    issues
}

/// Every fenced block in the source document needs a language tag, whether
/// or not the engine would execute it.
fn validate_language_tags(source: &str) -> Vec<Issue> {
    let arena = Arena::new();
    let doc = Document::parse(&arena, source);
    doc.untagged_fences()
        .into_iter()
        .map(|snippet| {
            Issue::error(format!(
                "Code block starting with {:?} is missing a language tag (```bash, ```azurecli, etc.).",
                truncate_snippet(&snippet)
            ))
        })
        .collect()
}

fn validate_prerequisite_expected_outputs(scenario: &Scenario) -> Vec<Issue> {
    let mut issues = Vec::new();
    for step in &scenario.steps {
        for (index, block) in step.code_blocks.iter().enumerate() {
            if !block.in_prerequisite_section || is_system_generated_block(block) {
                continue;
            }
            if code_block_contains_only_exports(block) {
                continue;
            }
            let has_literal = !block.expected_output.content.trim().is_empty();
            let has_regex = block.expected_output.expected_regex.is_some();
            if !has_literal && !has_regex {
                issues.push(Issue::error(format!(
                    "Prerequisite command {:?} #{} must include an expected_results block to verify success.",
                    step.name,
                    index + 1
                )));
            }
        }
    }
    issues
}

fn validate_expected_similarity_ranges(scenario: &Scenario) -> Vec<Issue> {
    let mut issues = Vec::new();
    for step in &scenario.steps {
        for (index, block) in step.code_blocks.iter().enumerate() {
            let similarity = block.expected_output.expected_similarity;
            if !(0.0..=1.0).contains(&similarity) {
                issues.push(Issue::warning(format!(
                    "Step {:?} command #{} declares expected_similarity {similarity:.2} which is outside the 0-1 range.",
                    step.name,
                    index + 1
                )));
            }
        }
    }
    issues
}

#[derive(Debug, Clone)]
struct EnvExport {
    name: String,
    location: String,
}

fn collect_env_exports(steps: &[Step]) -> Vec<EnvExport> {
    let mut seen = HashSet::new();
    let mut exports = Vec::new();
    for step in steps {
        for (block_index, block) in step.code_blocks.iter().enumerate() {
            if is_system_generated_block(block) {
                continue;
            }
            for (line_index, line) in block.content.split('\n').enumerate() {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                let Some(captures) = export_statement_regex().captures(line) else {
                    continue;
                };
                let name = captures[1].to_string();
                if !seen.insert(name.clone()) {
                    continue;
                }
                exports.push(EnvExport {
                    name,
                    location: format!(
                        "step {:?} block {} line {}",
                        step.name,
                        block_index + 1,
                        line_index + 1
                    ),
                });
            }
        }
    }
    exports
}

fn validate_env_prefix_consistency(exports: &[EnvExport]) -> Vec<Issue> {
    let mut issues = Vec::new();
    for export in exports {
        // HASH is a special helper variable and does not require a prefix.
        if export.name == "HASH" {
            continue;
        }
        if !has_uppercase_prefix(&export.name) {
            issues.push(Issue::error(format!(
                "Environment variable {} ({}) must use an uppercase prefix followed by '_' (e.g. PREFIX_value).",
                export.name, export.location
            )));
        }
    }
    issues
}

fn has_uppercase_prefix(name: &str) -> bool {
    match name.split_once('_') {
        Some((prefix, _)) => !prefix.is_empty() && prefix == prefix.to_uppercase(),
        None => false,
    }
}

fn validate_env_usage(scenario: &Scenario, exports: &[EnvExport]) -> Vec<Issue> {
    if exports.is_empty() {
        return Vec::new();
    }

    let mut usage: HashMap<&str, bool> = HashMap::new();
    let patterns: HashMap<&str, Regex> = exports
        .iter()
        .map(|export| {
            (
                export.name.as_str(),
                compile_env_reference_regex(&export.name),
            )
        })
        .collect();

    for step in &scenario.steps {
        for block in &step.code_blocks {
            if is_system_generated_block(block) {
                continue;
            }
            for line in block.content.split('\n') {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                let exported_name = if trimmed.starts_with("export ") {
                    export_statement_regex()
                        .captures(line)
                        .map(|captures| captures[1].to_string())
                } else {
                    None
                };
                if is_echo_like_line(trimmed) {
                    continue;
                }
                for export in exports {
                    if usage.get(export.name.as_str()).copied().unwrap_or(false) {
                        continue;
                    }
                    if exported_name.as_deref() == Some(export.name.as_str()) {
                        continue;
                    }
                    let Some(found) = patterns[export.name.as_str()].find(line) else {
                        continue;
                    };
                    if is_echo_before_match(line, found.start()) {
                        continue;
                    }
                    usage.insert(export.name.as_str(), true);
                }
            }
        }
    }

    exports
        .iter()
        .filter(|export| !usage.get(export.name.as_str()).copied().unwrap_or(false))
        .map(|export| {
            Issue::warning(format!(
                "Environment variable {} ({}) is exported but never referenced outside echo/printf statements.",
                export.name, export.location
            ))
        })
        .collect()
}

fn validate_undefined_env_references(scenario: &Scenario, exports: &[EnvExport]) -> Vec<Issue> {
    let mut defined: HashSet<String> = exports.iter().map(|export| export.name.clone()).collect();
    let mut missing: BTreeMap<String, String> = BTreeMap::new();

    for step in &scenario.steps {
        for (block_index, block) in step.code_blocks.iter().enumerate() {
            if is_system_generated_block(block) {
                continue;
            }
            for (line_index, line) in block.content.split('\n').enumerate() {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                if let Some(name) = find_assigned_variable(trimmed) {
                    defined.insert(name);
                }
                for reference in find_env_references(line) {
                    if is_lowercase_name(&reference)
                        || defined.contains(&reference)
                        || ALLOWED_EXTERNAL_ENV_VARS.contains(&reference.as_str())
                        || missing.contains_key(&reference)
                    {
                        continue;
                    }
                    missing.insert(
                        reference,
                        format!(
                            "step {:?} block {} line {}",
                            step.name,
                            block_index + 1,
                            line_index + 1
                        ),
                    );
                }
            }
        }
    }

    missing
        .into_iter()
        .map(|(name, location)| {
            Issue::error(format!(
                "Environment variable {name} ({location}) is referenced but never exported in this document."
            ))
        })
        .collect()
}

fn compile_env_reference_regex(name: &str) -> Regex {
    let escaped = regex::escape(name);
    Regex::new(&format!(r"\$(\{{{escaped}\}}|{escaped})([^A-Za-z0-9_]|$)"))
        .expect("env usage pattern")
}

fn find_env_references(line: &str) -> Vec<String> {
    env_reference_regex()
        .captures_iter(line)
        .map(|captures| captures[2].to_string())
        .collect()
}

fn find_assigned_variable(line: &str) -> Option<String> {
    assignment_regex()
        .captures(line)
        .map(|captures| captures[1].to_string())
}

fn is_lowercase_name(name: &str) -> bool {
    !name.is_empty() && name == name.to_lowercase()
}

/// True when every effective line of the block is an `export` statement;
/// such prerequisite blocks need no verification output.
fn code_block_contains_only_exports(block: &CodeBlock) -> bool {
    let mut found = false;
    for line in block.content.split('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if !trimmed.starts_with("export ") || !export_statement_regex().is_match(line) {
            return false;
        }
        found = true;
    }
    found
}

fn is_echo_like_line(line: &str) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    matches!(
        normalize_command_token(&tokens).as_deref(),
        Some("echo") | Some("printf")
    )
}

/// Skip wrapper commands so `sudo echo ...` still counts as echo.
fn normalize_command_token(tokens: &[&str]) -> Option<String> {
    for token in tokens {
        let lowered = token.to_lowercase();
        if matches!(lowered.as_str(), "sudo" | "env" | "time") {
            continue;
        }
        return Some(lowered);
    }
    None
}

fn is_echo_before_match(line: &str, match_start: usize) -> bool {
    let segment = command_segment_before_match(line, match_start);
    if segment.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = segment.split_whitespace().collect();
    matches!(
        normalize_command_token(&tokens).as_deref(),
        Some("echo") | Some("printf")
    )
}

fn command_segment_before_match(line: &str, match_start: usize) -> &str {
    if match_start == 0 {
        return "";
    }
    let prefix = &line[..match_start];
    match last_separator_index(prefix) {
        Some(cut) if cut < prefix.len() => prefix[cut..].trim(),
        _ => prefix.trim(),
    }
}

fn last_separator_index(segment: &str) -> Option<usize> {
    ["&&", "||", ";", "|"]
        .iter()
        .filter_map(|separator| {
            segment
                .rfind(separator)
                .map(|index| index + separator.len())
        })
        .max()
}

/// Engine-generated blocks are exempt from author-facing rules.
fn is_system_generated_block(block: &CodeBlock) -> bool {
    block.content.contains("ie:auto-prereq")
        || block.header.starts_with(CLI_EXPORT_HEADER.trim_end_matches('.'))
}

fn truncate_snippet(snippet: &str) -> String {
    let snippet = snippet.trim();
    if snippet.is_empty() {
        return "<empty>".to_string();
    }
    if snippet.len() > 60 {
        let mut end = 60;
        while end > 0 && !snippet.is_char_boundary(end) {
            end -= 1;
        }
        return format!("{}...", &snippet[..end]);
    }
    snippet.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::compile;
    use std::collections::BTreeMap;

    fn compile_markdown(content: &str) -> Scenario {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(&path, content).unwrap();
        compile(path.to_str().unwrap(), &["bash"], &BTreeMap::new()).unwrap()
    }

    fn messages(issues: &[Issue], severity: Severity) -> Vec<&str> {
        issues
            .iter()
            .filter(|issue| issue.severity == severity)
            .map(|issue| issue.message.as_str())
            .collect()
    }

    #[test]
    fn blocks_without_descriptions_are_errors() {
        let scenario =
            compile_markdown("# T\n\n## Step\n\n```bash\nVAR_A=1\necho done\n```\n");
        let issues = validate_scenario(&scenario);
        let errors = messages(&issues, Severity::Error);
        assert!(errors
            .iter()
            .any(|message| message.contains("descriptive text")));
    }

    #[test]
    fn untagged_fences_are_errors() {
        let scenario = compile_markdown("# T\n\n## Step\n\nRun.\n\n```\nuntagged command\n```\n\nAnd then.\n\n```bash\necho ok\n```\n");
        let issues = validate_scenario(&scenario);
        let errors = messages(&issues, Severity::Error);
        assert!(errors
            .iter()
            .any(|message| message.contains("missing a language tag")));
    }

    #[test]
    fn undefined_uppercase_references_are_errors() {
        let scenario =
            compile_markdown("# T\n\n## Step\n\nShow it.\n\n```bash\ncat $MISSING_VAR\n```\n");
        let issues = validate_scenario(&scenario);
        let errors = messages(&issues, Severity::Error);
        assert!(errors.iter().any(|message| {
            message.contains("MISSING_VAR") && message.contains("is referenced but never exported")
        }));
    }

    #[test]
    fn lowercase_and_external_references_are_fine() {
        let scenario = compile_markdown(
            "# T\n\n## Step\n\nShow it.\n\n```bash\nls $HOME $local_var\n```\n",
        );
        let issues = validate_scenario(&scenario);
        assert!(!issues
            .iter()
            .any(|issue| issue.message.contains("never exported")));
    }

    #[test]
    fn locally_assigned_variables_count_as_defined() {
        let scenario = compile_markdown(
            "# T\n\n## Step\n\nAssign then use.\n\n```bash\nRG_NAME=demo\naz group show --name $RG_NAME\n```\n",
        );
        let issues = validate_scenario(&scenario);
        assert!(!issues
            .iter()
            .any(|issue| issue.message.contains("never exported")));
    }

    #[test]
    fn exports_without_uppercase_prefix_are_errors() {
        let scenario = compile_markdown(
            "# T\n\n## Step\n\nExport them.\n\n```bash\nexport noprefix=1\nexport EV_GOOD=2\nexport HASH=3\naz use $noprefix $EV_GOOD $HASH\n```\n",
        );
        let issues = validate_scenario(&scenario);
        let errors = messages(&issues, Severity::Error);
        assert!(errors
            .iter()
            .any(|message| message.contains("noprefix") && message.contains("uppercase prefix")));
        assert!(!errors.iter().any(|message| message.contains("EV_GOOD")));
        assert!(!errors
            .iter()
            .any(|message| message.contains("HASH") && message.contains("prefix")));
    }

    #[test]
    fn exports_used_only_in_echo_are_warnings() {
        let scenario = compile_markdown(
            "# T\n\n## Step\n\nExport and echo.\n\n```bash\nexport EV_UNUSED=1\necho $EV_UNUSED\n```\n",
        );
        let issues = validate_scenario(&scenario);
        let warnings = messages(&issues, Severity::Warning);
        assert!(warnings.iter().any(|message| {
            message.contains("EV_UNUSED")
                && message.contains("never referenced outside echo/printf")
        }));
    }

    #[test]
    fn exports_used_in_real_commands_are_not_flagged() {
        let scenario = compile_markdown(
            "# T\n\n## Step\n\nExport and use.\n\n```bash\nexport EV_USED=rg\naz group show --name $EV_USED\n```\n",
        );
        let issues = validate_scenario(&scenario);
        assert!(!issues
            .iter()
            .any(|issue| issue.message.contains("EV_USED")));
    }

    #[test]
    fn prerequisite_blocks_need_expected_output() {
        let scenario = compile_markdown(
            "# T\n\n## Prerequisites\n\nCheck the install.\n\n```bash\naz version\n```\n",
        );
        let issues = validate_scenario(&scenario);
        let errors = messages(&issues, Severity::Error);
        assert!(errors
            .iter()
            .any(|message| message.contains("expected_results block")));
    }

    #[test]
    fn export_only_prerequisite_blocks_are_exempt() {
        let scenario = compile_markdown(
            "# T\n\n## Prerequisites\n\nSet a name.\n\n```bash\nexport EV_NAME=demo\n```\n\n## Step\n\nUse.\n\n```bash\naz group show --name $EV_NAME\n```\n",
        );
        let issues = validate_scenario(&scenario);
        assert!(!issues
            .iter()
            .any(|issue| issue.message.contains("expected_results block")));
    }

    #[test]
    fn out_of_range_similarity_is_a_warning() {
        let scenario = compile_markdown(
            "# T\n\n## Step\n\nRun.\n\n```bash\necho hi\n```\n\n<!-- expected_similarity=1.5 -->\n\n```text\nhi\n```\n",
        );
        let issues = validate_scenario(&scenario);
        let warnings = messages(&issues, Severity::Warning);
        assert!(warnings
            .iter()
            .any(|message| message.contains("outside the 0-1 range")));
    }

    #[test]
    fn generated_prerequisite_blocks_are_exempt_from_block_rules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("p.md"),
            "# P\n\n## Verification\n\nCheck.\n\n```bash\necho ok\n```\n\n<!-- expected_similarity=\"ok\" -->\n\n```text\nok\n```\n",
        )
        .unwrap();
        let main = dir.path().join("main.md");
        std::fs::write(
            &main,
            "# T\n\n## Prerequisites\n\n[P](p.md)\n\n## Step\n\nGo.\n\n```bash\necho go\n```\n",
        )
        .unwrap();
        let scenario = compile(main.to_str().unwrap(), &["bash"], &BTreeMap::new()).unwrap();

        let issues = validate_scenario(&scenario);
        // Banner blocks carry no description but must not be flagged.
        let errors = messages(&issues, Severity::Error);
        assert!(
            !errors
                .iter()
                .any(|message| message.contains("Prerequisites") && message.contains("descriptive text")),
            "generated blocks were flagged: {errors:?}"
        );
    }

    #[test]
    fn issues_do_not_depend_on_marker_file_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("p.md"),
            "# Purity Probe\n\n## Verification\n\nCheck.\n\n```bash\necho ok\n```\n\n<!-- expected_similarity=\"ok\" -->\n\n```text\nok\n```\n",
        )
        .unwrap();
        let main = dir.path().join("main.md");
        std::fs::write(
            &main,
            "# T\n\n## Prerequisites\n\n[P](p.md)\n\n## Step\n\nGo.\n\n```bash\necho go\n```\n",
        )
        .unwrap();

        let marker = "/tmp/prereq_purity_probe_skip";
        let _ = std::fs::remove_file(marker);
        let scenario = compile(main.to_str().unwrap(), &["bash"], &BTreeMap::new()).unwrap();
        let without_marker: Vec<String> = validate_scenario(&scenario)
            .into_iter()
            .map(|issue| issue.message)
            .collect();

        std::fs::write(marker, "Purity Probe [p.md]").unwrap();
        let scenario = compile(main.to_str().unwrap(), &["bash"], &BTreeMap::new()).unwrap();
        let with_marker: Vec<String> = validate_scenario(&scenario)
            .into_iter()
            .map(|issue| issue.message)
            .collect();
        let _ = std::fs::remove_file(marker);

        assert_eq!(without_marker, with_marker);
    }

    #[test]
    fn missing_prerequisites_become_errors() {
        let issues =
            missing_prerequisite_issues(&["Prerequisite 'x.md' not found".to_string()]);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Error);
    }

    #[test]
    fn partition_splits_by_severity() {
        let issues = vec![
            Issue::error("e".to_string()),
            Issue::warning("w".to_string()),
        ];
        let (warnings, errors) = partition_issues(&issues);
        assert_eq!(warnings, vec!["w".to_string()]);
        assert_eq!(errors, vec!["e".to_string()]);
    }
}
