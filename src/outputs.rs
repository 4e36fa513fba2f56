//! Output comparison for executed code blocks.
//!
//! Three comparison strategies share one entry point: an expected regular
//! expression (expanded against the environment), JSON structural similarity,
//! and Jaro-Winkler similarity for everything else.

use crate::errors::EngineError;
use crate::state;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const OUTPUT_SUMMARY_MAX_LINES: usize = 20;

fn ansi_sgr_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("\x1b\\[[0-9;]*m").expect("ansi pattern"))
}

fn env_reference_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("env reference pattern")
    })
}

/// Compare actual command output against the expectations attached to the
/// block. Returns the similarity score on success; regex matches score 0.
pub fn compare_command_outputs(
    actual_output: &str,
    expected_output: &str,
    expected_similarity: f64,
    expected_regex: Option<&str>,
    expected_language: &str,
    state_file: &str,
) -> Result<f64, EngineError> {
    let actual = normalize_output(actual_output);
    let expected = normalize_output(expected_output);

    if let Some(pattern) = expected_regex.map(str::trim).filter(|p| !p.is_empty()) {
        let (expanded, used) = expand_regex_pattern(pattern, &environment_for_regex(state_file));
        let compiled = Regex::new(&expanded).map_err(|source| EngineError::Pattern {
            pattern: expanded.clone(),
            source,
        })?;

        if !compiled.is_match(&actual) {
            let mut pattern_display = pattern.to_string();
            if let Some(details) = format_regex_env_details(&used) {
                pattern_display = format!("{pattern_display}\n{details}");
            }
            return Err(EngineError::OutputMismatch {
                score: 0.0,
                diagnostic: format!(
                    "Expected output does not match actual output.\nExpected Pattern:\n{}\nActual:\n{}",
                    pattern_display,
                    summarize_output(&actual, OUTPUT_SUMMARY_MAX_LINES)
                ),
            });
        }

        return Ok(0.0);
    }

    let score = if expected_language.eq_ignore_ascii_case("json") {
        json_similarity_score(&actual, &expected)?
    } else {
        strsim::jaro_winkler(&expected, &actual)
    };

    if expected_similarity > score {
        return Err(EngineError::OutputMismatch {
            score,
            diagnostic: format!(
                "Expected output does not match actual output.\nExpected:\n{}\nActual:\n{}\nExpected Score:{expected_similarity}\nActual Score:{score}",
                summarize_output(&expected, OUTPUT_SUMMARY_MAX_LINES),
                summarize_output(&actual, OUTPUT_SUMMARY_MAX_LINES)
            ),
        });
    }

    Ok(score)
}

/// Strip ANSI SGR sequences and normalize line endings to `\n`.
pub fn normalize_output(value: &str) -> String {
    let value = ansi_sgr_regex().replace_all(value, "");
    value.replace("\r\n", "\n").replace('\r', "\n")
}

fn json_similarity_score(actual: &str, expected: &str) -> Result<f64, EngineError> {
    let actual_value: serde_json::Value =
        serde_json::from_str(actual.trim()).map_err(|err| EngineError::OutputMismatch {
            score: 0.0,
            diagnostic: format!("actual output is not valid JSON: {err}"),
        })?;
    let expected_value: serde_json::Value =
        serde_json::from_str(expected.trim()).map_err(|err| EngineError::OutputMismatch {
            score: 0.0,
            diagnostic: format!("expected output is not valid JSON: {err}"),
        })?;
    Ok(json_similarity(&actual_value, &expected_value))
}

/// Structural similarity between two JSON values in [0, 1]. Objects average
/// over the union of keys, arrays pair elements up to the longer length, and
/// scalars contribute 1 only on equality.
fn json_similarity(a: &serde_json::Value, b: &serde_json::Value) -> f64 {
    use serde_json::Value;

    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            let keys: std::collections::BTreeSet<&String> =
                left.keys().chain(right.keys()).collect();
            if keys.is_empty() {
                return 1.0;
            }
            let total: f64 = keys
                .iter()
                .map(|key| match (left.get(*key), right.get(*key)) {
                    (Some(lv), Some(rv)) => json_similarity(lv, rv),
                    _ => 0.0,
                })
                .sum();
            total / keys.len() as f64
        }
        (Value::Array(left), Value::Array(right)) => {
            let len = left.len().max(right.len());
            if len == 0 {
                return 1.0;
            }
            let total: f64 = (0..len)
                .map(|index| match (left.get(index), right.get(index)) {
                    (Some(lv), Some(rv)) => json_similarity(lv, rv),
                    _ => 0.0,
                })
                .sum();
            total / len as f64
        }
        _ => {
            if a == b {
                1.0
            } else {
                0.0
            }
        }
    }
}

/// The environment visible to `$VAR` expansion: the process environment
/// overlaid with the persisted state file, state file winning.
fn environment_for_regex(state_file: &str) -> BTreeMap<String, String> {
    let mut replacements = state::process_environment();
    if let Ok(persisted) = state::load_environment_state_file(state_file) {
        replacements.extend(persisted);
    }
    replacements
}

/// Expand `$VAR` and `${VAR}` references; `\$` stays a literal dollar.
/// Returns the expanded pattern and the variables that were substituted.
fn expand_regex_pattern(
    pattern: &str,
    replacements: &BTreeMap<String, String>,
) -> (String, BTreeMap<String, String>) {
    const LITERAL_DOLLAR: &str = "\u{1}ie-literal-dollar\u{1}";
    let protected = pattern.replace("\\$", LITERAL_DOLLAR);

    let mut used = BTreeMap::new();
    let expanded = env_reference_regex().replace_all(&protected, |caps: &regex::Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match replacements.get(name) {
            Some(value) => {
                used.insert(name.to_string(), value.clone());
                value.clone()
            }
            None => String::new(),
        }
    });

    (expanded.replace(LITERAL_DOLLAR, "$"), used)
}

fn format_regex_env_details(used: &BTreeMap<String, String>) -> Option<String> {
    if used.is_empty() {
        return None;
    }
    let parts: Vec<String> = used
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    Some(format!("(where {})", parts.join(", ")))
}

fn summarize_output(value: &str, max_lines: usize) -> String {
    let trimmed = value.trim_end_matches('\n');
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    let lines: Vec<&str> = trimmed.split('\n').collect();
    if lines.len() <= max_lines {
        return lines.join("\n");
    }

    let mut summary: Vec<String> = lines[..max_lines].iter().map(|s| s.to_string()).collect();
    summary.push(format!("... ({} more lines)", lines.len() - max_lines));
    summary.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_STATE_FILE: &str = "/tmp/ie-outputs-test-no-state-file";

    #[test]
    fn normalization_is_idempotent() {
        let raw = "\x1b[32mgreen\x1b[0m\r\nnext\rlast";
        let once = normalize_output(raw);
        assert_eq!(once, "green\nnext\nlast");
        assert_eq!(normalize_output(&once), once);
    }

    #[test]
    fn identical_output_scores_one() {
        let score =
            compare_command_outputs("hello\n", "hello\n", 0.9, None, "text", NO_STATE_FILE)
                .unwrap();
        assert!(score > 0.999);
    }

    #[test]
    fn score_stays_within_bounds_and_gates_on_threshold() {
        let err = compare_command_outputs(
            "completely different",
            "expected words",
            0.99,
            None,
            "text",
            NO_STATE_FILE,
        )
        .unwrap_err();
        match err {
            EngineError::OutputMismatch { score, .. } => {
                assert!((0.0..=1.0).contains(&score));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_threshold_accepts_anything() {
        let score =
            compare_command_outputs("anything", "", 0.0, None, "text", NO_STATE_FILE).unwrap();
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn regex_branch_expands_process_environment() {
        std::env::set_var("IE_OUTPUTS_TEST_FOO", "World");
        let result = compare_command_outputs(
            "Hello World",
            "",
            0.0,
            Some("^Hello $IE_OUTPUTS_TEST_FOO$"),
            "text",
            NO_STATE_FILE,
        );
        assert_eq!(result.unwrap(), 0.0);

        let err = compare_command_outputs(
            "Hello there",
            "",
            0.0,
            Some("^Hello $IE_OUTPUTS_TEST_FOO$"),
            "text",
            NO_STATE_FILE,
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("IE_OUTPUTS_TEST_FOO=World"));
    }

    #[test]
    fn regex_branch_prefers_state_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("env");
        std::fs::write(&state_file, "IE_REGEX_VALUE=\"World\"\n").unwrap();

        let result = compare_command_outputs(
            "Hello World",
            "",
            0.0,
            Some("^Hello $IE_REGEX_VALUE$"),
            "text",
            state_file.to_str().unwrap(),
        );
        assert_eq!(result.unwrap(), 0.0);
    }

    #[test]
    fn escaped_dollar_is_a_literal_anchor() {
        // `\$` denotes a literal dollar sign in the matched output.
        let result = compare_command_outputs(
            "cost: $5",
            "",
            0.0,
            Some(r"cost: \$5"),
            "text",
            NO_STATE_FILE,
        );
        assert_eq!(result.unwrap(), 0.0);
    }

    #[test]
    fn invalid_pattern_is_reported_as_pattern_error() {
        let err = compare_command_outputs("x", "", 0.0, Some("(unclosed"), "text", NO_STATE_FILE)
            .unwrap_err();
        assert!(matches!(err, EngineError::Pattern { .. }));
    }

    #[test]
    fn json_branch_scores_structural_overlap() {
        let actual = r#"{"name": "rg", "location": "eastus"}"#;
        let expected = r#"{"name": "rg", "location": "westus"}"#;
        let err = compare_command_outputs(actual, expected, 0.9, None, "json", NO_STATE_FILE)
            .unwrap_err();
        match err {
            EngineError::OutputMismatch { score, .. } => {
                assert!((score - 0.5).abs() < 1e-9);
            }
            other => panic!("unexpected error: {other}"),
        }

        let score =
            compare_command_outputs(actual, actual, 0.9, None, "json", NO_STATE_FILE).unwrap();
        assert_eq!(score, 1.0);
    }

    #[test]
    fn output_summaries_are_capped() {
        let long: String = (0..40).map(|i| format!("line {i}\n")).collect();
        let summary = summarize_output(&long, 20);
        assert!(summary.contains("line 0"));
        assert!(summary.contains("... (20 more lines)"));
        assert!(!summary.contains("line 39"));
    }
}
