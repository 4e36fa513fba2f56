//! Environment and working-directory state persisted across invocations.
//!
//! Commands run in separate bash subprocesses, so exports and `cd` effects
//! only survive between blocks through these files. The environment file is
//! one `KEY="VALUE"` line per variable, sorted by key; the working-directory
//! file is a single absolute path with a trailing newline.

use crate::errors::EngineError;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const DEFAULT_ENV_STATE_FILE: &str = "/tmp/ie-env-vars";
pub const DEFAULT_WORKING_DIRECTORY_FILE: &str = "/tmp/working-dir";

fn valid_key_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[a-zA-Z_][a-zA-Z0-9_]*$").expect("valid key pattern"))
}

/// The baseline file sits next to the state file it snapshots.
pub fn baseline_state_file(state_file: &str) -> String {
    let state_file = if state_file.trim().is_empty() {
        DEFAULT_ENV_STATE_FILE
    } else {
        state_file
    };
    format!("{state_file}.baseline")
}

/// Convert repeated `--var KEY=VALUE` assignments into a map. Any entry
/// without `=` or with an empty key is a user error.
pub fn parse_var_assignments(assignments: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for assignment in assignments {
        let Some((key, value)) = assignment.split_once('=') else {
            return Err(EngineError::user_input(format!(
                "invalid environment variable format: {assignment}"
            ))
            .into());
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(EngineError::user_input(format!(
                "environment variable name is empty in assignment: {assignment}"
            ))
            .into());
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

/// Snapshot of the current process environment.
pub fn process_environment() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

/// Load a state file of `KEY="VALUE"` lines. Surrounding double quotes are
/// stripped from values; lines without `=` are ignored.
pub fn load_environment_state_file(path: &str) -> Result<BTreeMap<String, String>> {
    let content = read_state_file(path)?;
    let mut env = BTreeMap::new();
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .unwrap_or(value);
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

/// Write sorted, quoted `KEY="VALUE"` lines.
pub fn write_environment_state_file(path: &str, env: &BTreeMap<String, String>) -> Result<()> {
    let mut out = String::new();
    for (key, value) in env {
        out.push_str(&format!("{key}=\"{value}\"\n"));
    }
    std::fs::write(path, out)
        .map_err(|err| EngineError::State(format!("failed to write env file '{path}': {err}")))?;
    Ok(())
}

/// Drop entries whose key is not a valid shell identifier. The surviving
/// entries keep their values verbatim.
pub fn sanitize_environment(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| valid_key_regex().is_match(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Capture the provided environment into the baseline file next to
/// `state_file`.
pub fn save_environment_baseline(state_file: &str, env: &BTreeMap<String, String>) -> Result<()> {
    let baseline_path = baseline_state_file(state_file);
    write_environment_state_file(&baseline_path, &sanitize_environment(env))
}

/// Keep only the variables whose values differ from the baseline, then
/// sanitize and rewrite the state file. Afterwards the file holds only the
/// variables the document introduced or modified.
pub fn filter_environment_state_file(state_file: &str, baseline_file: &str) -> Result<()> {
    let state_file = if state_file.trim().is_empty() {
        DEFAULT_ENV_STATE_FILE
    } else {
        state_file
    };

    if !Path::new(state_file).exists() {
        return Ok(());
    }

    let current = load_environment_state_file(state_file)?;
    let baseline = if !baseline_file.trim().is_empty() && Path::new(baseline_file).exists() {
        load_environment_state_file(baseline_file)?
    } else {
        BTreeMap::new()
    };

    let filtered = filter_against_baseline(&current, &baseline);
    let filtered = sanitize_environment(&filtered);
    write_environment_state_file(state_file, &filtered)
}

fn filter_against_baseline(
    current: &BTreeMap<String, String>,
    baseline: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    current
        .iter()
        .filter(|(key, value)| baseline.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Sanitize the state file in place without consulting the baseline.
pub fn clean_environment_state_file(path: &str) -> Result<()> {
    let env = load_environment_state_file(path)?;
    write_environment_state_file(path, &sanitize_environment(&env))
}

pub fn delete_environment_state_file(path: &str) -> Result<()> {
    delete_state_file(path)
}

/// Load the persisted working directory, trimmed of surrounding whitespace.
pub fn load_working_directory(path: &str) -> Result<String> {
    let content = read_state_file(path)?;
    Ok(content.trim().to_string())
}

/// Persist a working directory with a trailing newline, matching what
/// `pwd > file` would produce.
pub fn save_working_directory(path: &str, working_dir: &str) -> Result<()> {
    if working_dir.is_empty() {
        return Err(EngineError::State("working directory is empty".to_string()).into());
    }
    let mut content = working_dir.to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }
    std::fs::write(path, content).map_err(|err| {
        EngineError::State(format!("failed to write working directory file '{path}': {err}"))
    })?;
    Ok(())
}

pub fn delete_working_directory(path: &str) -> Result<()> {
    delete_state_file(path)
}

fn read_state_file(path: &str) -> Result<String> {
    if !Path::new(path).exists() {
        return Err(EngineError::StateNotFound(PathBuf::from(path)).into());
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read state file '{path}'"))
}

fn delete_state_file(path: &str) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(EngineError::StateNotFound(PathBuf::from(path)).into())
        }
        Err(err) => {
            Err(EngineError::State(format!("failed to delete state file '{path}': {err}")).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::is_state_not_found;

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_str().unwrap().to_string()
    }

    #[test]
    fn round_trip_preserves_sanitized_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "env");

        let mut env = BTreeMap::new();
        env.insert("EV_ALPHA".to_string(), "one".to_string());
        env.insert("EV_BETA".to_string(), "two words".to_string());
        env.insert("BASH_FUNC_x%%".to_string(), "() { :; }".to_string());

        write_environment_state_file(&path, &sanitize_environment(&env)).unwrap();
        let loaded = load_environment_state_file(&path).unwrap();

        assert_eq!(loaded.get("EV_ALPHA").map(String::as_str), Some("one"));
        assert_eq!(
            loaded.get("EV_BETA").map(String::as_str),
            Some("two words")
        );
        assert!(!loaded.contains_key("BASH_FUNC_x%%"));
    }

    #[test]
    fn state_file_lines_are_sorted_and_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "env");

        let mut env = BTreeMap::new();
        env.insert("ZED".to_string(), "last".to_string());
        env.insert("ALPHA".to_string(), "first".to_string());
        write_environment_state_file(&path, &env).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "ALPHA=\"first\"\nZED=\"last\"\n");
    }

    #[test]
    fn sanitize_is_an_idempotent_filter() {
        let mut env = BTreeMap::new();
        env.insert("GOOD_KEY".to_string(), "kept".to_string());
        env.insert("1BAD".to_string(), "dropped".to_string());
        env.insert("ALSO-BAD".to_string(), "dropped".to_string());

        let once = sanitize_environment(&env);
        assert_eq!(once.len(), 1);
        assert_eq!(once.get("GOOD_KEY").map(String::as_str), Some("kept"));
        assert_eq!(sanitize_environment(&once), once);
    }

    #[test]
    fn baseline_filter_keeps_only_changed_values() {
        let dir = tempfile::tempdir().unwrap();
        let state = temp_path(&dir, "env");
        let baseline = temp_path(&dir, "env.baseline");

        let mut current = BTreeMap::new();
        current.insert("UNCHANGED".to_string(), "same".to_string());
        current.insert("CHANGED".to_string(), "new".to_string());
        current.insert("INTRODUCED".to_string(), "fresh".to_string());
        write_environment_state_file(&state, &current).unwrap();

        let mut base = BTreeMap::new();
        base.insert("UNCHANGED".to_string(), "same".to_string());
        base.insert("CHANGED".to_string(), "old".to_string());
        write_environment_state_file(&baseline, &base).unwrap();

        filter_environment_state_file(&state, &baseline).unwrap();
        let filtered = load_environment_state_file(&state).unwrap();

        assert!(!filtered.contains_key("UNCHANGED"));
        assert_eq!(filtered.get("CHANGED").map(String::as_str), Some("new"));
        assert_eq!(
            filtered.get("INTRODUCED").map(String::as_str),
            Some("fresh")
        );
    }

    #[test]
    fn loading_a_missing_file_reports_not_found() {
        let err = load_environment_state_file("/tmp/ie-state-test-does-not-exist").unwrap_err();
        assert!(is_state_not_found(&err));
    }

    #[test]
    fn working_directory_round_trips_with_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "wd");

        save_working_directory(&path, "/srv/project").unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "/srv/project\n"
        );
        assert_eq!(load_working_directory(&path).unwrap(), "/srv/project");
    }

    #[test]
    fn invalid_var_assignment_is_a_user_error() {
        let err = parse_var_assignments(&["INVALID".to_string()]).unwrap_err();
        assert!(err.to_string().contains("invalid environment variable"));
    }

    #[test]
    fn var_assignment_keeps_value_verbatim() {
        let parsed =
            parse_var_assignments(&["EV_KEY=a=b=c".to_string()]).unwrap();
        assert_eq!(parsed.get("EV_KEY").map(String::as_str), Some("a=b=c"));
    }
}
