use std::path::PathBuf;
use thiserror::Error;

/// Error kinds the engine distinguishes programmatically. Contextual,
/// human-readable prefixes are layered on top with `anyhow::Context`; the
/// lowest cause stays downcastable so callers can branch on the kind.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The caller supplied unusable input (bad --var, unknown feature, ...).
    #[error("{0}")]
    UserInput(String),

    /// The markdown document or its annotations could not be parsed.
    #[error("{0}")]
    ScenarioParse(String),

    /// A shell command exited with a non-zero status.
    #[error("command exited with status {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    /// Actual output did not satisfy the expected output of a block.
    #[error("{diagnostic}")]
    OutputMismatch { score: f64, diagnostic: String },

    /// An expected-output regex failed to compile after variable expansion.
    #[error("cannot compile regex {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },

    /// A required state file is absent.
    #[error("state file '{0}' does not exist")]
    StateNotFound(PathBuf),

    /// Reading or writing persisted state failed.
    #[error("{0}")]
    State(String),

    /// Environment-level configuration (e.g. subscription setup) failed.
    #[error("{0}")]
    Config(String),
}

impl EngineError {
    pub fn user_input(message: impl Into<String>) -> Self {
        EngineError::UserInput(message.into())
    }
}

/// True when the lowest cause of `err` is a missing state file. Callers treat
/// this as "nothing to clear" rather than a failure.
pub fn is_state_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::StateNotFound(_))
    )
}
