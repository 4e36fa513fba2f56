//! Bash subprocess adapter.
//!
//! Every block runs in a fresh `bash -c` child, so continuity between blocks
//! comes from the persisted state files: the adapter overlays the saved
//! environment onto the child and, after state-writing commands, captures the
//! child's final environment and working directory back into the files.

use crate::errors::EngineError;
use crate::state;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};

/// Configuration for one command execution.
#[derive(Debug, Clone, Default)]
pub struct CommandConfig {
    pub env: BTreeMap<String, String>,
    pub inherit_environment: bool,
    /// Wire the child's stdio straight to the terminal (ssh and friends).
    pub interactive: bool,
    /// Persist the post-command environment and working directory so the
    /// next invocation resumes where this one left off.
    pub write_to_history: bool,
    /// Tee captured output to the terminal as the child produces it.
    pub stream_output: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run `command` through bash. Returns the captured output on exit 0 and a
/// `CommandFailed` error otherwise.
pub fn execute_bash_command(command: &str, config: &CommandConfig) -> Result<CommandOutput> {
    let script = if config.write_to_history {
        wrap_with_state_capture(command)
    } else {
        command.to_string()
    };

    let mut child_command = Command::new("bash");
    child_command.arg("-c").arg(&script);

    if !config.inherit_environment {
        child_command.env_clear();
    }
    // Exports from earlier blocks reach this child through the state file.
    if let Ok(persisted) = state::load_environment_state_file(state::DEFAULT_ENV_STATE_FILE) {
        child_command.envs(persisted);
    }
    child_command.envs(&config.env);

    if let Ok(working_dir) = state::load_working_directory(state::DEFAULT_WORKING_DIRECTORY_FILE) {
        if !working_dir.is_empty() && Path::new(&working_dir).is_dir() {
            child_command.current_dir(&working_dir);
        }
    }

    let output = if config.interactive {
        run_interactive(&mut child_command)?
    } else if config.stream_output {
        run_streaming(&mut child_command)?
    } else {
        run_captured(&mut child_command)?
    };

    if config.write_to_history {
        if let Err(err) = filter_persisted_state() {
            log::warn!("Failed to filter persisted environment state: {err:#}");
        }
    }

    if output.exit_code != 0 {
        return Err(EngineError::CommandFailed {
            exit_code: output.exit_code,
            stderr: output.stderr.trim_end().to_string(),
        }
        .into());
    }
    Ok(output)
}

/// Append state capture so `env` and `pwd` after the user's command land in
/// the state files without disturbing its exit code.
fn wrap_with_state_capture(command: &str) -> String {
    format!(
        "{command}\nIE_LAST_EXIT=$?\nenv > {env_file}\npwd > {wd_file}\nexit $IE_LAST_EXIT",
        env_file = state::DEFAULT_ENV_STATE_FILE,
        wd_file = state::DEFAULT_WORKING_DIRECTORY_FILE,
    )
}

/// Raw `env` output contains the whole inherited environment; reduce the
/// state file to document-introduced variables with valid identifiers.
fn filter_persisted_state() -> Result<()> {
    state::filter_environment_state_file(
        state::DEFAULT_ENV_STATE_FILE,
        &state::baseline_state_file(state::DEFAULT_ENV_STATE_FILE),
    )
}

fn run_interactive(command: &mut Command) -> Result<CommandOutput> {
    let status = command
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("failed to spawn bash")?;

    Ok(CommandOutput {
        stdout: String::new(),
        stderr: String::new(),
        exit_code: exit_code_of(&status),
    })
}

fn run_captured(command: &mut Command) -> Result<CommandOutput> {
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to spawn bash")?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: exit_code_of(&output.status),
    })
}

fn run_streaming(command: &mut Command) -> Result<CommandOutput> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn bash")?;

    let stdout_pipe = child.stdout.take().context("child stdout missing")?;
    let stderr_pipe = child.stderr.take().context("child stderr missing")?;

    let stdout_task = std::thread::spawn(move || tee(stdout_pipe, std::io::stdout()));
    let stderr_task = std::thread::spawn(move || tee(stderr_pipe, std::io::stderr()));

    let status = child.wait().context("failed to wait for bash")?;
    let stdout = stdout_task.join().unwrap_or_default();
    let stderr = stderr_task.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code: exit_code_of(&status),
    })
}

/// Forward the child's stream to the terminal line by line while keeping a
/// copy for comparison.
fn tee(source: impl Read, mut sink: impl Write) -> String {
    let mut captured = String::new();
    let mut reader = BufReader::new(source);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let _ = sink.write_all(line.as_bytes());
                let _ = sink.flush();
                captured.push_str(&line);
            }
        }
    }
    captured
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    // A signal-terminated child has no code; report it like a failure.
    status.code().unwrap_or(-1)
}
