//! The per-block execution loop.

use super::report::ReportBlock;
use super::summary::ExecutionTimings;
use super::EngineConfiguration;
use crate::azure;
use crate::environments::{self, DeploymentStatus, StatusCodeBlock};
use crate::markdown::CodeBlock;
use crate::outputs;
use crate::prereq::{self, PrereqBlockKind};
use crate::scenario::{Scenario, Step};
use crate::shell::{self, CommandConfig, CommandOutput};
use crate::state;
use crate::ui;
use anyhow::Result;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{mpsc, OnceLock};
use std::time::Instant;

/// Everything observed during a run: per-block records for the report and
/// the timing ledger for the summary.
#[derive(Default)]
pub(super) struct RunOutcome {
    pub block_results: Vec<(String, ReportBlock)>,
    pub timings: ExecutionTimings,
}

fn multiline_quoted_string_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("(?s)\"[^\"]*\n[^\"]*\"").expect("quoted string pattern"))
}

pub(super) fn execute_and_render_steps(
    configuration: &EngineConfiguration,
    scenario: &Scenario,
    outcome: &mut RunOutcome,
) -> Result<()> {
    let mut resource_group_name = String::new();
    let mut status = DeploymentStatus::new();

    if let Err(err) = azure::set_subscription(&configuration.subscription) {
        log::error!("Invalid Config: Failed to set subscription: {err:#}");
        status.set_error(&err);
        environments::report_status(&status, configuration.environment);
        return Err(err);
    }

    if !configuration.correlation_id.trim().is_empty() {
        // Azure CLI child processes stamp their telemetry with this agent.
        std::env::set_var(
            "AZURE_HTTP_USER_AGENT",
            format!("innovation-engine-{}", configuration.correlation_id.trim()),
        );
    }

    let steps_to_execute =
        filter_deletion_commands(&scenario.steps, configuration.do_not_delete);

    // Snapshot the process environment so persisted state can be reduced to
    // document-introduced variables.
    state::save_environment_baseline(
        state::DEFAULT_ENV_STATE_FILE,
        &state::process_environment(),
    )?;

    for (step_number, step) in steps_to_execute.iter().enumerate() {
        let status_blocks = step
            .code_blocks
            .iter()
            .map(|block| StatusCodeBlock {
                command: block.content.clone(),
                description: block.description.clone(),
            })
            .collect();
        status.add_step(format!("{}. {}", step_number + 1, step.name), status_blocks);
    }
    environments::report_status(&status, configuration.environment);

    let last_step = steps_to_execute.len().saturating_sub(1);
    for (step_number, step) in steps_to_execute.iter().enumerate() {
        println!(
            "{}",
            ui::step_title(&format!("{}. {}\n", step_number + 1, step.name))
        );
        status.current_step = step_number + 1;

        for block in &step.code_blocks {
            let sentinel = prereq::parse_sentinel(&block.content);
            let kind = sentinel.as_ref().map(|(kind, _)| *kind);
            let metadata = sentinel
                .map(|(_, metadata)| metadata)
                .unwrap_or_default();
            let marker = metadata.get("marker").cloned().unwrap_or_default();
            let is_banner = kind == Some(PrereqBlockKind::Banner);
            let is_verification = kind == Some(PrereqBlockKind::Verification);
            let is_body = kind == Some(PrereqBlockKind::Body);

            let command_content = if kind.is_some() {
                prereq::strip_sentinel(&block.content)
            } else {
                block.content.clone()
            };

            // A present marker means verification already passed; the body
            // is skipped without any output.
            if is_body && !marker.is_empty() && Path::new(&marker).exists() {
                continue;
            }

            // Verification always re-evaluates from a clean slate.
            if is_verification && !marker.is_empty() {
                let _ = prereq::remove_marker(&marker);
            }

            if !block.description.trim().is_empty() {
                for line in block.description.split('\n') {
                    println!("    {}", ui::verbose(line));
                }
                println!();
            }

            let display_content = if is_banner {
                String::new()
            } else if configuration.render_values {
                match render_command(&command_content) {
                    Ok(rendered) => rendered.stdout,
                    Err(err) => {
                        log::error!("Failed to render command: {err:#}");
                        status.set_error(&err);
                        attach_resource_uris(&mut status, &resource_group_name, configuration);
                        environments::report_status(&status, configuration.environment);
                        return Err(err);
                    }
                }
            } else {
                command_content.clone()
            };

            if configuration.verbose && !is_banner {
                let working_dir = state::load_working_directory(
                    state::DEFAULT_WORKING_DIRECTORY_FILE,
                )
                .ok()
                .filter(|dir| !dir.is_empty())
                .or_else(|| {
                    std::env::current_dir()
                        .ok()
                        .map(|dir| dir.to_string_lossy().into_owned())
                })
                .unwrap_or_default();
                println!(
                    "    {}",
                    ui::verbose(&format!("Working directory: {working_dir}"))
                );
                log::debug!("Working directory before command: {working_dir}");
            }

            if !display_content.is_empty() {
                print!("    {}", ui::indent_multiline_command(&display_content, 4));
                if !display_content.ends_with('\n') {
                    println!();
                }
            }

            let interactive = is_interactive_command(&command_content);
            log::info!("Executing command (interactive={interactive}): {command_content}");

            // For a one-click flow ending in ssh, the terminal is handed
            // over, so the final status must go out first.
            if interactive && step_number == last_step {
                status.status = "Succeeded".to_string();
                attach_resource_uris(&mut status, &resource_group_name, configuration);
                environments::report_status(&status, configuration.environment);
            }

            let started = Instant::now();
            let execution_result = if interactive {
                shell::execute_bash_command(
                    &command_content,
                    &CommandConfig {
                        env: scenario.environment.clone(),
                        inherit_environment: true,
                        interactive: true,
                        write_to_history: false,
                        stream_output: false,
                    },
                )
            } else if configuration.stream_output {
                shell::execute_bash_command(
                    &command_content,
                    &CommandConfig {
                        env: scenario.environment.clone(),
                        inherit_environment: true,
                        interactive: false,
                        write_to_history: true,
                        stream_output: true,
                    },
                )
            } else {
                run_with_spinner(&command_content, scenario.environment.clone())
            };
            let elapsed = started.elapsed();

            if let Some(kind) = kind {
                outcome.timings.record_prereq_block(
                    metadata.get("display").map(String::as_str).unwrap_or(""),
                    metadata.get("source").map(String::as_str).unwrap_or(""),
                    metadata.get("heading").map(String::as_str).unwrap_or(""),
                    kind,
                    elapsed,
                );
            } else {
                outcome.timings.record_step_block(&step.name, elapsed);
            }

            match execution_result {
                Ok(output) => {
                    log::info!("Command output to stdout:\n{}", output.stdout);
                    log::info!("Command output to stderr:\n{}", output.stderr);

                    let comparison = outputs::compare_command_outputs(
                        &output.stdout,
                        &block.expected_output.content,
                        block.expected_output.expected_similarity,
                        block.expected_output.expected_regex.as_deref(),
                        &block.expected_output.language,
                        state::DEFAULT_ENV_STATE_FILE,
                    );

                    match comparison {
                        Ok(score) => {
                            // Streaming already rendered the output live.
                            if !configuration.stream_output
                                && !interactive
                                && !output.stdout.trim().is_empty()
                            {
                                println!("{}", ui::verbose(output.stdout.trim_end()));
                            }

                            if is_verification && !marker.is_empty() {
                                let display =
                                    metadata.get("display").map(String::as_str).unwrap_or("");
                                if let Err(err) = prereq::write_marker(&marker, display) {
                                    log::warn!("Failed to write marker {marker}: {err:#}");
                                }
                            }

                            if resource_group_name.is_empty()
                                && azure::is_az_command(&command_content)
                            {
                                if let Some(group) =
                                    azure::find_resource_group_name(&output.stdout)
                                {
                                    log::info!("Found resource group: {group}");
                                    status.add_resource_uri(azure::build_resource_group_id(
                                        &configuration.subscription,
                                        &group,
                                    ));
                                    resource_group_name = group;
                                }
                            }

                            if !is_banner {
                                outcome.block_results.push((
                                    step.name.clone(),
                                    block_record(block, &command_content, &output, score, None, elapsed),
                                ));
                            }

                            if step_number != last_step {
                                environments::report_status(&status, configuration.environment);
                            }
                        }
                        Err(mismatch) => {
                            render_expected_actual(
                                &block.expected_output.content,
                                &output.stdout,
                                block.expected_output.expected_similarity,
                                block.expected_output.expected_regex.as_deref(),
                            );
                            let err = anyhow::Error::new(mismatch);
                            outcome.block_results.push((
                                step.name.clone(),
                                block_record(
                                    block,
                                    &command_content,
                                    &output,
                                    0.0,
                                    Some(format!("{err:#}")),
                                    elapsed,
                                ),
                            ));

                            if is_verification {
                                // Verification failure is recoverable: the
                                // marker stays absent and the body runs.
                                continue;
                            }

                            log::error!("Error comparing command outputs: {err:#}");
                            status.set_error(&err);
                            attach_resource_uris(&mut status, &resource_group_name, configuration);
                            environments::report_status(&status, configuration.environment);
                            return Err(err);
                        }
                    }
                }
                Err(err) => {
                    println!("  {}", ui::error("\u{2717}"));
                    println!("  {}", ui::error_message(&format!("{err:#}")));
                    log::error!("Error executing command: {err:#}");

                    outcome.block_results.push((
                        step.name.clone(),
                        block_record(
                            block,
                            &command_content,
                            &CommandOutput::default(),
                            0.0,
                            Some(format!("{err:#}")),
                            elapsed,
                        ),
                    ));

                    if is_verification {
                        let display = metadata.get("display").map(String::as_str).unwrap_or("");
                        log::warn!("Verification command execution failed for {display}");
                        continue;
                    }

                    status.set_error(&err);
                    attach_resource_uris(&mut status, &resource_group_name, configuration);
                    environments::report_status(&status, configuration.environment);
                    return Err(err);
                }
            }
        }
    }

    status.status = "Succeeded".to_string();
    attach_resource_uris(&mut status, &resource_group_name, configuration);
    environments::report_status(&status, configuration.environment);

    clean_state_files(configuration);
    Ok(())
}

/// With `--do-not-delete`, blocks that would tear down resource groups are
/// dropped from the plan.
fn filter_deletion_commands(steps: &[Step], preserve_resources: bool) -> Vec<Step> {
    if !preserve_resources {
        return steps.to_vec();
    }
    steps
        .iter()
        .map(|step| Step {
            name: step.name.clone(),
            code_blocks: step
                .code_blocks
                .iter()
                .filter(|block| !azure::is_az_group_delete(&block.content))
                .cloned()
                .collect(),
        })
        .collect()
}

fn clean_state_files(configuration: &EngineConfiguration) {
    use crate::errors::is_state_not_found;

    if configuration.environment.is_azure_like() {
        log::info!(
            "Cleaning environment variable file located at {}",
            state::DEFAULT_ENV_STATE_FILE
        );
        if let Err(err) = state::clean_environment_state_file(state::DEFAULT_ENV_STATE_FILE) {
            if !is_state_not_found(&err) {
                log::error!("Error cleaning environment variables: {err:#}");
            }
        }
        log::info!(
            "Cleaning working directory file located at {}",
            state::DEFAULT_WORKING_DIRECTORY_FILE
        );
        if let Err(err) = state::delete_working_directory(state::DEFAULT_WORKING_DIRECTORY_FILE) {
            if !is_state_not_found(&err) {
                log::error!("Error cleaning working directory: {err:#}");
            }
        }
    } else {
        let _ = state::delete_environment_state_file(state::DEFAULT_ENV_STATE_FILE);
        let _ = state::delete_working_directory(state::DEFAULT_WORKING_DIRECTORY_FILE);
        let _ = state::delete_environment_state_file(&state::baseline_state_file(
            state::DEFAULT_ENV_STATE_FILE,
        ));
    }
}

fn attach_resource_uris(
    status: &mut DeploymentStatus,
    resource_group_name: &str,
    configuration: &EngineConfiguration,
) {
    if !resource_group_name.is_empty() {
        status.add_resource_uri(azure::build_resource_group_id(
            &configuration.subscription,
            resource_group_name,
        ));
    }
}

/// Expand variable references in the command for display by piping it
/// through `echo -e`. Line continuations are escaped unless they sit inside
/// a quoted multiline string.
fn render_command(content: &str) -> Result<CommandOutput> {
    let escaped = if multiline_quoted_string_regex().is_match(content) {
        content.to_string()
    } else {
        content.replace("\\\n", "\\\\\n")
    };
    shell::execute_bash_command(
        &format!("echo -e \"{escaped}\""),
        &CommandConfig {
            inherit_environment: true,
            ..CommandConfig::default()
        },
    )
}

/// Commands that take over the terminal (ssh) inherit stdio directly.
fn is_interactive_command(content: &str) -> bool {
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Ok(tokens) = shell_words::split(trimmed) else {
            return false;
        };
        for token in tokens {
            match token.as_str() {
                "sudo" | "env" | "time" => continue,
                first => return first == "ssh",
            }
        }
        return false;
    }
    false
}

/// Run the command on a worker thread while the calling thread renders the
/// spinner. The two rendezvous on the result channel, so the spinner never
/// races with output decoding.
fn run_with_spinner(
    command: &str,
    env: BTreeMap<String, String>,
) -> Result<CommandOutput> {
    let (sender, receiver) = mpsc::channel();
    let command = command.to_string();
    let worker = std::thread::spawn(move || {
        let config = CommandConfig {
            env,
            inherit_environment: true,
            interactive: false,
            write_to_history: true,
            stream_output: false,
        };
        let result = shell::execute_bash_command(&command, &config);
        let _ = sender.send(result);
    });

    ui::hide_cursor();
    let mut frame = 0usize;
    let result = loop {
        match receiver.recv_timeout(ui::SPINNER_REFRESH) {
            Ok(result) => break result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                frame = (frame + 1) % ui::SPINNER_FRAMES.len();
                print!(
                    "\r  {}",
                    ui::spinner(&ui::SPINNER_FRAMES[frame].to_string())
                );
                let _ = std::io::stdout().flush();
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                break Err(anyhow::anyhow!("command worker terminated unexpectedly"));
            }
        }
    };
    let _ = worker.join();
    print!("\r    \n");
    ui::show_cursor();
    result
}

fn render_expected_actual(
    expected: &str,
    actual: &str,
    expected_similarity: f64,
    expected_regex: Option<&str>,
) {
    println!(
        "  {}",
        ui::error_message("Expected output does not match:")
    );
    match expected_regex {
        Some(pattern) => {
            println!("    Expected RE match:");
            render_indented_block(pattern, "      ");
        }
        None => {
            println!(
                "    Expected similarity level of {} against:",
                format_similarity(expected_similarity)
            );
            render_indented_block(expected.trim_end_matches('\n'), "      ");
        }
    }
    println!("    Actual:");
    render_indented_block(actual.trim_end_matches('\n'), "      ");
}

fn render_indented_block(content: &str, indent: &str) {
    if content.trim().is_empty() {
        println!("{indent}<empty>");
        return;
    }
    for line in content.split('\n') {
        if line.trim().is_empty() {
            println!("{indent}");
        } else {
            println!("{indent}{}", ui::verbose(line));
        }
    }
}

fn format_similarity(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let formatted = format!("{value}");
    if formatted.contains('.') {
        formatted
    } else {
        format!("{value:.1}")
    }
}

fn block_record(
    block: &CodeBlock,
    command: &str,
    output: &CommandOutput,
    score: f64,
    error: Option<String>,
    elapsed: std::time::Duration,
) -> ReportBlock {
    let expected = &block.expected_output;
    ReportBlock {
        command: command.to_string(),
        stdout: output.stdout.clone(),
        similarity_score: score,
        expected_output: (!expected.content.is_empty()).then(|| expected.content.clone()),
        expected_regex: expected.expected_regex.clone(),
        error,
        elapsed_ms: elapsed.as_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_commands_are_interactive() {
        assert!(is_interactive_command("ssh user@host\n"));
        assert!(is_interactive_command("sudo ssh user@host\n"));
        assert!(is_interactive_command("# connect\nssh -i key.pem user@host\n"));
        assert!(!is_interactive_command("echo ssh\n"));
        assert!(!is_interactive_command("az vm list\n"));
    }

    #[test]
    fn deletion_filter_drops_only_group_delete_blocks() {
        let steps = vec![Step {
            name: "Cleanup".to_string(),
            code_blocks: vec![
                CodeBlock {
                    content: "az group delete --name rg --yes\n".to_string(),
                    ..CodeBlock::default()
                },
                CodeBlock {
                    content: "echo done\n".to_string(),
                    ..CodeBlock::default()
                },
            ],
        }];

        let filtered = filter_deletion_commands(&steps, true);
        assert_eq!(filtered[0].code_blocks.len(), 1);
        assert_eq!(filtered[0].code_blocks[0].content, "echo done\n");

        let unfiltered = filter_deletion_commands(&steps, false);
        assert_eq!(unfiltered[0].code_blocks.len(), 2);
    }

    #[test]
    fn similarity_formatting_matches_the_console_style() {
        assert_eq!(format_similarity(0.0), "0");
        assert_eq!(format_similarity(0.8), "0.8");
        assert_eq!(format_similarity(1.0), "1.0");
    }
}
