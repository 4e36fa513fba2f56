//! Command drivers: bind CLI options, compile the scenario, and hand it to
//! the engine, inspector, or converters.

use crate::cli::{ClearEnvArgs, EnvConfigArgs, ExecutionArgs, GlobalArgs, TestArgs, ToBashArgs};
use crate::engine::{Engine, EngineConfiguration};
use crate::environments::Environment;
use crate::errors::{is_state_not_found, EngineError};
use crate::scenario::{self, Scenario};
use crate::state;
use crate::ui;
use crate::validation;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Languages whose fenced blocks are executable.
pub const EXECUTION_LANGUAGES: &[&str] =
    &["bash", "azurecli", "azurecli-interactive", "terraform"];
/// Inspect additionally accepts blocks meant only for linting.
pub const INSPECT_LANGUAGES: &[&str] = &["bash", "azurecli", "azurecli-inspect", "terraform"];

struct ExecutionOptions {
    markdown_path: String,
    verbose: bool,
    do_not_delete: bool,
    stream_output: bool,
    subscription: String,
    correlation_id: String,
    working_directory: String,
    environment: Environment,
    render_values: bool,
    env_overrides: BTreeMap<String, String>,
    report_file: Option<String>,
}

fn bind_execution_options(
    args: &ExecutionArgs,
    global: &GlobalArgs,
    report_file: Option<String>,
) -> Result<ExecutionOptions> {
    let env_overrides =
        state::parse_var_assignments(&args.vars).context("invalid --var assignment")?;
    let render_values = should_render_values(&global.features)?;

    Ok(ExecutionOptions {
        markdown_path: args.markdown_file.clone(),
        verbose: args.verbose,
        do_not_delete: args.do_not_delete,
        stream_output: args.stream_output,
        subscription: args.subscription.clone(),
        correlation_id: args.correlation_id.clone(),
        working_directory: args.working_directory.clone(),
        environment: global.environment,
        render_values,
        env_overrides,
        report_file,
    })
}

/// Only `render-values` is a recognized feature; anything else is a user
/// error.
fn should_render_values(features: &[String]) -> Result<bool> {
    let mut render_values = false;
    for feature in features {
        match feature.as_str() {
            "render-values" => render_values = true,
            other => {
                return Err(EngineError::user_input(format!("invalid feature: {other}")).into())
            }
        }
    }
    Ok(render_values)
}

fn engine_configuration(options: &ExecutionOptions) -> EngineConfiguration {
    EngineConfiguration {
        verbose: options.verbose,
        do_not_delete: options.do_not_delete,
        stream_output: options.stream_output,
        subscription: options.subscription.clone(),
        correlation_id: options.correlation_id.clone(),
        working_directory: options.working_directory.clone(),
        environment: options.environment,
        render_values: options.render_values,
        report_file: options.report_file.clone(),
    }
}

fn compile_scenario(options: &ExecutionOptions, languages: &[&str]) -> Result<Scenario> {
    scenario::compile(&options.markdown_path, languages, &options.env_overrides)
        .context("error creating scenario")
}

/// Return to the directory the CLI was invoked from before parsing, and
/// overwrite any stale working-directory state so the first command executes
/// relative to the invocation directory, not a previous run.
fn reset_invocation_directory(invocation_directory: Option<&Path>) {
    let Some(directory) = invocation_directory else {
        return;
    };
    if let Err(err) = std::env::set_current_dir(directory) {
        log::warn!(
            "Failed to change to invocation directory '{}': {err}",
            directory.display()
        );
        return;
    }
    log::debug!(
        "Changed to original invocation directory: {}",
        directory.display()
    );
    if let Err(err) = state::save_working_directory(
        state::DEFAULT_WORKING_DIRECTORY_FILE,
        &directory.to_string_lossy(),
    ) {
        log::warn!("Failed to persist invocation working directory: {err:#}");
    }
}

pub fn execute(
    args: &ExecutionArgs,
    global: &GlobalArgs,
    invocation_directory: Option<&Path>,
) -> Result<()> {
    reset_invocation_directory(invocation_directory);
    let options = bind_execution_options(args, global, None)?;
    let scenario = compile_scenario(&options, EXECUTION_LANGUAGES)?;
    Engine::new(engine_configuration(&options))
        .execute_scenario(scenario)
        .context("error executing scenario")
}

pub fn test(args: &TestArgs, global: &GlobalArgs) -> Result<()> {
    let options = bind_execution_options(&args.execution, global, args.report.clone())?;
    let scenario = compile_scenario(&options, EXECUTION_LANGUAGES)?;
    Engine::new(engine_configuration(&options))
        .test_scenario(scenario)
        .context("scenario did not finish successfully")
}

pub fn interactive(
    args: &ExecutionArgs,
    global: &GlobalArgs,
    invocation_directory: Option<&Path>,
) -> Result<()> {
    reset_invocation_directory(invocation_directory);
    let mut options = bind_execution_options(args, global, None)?;
    // Interactive mode always streams.
    options.stream_output = true;
    let scenario = compile_scenario(&options, EXECUTION_LANGUAGES)?;
    Engine::new(engine_configuration(&options))
        .interact_with_scenario(scenario)
        .context("error executing scenario")
}

pub fn inspect(args: &ExecutionArgs, global: &GlobalArgs) -> Result<()> {
    let options = bind_execution_options(args, global, None)?;
    let mut scenario = compile_scenario(&options, INSPECT_LANGUAGES)?;

    let mut issues = validation::validate_scenario(&scenario);
    let missing = std::mem::take(&mut scenario.missing_prerequisites);
    issues.extend(validation::missing_prerequisite_issues(&missing));

    let (warnings, errors) = validation::partition_issues(&issues);

    if !errors.is_empty() {
        if !warnings.is_empty() {
            eprintln!(
                "{}",
                ui::warning(&format!(
                    "Warning: validation warnings detected ({}); see details below.",
                    warnings.len()
                ))
            );
            for warning in &warnings {
                eprintln!("{}", ui::warning(&format!("- {warning}")));
            }
        }
        for error in &errors {
            eprintln!("{}", ui::error_message(&format!("- {error}")));
        }
        let plural = if errors.len() == 1 { "" } else { "s" };
        anyhow::bail!(
            "document failed inspection checks ({} validation error{plural})",
            errors.len()
        );
    }

    if !warnings.is_empty() {
        eprintln!(
            "{}",
            ui::warning(&format!(
                "Warning: validation warnings detected ({}); see details below.",
                warnings.len()
            ))
        );
    }

    println!("{}", ui::scenario_title(&scenario.name));
    for (step_number, step) in scenario.steps.iter().enumerate() {
        println!(
            "{}",
            ui::step_title(&format!("  {}. {}\n", step_number + 1, step.name))
        );
        for (block_number, block) in step.code_blocks.iter().enumerate() {
            println!(
                "{}",
                ui::verbose(&format!(
                    "    {}.{} {}",
                    step_number + 1,
                    block_number + 1,
                    block.description
                ))
            );
            println!(
                "      {}",
                ui::indent_multiline_command(block.content.trim_end(), 6)
            );
        }
    }

    if !warnings.is_empty() {
        eprintln!();
        eprintln!("{}", ui::warning("Validation warning details:"));
        for warning in &warnings {
            eprintln!("{}", ui::warning(&format!("- {warning}")));
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct AzureScript {
    script: String,
}

pub fn to_bash(args: &ToBashArgs, global: &GlobalArgs) -> Result<()> {
    let env_overrides =
        state::parse_var_assignments(&args.vars).context("invalid --var assignment")?;
    let scenario = scenario::compile(&args.markdown_file, EXECUTION_LANGUAGES, &env_overrides)
        .context("error creating scenario")?;

    // Inside cloud shell the script travels to the portal in a JSON envelope.
    if global.environment.is_azure_like() {
        let script = AzureScript {
            script: scenario.to_shell_script(),
        };
        let json = serde_json::to_string(&script).context("error converting to json")?;
        println!("ie_us{json}ie_ue");
    } else {
        print!("{}", scenario.to_shell_script());
    }
    Ok(())
}

pub fn env_config(args: &EnvConfigArgs) -> Result<()> {
    let env = state::load_environment_state_file(&args.state_file)
        .context("error loading environment state")?;
    let sanitized = state::sanitize_environment(&env);

    let exports = build_export_lines(&sanitized, &args.prefix);
    if exports.is_empty() {
        println!("# No persisted environment variables matched the requested filters.");
        return Ok(());
    }
    for line in exports {
        println!("{line}");
    }
    Ok(())
}

fn build_export_lines(values: &BTreeMap<String, String>, prefix: &str) -> Vec<String> {
    values
        .iter()
        .filter(|(key, _)| prefix.is_empty() || key.starts_with(prefix))
        .map(|(key, value)| format!("export {key}={value:?}"))
        .collect()
}

pub fn clear_env(args: &ClearEnvArgs) -> Result<()> {
    let clear_working_dir = args.all || args.working_dir;

    if !args.force {
        print!("This will clear the stored environment state");
        if clear_working_dir {
            print!(" and working directory state");
        }
        print!(". Continue? (y/N): ");
        std::io::stdout().flush().ok();

        let mut response = String::new();
        std::io::stdin()
            .read_line(&mut response)
            .context("failed to read confirmation")?;
        if !matches!(response.trim(), "y" | "Y" | "yes") {
            println!("Operation cancelled.");
            return Ok(());
        }
    }

    match state::delete_environment_state_file(state::DEFAULT_ENV_STATE_FILE) {
        Ok(()) => println!("Environment variables cleared successfully."),
        Err(err) if is_state_not_found(&err) => {
            println!("Environment variables state file was already clear.")
        }
        Err(err) => return Err(err).context("error clearing environment variables"),
    }

    if clear_working_dir {
        match state::delete_working_directory(state::DEFAULT_WORKING_DIRECTORY_FILE) {
            Ok(()) => println!("Working directory state cleared successfully."),
            Err(err) if is_state_not_found(&err) => {
                println!("Working directory state file was already clear.")
            }
            Err(err) => return Err(err).context("error clearing working directory state"),
        }
    }

    log::info!("Environment state cleared successfully");
    Ok(())
}
