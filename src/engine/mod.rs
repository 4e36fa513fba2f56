//! Execution runtime: drives a compiled scenario against the shell, renders
//! progress, and reports structured status.

mod execution;
mod report;
mod summary;

use crate::environments::Environment;
use crate::scenario::Scenario;
use crate::state;
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Caller-supplied flags bound into one configuration for the runtime.
#[derive(Debug, Clone)]
pub struct EngineConfiguration {
    pub verbose: bool,
    pub do_not_delete: bool,
    pub stream_output: bool,
    pub subscription: String,
    pub correlation_id: String,
    pub working_directory: String,
    pub environment: Environment,
    pub render_values: bool,
    pub report_file: Option<String>,
}

pub struct Engine {
    configuration: EngineConfiguration,
}

impl Engine {
    pub fn new(configuration: EngineConfiguration) -> Engine {
        Engine { configuration }
    }

    /// Run every step of the scenario, rendering narrative and output.
    pub fn execute_scenario(&self, scenario: Scenario) -> Result<()> {
        self.run_scenario(scenario, false)
    }

    /// Run the scenario asserting expected outputs, optionally writing a JSON
    /// report of the run.
    pub fn test_scenario(&self, scenario: Scenario) -> Result<()> {
        self.run_scenario(scenario, true)
    }

    /// Interactive mode streams output live; otherwise it is the execute
    /// state machine.
    pub fn interact_with_scenario(&self, scenario: Scenario) -> Result<()> {
        self.run_scenario(scenario, false)
    }

    fn run_scenario(&self, mut scenario: Scenario, write_report_file: bool) -> Result<()> {
        println!("{}", crate::ui::scenario_title(&scenario.name));
        if !scenario.intro_text.is_empty() {
            println!();
            println!("{}", crate::ui::verbose(&scenario.intro_text));
        }
        println!();

        let restore_dir = self.enter_working_directory()?;

        let mut outcome = execution::RunOutcome::default();
        let result =
            execution::execute_and_render_steps(&self.configuration, &scenario, &mut outcome);

        if let Some(original) = restore_dir {
            if let Err(err) = std::env::set_current_dir(&original) {
                log::warn!(
                    "Failed to restore working directory '{}': {err}",
                    original.display()
                );
            }
        }

        // The warning buffer drains exactly once per invocation.
        for warning in std::mem::take(&mut scenario.missing_prerequisites) {
            log::warn!("{warning}");
        }

        if write_report_file {
            if let Some(report_file) = &self.configuration.report_file {
                let report = report::build_report(&scenario, &outcome, result.is_ok());
                report::write_report(report_file, &report)
                    .with_context(|| format!("error writing report to '{report_file}'"))?;
            }
        }

        match result {
            Ok(()) => {
                print!("{}", outcome.timings.render());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Switch into the configured working directory for the duration of the
    /// run, persisting it so the first block resumes there.
    fn enter_working_directory(&self) -> Result<Option<PathBuf>> {
        let target = self.configuration.working_directory.trim();
        if target.is_empty() || target == "." {
            return Ok(None);
        }

        let original = std::env::current_dir().context("failed to read current directory")?;
        std::env::set_current_dir(target)
            .with_context(|| format!("failed to enter working directory '{target}'"))?;

        let absolute = std::env::current_dir().context("failed to read working directory")?;
        state::save_working_directory(
            state::DEFAULT_WORKING_DIRECTORY_FILE,
            &absolute.to_string_lossy(),
        )?;
        Ok(Some(original))
    }
}
