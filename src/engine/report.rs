//! JSON report for test runs.

use super::execution::RunOutcome;
use crate::scenario::Scenario;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct TestReport {
    pub scenario: String,
    pub properties: BTreeMap<String, serde_yaml::Value>,
    pub environment: BTreeMap<String, String>,
    pub success: bool,
    pub steps: Vec<ReportStep>,
}

#[derive(Debug, Serialize)]
pub struct ReportStep {
    pub name: String,
    pub blocks: Vec<ReportBlock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportBlock {
    pub command: String,
    pub stdout: String,
    #[serde(rename = "similarityScore")]
    pub similarity_score: f64,
    #[serde(rename = "expectedOutput", skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(rename = "expectedRegex", skip_serializing_if = "Option::is_none")]
    pub expected_regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "elapsedMilliseconds")]
    pub elapsed_ms: u128,
}

pub(super) fn build_report(
    scenario: &Scenario,
    outcome: &RunOutcome,
    success: bool,
) -> TestReport {
    let mut steps: Vec<ReportStep> = Vec::new();
    for (step_name, block) in &outcome.block_results {
        match steps.iter_mut().find(|step| &step.name == step_name) {
            Some(step) => step.blocks.push(block.clone()),
            None => steps.push(ReportStep {
                name: step_name.clone(),
                blocks: vec![block.clone()],
            }),
        }
    }

    TestReport {
        scenario: scenario.name.clone(),
        properties: scenario.properties.clone(),
        environment: scenario.environment.clone(),
        success,
        steps,
    }
}

pub fn write_report(path: &str, report: &TestReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    std::fs::write(path, json).with_context(|| format!("failed to write report to '{path}'"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_groups_blocks_by_step() {
        let scenario = Scenario {
            name: "Demo".to_string(),
            intro_text: String::new(),
            steps: Vec::new(),
            properties: BTreeMap::new(),
            environment: BTreeMap::new(),
            source: String::new(),
            missing_prerequisites: Vec::new(),
        };

        let block = ReportBlock {
            command: "echo hi".to_string(),
            stdout: "hi\n".to_string(),
            similarity_score: 1.0,
            expected_output: None,
            expected_regex: None,
            error: None,
            elapsed_ms: 3,
        };
        let mut outcome = RunOutcome::default();
        outcome
            .block_results
            .push(("Step".to_string(), block.clone()));
        outcome.block_results.push(("Step".to_string(), block));

        let report = build_report(&scenario, &outcome, true);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].blocks.len(), 2);
        assert!(report.success);

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"similarityScore\""));
        assert!(json.contains("\"elapsedMilliseconds\""));
    }
}
