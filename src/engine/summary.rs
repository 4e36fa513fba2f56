//! Per-block timing attribution and the end-of-run execution summary.

use crate::prereq::PrereqBlockKind;
use std::time::Duration;

/// Timing ledger for one run. Prerequisite blocks are attributed to their
/// originating document and heading; everything else to its step.
#[derive(Debug, Default)]
pub(super) struct ExecutionTimings {
    prereqs: Vec<PrereqTiming>,
    steps: Vec<StepTiming>,
}

#[derive(Debug)]
struct PrereqTiming {
    display: String,
    source: String,
    verification: Vec<(String, Duration)>,
    execution: Vec<(String, Duration)>,
}

#[derive(Debug)]
struct StepTiming {
    name: String,
    total: Duration,
}

impl ExecutionTimings {
    pub(super) fn record_step_block(&mut self, step_name: &str, elapsed: Duration) {
        match self.steps.iter_mut().find(|step| step.name == step_name) {
            Some(step) => step.total += elapsed,
            None => self.steps.push(StepTiming {
                name: step_name.to_string(),
                total: elapsed,
            }),
        }
    }

    pub(super) fn record_prereq_block(
        &mut self,
        display: &str,
        source: &str,
        heading: &str,
        kind: PrereqBlockKind,
        elapsed: Duration,
    ) {
        let entry = match self
            .prereqs
            .iter_mut()
            .find(|prereq| prereq.display == display)
        {
            Some(entry) => entry,
            None => {
                self.prereqs.push(PrereqTiming {
                    display: display.to_string(),
                    source: source.to_string(),
                    verification: Vec::new(),
                    execution: Vec::new(),
                });
                self.prereqs.last_mut().expect("just pushed")
            }
        };

        let bucket = match kind {
            PrereqBlockKind::Verification => &mut entry.verification,
            // Banner output is part of executing the prerequisite.
            PrereqBlockKind::Banner | PrereqBlockKind::Body => &mut entry.execution,
        };
        bucket.push((heading.to_string(), elapsed));
    }

    pub(super) fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("Execution summary:\n");

        if !self.prereqs.is_empty() {
            out.push_str("  Prerequisites:\n");
            for prereq in &self.prereqs {
                out.push_str(&format!(
                    "    {} (from {}):\n",
                    prereq.display, prereq.source
                ));
                render_bucket(&mut out, "verification", &prereq.verification);
                render_bucket(&mut out, "execution", &prereq.execution);
            }
        }

        if !self.steps.is_empty() {
            out.push_str("  Steps:\n");
            for (index, step) in self.steps.iter().enumerate() {
                out.push_str(&format!(
                    "    {}. {}: {}\n",
                    index + 1,
                    step.name,
                    format_duration(step.total)
                ));
            }
        }

        out.push_str(&format!("Total: {}\n", format_duration(self.total())));
        out
    }

    fn total(&self) -> Duration {
        let prereq_total: Duration = self
            .prereqs
            .iter()
            .flat_map(|p| p.verification.iter().chain(p.execution.iter()))
            .map(|(_, elapsed)| *elapsed)
            .sum();
        let step_total: Duration = self.steps.iter().map(|step| step.total).sum();
        prereq_total + step_total
    }
}

fn render_bucket(out: &mut String, label: &str, entries: &[(String, Duration)]) {
    if entries.is_empty() {
        return;
    }
    out.push_str(&format!("      {label}:\n"));
    for (heading, elapsed) in entries {
        let heading = if heading.is_empty() { "(banner)" } else { heading };
        out.push_str(&format!(
            "        {heading}: {}\n",
            format_duration(*elapsed)
        ));
    }
}

fn format_duration(duration: Duration) -> String {
    format!("{:.2}s", duration.as_secs_f64())
}
