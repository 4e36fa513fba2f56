//! Execution environments and the deployment-status envelope.

use serde::Serialize;
use std::fmt;

/// Where the engine is running. Azure-like environments change state-file
/// cleanup and wrap machine-readable output in `ie_us`/`ie_ue` markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Environment {
    Local,
    GithubAction,
    Azure,
    Ocd,
}

impl Environment {
    pub fn is_azure_like(self) -> bool {
        matches!(self, Environment::Azure | Environment::Ocd)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::GithubAction => "github-action",
            Environment::Azure => "azure",
            Environment::Ocd => "ocd",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the deployment consumed by the status collaborator between
/// blocks.
#[derive(Debug, Clone, Serialize, Default)]
pub struct DeploymentStatus {
    pub steps: Vec<StatusStep>,
    #[serde(rename = "currentStep")]
    pub current_step: usize,
    pub status: String,
    #[serde(rename = "resourceURIs")]
    pub resource_uris: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusStep {
    pub name: String,
    #[serde(rename = "codeBlocks")]
    pub code_blocks: Vec<StatusCodeBlock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCodeBlock {
    pub command: String,
    pub description: String,
}

impl DeploymentStatus {
    pub fn new() -> Self {
        DeploymentStatus {
            status: "Executing".to_string(),
            ..DeploymentStatus::default()
        }
    }

    pub fn add_step(&mut self, name: String, code_blocks: Vec<StatusCodeBlock>) {
        self.steps.push(StatusStep { name, code_blocks });
    }

    pub fn set_error(&mut self, error: &anyhow::Error) {
        self.status = "Failed".to_string();
        self.error = Some(format!("{error:#}"));
    }

    pub fn add_resource_uri(&mut self, uri: String) {
        if !self.resource_uris.contains(&uri) {
            self.resource_uris.push(uri);
        }
    }
}

/// Emit the status envelope for Azure-like environments. Elsewhere this is a
/// no-op; the console rendering already tells the story.
pub fn report_status(status: &DeploymentStatus, environment: Environment) {
    if !environment.is_azure_like() {
        return;
    }
    match serde_json::to_string(status) {
        Ok(json) => println!("ie_us{json}ie_ue"),
        Err(err) => log::error!("Failed to serialize deployment status: {err}"),
    }
}
