//! Azure CLI helpers: subscription setup, resource-group discovery, and the
//! command patterns the runtime keys off.

use crate::errors::EngineError;
use crate::shell::{self, CommandConfig};
use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

fn az_command_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?m)^\s*az\s+").expect("az command pattern"))
}

fn az_group_delete_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"az\s+group\s+delete").expect("az group delete pattern"))
}

fn resource_group_json_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#""resourceGroup"\s*:\s*"([^"]+)""#).expect("resource group json pattern")
    })
}

fn resource_group_uri_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"/resourceGroups/([A-Za-z0-9._()-]+)").expect("resource group uri pattern")
    })
}

pub fn is_az_command(content: &str) -> bool {
    az_command_regex().is_match(content)
}

pub fn is_az_group_delete(content: &str) -> bool {
    az_group_delete_regex().is_match(content)
}

/// Point the Azure CLI at the requested subscription. An empty subscription
/// keeps the CLI default.
pub fn set_subscription(subscription: &str) -> Result<()> {
    if subscription.trim().is_empty() {
        return Ok(());
    }

    let command = format!("az account set --subscription \"{subscription}\"");
    let config = CommandConfig {
        inherit_environment: true,
        ..CommandConfig::default()
    };
    shell::execute_bash_command(&command, &config).map_err(|err| {
        anyhow::Error::new(EngineError::Config(format!(
            "failed to set subscription '{subscription}': {err:#}"
        )))
    })?;
    Ok(())
}

/// Pull a resource-group name out of Azure CLI output, preferring the JSON
/// field over a resource URI segment.
pub fn find_resource_group_name(output: &str) -> Option<String> {
    if let Some(captures) = resource_group_json_regex().captures(output) {
        return Some(captures[1].to_string());
    }
    resource_group_uri_regex()
        .captures(output)
        .map(|captures| captures[1].to_string())
}

pub fn build_resource_group_id(subscription: &str, resource_group: &str) -> String {
    format!("/subscriptions/{subscription}/resourceGroups/{resource_group}")
}
