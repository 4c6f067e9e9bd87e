use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};

use crate::config::PluginSettings;
use crate::plugin::Plugin;
use crate::types::CmdArgs;

pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];
const DEFAULT_CNI_VERSION: &str = "1.0.0";

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    let container_id = env::var("CNI_CONTAINERID")
        .context("CNI_CONTAINERID not found in environment")?;

    // may be empty on DEL
    let netns = env::var("CNI_NETNS").unwrap_or_default();

    let ifname = env::var("CNI_IFNAME")
        .context("CNI_IFNAME not found in environment")?;

    let path = env::var("CNI_PATH").unwrap_or_default();

    let args_str = env::var("CNI_ARGS").unwrap_or_default();
    let args = parse_cni_args(&args_str);

    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Execute the add command
pub fn cmd_add(plugin: &Plugin) -> Result<()> {
    let args = parse_args()?;
    let result = plugin.cmd_add(&args)?;
    result.print()
}

/// Execute the delete command
pub fn cmd_del(plugin: &Plugin) -> Result<()> {
    let args = parse_args()?;
    plugin.cmd_del(&args)
}

/// Execute the check command
pub fn cmd_check(plugin: &Plugin) -> Result<()> {
    let args = parse_args()?;
    plugin.cmd_check(&args)
}

#[derive(Debug, Serialize)]
struct VersionInfo<'a> {
    #[serde(rename = "cniVersion")]
    cni_version: &'a str,
    #[serde(rename = "supportedVersions")]
    supported_versions: &'a [&'a str],
}

/// Output supported CNI versions
pub fn version_json() -> String {
    let info = VersionInfo {
        cni_version: DEFAULT_CNI_VERSION,
        supported_versions: SUPPORTED_VERSIONS,
    };
    serde_json::to_string(&info).unwrap_or_default()
}

/// CNI error object printed on stdout when a command fails
#[derive(Debug, Serialize)]
pub struct CniError {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl CniError {
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self {
            cni_version: DEFAULT_CNI_VERSION.to_string(),
            code: 100,
            msg: err.to_string(),
            details: format!("{:#}", err),
        }
    }

    pub fn print(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<()> {
    let cmd = env::var("CNI_COMMAND")
        .context("CNI_COMMAND not found in environment")?;

    if cmd == "VERSION" {
        println!("{}", version_json());
        return Ok(());
    }

    let plugin = Plugin::from_settings(&PluginSettings::from_env());
    match cmd.as_str() {
        "ADD" => cmd_add(&plugin),
        "DEL" => cmd_del(&plugin),
        "CHECK" => cmd_check(&plugin),
        _ => anyhow::bail!("Unknown CNI command: {}", cmd),
    }
}
