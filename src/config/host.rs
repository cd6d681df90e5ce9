//! Virtualization host configuration
//!
//! Controls launching the host shell and rewriting loopback targets to the
//! host's dynamic address.

use serde::{Deserialize, Serialize};

/// Default program used both to launch the host and to query its address
fn default_program() -> String {
    "wsl".to_string()
}

/// Default discovery arguments (`wsl -- hostname -I`)
fn default_discovery_args() -> Vec<String> {
    vec!["--".to_string(), "hostname".to_string(), "-I".to_string()]
}

/// Virtualization host settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Launch the host at startup
    #[serde(default)]
    pub start: bool,

    /// Launch arguments, whitespace separated
    #[serde(default)]
    pub args: String,

    /// Show the host console window (Windows only)
    #[serde(default)]
    pub show_window: bool,

    /// Replace `127.0.0.1` targets with the host's discovered address
    #[serde(default)]
    pub auto_rewrite_target: bool,

    /// Host shell program
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments that make the host print its addresses
    #[serde(default = "default_discovery_args")]
    pub discovery_args: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            start: false,
            args: String::new(),
            show_window: false,
            auto_rewrite_target: false,
            program: default_program(),
            discovery_args: default_discovery_args(),
        }
    }
}

impl HostConfig {
    /// Launch arguments split on whitespace
    pub fn launch_args(&self) -> Vec<&str> {
        self.args.split_whitespace().collect()
    }
}
