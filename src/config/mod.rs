//! Configuration module for Portrelay
//!
//! This module provides configuration types and TOML parsing for the relay
//! engine and the binary.

mod host;
mod rule;
mod tcp;

pub use host::HostConfig;
pub use rule::{split_target, Protocol, RuleConfig};
pub use tcp::TcpConfig;

use crate::error::RelayError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Virtualization host settings
    #[serde(default)]
    pub host: HostConfig,

    /// TCP socket options
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Forwarding rules, in display order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Config {
    /// Validate every rule and reject duplicate protocol/port pairs
    pub fn validate(&self) -> Result<(), RelayError> {
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate()?;
            let earlier = &self.rules[..i];
            if earlier
                .iter()
                .any(|r| r.protocol == rule.protocol && r.listen_port == rule.listen_port)
            {
                return Err(RelayError::DuplicatePort {
                    protocol: rule.protocol,
                    port: rule.port()?,
                });
            }
        }
        Ok(())
    }

    /// Assign ids to rules that lack one. Returns true if any was assigned.
    pub fn ensure_ids(&mut self) -> bool {
        self.rules
            .iter_mut()
            .fold(false, |assigned, rule| rule.ensure_id() || assigned)
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}

/// Write configuration to a TOML file, creating parent directories
pub fn save_config<P: AsRef<Path>>(path: P, config: &Config) -> Result<()> {
    let path = path.as_ref();
    let content = toml::to_string_pretty(config).context("Failed to serialize configuration")?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {:?}", path))
}
