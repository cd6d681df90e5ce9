//! Forwarding rule configuration
//!
//! A rule binds one local port for one protocol and forwards everything it
//! receives to a `host:port` target.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

/// Transport protocol of a rule
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream forwarding
    #[default]
    Tcp,
    /// Datagram forwarding through a NAT-style session table
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// One forwarding rule as stored in the configuration file
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RuleConfig {
    /// Stable identifier, assigned once and never recomputed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Protocol to forward
    #[serde(default)]
    pub protocol: Protocol,

    /// Local port, bound on all interfaces
    pub listen_port: u32,

    /// Target address (`host:port`)
    pub target_addr: String,
}

impl RuleConfig {
    /// Create a rule without an id
    pub fn new(protocol: Protocol, listen_port: u32, target_addr: impl Into<String>) -> Self {
        RuleConfig {
            id: String::new(),
            protocol,
            listen_port,
            target_addr: target_addr.into(),
        }
    }

    /// Set the rule id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Assign a fresh id if the rule has none. Returns true if one was assigned.
    pub fn ensure_id(&mut self) -> bool {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
            true
        } else {
            false
        }
    }

    /// Validated listen port
    pub fn port(&self) -> Result<u16, RelayError> {
        match u16::try_from(self.listen_port) {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(RelayError::InvalidPort(self.listen_port)),
        }
    }

    /// Address the rule listens on. Listeners are never loopback-restricted.
    pub fn listen_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port()?)))
    }

    /// Check this rule on its own: port range and target shape
    pub fn validate(&self) -> Result<(), RelayError> {
        self.port()?;
        split_target(&self.target_addr)
            .ok_or_else(|| RelayError::InvalidTarget(self.target_addr.clone()))?;
        Ok(())
    }

    /// Check this rule against the other configured rules.
    ///
    /// A rule with the same id is the rule being edited and is skipped.
    pub fn validate_against<'a, I>(&self, others: I) -> Result<(), RelayError>
    where
        I: IntoIterator<Item = &'a RuleConfig>,
    {
        self.validate()?;
        let collides = others.into_iter().any(|other| {
            (self.id.is_empty() || other.id != self.id)
                && other.protocol == self.protocol
                && other.listen_port == self.listen_port
        });
        if collides {
            return Err(RelayError::DuplicatePort {
                protocol: self.protocol,
                port: self.port()?,
            });
        }
        Ok(())
    }
}

impl fmt::Display for RuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0.0.0.0:{} -> {} ({})",
            self.listen_port, self.target_addr, self.protocol
        )
    }
}

/// Split a `host:port` target into its host and numeric port
pub fn split_target(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host, port))
}
