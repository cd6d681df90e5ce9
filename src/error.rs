//! Error types for Portrelay
//!
//! This module defines the error taxonomy of the relay engine. None of these
//! errors aborts the engine itself: the worst outcome of any failure is that a
//! single rule or a single session is inactive.

use crate::config::Protocol;
use std::io;
use thiserror::Error;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// The listen address could not be bound (port in use, permission denied)
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the bind was attempted on
        addr: String,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// The target could not be reached within the connect timeout
    #[error("failed to connect to {target}: {source}")]
    Dial {
        /// Target address
        target: String,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// Listen port outside of 1-65535
    #[error("invalid listen port {0}: must be between 1 and 65535")]
    InvalidPort(u32),

    /// Another rule already uses this protocol/port pair
    #[error("{protocol} port {port} is already used by another rule")]
    DuplicatePort {
        /// Protocol of the colliding rules
        protocol: Protocol,
        /// Colliding listen port
        port: u16,
    },

    /// Target address is not of the form `host:port`
    #[error("invalid target address: {0}")]
    InvalidTarget(String),

    /// No rule with the given id exists
    #[error("unknown rule: {0}")]
    UnknownRule(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Build a bind error for the given address
    pub fn bind(addr: impl ToString, source: io::Error) -> Self {
        RelayError::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Build a dial error for the given target
    pub fn dial(target: impl ToString, source: io::Error) -> Self {
        RelayError::Dial {
            target: target.to_string(),
            source,
        }
    }

    /// Whether this error was caused by the address already being in use
    pub fn is_addr_in_use(&self) -> bool {
        matches!(
            self,
            RelayError::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse
        )
    }
}
