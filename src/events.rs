//! Status events
//!
//! The orchestrator publishes what happens to each rule on a broadcast
//! channel, so a UI, a log file or a test can follow rule status without
//! polling.

use crate::config::Protocol;
use std::net::SocketAddr;

/// Capacity of the event channel; slow subscribers lose the oldest events
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened to a forwarding rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The rule's listener is bound and forwarding
    RuleStarted {
        /// Rule id
        id: String,
        /// Rule protocol
        protocol: Protocol,
        /// Bound address
        listen: SocketAddr,
        /// Effective target
        target: String,
    },

    /// The rule could not be started and is inactive
    RuleFailed {
        /// Rule id
        id: String,
        /// Rule protocol
        protocol: Protocol,
        /// Configured port
        listen_port: u32,
        /// Failure cause
        error: String,
    },

    /// The rule's listener was closed
    RuleStopped {
        /// Rule id
        id: String,
    },

    /// A loopback target was replaced by the host's address
    TargetRewritten {
        /// Rule id
        id: String,
        /// Configured target
        from: String,
        /// Target actually used
        to: String,
    },
}

impl RelayEvent {
    /// Id of the rule the event is about
    pub fn rule_id(&self) -> &str {
        match self {
            RelayEvent::RuleStarted { id, .. }
            | RelayEvent::RuleFailed { id, .. }
            | RelayEvent::RuleStopped { id }
            | RelayEvent::TargetRewritten { id, .. } => id,
        }
    }
}
