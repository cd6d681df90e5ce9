//! # Portrelay - TCP/UDP Port Forwarder
//!
//! Portrelay forwards TCP and UDP traffic from local ports to configurable
//! targets. Idle sessions are torn down automatically, and targets on the
//! loopback address can be retargeted to a virtualization host (such as WSL)
//! whose address changes across reboots.
//!
//! ## Features
//!
//! - **TCP relay**: one bidirectional pipe per accepted connection, closed
//!   after 5 minutes without traffic in either direction
//! - **UDP relay**: a NAT-style session table demultiplexes one listening
//!   socket across many clients; sessions expire after 2 minutes of upstream
//!   silence
//! - **Host address rewrite**: `127.0.0.1:<port>` targets follow the host's
//!   current address
//! - **Status events**: every rule's status is published on a broadcast
//!   channel
//!
//! ## Usage
//!
//! ```rust,ignore
//! use portrelay::config::load_config;
//! use portrelay::ProxyOrchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("portrelay.toml")?;
//!     config.validate()?;
//!
//!     let mut orchestrator = ProxyOrchestrator::new(&config.host);
//!     orchestrator.apply(&config, false).await;
//!
//!     for status in orchestrator.statuses() {
//!         println!("{} {}", status.id, status.status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator -> Address Rewriter (optional) -> one relay per rule
//! client -> 0.0.0.0:<listen_port> -> relay -> target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod orchestrator;
pub mod relay;

// Re-export commonly used items
pub use config::{load_config, Config, Protocol, RuleConfig};
pub use error::RelayError;
pub use events::RelayEvent;
pub use orchestrator::{ProxyOrchestrator, ProxyRule, RuleStatus};
pub use relay::{RelayHandle, SessionClock};

/// Version of the Portrelay library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
