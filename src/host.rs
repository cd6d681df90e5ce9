//! Virtualization host integration
//!
//! The host (a WSL distribution, typically) gets a new address on every boot,
//! so targets written as `127.0.0.1:<port>` can be rewritten to the address
//! the host currently reports. Discovery failures are never fatal: they just
//! mean "no rewrite".

use crate::config::{split_target, HostConfig};
use async_trait::async_trait;
use std::fmt::Debug;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// The only target host that is ever rewritten
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Source of the host's current address
#[async_trait]
pub trait HostDiscovery: Send + Sync + Debug {
    /// Current address of the host, or `None` if it cannot be determined
    async fn discover(&self) -> Option<String>;
}

/// Discovery by running a command and reading its first output token
#[derive(Debug, Clone)]
pub struct CommandDiscovery {
    program: String,
    args: Vec<String>,
}

impl CommandDiscovery {
    /// Create a discovery running `program args...`
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandDiscovery {
            program: program.into(),
            args,
        }
    }

    /// Discovery configured from the host settings
    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(config.program.clone(), config.discovery_args.clone())
    }
}

#[async_trait]
impl HostDiscovery for CommandDiscovery {
    async fn discover(&self) -> Option<String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .await;

        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                debug!(program = %self.program, status = %output.status, "Host discovery failed");
                return None;
            }
            Err(e) => {
                debug!(program = %self.program, error = %e, "Host discovery could not run");
                return None;
            }
        };

        parse_discovery_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Discovery with a fixed answer
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery(pub Option<String>);

#[async_trait]
impl HostDiscovery for StaticDiscovery {
    async fn discover(&self) -> Option<String> {
        self.0.clone().filter(|ip| !ip.is_empty())
    }
}

/// First whitespace separated token of the discovery output
pub fn parse_discovery_output(output: &str) -> Option<String> {
    output.split_whitespace().next().map(str::to_string)
}

/// Replace a loopback target host with `ip`, keeping the port.
///
/// Returns `None` when the target is left unchanged.
pub fn rewrite_target(target: &str, ip: &str) -> Option<String> {
    if ip.is_empty() {
        return None;
    }
    match split_target(target) {
        Some((LOOPBACK_HOST, port)) => Some(format!("{}:{}", ip, port)),
        _ => None,
    }
}

/// A launched host shell, killed when stopped or dropped
#[derive(Debug)]
pub struct HostProcess {
    child: Child,
}

impl HostProcess {
    /// Launch the host if the configuration asks for it.
    ///
    /// Launch failures are logged and yield `None`.
    pub fn launch(config: &HostConfig) -> Option<Self> {
        if !config.start {
            return None;
        }

        let mut command = Command::new(&config.program);
        command
            .args(config.launch_args())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        #[cfg(windows)]
        if !config.show_window {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        info!(program = %config.program, args = %config.args, "Starting host");
        match command.spawn() {
            Ok(child) => Some(HostProcess { child }),
            Err(e) => {
                warn!(program = %config.program, args = %config.args, error = %e, "Host start failed");
                None
            }
        }
    }

    /// OS process id, if still running
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the host and reap it
    pub async fn stop(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Host already exited");
        }
    }
}
