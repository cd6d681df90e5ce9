//! Relay servers
//!
//! One relay owns the listening socket of one rule. Starting a relay binds the
//! socket and returns a [`RelayHandle`] immediately; the accept (TCP) or
//! dispatch (UDP) loop and every session it spawns run in the background until
//! the handle is closed.
//!
//! ```text
//! client -> 0.0.0.0:<listen_port> -> relay -> target
//! ```

pub mod clock;
pub mod tcp;
pub mod udp;

pub use clock::SessionClock;
pub use tcp::start_tcp;
pub use udp::{start_udp, NatTable};

use crate::config::{Protocol, TcpConfig};
use crate::error::RelayError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Start the relay matching `protocol`
pub async fn start(
    protocol: Protocol,
    listen: SocketAddr,
    target: &str,
    clock: SessionClock,
    socket_opts: SocketOpts,
) -> Result<RelayHandle, RelayError> {
    match protocol {
        Protocol::Tcp => start_tcp(listen, target, clock, socket_opts).await,
        Protocol::Udp => start_udp(listen, target, clock).await,
    }
}

/// Pause before accepting again after running out of descriptors or buffers
pub(crate) const EXHAUSTION_BACKOFF: Duration = Duration::from_millis(100);

#[cfg(any(target_os = "linux", target_os = "android"))]
const EXHAUSTION_ERRNOS: &[i32] = &[23, 24, 105]; // ENFILE, EMFILE, ENOBUFS
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const EXHAUSTION_ERRNOS: &[i32] = &[23, 24, 55]; // ENFILE, EMFILE, ENOBUFS
#[cfg(windows)]
const EXHAUSTION_ERRNOS: &[i32] = &[10024, 10055]; // WSAEMFILE, WSAENOBUFS
#[cfg(not(any(unix, windows)))]
const EXHAUSTION_ERRNOS: &[i32] = &[];

/// Whether `err` reports a momentary shortage of descriptors or buffers
pub(crate) fn is_resource_exhaustion(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::OutOfMemory
        || err
            .raw_os_error()
            .is_some_and(|code| EXHAUSTION_ERRNOS.contains(&code))
}

/// Ownership of a running relay's listening socket.
///
/// All tasks of the relay (the listener loop and its sessions) share one
/// cancellation token and one task tracker. The listener loop also watches a
/// child token that it cancels itself when the socket fails for good; that
/// stops new sessions and leaves established ones running.
///
/// Closing the handle cancels the parent token and waits for every task to
/// finish, so the port is free again when [`close`](RelayHandle::close)
/// returns. Dropping the handle cancels without waiting.
#[derive(Debug)]
pub struct RelayHandle {
    protocol: Protocol,
    local_addr: SocketAddr,
    token: CancellationToken,
    listener: CancellationToken,
    tracker: TaskTracker,
    nat: Option<Arc<NatTable>>,
}

impl RelayHandle {
    pub(crate) fn new(protocol: Protocol, local_addr: SocketAddr) -> Self {
        let token = CancellationToken::new();
        RelayHandle {
            protocol,
            local_addr,
            listener: token.child_token(),
            token,
            tracker: TaskTracker::new(),
            nat: None,
        }
    }

    pub(crate) fn with_nat(mut self, nat: Arc<NatTable>) -> Self {
        self.nat = Some(nat);
        self
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn listener_token(&self) -> &CancellationToken {
        &self.listener
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Protocol of the relay
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Address the listening socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True until the relay is closed or its listener fails permanently
    pub fn is_open(&self) -> bool {
        !self.listener.is_cancelled()
    }

    /// Number of live UDP sessions, `None` for TCP relays
    pub fn active_sessions(&self) -> Option<usize> {
        self.nat.as_ref().map(|nat| nat.len())
    }

    /// Stop the relay and wait until its socket is released.
    ///
    /// Safe to call more than once and concurrently.
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!(protocol = %self.protocol, listen = %self.local_addr, "Relay closed");
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Socket options applied to both sides of a forwarded TCP connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts::from_tcp_config(&TcpConfig::default())
    }
}

impl SocketOpts {
    /// Create socket options from TCP config
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        let keepalive = config.keepalive_secs > 0;
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: keepalive.then_some(config.keepalive_secs),
            keepalive_interval: keepalive.then_some(config.keepalive_interval),
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}
