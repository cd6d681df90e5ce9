//! TCP relay server
//!
//! Accepts connections on the rule's listen port and pipes each one to the
//! target. Every direction of a session reads under an idle deadline; when
//! either direction ends, both sockets of the session are closed.
//!
//! A listener that fails for good stops accepting; sessions it already
//! accepted keep running until they end on their own or the relay is closed.

use super::clock::{is_timeout, with_deadline, SessionClock};
use super::{is_resource_exhaustion, RelayHandle, SocketOpts, EXHAUSTION_BACKOFF};
use crate::config::Protocol;
use crate::error::RelayError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Transfer buffer size per direction
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Bind `listen` and start forwarding accepted connections to `target`.
///
/// Returns as soon as the listener is bound. A bind failure spawns nothing.
pub async fn start_tcp(
    listen: SocketAddr,
    target: &str,
    clock: SessionClock,
    socket_opts: SocketOpts,
) -> Result<RelayHandle, RelayError> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| RelayError::bind(listen, e))?;
    let local_addr = listener.local_addr()?;

    info!(listen = %local_addr, target = %target, "TCP relay started");

    let handle = RelayHandle::new(Protocol::Tcp, local_addr);
    let relay = TcpRelay {
        target: Arc::from(target),
        clock,
        socket_opts,
        token: handle.token().clone(),
        listener: handle.listener_token().clone(),
        tracker: handle.tracker().clone(),
    };
    handle.tracker().spawn(relay.accept_loop(listener));

    Ok(handle)
}

/// State shared by the accept loop and its sessions
#[derive(Clone)]
struct TcpRelay {
    target: Arc<str>,
    clock: SessionClock,
    socket_opts: SocketOpts,
    token: CancellationToken,
    listener: CancellationToken,
    tracker: TaskTracker,
}

impl TcpRelay {
    async fn accept_loop(self, listener: TcpListener) {
        let listen = listener.local_addr().ok();

        loop {
            let accepted = tokio::select! {
                _ = self.listener.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(client = %peer, target = %self.target, "TCP connection accepted");
                    self.tracker.spawn(self.clone().handle_connection(stream, peer));
                }
                Err(e) if is_resource_exhaustion(&e) => {
                    warn!(listen = ?listen, error = %e, "TCP accept out of resources, backing off");
                    tokio::select! {
                        _ = self.listener.cancelled() => break,
                        _ = tokio::time::sleep(EXHAUSTION_BACKOFF) => {}
                    }
                }
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "Transient TCP accept error");
                }
                Err(e) => {
                    error!(listen = ?listen, error = %e, "TCP accept failed, stopping listener");
                    self.listener.cancel();
                    break;
                }
            }
        }

        debug!(listen = ?listen, "TCP accept loop stopped");
    }

    async fn handle_connection(self, client: TcpStream, peer: SocketAddr) {
        let dialed = tokio::select! {
            _ = self.token.cancelled() => return,
            dialed = dial(&self.target, &self.clock) => dialed,
        };
        let upstream = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                warn!(client = %peer, error = %e, "TCP dial failed, dropping connection");
                return;
            }
        };

        for stream in [&client, &upstream] {
            if let Err(e) = self.socket_opts.apply(stream) {
                warn!("Failed to apply socket options: {}", e);
            }
        }

        let (mut client_read, mut client_write) = client.into_split();
        let (mut upstream_read, mut upstream_write) = upstream.into_split();

        tokio::select! {
            result = pipe(&mut client_read, &mut upstream_write, &self.clock) => {
                log_pipe_end("client->target", peer, result);
            }
            result = pipe(&mut upstream_read, &mut client_write, &self.clock) => {
                log_pipe_end("target->client", peer, result);
            }
            _ = self.token.cancelled() => {
                debug!(client = %peer, "TCP session closed by relay stop");
            }
        }
        // Dropping the halves here closes both sockets
    }
}

/// Dial the target under the connect deadline
pub async fn dial(target: &str, clock: &SessionClock) -> Result<TcpStream, RelayError> {
    with_deadline(clock.connect, "connect", TcpStream::connect(target))
        .await
        .map_err(|e| RelayError::dial(target, e))
}

/// Copy `src` into `dst` until EOF or error.
///
/// Each read waits at most `clock.tcp_idle` and each write at most
/// `clock.write`. Returns the number of bytes forwarded.
pub async fn pipe<R, W>(src: &mut R, dst: &mut W, clock: &SessionClock) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = with_deadline(clock.tcp_idle, "read", src.read(&mut buf)).await?;
        if n == 0 {
            return Ok(total);
        }
        with_deadline(clock.write, "write", dst.write_all(&buf[..n])).await?;
        total += n as u64;
    }
}

fn log_pipe_end(direction: &str, peer: SocketAddr, result: io::Result<u64>) {
    match result {
        Ok(bytes) => debug!(client = %peer, bytes, "{} finished", direction),
        Err(e) if is_timeout(&e) => debug!(client = %peer, "{} idle: {}", direction, e),
        Err(e) => debug!(client = %peer, error = %e, "{} transfer error", direction),
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
