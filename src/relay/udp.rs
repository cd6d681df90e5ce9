//! UDP relay server
//!
//! One shared socket receives datagrams from every client of a rule. The
//! dispatch loop looks the client address up in a NAT table: a known client's
//! datagram is queued to its session, an unknown client gets a new session
//! with its own upstream socket connected to the target.
//!
//! A session lives until its upstream has been silent for the idle deadline
//! or fails. It then removes its own table entry; nothing else evicts
//! sessions. If the dispatch loop stops because the socket failed, live
//! sessions keep delivering replies until they go idle.

use super::clock::SessionClock;
use super::{is_resource_exhaustion, RelayHandle, EXHAUSTION_BACKOFF};
use crate::config::Protocol;
use crate::error::RelayError;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM: usize = 65507;

/// Datagrams queued per session before new ones are dropped
const SESSION_QUEUE_SIZE: usize = 256;

/// Outcome of handing a datagram to the NAT table
#[derive(Debug)]
pub enum Dispatch {
    /// Queued for the client's existing session
    Queued,
    /// The session's queue is full; the datagram was dropped
    Dropped,
    /// No live session for this client; the datagram is handed back
    NoSession(Bytes),
}

struct SessionEntry {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

/// Client address to session mapping of one UDP relay.
///
/// Every operation is synchronous and holds a shard lock only for the map
/// access itself, never across socket IO.
#[derive(Default)]
pub struct NatTable {
    sessions: DashMap<SocketAddr, SessionEntry>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for NatTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatTable")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl NatTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether `client` has a live session
    pub fn contains(&self, client: &SocketAddr) -> bool {
        self.sessions.contains_key(client)
    }

    /// Queue a datagram to the client's session without waiting
    pub fn dispatch(&self, client: &SocketAddr, datagram: Bytes) -> Dispatch {
        let Some(entry) = self.sessions.get(client) else {
            return Dispatch::NoSession(datagram);
        };
        let sent = entry.tx.try_send(datagram);
        let id = entry.id;
        drop(entry);

        match sent {
            Ok(()) => Dispatch::Queued,
            Err(TrySendError::Full(_)) => Dispatch::Dropped,
            Err(TrySendError::Closed(datagram)) => {
                // The session is exiting and has not removed itself yet
                self.remove(client, id);
                Dispatch::NoSession(datagram)
            }
        }
    }

    /// Register a new session for `client`.
    ///
    /// Returns the session id and the receiving end of its queue, or `None`
    /// if the client already has a session.
    pub fn register(&self, client: SocketAddr) -> Option<(u64, mpsc::Receiver<Bytes>)> {
        match self.sessions.entry(client) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::channel(SESSION_QUEUE_SIZE);
                vacant.insert(SessionEntry { id, tx });
                Some((id, rx))
            }
        }
    }

    /// Remove the client's entry if it still belongs to session `id`
    pub fn remove(&self, client: &SocketAddr, id: u64) -> bool {
        self.sessions
            .remove_if(client, |_, entry| entry.id == id)
            .is_some()
    }
}

/// Bind `listen` and start forwarding datagrams to `target`.
///
/// Returns as soon as the socket is bound. A bind failure spawns nothing.
pub async fn start_udp(
    listen: SocketAddr,
    target: &str,
    clock: SessionClock,
) -> Result<RelayHandle, RelayError> {
    let socket = UdpSocket::bind(listen)
        .await
        .map_err(|e| RelayError::bind(listen, e))?;
    let local_addr = socket.local_addr()?;

    info!(listen = %local_addr, target = %target, "UDP relay started");

    let nat = Arc::new(NatTable::new());
    let handle = RelayHandle::new(Protocol::Udp, local_addr).with_nat(nat.clone());
    let relay = UdpRelay {
        socket: Arc::new(socket),
        target: Arc::from(target),
        clock,
        nat,
        token: handle.token().clone(),
        listener: handle.listener_token().clone(),
        tracker: handle.tracker().clone(),
    };
    handle.tracker().spawn(relay.dispatch_loop());

    Ok(handle)
}

/// State shared by the dispatch loop and its sessions
#[derive(Clone)]
struct UdpRelay {
    socket: Arc<UdpSocket>,
    target: Arc<str>,
    clock: SessionClock,
    nat: Arc<NatTable>,
    token: CancellationToken,
    listener: CancellationToken,
    tracker: TaskTracker,
}

impl UdpRelay {
    async fn dispatch_loop(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::select! {
                _ = self.listener.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (len, client) = match received {
                Ok(received) => received,
                Err(e) if is_resource_exhaustion(&e) => {
                    warn!(error = %e, "UDP receive out of resources, backing off");
                    tokio::select! {
                        _ = self.listener.cancelled() => break,
                        _ = tokio::time::sleep(EXHAUSTION_BACKOFF) => continue,
                    }
                }
                Err(e) if is_transient_recv_error(&e) => {
                    debug!(error = %e, "Transient UDP receive error");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "UDP receive failed, stopping listener");
                    self.listener.cancel();
                    break;
                }
            };

            let datagram = Bytes::copy_from_slice(&buf[..len]);
            match self.nat.dispatch(&client, datagram) {
                Dispatch::Queued => {}
                Dispatch::Dropped => {
                    debug!(client = %client, "UDP session queue full, datagram dropped");
                }
                Dispatch::NoSession(datagram) => {
                    if let Some((id, rx)) = self.nat.register(client) {
                        self.tracker
                            .spawn(self.clone().run_session(client, id, datagram, rx));
                    }
                }
            }
        }

        debug!("UDP dispatch loop stopped");
    }

    async fn run_session(
        self,
        client: SocketAddr,
        id: u64,
        first: Bytes,
        rx: mpsc::Receiver<Bytes>,
    ) {
        let dialed = tokio::select! {
            _ = self.token.cancelled() => None,
            dialed = dial_udp(&self.target) => Some(dialed),
        };
        match dialed {
            None => {}
            Some(Ok(upstream)) => {
                debug!(client = %client, target = %self.target, "UDP session opened");
                self.relay_session(client, upstream, first, rx).await;
            }
            Some(Err(e)) => {
                warn!(client = %client, error = %e, "UDP dial failed, dropping session");
            }
        }

        self.nat.remove(&client, id);
        debug!(client = %client, "UDP session closed");
    }

    async fn relay_session(
        &self,
        client: SocketAddr,
        upstream: UdpSocket,
        first: Bytes,
        mut rx: mpsc::Receiver<Bytes>,
    ) {
        if let Err(e) = upstream.send(&first).await {
            warn!(client = %client, error = %e, "UDP forward failed");
            return;
        }

        let idle = tokio::time::sleep(self.clock.udp_idle);
        tokio::pin!(idle);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = &mut idle => {
                    debug!(client = %client, "UDP session idle for {:?}", self.clock.udp_idle);
                    break;
                }
                Some(datagram) = rx.recv() => {
                    if let Err(e) = upstream.send(&datagram).await {
                        debug!(client = %client, error = %e, "UDP forward failed");
                    }
                }
                received = upstream.recv(&mut buf) => match received {
                    Ok(len) => {
                        idle.as_mut().reset(Instant::now() + self.clock.udp_idle);
                        if let Err(e) = self.socket.send_to(&buf[..len], client).await {
                            warn!(client = %client, error = %e, "UDP reply failed");
                        }
                    }
                    Err(e) => {
                        debug!(client = %client, error = %e, "UDP upstream read failed");
                        break;
                    }
                },
            }
        }
    }
}

/// Open an upstream socket connected to `target`
async fn dial_udp(target: &str) -> Result<UdpSocket, RelayError> {
    let connect = async {
        let addr = tokio::net::lookup_host(target).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "target resolved to no address")
        })?;
        let bind: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        Ok::<_, io::Error>(socket)
    };
    connect.await.map_err(|e| RelayError::dial(target, e))
}

fn is_transient_recv_error(err: &io::Error) -> bool {
    // ICMP errors from earlier replies surface here on some platforms
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_nat_register_once_per_client() {
        let nat = NatTable::new();
        assert!(nat.is_empty());

        let (id, _rx) = nat.register(client(1000)).unwrap();
        assert!(nat.register(client(1000)).is_none());
        assert!(nat.contains(&client(1000)));

        let (other, _rx2) = nat.register(client(1001)).unwrap();
        assert_ne!(id, other);
        assert_eq!(nat.len(), 2);
    }

    #[test]
    fn test_nat_remove_only_own_entry() {
        let nat = NatTable::new();
        let (id, _rx) = nat.register(client(1000)).unwrap();

        assert!(!nat.remove(&client(1000), id + 1));
        assert!(nat.contains(&client(1000)));
        assert!(nat.remove(&client(1000), id));
        assert!(!nat.contains(&client(1000)));
        assert!(!nat.remove(&client(1000), id));
    }

    #[tokio::test]
    async fn test_nat_dispatch_to_session() {
        let nat = NatTable::new();
        let datagram = Bytes::from_static(b"ping");

        assert!(matches!(
            nat.dispatch(&client(1000), datagram.clone()),
            Dispatch::NoSession(d) if d == datagram
        ));

        let (_id, mut rx) = nat.register(client(1000)).unwrap();
        assert!(matches!(
            nat.dispatch(&client(1000), datagram.clone()),
            Dispatch::Queued
        ));
        assert_eq!(rx.recv().await.unwrap(), datagram);
    }

    #[test]
    fn test_nat_dispatch_full_queue_drops() {
        let nat = NatTable::new();
        let (_id, _rx) = nat.register(client(1000)).unwrap();

        for _ in 0..SESSION_QUEUE_SIZE {
            assert!(matches!(
                nat.dispatch(&client(1000), Bytes::from_static(b"x")),
                Dispatch::Queued
            ));
        }
        assert!(matches!(
            nat.dispatch(&client(1000), Bytes::from_static(b"x")),
            Dispatch::Dropped
        ));
    }

    #[test]
    fn test_nat_dispatch_closed_session_is_evicted() {
        let nat = NatTable::new();
        let (_id, rx) = nat.register(client(1000)).unwrap();
        drop(rx);

        assert!(matches!(
            nat.dispatch(&client(1000), Bytes::from_static(b"x")),
            Dispatch::NoSession(_)
        ));
        assert!(!nat.contains(&client(1000)));
        assert!(nat.register(client(1000)).is_some());
    }

    #[test]
    fn test_transient_recv_errors() {
        assert!(is_transient_recv_error(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
        assert!(!is_transient_recv_error(&io::Error::from(
            io::ErrorKind::Other
        )));
    }

    #[tokio::test]
    async fn test_dial_udp_rejects_unparseable_target() {
        assert!(matches!(
            dial_udp("no-port-here").await,
            Err(RelayError::Dial { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_udp_bind_conflict() {
        let holder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = holder.local_addr().unwrap();

        let err = start_udp(addr, "127.0.0.1:9", SessionClock::default())
            .await
            .unwrap_err();
        assert!(err.is_addr_in_use());
    }

    #[tokio::test]
    async fn test_session_round_trip_and_eviction() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..len], from).await;
            }
        });

        let clock = SessionClock::default().with_udp_idle(Duration::from_millis(300));
        let handle = start_udp(
            "127.0.0.1:0".parse().unwrap(),
            &echo_addr.to_string(),
            clock,
        )
        .await
        .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"hello", handle.local_addr()).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), sender.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from.port(), handle.local_addr().port());
        assert_eq!(handle.active_sessions(), Some(1));

        // Upstream silent past the idle deadline: the session evicts itself
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(handle.active_sessions(), Some(0));

        handle.close().await;
    }

    #[tokio::test]
    async fn test_listener_failure_keeps_live_sessions() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        let handle = start_udp(
            "127.0.0.1:0".parse().unwrap(),
            &echo_addr.to_string(),
            SessionClock::default(),
        )
        .await
        .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"hello", handle.local_addr()).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, session) = tokio::time::timeout(Duration::from_secs(2), echo.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"hello");

        // What the dispatch loop does on a permanent error
        handle.listener_token().cancel();
        assert!(!handle.is_open());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.active_sessions(), Some(1));

        // Replies from the target still reach the client
        echo.send_to(b"late reply", session).await.unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), sender.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"late reply");

        tokio::time::timeout(Duration::from_secs(2), handle.close())
            .await
            .unwrap();
        assert_eq!(handle.active_sessions(), Some(0));
    }
}
