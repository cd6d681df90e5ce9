//! Test utilities for Portrelay
//!
//! Echo targets, free port lookup and configuration builders shared by the
//! integration tests.

#![allow(dead_code)]

use portrelay::config::{Config, Protocol, RuleConfig};
use portrelay::SessionClock;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

/// Deadlines short enough for tests
pub fn fast_clock() -> SessionClock {
    SessionClock::default()
        .with_tcp_idle(Duration::from_millis(300))
        .with_udp_idle(Duration::from_millis(300))
        .with_connect(Duration::from_millis(500))
        .with_write(Duration::from_millis(500))
}

/// Start a TCP server echoing every byte back; it never closes on its own
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Start a UDP server echoing datagrams; reports each sender address
pub async fn spawn_udp_echo() -> (SocketAddr, mpsc::UnboundedReceiver<SocketAddr>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let _ = tx.send(from);
            let _ = socket.send_to(&buf[..len], from).await;
        }
    });

    (addr, rx)
}

/// A TCP port currently free on all interfaces
pub async fn free_tcp_port() -> u16 {
    let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A UDP port currently free on all interfaces
pub async fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("0.0.0.0:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

/// Loopback address of a port bound on all interfaces
pub fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Send `data` through a TCP relay and read the echo
pub async fn tcp_round_trip(addr: SocketAddr, data: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(data).await.unwrap();

    let mut received = vec![0u8; data.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    received
}

/// Send one datagram and wait for the reply
pub async fn udp_round_trip(socket: &UdpSocket, addr: SocketAddr, data: &[u8]) -> Vec<u8> {
    socket.send_to(data, addr).await.unwrap();

    let mut buf = vec![0u8; 65535];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf.truncate(len);
    buf
}

/// Test configuration builder
#[derive(Default)]
pub struct TestConfigBuilder {
    rules: Vec<RuleConfig>,
    auto_rewrite_target: bool,
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule with a fixed id
    pub fn rule(mut self, id: &str, protocol: Protocol, port: u16, target: &str) -> Self {
        self.rules
            .push(RuleConfig::new(protocol, port as u32, target).with_id(id));
        self
    }

    /// Enable loopback target rewriting
    pub fn auto_rewrite_target(mut self, enabled: bool) -> Self {
        self.auto_rewrite_target = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        let mut config = Config {
            rules: self.rules,
            ..Default::default()
        };
        config.host.auto_rewrite_target = self.auto_rewrite_target;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_echo() {
        let addr = spawn_tcp_echo().await;
        assert_eq!(tcp_round_trip(addr, b"hello").await, b"hello");
    }

    #[test]
    fn test_config_builder() {
        let config = TestConfigBuilder::new()
            .rule("a", Protocol::Tcp, 8001, "127.0.0.1:8080")
            .auto_rewrite_target(true)
            .build();

        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].id, "a");
        assert!(config.host.auto_rewrite_target);
    }
}
