//! Session clock
//!
//! Deadline bookkeeping shared by both relays. Every blocking socket call in a
//! session goes through one of these helpers, so an elapsed deadline always
//! surfaces as an `io::ErrorKind::TimedOut` error and ends the session.

use std::future::Future;
use std::io;
use std::time::Duration;

/// Timeout for dialing a TCP target
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle read deadline for each direction of a TCP session
pub const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Write deadline for forwarding one buffer
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle read deadline on a UDP session's upstream. This is the only way UDP
/// sessions are ever evicted.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Deadlines applied by the relays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClock {
    /// TCP dial timeout
    pub connect: Duration,
    /// TCP per-direction read deadline
    pub tcp_idle: Duration,
    /// Write deadline for forwarded data
    pub write: Duration,
    /// UDP upstream read deadline
    pub udp_idle: Duration,
}

impl Default for SessionClock {
    fn default() -> Self {
        SessionClock {
            connect: CONNECT_TIMEOUT,
            tcp_idle: TCP_IDLE_TIMEOUT,
            write: WRITE_TIMEOUT,
            udp_idle: UDP_IDLE_TIMEOUT,
        }
    }
}

impl SessionClock {
    /// Set the TCP idle deadline
    pub fn with_tcp_idle(mut self, timeout: Duration) -> Self {
        self.tcp_idle = timeout;
        self
    }

    /// Set the UDP idle deadline
    pub fn with_udp_idle(mut self, timeout: Duration) -> Self {
        self.udp_idle = timeout;
        self
    }

    /// Set the dial timeout
    pub fn with_connect(mut self, timeout: Duration) -> Self {
        self.connect = timeout;
        self
    }

    /// Set the write deadline
    pub fn with_write(mut self, timeout: Duration) -> Self {
        self.write = timeout;
        self
    }
}

/// Run an IO operation under a deadline
pub async fn with_deadline<F, T>(deadline: Duration, what: &'static str, op: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(deadline, op).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} timed out after {:?}", what, deadline),
        )),
    }
}

/// Whether an IO error is an elapsed deadline rather than a transfer failure
pub fn is_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_deadlines() {
        let clock = SessionClock::default();
        assert_eq!(clock.connect, Duration::from_secs(5));
        assert_eq!(clock.tcp_idle, Duration::from_secs(300));
        assert_eq!(clock.write, Duration::from_secs(10));
        assert_eq!(clock.udp_idle, Duration::from_secs(120));
    }

    #[test]
    fn test_builders() {
        let clock = SessionClock::default()
            .with_tcp_idle(Duration::from_millis(100))
            .with_udp_idle(Duration::from_millis(200))
            .with_connect(Duration::from_millis(300))
            .with_write(Duration::from_millis(400));
        assert_eq!(clock.tcp_idle, Duration::from_millis(100));
        assert_eq!(clock.udp_idle, Duration::from_millis(200));
        assert_eq!(clock.connect, Duration::from_millis(300));
        assert_eq!(clock.write, Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let result: io::Result<()> = with_deadline(
            Duration::from_secs(120),
            "read",
            std::future::pending(),
        )
        .await;
        let err = result.unwrap_err();
        assert!(is_timeout(&err));
        assert!(err.to_string().contains("read timed out"));
    }

    #[tokio::test]
    async fn test_with_deadline_passes_result_through() {
        let ok = with_deadline(Duration::from_secs(1), "read", async { Ok(7usize) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = with_deadline(Duration::from_secs(1), "read", async {
            Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionReset))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(!is_timeout(&err));
    }
}
