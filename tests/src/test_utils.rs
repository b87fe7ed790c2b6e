//! Test utility functions for integration tests
//!
//! Provides logging setup, polling helpers and a scripted UDP peer.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use nextgtp_codec::{parse, GtpMessage, Message};
use nextgtp_common::{ConnConfig, GtpVersion};
use nextgtp_conn::Conn;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing_subscriber::{fmt, EnvFilter};

/// Result type for integration tests
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Default timeout for test operations
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default poll interval for condition checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Initialize logging for tests
///
/// Uses RUST_LOG environment variable if set, otherwise defaults to "info"
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// Wait for a condition to become true with timeout
pub async fn wait_for_condition<F, Fut>(
    mut condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> TestResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = timeout(timeout_duration, async {
        loop {
            if condition().await {
                return;
            }
            sleep(poll_interval).await;
        }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(_) => Err("Condition not met within timeout".into()),
    }
}

/// Loopback configuration with path management off
pub fn loopback_config(version: GtpVersion) -> ConnConfig {
    ConnConfig::new("127.0.0.1:0".parse().unwrap(), version)
        .with_restart_counter(1)
        .with_retry(Duration::from_millis(100), 2)
        .without_path_management()
}

/// Bind a connection and run its receive loop in the background.
///
/// Dropping the returned sender stops the loop.
pub async fn serve(config: ConnConfig) -> TestResult<(Conn, watch::Sender<bool>)> {
    let conn = Conn::bind(config).await?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let server = conn.clone();
    tokio::spawn(async move { server.listen_and_serve(stop_rx).await });
    Ok((conn, stop_tx))
}

/// Scripted GTP peer on a loopback UDP socket
///
/// Records what it receives and sends whatever the test tells it to.
pub struct MockPeer {
    socket: UdpSocket,
}

impl MockPeer {
    /// Bind on an ephemeral loopback port
    pub async fn bind() -> TestResult<Self> {
        Ok(Self {
            socket: UdpSocket::bind("127.0.0.1:0").await?,
        })
    }

    /// Bind on a specific loopback address, e.g. `127.0.0.2:0`
    pub async fn bind_at(addr: &str) -> TestResult<Self> {
        Ok(Self {
            socket: UdpSocket::bind(addr).await?,
        })
    }

    /// Local address of the peer
    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    /// Send a message to `to`
    pub async fn send(&self, msg: &GtpMessage, to: SocketAddr) -> TestResult {
        let bytes = msg.marshal()?;
        self.socket.send_to(&bytes, to).await?;
        Ok(())
    }

    /// Send raw bytes to `to`
    pub async fn send_raw(&self, data: &[u8], to: SocketAddr) -> TestResult {
        self.socket.send_to(data, to).await?;
        Ok(())
    }

    /// Receive the next message, failing after [`DEFAULT_TEST_TIMEOUT`]
    pub async fn recv(&self) -> TestResult<(GtpMessage, SocketAddr)> {
        self.recv_within(DEFAULT_TEST_TIMEOUT)
            .await?
            .ok_or_else(|| "no datagram received".into())
    }

    /// Receive the next message if one arrives within `window`
    pub async fn recv_within(&self, window: Duration) -> TestResult<Option<(GtpMessage, SocketAddr)>> {
        let mut buf = vec![0u8; 4096];
        match timeout(window, self.socket.recv_from(&mut buf)).await {
            Ok(received) => {
                let (len, from) = received?;
                Ok(Some((parse(&buf[..len])?, from)))
            }
            Err(_) => Ok(None),
        }
    }

    /// Collect every message arriving within `window`
    pub async fn collect_for(&self, window: Duration) -> TestResult<Vec<GtpMessage>> {
        let deadline = tokio::time::Instant::now() + window;
        let mut out = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                break;
            }
            match self.recv_within(left).await? {
                Some((msg, _)) => out.push(msg),
                None => break,
            }
        }
        Ok(out)
    }
}

/// Answer every request arriving at `peer` with an Echo Response carrying
/// `restart_counter`, after `delay`.
pub fn spawn_echo_responder(peer: MockPeer, restart_counter: u8, delay: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok(Some((msg, from))) = peer.recv_within(Duration::from_secs(30)).await else {
                break;
            };
            if !msg.is_echo_request() {
                continue;
            }
            sleep(delay).await;
            let seq = msg.sequence().unwrap_or(0);
            let reply = GtpMessage::echo_response(msg.version(), seq, restart_counter);
            if peer.send(&reply, from).await.is_err() {
                break;
            }
        }
    })
}
