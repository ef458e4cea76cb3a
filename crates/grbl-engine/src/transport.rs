//! Duplex byte-stream abstraction and the reconnect/heartbeat/quality state
//! machine that drives any implementation of it.
//!
//! This module supplies the trait and the supervisor; it does not supply a
//! serial, WiFi or Bluetooth backend — those are the embedding
//! application's concern.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use grbl_core::HostError;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const CONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);
const CONNECT_MAX_ATTEMPTS: u32 = 5;
/// Emit a heartbeat-timeout error if no line is seen for this long while
/// nominally connected.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by a [`Transport`] or its surrounding [`ConnectionSupervisor`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `open()` failed after exhausting its reconnect attempts.
    #[error("connection failed: {0}")]
    OpenFailed(String),
    /// A write to the underlying stream failed.
    #[error("write failed: {0}")]
    WriteFailed(String),
    /// A read from the underlying stream failed.
    #[error("read failed: {0}")]
    ReadFailed(String),
    /// No line arrived within the heartbeat window.
    #[error("heartbeat timeout: no line observed in {0:?}")]
    HeartbeatTimeout(Duration),
    /// An operation was attempted while not connected.
    #[error("transport is not connected")]
    NotConnected,
}

impl From<TransportError> for HostError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::HeartbeatTimeout(_) => HostError::ConnectionTimeout(err.to_string()),
            TransportError::NotConnected | TransportError::OpenFailed(_) => {
                HostError::ConnectionFailed(err.to_string())
            }
            TransportError::WriteFailed(_) | TransportError::ReadFailed(_) => {
                HostError::HardwareError(err.to_string())
            }
        }
    }
}

/// Link-quality gauge maintained from observed timeouts and errors (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    /// No errors or timeouts observed recently.
    Excellent,
    /// A handful of recoverable hiccups.
    Good,
    /// Enough recent failures that `is_connected` should report false.
    Poor,
    /// Nothing observed yet (freshly opened, or never connected).
    Unknown,
}

/// A duplex byte stream speaking line-oriented text, plus raw single-byte
/// realtime commands. Implementations need not split incoming bytes on
/// `\r\n` themselves only if they already hand back a range of bytes ending
/// the line; `read_line` is expected to return exactly one complete line
/// with its terminator stripped.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the underlying link. Idempotent if already open.
    async fn open(&self) -> Result<(), TransportError>;

    /// Write `bytes` verbatim (the caller is responsible for any trailing
    /// newline on line commands; realtime bytes are sent with none).
    async fn write_bytes(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Block until the next complete line arrives, terminator stripped.
    async fn read_line(&self) -> Result<String, TransportError>;

    /// Tear down the link. Idempotent.
    async fn close(&self);
}

fn quality_rank(quality: ConnectionQuality) -> u8 {
    match quality {
        ConnectionQuality::Unknown => 0,
        ConnectionQuality::Poor => 1,
        ConnectionQuality::Good => 2,
        ConnectionQuality::Excellent => 3,
    }
}

fn quality_from_rank(rank: u8) -> ConnectionQuality {
    match rank {
        0 => ConnectionQuality::Unknown,
        1 => ConnectionQuality::Poor,
        2 => ConnectionQuality::Good,
        _ => ConnectionQuality::Excellent,
    }
}

/// Wraps a [`Transport`] impl with the reconnect-backoff, heartbeat-watchdog
/// and quality-gauge state machine described in §4.1. The `Controller` owns
/// exactly one of these.
pub struct ConnectionSupervisor {
    inner: Arc<dyn Transport>,
    connected: AtomicBool,
    quality_rank: AtomicU32,
    consecutive_failures: AtomicU32,
    last_line_at: Mutex<Option<Instant>>,
}

impl ConnectionSupervisor {
    /// Wrap `transport`, initially disconnected with unknown quality.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: transport,
            connected: AtomicBool::new(false),
            quality_rank: AtomicU32::new(quality_rank(ConnectionQuality::Unknown) as u32),
            consecutive_failures: AtomicU32::new(0),
            last_line_at: Mutex::new(None),
        }
    }

    /// Current quality gauge.
    pub fn quality(&self) -> ConnectionQuality {
        quality_from_rank(self.quality_rank.load(Ordering::Relaxed) as u8)
    }

    fn set_quality(&self, quality: ConnectionQuality) {
        self.quality_rank
            .store(quality_rank(quality) as u32, Ordering::Relaxed);
    }

    /// Whether the link is usable: connected *and* quality is not `Poor`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && self.quality() != ConnectionQuality::Poor
    }

    /// Open the link, retrying with exponential backoff (1 s × 2ⁿ, capped
    /// at 30 s) up to 5 attempts before giving up.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.open().await {
                Ok(()) => {
                    self.connected.store(true, Ordering::Relaxed);
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    self.set_quality(ConnectionQuality::Excellent);
                    *self.last_line_at.lock().await = Some(Instant::now());
                    debug!(attempt, "transport connected");
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    warn!(attempt, %err, "transport open failed");
                    if attempt >= CONNECT_MAX_ATTEMPTS {
                        self.set_quality(ConnectionQuality::Poor);
                        return Err(TransportError::OpenFailed(err.to_string()));
                    }
                    let delay = CONNECT_BACKOFF_BASE
                        .saturating_mul(1 << attempt.min(16))
                        .min(CONNECT_BACKOFF_CAP);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Idempotent disconnect.
    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            self.inner.close().await;
            self.set_quality(ConnectionQuality::Unknown);
            debug!("transport disconnected");
        }
    }

    /// Write raw bytes through the underlying transport.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }
        match self.inner.write_bytes(bytes).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.note_failure();
                Err(err)
            }
        }
    }

    /// Read the next line, enforcing the heartbeat watchdog: if none
    /// arrives within [`HEARTBEAT_TIMEOUT`], the quality degrades and a
    /// timeout error is returned instead of blocking forever.
    pub async fn recv_line(&self) -> Result<String, TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }
        match tokio::time::timeout(HEARTBEAT_TIMEOUT, self.inner.read_line()).await {
            Ok(Ok(line)) => {
                *self.last_line_at.lock().await = Some(Instant::now());
                self.note_success();
                Ok(line)
            }
            Ok(Err(err)) => {
                self.note_failure();
                Err(err)
            }
            Err(_) => {
                self.note_failure();
                Err(TransportError::HeartbeatTimeout(HEARTBEAT_TIMEOUT))
            }
        }
    }

    fn note_success(&self) {
        let failures = self.consecutive_failures.swap(0, Ordering::Relaxed);
        if failures == 0 {
            self.set_quality(ConnectionQuality::Excellent);
        } else {
            self.set_quality(ConnectionQuality::Good);
        }
    }

    fn note_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.set_quality(if failures >= 3 {
            ConnectionQuality::Poor
        } else {
            ConnectionQuality::Good
        });
    }
}

/// In-memory [`Transport`] test double: lines "from the device" are queued
/// with [`LoopbackTransport::push_line`], and every write is captured for
/// assertions with [`LoopbackTransport::written`].
#[derive(Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    open_should_fail: AtomicBool,
}

#[derive(Default)]
struct LoopbackState {
    inbound: VecDeque<String>,
    outbound: Vec<Vec<u8>>,
    waiters: Vec<tokio::sync::oneshot::Sender<String>>,
}

impl LoopbackTransport {
    /// A loopback transport whose `open()` always succeeds.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A loopback transport whose `open()` always fails, for exercising the
    /// reconnect-backoff path in tests.
    pub fn failing() -> Arc<Self> {
        let t = Self::default();
        t.open_should_fail.store(true, Ordering::Relaxed);
        Arc::new(t)
    }

    /// Queue a line as if it arrived from the device.
    pub async fn push_line(&self, line: impl Into<String>) {
        let line = line.into();
        let mut state = self.state.lock().await;
        if let Some(waiter) = state.waiters.pop() {
            let _ = waiter.send(line);
        } else {
            state.inbound.push_back(line);
        }
    }

    /// Every payload written so far, in order.
    pub async fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().await.outbound.clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self) -> Result<(), TransportError> {
        if self.open_should_fail.load(Ordering::Relaxed) {
            return Err(TransportError::OpenFailed("loopback configured to fail".into()));
        }
        Ok(())
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.state.lock().await.outbound.push(bytes.to_vec());
        Ok(())
    }

    async fn read_line(&self) -> Result<String, TransportError> {
        let rx = {
            let mut state = self.state.lock().await;
            if let Some(line) = state.inbound.pop_front() {
                return Ok(line);
            }
            let (tx, rx) = tokio::sync::oneshot::channel();
            state.waiters.push(tx);
            rx
        };
        rx.await
            .map_err(|_| TransportError::ReadFailed("loopback closed".into()))
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_send_and_receive_round_trip() {
        let transport = LoopbackTransport::new();
        let supervisor = ConnectionSupervisor::new(transport.clone());
        supervisor.connect().await.unwrap();
        assert!(supervisor.is_connected());

        supervisor.send(b"?").await.unwrap();
        assert_eq!(transport.written().await, vec![b"?".to_vec()]);

        transport.push_line("ok").await;
        let line = supervisor.recv_line().await.unwrap();
        assert_eq!(line, "ok");
    }

    #[tokio::test]
    async fn failed_open_exhausts_retries_and_reports_poor_quality() {
        let transport = LoopbackTransport::failing();
        let supervisor = ConnectionSupervisor::new(transport);
        let err = supervisor.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::OpenFailed(_)));
        assert_eq!(supervisor.quality(), ConnectionQuality::Poor);
        assert!(!supervisor.is_connected());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let transport = LoopbackTransport::new();
        let supervisor = ConnectionSupervisor::new(transport);
        supervisor.connect().await.unwrap();
        supervisor.disconnect().await;
        supervisor.disconnect().await;
        assert!(!supervisor.is_connected());
    }
}
