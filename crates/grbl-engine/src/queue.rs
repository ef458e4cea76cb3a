//! FIFO command queue with the at-most-one-in-flight discipline (§4.2).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use grbl_core::HostError;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::transport::{ConnectionSupervisor, TransportError};

/// Reject new commands once this many are queued or dispatched (§4.2).
const MAX_QUEUE_LEN: usize = 50;
/// Retry budget for a dispatched command.
const MAX_ATTEMPTS: u8 = 3;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(100);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Failure modes at the queue seam (§3.1).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue already holds [`MAX_QUEUE_LEN`] commands.
    #[error("command buffer full ({length} commands queued)")]
    Full {
        /// The capacity that was hit.
        length: usize,
    },
    /// Rejected by an `emergency_stop`, `soft_reset`, or explicit `clear()`.
    #[error("command cancelled")]
    Cancelled,
    /// Exhausted its retry budget without a terminator line.
    #[error("command timed out: {command}")]
    Timeout {
        /// The command text that timed out.
        command: String,
    },
    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<QueueError> for HostError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full { .. } => HostError::BufferOverflow(err.to_string()),
            QueueError::Cancelled => HostError::Cancelled(err.to_string()),
            QueueError::Timeout { .. } => HostError::CommandTimeout(err.to_string()),
            QueueError::Transport(transport_err) => transport_err.into(),
        }
    }
}

/// The lines collected while waiting for one command to resolve, including
/// the terminator line itself.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Every line observed after dispatch, terminator included, in order.
    pub lines: Vec<String>,
}

impl CommandResponse {
    /// The terminator line (always present on a successful response).
    pub fn terminator(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or_default()
    }
}

enum Terminator {
    Match,
    NotYet,
}

fn classify_terminator(command: &str, line: &str) -> Terminator {
    let lower = line.to_ascii_lowercase();
    let trimmed_command = command.trim();
    if trimmed_command == "?" && line.starts_with('<') {
        return Terminator::Match;
    }
    if line.contains("[PRB") {
        return Terminator::Match;
    }
    if lower.starts_with("error") || lower.starts_with("alarm") {
        return Terminator::Match;
    }
    // A probe cycle's terminator is its `[PRB:...]` report (or a failing
    // alarm/error), never a bare `ok` on its own — mirrors the `?` special
    // case above: the command determines which line ends its response.
    if trimmed_command.to_ascii_uppercase().starts_with("G38") {
        return Terminator::NotYet;
    }
    if lower == "ok" || lower.contains("ok") {
        return Terminator::Match;
    }
    Terminator::NotYet
}

fn retry_backoff(attempt: u8) -> Duration {
    RETRY_BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(16))
        .min(RETRY_BACKOFF_CAP)
}

/// FIFO of outgoing commands against one [`ConnectionSupervisor`], with
/// at-most-one dispatched at a time.
pub struct CommandQueue {
    transport: Arc<ConnectionSupervisor>,
    dispatch: AsyncMutex<()>,
    pending: AtomicUsize,
    generation: watch::Sender<u64>,
}

struct PendingGuard<'a>(&'a AtomicUsize);
impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CommandQueue {
    /// A fresh, empty queue driving `transport`.
    pub fn new(transport: Arc<ConnectionSupervisor>) -> Self {
        let (generation, _rx) = watch::channel(0);
        Self {
            transport,
            dispatch: AsyncMutex::new(()),
            pending: AtomicUsize::new(0),
            generation,
        }
    }

    /// Commands currently queued or dispatched.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the queue currently holds no commands.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `text` (a newline-terminated line command) and wait for it to
    /// resolve, retrying transient failures with backoff up to
    /// [`MAX_ATTEMPTS`] times.
    pub async fn execute(&self, text: &str, timeout: Duration) -> Result<CommandResponse, QueueError> {
        if self.pending.load(Ordering::Acquire) >= MAX_QUEUE_LEN {
            return Err(QueueError::Full {
                length: MAX_QUEUE_LEN,
            });
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        let _release = PendingGuard(&self.pending);

        let my_generation = *self.generation.borrow();
        let mut cancel_rx = self.generation.subscribe();

        let _dispatch_permit = tokio::select! {
            guard = self.dispatch.lock() => guard,
            _ = wait_for_cancel(&mut cancel_rx, my_generation) => {
                return Err(QueueError::Cancelled);
            }
        };
        if *self.generation.borrow() != my_generation {
            return Err(QueueError::Cancelled);
        }

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let payload = format!("{}\n", text.trim_end_matches('\n'));
            if let Err(err) = self.transport.send(payload.as_bytes()).await {
                warn!(%err, attempt, command = text, "dispatch write failed");
                if attempt >= MAX_ATTEMPTS {
                    return Err(QueueError::Transport(err));
                }
                tokio::select! {
                    _ = tokio::time::sleep(retry_backoff(attempt)) => {}
                    _ = wait_for_cancel(&mut cancel_rx, my_generation) => {
                        return Err(QueueError::Cancelled);
                    }
                }
                continue;
            }

            match self
                .collect_response(text, timeout, &mut cancel_rx, my_generation)
                .await
            {
                Ok(response) => {
                    debug!(command = text, attempt, "command resolved");
                    return Ok(response);
                }
                Err(CollectOutcome::Cancelled) => return Err(QueueError::Cancelled),
                Err(CollectOutcome::Timeout) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(QueueError::Timeout {
                            command: text.to_string(),
                        });
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(retry_backoff(attempt)) => {}
                        _ = wait_for_cancel(&mut cancel_rx, my_generation) => {
                            return Err(QueueError::Cancelled);
                        }
                    }
                }
                Err(CollectOutcome::Transport(err)) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(QueueError::Transport(err));
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(retry_backoff(attempt)) => {}
                        _ = wait_for_cancel(&mut cancel_rx, my_generation) => {
                            return Err(QueueError::Cancelled);
                        }
                    }
                }
            }
        }
    }

    async fn collect_response(
        &self,
        command: &str,
        timeout: Duration,
        cancel_rx: &mut watch::Receiver<u64>,
        my_generation: u64,
    ) -> Result<CommandResponse, CollectOutcome> {
        let mut lines = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(CollectOutcome::Timeout);
            }
            tokio::select! {
                line = tokio::time::timeout(remaining, self.transport.recv_line()) => {
                    match line {
                        Ok(Ok(line)) => {
                            let is_match = matches!(classify_terminator(command, &line), Terminator::Match);
                            lines.push(line);
                            if is_match {
                                return Ok(CommandResponse { lines });
                            }
                        }
                        Ok(Err(err)) => return Err(CollectOutcome::Transport(err)),
                        Err(_) => return Err(CollectOutcome::Timeout),
                    }
                }
                _ = wait_for_cancel(cancel_rx, my_generation) => {
                    return Err(CollectOutcome::Cancelled);
                }
            }
        }
    }

    /// Reject every waiting and dispatched command with a cancellation
    /// error. Subsequent commands may be enqueued immediately afterward.
    pub fn clear(&self) {
        let next = self.generation.borrow().wrapping_add(1);
        let _ = self.generation.send(next);
        debug!("command queue cleared");
    }
}

enum CollectOutcome {
    Cancelled,
    Timeout,
    Transport(TransportError),
}

async fn wait_for_cancel(rx: &mut watch::Receiver<u64>, my_generation: u64) {
    loop {
        if *rx.borrow() != my_generation {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped; nothing more can cancel us, hang instead of
            // racing a select branch that will never resolve usefully.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn supervisor() -> (Arc<ConnectionSupervisor>, Arc<LoopbackTransport>) {
        let transport = LoopbackTransport::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(transport.clone()));
        (supervisor, transport)
    }

    #[tokio::test]
    async fn resolves_on_ok() {
        let (supervisor, transport) = supervisor();
        supervisor.connect().await.unwrap();
        let queue = CommandQueue::new(supervisor);

        transport.push_line("ok").await;
        let response = queue
            .execute("G0 X10", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.terminator(), "ok");
    }

    #[tokio::test]
    async fn rejects_when_queue_length_exceeds_capacity() {
        let (supervisor, _transport) = supervisor();
        supervisor.connect().await.unwrap();
        let queue = Arc::new(CommandQueue::new(supervisor));
        queue.pending.store(MAX_QUEUE_LEN, Ordering::Release);

        let err = queue
            .execute("G0 X1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Full { .. }));
    }

    #[tokio::test]
    async fn clear_cancels_waiting_command() {
        let (supervisor, _transport) = supervisor();
        supervisor.connect().await.unwrap();
        let queue = Arc::new(CommandQueue::new(supervisor));

        let queue_clone = queue.clone();
        let handle = tokio::spawn(async move {
            queue_clone.execute("G0 X1", Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;
        queue.clear();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(QueueError::Cancelled)));
    }
}
