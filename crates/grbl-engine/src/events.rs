//! The Controller's single fan-out point for every event in §4.6 (ambient
//! design made concrete in SPEC_FULL.md §2.1).
//!
//! Two views over the same emission: a synchronous listener registry
//! (`subscribe`/`unsubscribe`, for code that just reacts) and a
//! `tokio::sync::broadcast` channel (for sequencers, the job runner and the
//! recovery supervisor, which need to `.await` a specific future event).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use grbl_core::recovery::Severity;
use grbl_core::Position;
use tokio::sync::broadcast;

use crate::codec::{AlarmEvent, StatusReport};

/// Default capacity of the broadcast channel backing [`EventBus`]. Slow
/// subscribers that fall this far behind the fastest one will see
/// `RecvError::Lagged` on their next `.recv()`.
const BROADCAST_CAPACITY: usize = 256;

/// Every event the Controller emits to subscribers (§4.6).
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// The transport finished `open()`.
    Connected,
    /// The transport was torn down.
    Disconnected,
    /// A decoded status report.
    Status(StatusReport),
    /// The raw status line, alongside the decoded `Status` event, for
    /// consumers that want the wire text verbatim.
    StatusUpdate(String),
    /// A decoded alarm line.
    Alarm(AlarmEvent),
    /// A non-fatal warning (safety-validator warn, parser warning, ...).
    Warning(String),
    /// A job advanced by one block.
    JobProgress {
        /// The job this progress belongs to.
        job_id: String,
        /// `0.0..=100.0`.
        percent: f64,
    },
    /// A job reached a terminal status.
    JobComplete {
        /// The job that finished.
        job_id: String,
        /// Whether it reached `Completed` (false for `Failed`/`Stopped`).
        success: bool,
    },
    /// `emergency_stop()` was invoked.
    EmergencyStop,
    /// `feed_hold()` was invoked.
    FeedHold,
    /// `soft_reset()` was invoked.
    SoftReset,
    /// A probe sequence began.
    ProbeStarted {
        /// Axis letter being probed (`X`, `Y`, or `Z`).
        axis: char,
    },
    /// A probe sequence resolved.
    ProbeCompleted {
        /// Whether the sequence reported success.
        success: bool,
        /// Whether contact was detected.
        contact: bool,
        /// Reported contact position, if known.
        position: Option<Position>,
    },
    /// A probe sequence failed before producing a report.
    ProbeFailed {
        /// Human-readable failure reason.
        reason: String,
    },
    /// Progress through a grid-probe scan.
    GridProbeProgress {
        /// Points measured so far.
        completed: usize,
        /// Total points in the scan.
        total: usize,
    },
    /// One step of the homing sequence completed.
    HomingStep {
        /// Human-readable description of the step.
        description: String,
    },
    /// The homing sequence resolved.
    HomingCompleted {
        /// Whether homing succeeded.
        success: bool,
    },
    /// The recovery supervisor diagnosed a non-normal state that needs an
    /// explicit `auto_recover` call (non-critical severities).
    RecoveryNeeded {
        /// Diagnosed severity.
        severity: Severity,
        /// Human-readable probable cause.
        cause: String,
    },
    /// A recovery script began executing.
    RecoveryStarted,
    /// A recovery script returned the machine to `Normal`.
    RecoveryCompleted,
    /// A recovery script failed to return the machine to `Normal`.
    RecoveryFailed {
        /// Human-readable failure reason.
        reason: String,
    },
    /// A generic error surfaced from any subsystem.
    Error(String),
}

/// A synchronous subscriber to the event bus. Implementors should return
/// quickly — `on_event` runs inline on the Controller's task.
pub trait EventListener: Send + Sync {
    /// Called once per emitted event, in emission order.
    fn on_event(&self, event: &HostEvent);
}

/// Handle returned by [`EventBus::subscribe`], used to remove that listener
/// later. Unsubscribing is always explicit (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// The Controller's event fan-out point.
pub struct EventBus {
    listeners: Mutex<Vec<(ListenerId, Arc<dyn EventListener>)>>,
    next_id: AtomicU64,
    broadcast_tx: broadcast::Sender<HostEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// A fresh, empty event bus.
    pub fn new() -> Self {
        let (broadcast_tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            broadcast_tx,
        }
    }

    /// Register a synchronous listener, returning an id for later removal.
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .expect("event bus listener lock poisoned")
            .push((id, listener));
        id
    }

    /// Remove a previously registered listener. A no-op if already removed.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners
            .lock()
            .expect("event bus listener lock poisoned")
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// Subscribe to the async broadcast view of the same emission stream.
    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<HostEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Emit `event` to every synchronous listener, then to the broadcast
    /// channel. Listener order matches registration order.
    pub fn emit(&self, event: HostEvent) {
        let listeners = self
            .listeners
            .lock()
            .expect("event bus listener lock poisoned")
            .clone();
        for (_, listener) in &listeners {
            listener.on_event(&event);
        }
        // No receivers is not an error: synchronous listeners may be the
        // only consumer for this particular event.
        let _ = self.broadcast_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingListener(Arc<AtomicUsize>);
    impl EventListener for CountingListener {
        fn on_event(&self, _event: &HostEvent) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn subscribed_listener_receives_events_until_unsubscribed() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe(Arc::new(CountingListener(count.clone())));

        bus.emit(HostEvent::Connected);
        assert_eq!(count.load(Ordering::Relaxed), 1);

        bus.unsubscribe(id);
        bus.emit(HostEvent::Disconnected);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn broadcast_subscriber_observes_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_broadcast();
        bus.emit(HostEvent::EmergencyStop);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, HostEvent::EmergencyStop));
    }
}
