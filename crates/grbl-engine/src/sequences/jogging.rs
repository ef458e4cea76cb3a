//! Single-jog sequence (§4.8): pre-flight bounds check, `$J=` dispatch with
//! a distance-scaled timeout, and failure classification/recovery.

use std::time::Duration;

use grbl_core::{Coordinates, HostError, MachineState};
use tracing::warn;

use crate::controller::Controller;

const MAX_JOG_FEED_MM_PER_MIN: f64 = 5_000.0;
const MIN_JOG_TIMEOUT: Duration = Duration::from_secs(10);
/// `max_axis_distance / feed * 60 * 1500 ms`, i.e. 1.5x the naive travel
/// time, expressed as a millisecond multiplier over minutes-per-mm.
const JOG_TIMEOUT_SCALE_MS: f64 = 60.0 * 1_500.0;

/// How a jog attempt failed, driving which scripted recovery runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogFailureKind {
    /// The projected or reported position tripped a soft/hard limit.
    Limit,
    /// The machine reported an alarm in response.
    Alarm,
    /// Anything else (timeout, transport error, ...).
    Generic,
}

/// Outcome of one `jog()` call (§4.8).
#[derive(Debug, Clone, PartialEq)]
pub struct JogResult {
    /// Whether the jog completed without error.
    pub success: bool,
    /// Set when `success` is false.
    pub failure_kind: Option<JogFailureKind>,
    /// Human-readable detail, present on failure.
    pub message: Option<String>,
}

impl JogResult {
    fn ok() -> Self {
        Self {
            success: true,
            failure_kind: None,
            message: None,
        }
    }

    fn failed(kind: JogFailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            failure_kind: Some(kind),
            message: Some(message.into()),
        }
    }
}

/// Drives a single jog against a borrowed [`Controller`]. Built fresh per
/// call; the single-outstanding-jog invariant lives in the Controller's
/// `JogGuard`, not here (§9).
pub struct JoggingSequencer<'a> {
    controller: &'a Controller,
}

impl<'a> JoggingSequencer<'a> {
    /// Borrow `controller` for the duration of one jog.
    pub fn new(controller: &'a Controller) -> Self {
        Self { controller }
    }

    /// Jog by `delta` (always incremental, per axis) at `feed` mm/min.
    pub async fn jog(&self, delta: Coordinates, feed: f64) -> JogResult {
        let Some(guard) = self.controller.try_acquire_jog_guard() else {
            return JogResult::failed(JogFailureKind::Generic, "a jog is already in progress");
        };

        if !self.controller.is_connected() {
            return JogResult::failed(JogFailureKind::Generic, "not connected");
        }
        if self.controller.machine_state().await != MachineState::Idle {
            return JogResult::failed(JogFailureKind::Generic, "machine is not idle");
        }
        if feed <= 0.0 || feed > MAX_JOG_FEED_MM_PER_MIN {
            return JogResult::failed(
                JogFailureKind::Limit,
                format!("feed {feed} outside 0..{MAX_JOG_FEED_MM_PER_MIN}"),
            );
        }

        let current = self.controller.expected_position().await;
        let projected = grbl_core::Position::new(
            current.x + delta.x.unwrap_or(0.0),
            current.y + delta.y.unwrap_or(0.0),
            current.z + delta.z.unwrap_or(0.0),
        );
        if !self.controller.soft_limits().contains(projected) {
            return JogResult::failed(JogFailureKind::Limit, "projected position exceeds soft limits");
        }

        let max_axis_distance = delta
            .x
            .unwrap_or(0.0)
            .abs()
            .max(delta.y.unwrap_or(0.0).abs())
            .max(delta.z.unwrap_or(0.0).abs());
        let timeout_ms = (max_axis_distance / feed * JOG_TIMEOUT_SCALE_MS).max(MIN_JOG_TIMEOUT.as_millis() as f64);
        let timeout = Duration::from_millis(timeout_ms as u64);

        let command = format!("$J=G91 {} F{feed}", format_axis_words(&delta));

        let result = match self.controller.send(&command, Some(timeout)).await {
            Ok(_) => JogResult::ok(),
            Err(err) => self.classify_and_recover(err).await,
        };
        drop(guard);
        result
    }

    async fn classify_and_recover(&self, err: HostError) -> JogResult {
        let kind = match &err {
            HostError::SafetyViolation(_) => JogFailureKind::Limit,
            HostError::HardwareError(message) if message.to_ascii_lowercase().contains("alarm") => {
                JogFailureKind::Alarm
            }
            _ if self.controller.machine_state().await.is_alarm() => JogFailureKind::Alarm,
            _ => JogFailureKind::Generic,
        };

        warn!(?kind, %err, "jog failed; running scripted recovery");
        match kind {
            JogFailureKind::Limit => {
                let z_max = self.controller.soft_limits().z.max;
                let _ = self.controller.send(&format!("G0 Z{}", z_max - 10.0), None).await;
            }
            JogFailureKind::Alarm => {
                let _ = self.controller.send("$X", None).await;
            }
            JogFailureKind::Generic => {
                let _ = self.controller.feed_hold().await;
            }
        }
        JogResult::failed(kind, err.to_string())
    }
}

fn format_axis_words(delta: &Coordinates) -> String {
    let mut words = Vec::new();
    if let Some(x) = delta.x {
        words.push(format!("X{x}"));
    }
    if let Some(y) = delta.y {
        words.push(format!("Y{y}"));
    }
    if let Some(z) = delta.z {
        words.push(format!("Z{z}"));
    }
    words.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use crate::transport::LoopbackTransport;
    use std::sync::Arc;

    async fn idle_controller() -> (Controller, Arc<LoopbackTransport>) {
        let transport = LoopbackTransport::new();
        let controller = Controller::new(transport.clone(), ControllerConfig::default());
        controller.connect().await.unwrap();

        let transport_clone = transport.clone();
        tokio::spawn(async move {
            transport_clone.push_line("<Idle|MPos:0,0,0>").await;
        });
        controller.get_status().await.unwrap();
        (controller, transport)
    }

    #[tokio::test]
    async fn jog_rejects_feed_above_max() {
        let (controller, _transport) = idle_controller().await;

        let delta = Coordinates {
            x: Some(1.0),
            ..Default::default()
        };
        let result = JoggingSequencer::new(&controller).jog(delta, 10_000.0).await;
        assert!(!result.success);
        assert_eq!(result.failure_kind, Some(JogFailureKind::Limit));
    }

    #[tokio::test]
    async fn jog_rejects_projected_travel_outside_soft_limits() {
        let (controller, _transport) = idle_controller().await;

        let delta = Coordinates {
            x: Some(10_000.0),
            ..Default::default()
        };
        let result = JoggingSequencer::new(&controller).jog(delta, 100.0).await;
        assert!(!result.success);
        assert_eq!(result.failure_kind, Some(JogFailureKind::Limit));
    }

    #[tokio::test]
    async fn second_concurrent_jog_is_rejected_while_first_holds_the_guard() {
        let (controller, _transport) = idle_controller().await;

        let guard = controller.try_acquire_jog_guard();
        assert!(guard.is_some());

        let delta = Coordinates {
            x: Some(1.0),
            ..Default::default()
        };
        let result = JoggingSequencer::new(&controller).jog(delta, 100.0).await;
        assert!(!result.success);
        assert_eq!(result.failure_kind, Some(JogFailureKind::Generic));
    }
}
