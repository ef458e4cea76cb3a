//! Single-axis and grid probing (§4.9): contact detection off the `[PRB:...]`
//! wire report, failure classification, and the grid-scan's derived surface
//! metrics.

use std::time::Duration;

use grbl_core::{HostError, MachineState, Position};
use tracing::warn;

use crate::codec::ProtocolCodec;
use crate::controller::Controller;
use crate::events::HostEvent;
use crate::queue::CommandResponse;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const SINGLE_PROBE_RAISE_BEFORE_MM: f64 = 10.0;
const SINGLE_PROBE_RAISE_AFTER_MM: f64 = 5.0;
const GRID_MOVE_FEED: f64 = 1_000.0;
const GRID_PROBE_TARGET_Z: f64 = -50.0;
const GRID_CLEARANCE_Z: f64 = 10.0;
const GRID_POINT_PAUSE: Duration = Duration::from_millis(200);
const GRID_PARK_POSITION: Position = Position { x: 0.0, y: 0.0, z: 20.0 };
const FLATNESS_WARNING_MM: f64 = 5.0;
const POINT_ANOMALY_MM: f64 = 2.0;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);
const IDLE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a probe attempt failed (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailureKind {
    /// `ALARM:4`: probe not in the expected state before the cycle started.
    InitialState,
    /// `ALARM:5`: travel exhausted without contact.
    NoContact,
    /// The probe move itself tripped a soft/hard limit.
    LimitTriggered,
    /// No terminator arrived within [`PROBE_TIMEOUT`].
    Timeout,
    /// Anything else.
    Unknown,
}

/// Outcome of one `probe()` call (§4.9).
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    /// Whether contact was detected and the cycle completed cleanly.
    pub success: bool,
    /// Whether the `[PRB:...]` report's contact bit was set.
    pub contact: bool,
    /// The reported contact position, if any.
    pub position: Option<Position>,
    /// Populated on failure.
    pub failure_kind: Option<ProbeFailureKind>,
    /// Human-readable detail, present on failure.
    pub message: Option<String>,
}

impl ProbeResult {
    fn ok(position: Option<Position>, contact: bool) -> Self {
        Self {
            success: true,
            contact,
            position,
            failure_kind: None,
            message: None,
        }
    }

    fn failed(kind: ProbeFailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            contact: false,
            position: None,
            failure_kind: Some(kind),
            message: Some(message.into()),
        }
    }
}

/// One measured (or failed) point of a grid-probe scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridProbePoint {
    /// X coordinate of this grid point.
    pub x: f64,
    /// Y coordinate of this grid point.
    pub y: f64,
    /// Measured Z, if the probe at this point succeeded.
    pub z: Option<f64>,
    /// Whether the probe at this point succeeded.
    pub success: bool,
}

/// Full result of a grid-probe scan (§4.9), including derived surface
/// metrics over the successfully measured points.
#[derive(Debug, Clone, PartialEq)]
pub struct GridProbeResult {
    /// Every point attempted, in scan order.
    pub points: Vec<GridProbePoint>,
    /// Mean Z over successful points.
    pub average_height: f64,
    /// `max(z) - min(z)` over successful points.
    pub flatness: f64,
    /// Advisory messages: failed-point count, excess flatness, per-point
    /// anomalies.
    pub warnings: Vec<String>,
}

/// Drives single-axis and grid probing against a borrowed [`Controller`].
/// Built fresh per call; holds no state between invocations (§9).
pub struct ProbingSequencer<'a> {
    controller: &'a Controller,
}

impl<'a> ProbingSequencer<'a> {
    /// Borrow `controller` for the duration of one probe or scan.
    pub fn new(controller: &'a Controller) -> Self {
        Self { controller }
    }

    /// Probe along `axis` by `distance` mm at `feed` mm/min.
    pub async fn probe(&self, axis: char, feed: f64, distance: f64) -> ProbeResult {
        self.controller.events().emit(HostEvent::ProbeStarted { axis });

        if let Err(result) = self.preflight(axis, distance).await {
            self.controller.events().emit(HostEvent::ProbeFailed {
                reason: result.message.clone().unwrap_or_default(),
            });
            return result;
        }

        if let Err(err) = self
            .controller
            .send(&format!("G91 G0 Z{SINGLE_PROBE_RAISE_BEFORE_MM}"), None)
            .await
        {
            let result = ProbeResult::failed(ProbeFailureKind::Unknown, err.to_string());
            self.controller.events().emit(HostEvent::ProbeFailed {
                reason: err.to_string(),
            });
            return result;
        }

        let command = format!("G38.2 {}{distance} F{feed}", axis.to_ascii_uppercase());
        let result = match self.controller.send(&command, Some(PROBE_TIMEOUT)).await {
            Ok(response) => self.interpret_response(&response),
            Err(HostError::CommandTimeout(_)) => {
                ProbeResult::failed(ProbeFailureKind::Timeout, "probe command timed out")
            }
            Err(err) => ProbeResult::failed(ProbeFailureKind::Unknown, err.to_string()),
        };

        let _ = self
            .controller
            .send(&format!("G91 G0 Z{SINGLE_PROBE_RAISE_AFTER_MM}"), None)
            .await;

        if result.success {
            self.controller.events().emit(HostEvent::ProbeCompleted {
                success: true,
                contact: result.contact,
                position: result.position,
            });
        } else {
            warn!(?result.failure_kind, "probe failed; running scripted recovery");
            self.run_recovery(result.failure_kind).await;
            self.controller.events().emit(HostEvent::ProbeFailed {
                reason: result.message.clone().unwrap_or_default(),
            });
        }
        result
    }

    async fn preflight(&self, axis: char, distance: f64) -> Result<(), ProbeResult> {
        if !self.controller.is_connected() {
            return Err(ProbeResult::failed(ProbeFailureKind::Unknown, "not connected"));
        }
        if self.controller.machine_state().await != MachineState::Idle {
            return Err(ProbeResult::failed(ProbeFailureKind::Unknown, "machine is not idle"));
        }
        if !self.controller.is_homed().await {
            return Err(ProbeResult::failed(
                ProbeFailureKind::Unknown,
                "machine has not completed homing this session",
            ));
        }
        if axis.to_ascii_uppercase() == 'Z' && distance >= 0.0 {
            return Err(ProbeResult::failed(
                ProbeFailureKind::Unknown,
                "Z probe requires a negative distance",
            ));
        }
        Ok(())
    }

    fn interpret_response(&self, response: &CommandResponse) -> ProbeResult {
        // The `[PRB]` line is not necessarily the terminator: the queue
        // resolves a probe command on its first `ok`, so a reply of
        // `ok\n[PRB:...]` has the probe report arrive as the terminator of
        // the *next* command instead. Scan every collected line.
        for line in &response.lines {
            if let Some(report) = ProtocolCodec::parse_probe(line) {
                return if report.contact {
                    ProbeResult::ok(Some(report.position), true)
                } else {
                    ProbeResult::failed(ProbeFailureKind::NoContact, "probe reported no contact")
                };
            }
            if let Some(alarm) = ProtocolCodec::parse_alarm(line) {
                let kind = match alarm.code {
                    4 => ProbeFailureKind::InitialState,
                    5 => ProbeFailureKind::NoContact,
                    _ => ProbeFailureKind::Unknown,
                };
                return ProbeResult::failed(kind, alarm.message);
            }
            if line.to_ascii_lowercase().starts_with("error") {
                return ProbeResult::failed(ProbeFailureKind::LimitTriggered, line.to_string());
            }
        }
        // No error/alarm surfaced and no PRB line parsed: treat the absence
        // of a failure indication as contact without a reported position.
        ProbeResult::ok(None, true)
    }

    async fn run_recovery(&self, kind: Option<ProbeFailureKind>) {
        match kind {
            Some(ProbeFailureKind::InitialState) | Some(ProbeFailureKind::NoContact) => {
                let _ = self.controller.send("$X", None).await;
            }
            Some(ProbeFailureKind::LimitTriggered) => {
                let z_max = self.controller.soft_limits().z.max;
                let _ = self
                    .controller
                    .send(&format!("G90 G0 Z{}", z_max - SINGLE_PROBE_RAISE_BEFORE_MM), None)
                    .await;
            }
            Some(ProbeFailureKind::Timeout) | Some(ProbeFailureKind::Unknown) | None => {
                let _ = self.controller.feed_hold().await;
            }
        }
    }

    /// Run a grid-probe scan over `grid_x` by `grid_y` mm, centred at the
    /// origin, sampling every `step` mm, probing at `feed` mm/min.
    pub async fn probe_grid(&self, grid_x: f64, grid_y: f64, step: f64, feed: f64) -> Result<GridProbeResult, HostError> {
        if grid_x <= 0.0 || grid_y <= 0.0 || step <= 0.0 {
            return Err(HostError::SafetyViolation(
                "grid probe dimensions and step must be positive".to_string(),
            ));
        }
        let limits = self.controller.soft_limits();
        let (envelope_x, envelope_y, _) = limits.size();
        if grid_x > envelope_x || grid_y > envelope_y {
            return Err(HostError::SafetyViolation(
                "grid probe envelope exceeds soft limits".to_string(),
            ));
        }

        let start_x = -grid_x / 2.0;
        let start_y = -grid_y / 2.0;
        let mut targets = Vec::new();
        let mut y = 0.0;
        while y <= grid_y {
            let mut x = 0.0;
            while x <= grid_x {
                targets.push((start_x + x, start_y + y));
                x += step;
            }
            y += step;
        }

        let total = targets.len();
        let mut points = Vec::with_capacity(total);
        for (index, (px, py)) in targets.into_iter().enumerate() {
            let point = self.probe_one_grid_point(px, py, feed).await;
            points.push(point);
            self.controller.events().emit(HostEvent::GridProbeProgress {
                completed: index + 1,
                total,
            });
        }

        let _ = self
            .controller
            .send(
                &format!(
                    "G90 G0 X{} Y{} Z{}",
                    GRID_PARK_POSITION.x, GRID_PARK_POSITION.y, GRID_PARK_POSITION.z
                ),
                None,
            )
            .await;

        Ok(summarize_grid(points))
    }

    async fn probe_one_grid_point(&self, px: f64, py: f64, feed: f64) -> GridProbePoint {
        if let Err(err) = self
            .controller
            .send(&format!("G90 G0 X{px} Y{py} F{GRID_MOVE_FEED}"), None)
            .await
        {
            warn!(%err, px, py, "grid probe move failed");
            return GridProbePoint { x: px, y: py, z: None, success: false };
        }
        if self.wait_for_idle().await.is_err() {
            return GridProbePoint { x: px, y: py, z: None, success: false };
        }

        let command = format!("G38.2 Z{GRID_PROBE_TARGET_Z} F{feed}");
        let measured = match self.controller.send(&command, Some(PROBE_TIMEOUT)).await {
            Ok(response) => ProtocolCodec::parse_probe(response.terminator()).and_then(|report| {
                report.contact.then_some(report.position.z)
            }),
            Err(err) => {
                warn!(%err, px, py, "grid probe point failed");
                None
            }
        };

        let _ = self.controller.send(&format!("G90 G0 Z{GRID_CLEARANCE_Z}"), None).await;
        tokio::time::sleep(GRID_POINT_PAUSE).await;

        GridProbePoint {
            x: px,
            y: py,
            z: measured,
            success: measured.is_some(),
        }
    }

    async fn wait_for_idle(&self) -> Result<(), ()> {
        let deadline = tokio::time::Instant::now() + IDLE_WAIT_TIMEOUT;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(());
            }
            match self.controller.get_status().await {
                Ok(status) if status.state == MachineState::Idle => return Ok(()),
                Ok(_) => {}
                Err(err) => warn!(%err, "status poll during grid probe failed"),
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }
}

fn summarize_grid(points: Vec<GridProbePoint>) -> GridProbeResult {
    let successful: Vec<f64> = points.iter().filter_map(|p| p.z).collect();
    let failed_count = points.len() - successful.len();

    let average_height = if successful.is_empty() {
        0.0
    } else {
        successful.iter().sum::<f64>() / successful.len() as f64
    };
    let flatness = match (
        successful.iter().cloned().fold(f64::MIN, f64::max),
        successful.iter().cloned().fold(f64::MAX, f64::min),
    ) {
        (max, min) if !successful.is_empty() => max - min,
        _ => 0.0,
    };

    let mut warnings = Vec::new();
    if failed_count > 0 {
        warnings.push(format!("{failed_count} grid point(s) failed to probe"));
    }
    if flatness > FLATNESS_WARNING_MM {
        warnings.push(format!("surface flatness {flatness:.3} mm exceeds {FLATNESS_WARNING_MM} mm"));
    }
    for point in &points {
        if let Some(z) = point.z {
            if (z - average_height).abs() > POINT_ANOMALY_MM {
                warnings.push(format!(
                    "point ({:.2}, {:.2}) deviates {:.3} mm from the mean",
                    point.x,
                    point.y,
                    z - average_height
                ));
            }
        }
    }

    GridProbeResult {
        points,
        average_height,
        flatness,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use crate::transport::LoopbackTransport;

    #[tokio::test]
    async fn probe_fails_preflight_when_machine_state_is_unknown() {
        let transport = LoopbackTransport::new();
        let controller = Controller::new(transport, ControllerConfig::default());
        controller.connect().await.unwrap();

        let result = ProbingSequencer::new(&controller).probe('Z', 50.0, -20.0).await;
        assert!(!result.success);
    }

    /// §8 Scenario 4, driven through `ProbingSequencer::probe` rather than
    /// the codec directly: the device's literal reply `ok\n[PRB:...]`
    /// arrives as two lines for the probe command, which must not resolve
    /// early on the bare `ok` (queue.rs's probe special case) and must be
    /// scanned in full rather than just at the terminator.
    #[tokio::test]
    async fn probe_reports_contact_from_ok_then_prb_reply() {
        let transport = LoopbackTransport::new();
        let controller = Controller::new(transport.clone(), ControllerConfig::default());
        controller.connect().await.unwrap();
        controller.set_homed(true).await;

        let transport_clone = transport.clone();
        tokio::spawn(async move {
            transport_clone.push_line("<Idle|MPos:0,0,0>").await;
        });
        controller.get_status().await.unwrap();

        let transport_clone = transport.clone();
        tokio::spawn(async move {
            transport_clone.push_line("ok").await; // pre-raise ack
            tokio::task::yield_now().await;
            transport_clone.push_line("ok").await; // probe command's "ok"
            tokio::task::yield_now().await;
            transport_clone
                .push_line("[PRB:0.000,0.000,-1.234:1]")
                .await; // ...followed by its probe report
            tokio::task::yield_now().await;
            transport_clone.push_line("ok").await; // post-raise ack
        });

        let result = ProbingSequencer::new(&controller).probe('Z', 50.0, -10.0).await;
        assert!(result.success, "{result:?}");
        assert!(result.contact);
        assert_eq!(result.position, Some(Position::new(0.0, 0.0, -1.234)));
    }

    #[test]
    fn grid_summary_reports_flatness_and_average() {
        let points = vec![
            GridProbePoint { x: 0.0, y: 0.0, z: Some(1.0), success: true },
            GridProbePoint { x: 1.0, y: 0.0, z: Some(3.0), success: true },
            GridProbePoint { x: 0.0, y: 1.0, z: None, success: false },
        ];
        let summary = summarize_grid(points);
        assert_eq!(summary.average_height, 2.0);
        assert_eq!(summary.flatness, 2.0);
        assert!(summary.warnings.iter().any(|w| w.contains("1 grid point")));
    }

    #[test]
    fn grid_targets_are_centred_on_origin() {
        let start_x = -10.0 / 2.0;
        let start_y = -10.0 / 2.0;
        assert_eq!(start_x, -5.0);
        assert_eq!(start_y, -5.0);
    }
}
