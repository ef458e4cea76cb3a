//! Multi-step homing procedure (§4.7): raise Z, issue `$H` (or per-axis),
//! wait for the Home→Idle transition, return to origin, verify.

use std::time::Duration;

use grbl_core::{HostError, MachineState};
use tracing::warn;

use crate::controller::Controller;
use crate::sequences::SequenceStep;

const RAISE_CLEARANCE_MM: f64 = 10.0;
const HOMING_TIMEOUT: Duration = Duration::from_secs(60);
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STEP_RETRY_BASE: Duration = Duration::from_secs(1);
const STEP_RETRY_CAP: Duration = Duration::from_secs(10);
const STEP_MAX_ATTEMPTS: u8 = 3;
const ORIGIN_TOLERANCE_MM: f64 = 0.1;

/// Outcome of one `home()` call (§4.7).
#[derive(Debug, Clone, PartialEq)]
pub struct HomingResult {
    /// Whether every step completed and the origin check passed.
    pub success: bool,
    /// Every step attempted, in order, regardless of outcome.
    pub steps: Vec<SequenceStep>,
    /// Set on failure: a short description of the safe-recovery actions
    /// that were run (raise Z, clear alarm).
    pub recovery_hint: Option<String>,
}

/// Drives a single homing attempt against a borrowed [`Controller`]. Built
/// fresh for each call; holds no state between invocations (§9).
pub struct HomingSequencer<'a> {
    controller: &'a Controller,
}

impl<'a> HomingSequencer<'a> {
    /// Borrow `controller` for the duration of one homing attempt.
    pub fn new(controller: &'a Controller) -> Self {
        Self { controller }
    }

    /// Run the full sequence. `axes` selects `$HX`/`$HY`/`$HZ` individually;
    /// `None` issues the all-axis `$H`.
    pub async fn home(&self, axes: Option<&[char]>) -> HomingResult {
        let mut steps = Vec::new();

        if !self.controller.is_connected() {
            steps.push(SequenceStep::failed("pre-flight: transport not connected", true));
            return self.fail(steps, "not connected").await;
        }
        if self.controller.machine_state().await.is_alarm() {
            steps.push(SequenceStep::failed("pre-flight: machine is in alarm", true));
            return self.fail(steps, "machine in alarm").await;
        }
        steps.push(SequenceStep::ok("pre-flight checks passed"));

        let z_max = self.controller.soft_limits().z.max;
        let safe_z = z_max - RAISE_CLEARANCE_MM;
        if let Err(err) = self
            .send_with_retry(&format!("G0 Z{safe_z}"), "raise Z to safe height", &mut steps)
            .await
        {
            return self.fail(steps, &err.to_string()).await;
        }

        let homing_commands: Vec<String> = match axes {
            Some(axes) if !axes.is_empty() => axes
                .iter()
                .map(|axis| format!("$H{}", axis.to_ascii_uppercase()))
                .collect(),
            _ => vec!["$H".to_string()],
        };
        for command in &homing_commands {
            if let Err(err) = self
                .send_with_retry(command, &format!("issue {command}"), &mut steps)
                .await
            {
                return self.fail(steps, &err.to_string()).await;
            }
        }

        if let Err(reason) = self.wait_for_home_to_idle().await {
            steps.push(SequenceStep::failed("wait for homing cycle to complete", true));
            return self.fail(steps, &reason).await;
        }
        steps.push(SequenceStep::ok("homing cycle reported idle"));

        if let Err(err) = self
            .send_with_retry("G0 X0 Y0", "return to origin", &mut steps)
            .await
        {
            return self.fail(steps, &err.to_string()).await;
        }

        match self.controller.get_status().await {
            Ok(status) => {
                if let Some(position) = status.machine_position {
                    if position.x.abs() > ORIGIN_TOLERANCE_MM || position.y.abs() > ORIGIN_TOLERANCE_MM {
                        steps.push(SequenceStep::failed("verify origin position", true));
                        return self
                            .fail(steps, "position did not converge to origin within tolerance")
                            .await;
                    }
                }
                steps.push(SequenceStep::ok("origin position verified"));
            }
            Err(err) => {
                steps.push(SequenceStep::failed("verify origin position", true));
                return self.fail(steps, &err.to_string()).await;
            }
        }

        HomingResult {
            success: true,
            steps,
            recovery_hint: None,
        }
    }

    async fn send_with_retry(
        &self,
        command: &str,
        description: &str,
        steps: &mut Vec<SequenceStep>,
    ) -> Result<(), HostError> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            match self.controller.send(command, None).await {
                Ok(_) => {
                    steps.push(SequenceStep::ok(description));
                    return Ok(());
                }
                Err(err) => {
                    if attempt >= STEP_MAX_ATTEMPTS {
                        steps.push(SequenceStep::failed(description, true));
                        return Err(err);
                    }
                    warn!(attempt, %err, description, "homing step failed, retrying");
                    let delay = STEP_RETRY_BASE.saturating_mul(1u32 << attempt.min(16)).min(STEP_RETRY_CAP);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn wait_for_home_to_idle(&self) -> Result<(), String> {
        let deadline = tokio::time::Instant::now() + HOMING_TIMEOUT;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err("timed out waiting for homing to complete".to_string());
            }
            match self.controller.get_status().await {
                Ok(status) => match status.state {
                    MachineState::Alarm(_) => return Err("homing cycle entered alarm".to_string()),
                    MachineState::Idle => return Ok(()),
                    _ => {}
                },
                Err(err) => {
                    warn!(%err, "status poll during homing failed");
                }
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    async fn fail(&self, steps: Vec<SequenceStep>, reason: &str) -> HomingResult {
        warn!(reason, "homing failed; running safe recovery");
        let z_max = self.controller.soft_limits().z.max;
        let _ = self.controller.send(&format!("G0 Z{}", z_max - RAISE_CLEARANCE_MM), None).await;
        let _ = self.controller.send("$X", None).await;
        HomingResult {
            success: false,
            steps,
            recovery_hint: Some(format!("raised Z and cleared alarm after: {reason}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use crate::transport::LoopbackTransport;

    #[tokio::test]
    async fn homing_fails_pre_flight_when_not_connected() {
        let transport = LoopbackTransport::new();
        let controller = Controller::new(transport, ControllerConfig::default());
        let result = HomingSequencer::new(&controller).home(None).await;
        assert!(!result.success);
        assert!(result.steps[0].critical);
    }

    #[tokio::test]
    async fn homing_runs_happy_path_to_success() {
        let transport = LoopbackTransport::new();
        let controller = Controller::new(transport.clone(), ControllerConfig::default());
        controller.connect().await.unwrap();

        let lines = vec!["ok", "ok", "<Home|MPos:0,0,0>", "<Idle|MPos:0,0,0>", "ok", "<Idle|MPos:0,0,0|F:0>"];
        let transport_clone = transport.clone();
        tokio::spawn(async move {
            for line in lines {
                transport_clone.push_line(line).await;
                tokio::task::yield_now().await;
            }
        });

        let result = HomingSequencer::new(&controller).home(None).await;
        assert!(result.success, "steps: {:?}", result.steps);
    }
}
