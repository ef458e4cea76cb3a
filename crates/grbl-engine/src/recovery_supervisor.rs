//! Periodic self-diagnosis and scripted recovery (§4.11). Polls the
//! Controller every 30 s when connected, maps whatever it finds onto a
//! [`RecoveryDiagnosis`], and can run that diagnosis's script either
//! automatically (critical severity, from the poll loop) or on an explicit
//! `auto_recover` call from the embedding application (§7).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use grbl_core::journal::BoundedRingBuffer;
use grbl_core::recovery::{DiagnosedState, RecoveryAction, RecoveryDiagnosis, RecoveryStep, Severity};
use grbl_core::{HostError, MachineState};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::controller::Controller;
use crate::events::HostEvent;

const DIAGNOSIS_INTERVAL: Duration = Duration::from_secs(30);
const DIAGNOSIS_HISTORY_CAPACITY: usize = 50;
const RECOVERY_RAISE_MM: f64 = 10.0;

/// Watches a [`Controller`] for abnormal conditions and scripts their
/// recovery (§4.11). Constructed once and shared as an `Arc`, matching the
/// ownership discipline the `JobRunner` uses for its own background tasks.
pub struct RecoverySupervisor {
    controller: Controller,
    history: AsyncMutex<BoundedRingBuffer<RecoveryDiagnosis>>,
    poll_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl RecoverySupervisor {
    /// Build a supervisor around `controller`. Diagnosis doesn't start
    /// running until [`RecoverySupervisor::start`] is called.
    pub fn new(controller: Controller) -> Arc<Self> {
        Arc::new(Self {
            controller,
            history: AsyncMutex::new(BoundedRingBuffer::new(DIAGNOSIS_HISTORY_CAPACITY)),
            poll_handle: AsyncMutex::new(None),
        })
    }

    /// Assess the machine's current state, in priority order: disconnected,
    /// alarm, position mismatch, else normal.
    pub async fn diagnose(&self) -> RecoveryDiagnosis {
        if !self.controller.is_connected() {
            return connection_lost_diagnosis();
        }
        if let MachineState::Alarm(code) = self.controller.machine_state().await {
            return alarm_diagnosis(code);
        }
        if self.controller.check_position_mismatch().await {
            return step_loss_diagnosis();
        }
        RecoveryDiagnosis::normal()
    }

    /// Start the periodic diagnosis loop, replacing any already running.
    /// Critical diagnoses are recovered automatically; anything else only
    /// raises `recoveryNeeded` and waits for `auto_recover` (§7).
    pub async fn start(self: &Arc<Self>, interval: Option<Duration>) {
        self.stop().await;
        let interval = interval.unwrap_or(DIAGNOSIS_INTERVAL);
        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !supervisor.controller.is_connected() {
                    continue;
                }
                let diagnosis = supervisor.diagnose().await;
                if diagnosis.is_normal() {
                    continue;
                }
                supervisor.record(diagnosis.clone()).await;
                supervisor.controller.events().emit(HostEvent::RecoveryNeeded {
                    severity: diagnosis.severity,
                    cause: diagnosis.probable_cause.clone(),
                });
                if diagnosis.severity == Severity::Critical {
                    let _ = supervisor.execute_recovery(&diagnosis, |_step| async {}).await;
                }
            }
        });
        *self.poll_handle.lock().await = Some(handle);
    }

    /// Stop the periodic diagnosis loop, if running.
    pub async fn stop(&self) {
        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.abort();
        }
    }

    /// Run `diagnosis`'s recovery script, yielding to `acknowledge` for any
    /// step with `confirmation_required`, then re-diagnose. Fails the
    /// operation if the machine is still not `Normal` afterward (§7).
    pub async fn execute_recovery<F, Fut>(
        &self,
        diagnosis: &RecoveryDiagnosis,
        acknowledge: F,
    ) -> Result<RecoveryDiagnosis, HostError>
    where
        F: Fn(&RecoveryStep) -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send,
    {
        self.controller.events().emit(HostEvent::RecoveryStarted);
        for step in &diagnosis.steps {
            if step.confirmation_required {
                acknowledge(step).await;
            }
            if let Err(err) = self.run_action(&step.action).await {
                warn!(%err, step = step.id, "recovery step failed");
                self.controller
                    .events()
                    .emit(HostEvent::RecoveryFailed { reason: err.to_string() });
                return Err(err);
            }
        }

        let after = self.diagnose().await;
        self.record(after.clone()).await;
        if after.is_normal() {
            self.controller.events().emit(HostEvent::RecoveryCompleted);
            Ok(after)
        } else {
            let reason = format!("still abnormal after recovery: {:?}", after.state);
            self.controller
                .events()
                .emit(HostEvent::RecoveryFailed { reason: reason.clone() });
            Err(HostError::MachineNotReady(reason))
        }
    }

    /// Diagnose, then run the script with a no-op acknowledger — the
    /// explicit call an embedding application makes for a non-critical
    /// `recoveryNeeded` event (§7). A no-op on an already-`Normal` diagnosis.
    pub async fn auto_recover(&self) -> Result<RecoveryDiagnosis, HostError> {
        let diagnosis = self.diagnose().await;
        if diagnosis.is_normal() {
            return Ok(diagnosis);
        }
        self.execute_recovery(&diagnosis, |_step| async {}).await
    }

    async fn run_action(&self, action: &RecoveryAction) -> Result<(), HostError> {
        match action {
            RecoveryAction::RaiseZ(mm) => self.controller.send(&format!("G91 G0 Z{mm}"), None).await.map(|_| ()),
            RecoveryAction::ClearAlarm => self.controller.send("$X", None).await.map(|_| ()),
            RecoveryAction::FeedHold => self.controller.feed_hold().await,
            RecoveryAction::SoftReset => self.controller.soft_reset().await,
            RecoveryAction::MoveTo(position) => self
                .controller
                .send(&format!("G90 G0 X{} Y{} Z{}", position.x, position.y, position.z), None)
                .await
                .map(|_| ()),
            RecoveryAction::PauseForManualIntervention => Ok(()),
        }
    }

    async fn record(&self, diagnosis: RecoveryDiagnosis) {
        self.history.lock().await.push(diagnosis);
    }

    /// Every diagnosis recorded so far, oldest first (cap 50).
    pub async fn history(&self) -> Vec<RecoveryDiagnosis> {
        self.history.lock().await.to_vec()
    }
}

fn connection_lost_diagnosis() -> RecoveryDiagnosis {
    let steps = vec![RecoveryStep {
        id: 0,
        description: "wait for an operator to restore the physical connection".to_string(),
        action: RecoveryAction::PauseForManualIntervention,
        confirmation_required: true,
    }];
    RecoveryDiagnosis {
        state: DiagnosedState::ConnectionLost,
        severity: Severity::High,
        probable_cause: "the transport reports disconnected".to_string(),
        affected_axes: Vec::new(),
        recommended_actions: vec!["reconnect the transport".to_string()],
        steps,
    }
}

fn alarm_diagnosis(code: u8) -> RecoveryDiagnosis {
    let (severity, recommended) = match code {
        1 => (Severity::Medium, "hard limit triggered"),
        4 | 5 => (Severity::Medium, "probe cycle failed"),
        6 | 7 | 8 | 9 => (Severity::High, "homing cycle failed"),
        _ => (Severity::High, "machine entered an alarm state"),
    };

    let mut steps = vec![
        RecoveryStep {
            id: 0,
            description: "clear the alarm lock".to_string(),
            action: RecoveryAction::ClearAlarm,
            confirmation_required: false,
        },
        RecoveryStep {
            id: 1,
            description: "raise Z to a safe clearance".to_string(),
            action: RecoveryAction::RaiseZ(RECOVERY_RAISE_MM),
            confirmation_required: false,
        },
    ];
    let mut recommended_actions = vec!["clear alarm".to_string(), "raise Z".to_string()];
    if severity == Severity::High {
        steps.push(RecoveryStep {
            id: 2,
            description: "wait for an operator to confirm it's safe to continue".to_string(),
            action: RecoveryAction::PauseForManualIntervention,
            confirmation_required: true,
        });
        recommended_actions.push("confirm safe to continue".to_string());
    }

    RecoveryDiagnosis {
        state: DiagnosedState::AlarmState(code),
        severity,
        probable_cause: format!("{recommended} ({})", grbl_core::machine_state::alarm_message(code)),
        affected_axes: Vec::new(),
        recommended_actions,
        steps,
    }
}

fn step_loss_diagnosis() -> RecoveryDiagnosis {
    let steps = vec![
        RecoveryStep {
            id: 0,
            description: "hold motion until position can be reconciled".to_string(),
            action: RecoveryAction::FeedHold,
            confirmation_required: false,
        },
        RecoveryStep {
            id: 1,
            description: "wait for an operator to verify position (re-home if unsure)".to_string(),
            action: RecoveryAction::PauseForManualIntervention,
            confirmation_required: true,
        },
    ];
    RecoveryDiagnosis {
        state: DiagnosedState::StepLossDetected,
        severity: Severity::High,
        probable_cause: "expected and last-known position have diverged past tolerance".to_string(),
        affected_axes: Vec::new(),
        recommended_actions: vec!["feed hold".to_string(), "verify position".to_string()],
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use crate::transport::LoopbackTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn diagnose_reports_connection_lost_when_not_connected() {
        let transport = LoopbackTransport::new();
        let controller = Controller::new(transport, ControllerConfig::default());
        let supervisor = RecoverySupervisor::new(controller);

        let diagnosis = supervisor.diagnose().await;
        assert_eq!(diagnosis.state, DiagnosedState::ConnectionLost);
        assert_eq!(diagnosis.severity, Severity::High);
    }

    #[tokio::test]
    async fn diagnose_reports_normal_once_connected_and_idle() {
        let transport = LoopbackTransport::new();
        let controller = Controller::new(transport.clone(), ControllerConfig::default());
        controller.connect().await.unwrap();
        let transport_clone = transport.clone();
        tokio::spawn(async move {
            transport_clone.push_line("<Idle|MPos:0,0,0>").await;
        });
        controller.get_status().await.unwrap();

        let supervisor = RecoverySupervisor::new(controller);
        assert!(supervisor.diagnose().await.is_normal());
    }

    #[tokio::test]
    async fn execute_recovery_yields_to_acknowledger_on_confirmation_required_steps() {
        let transport = LoopbackTransport::new();
        let controller = Controller::new(transport.clone(), ControllerConfig::default());
        controller.connect().await.unwrap();

        let transport_clone = transport.clone();
        tokio::spawn(async move {
            transport_clone.push_line("ok").await;
            tokio::task::yield_now().await;
            transport_clone.push_line("ok").await;
            tokio::task::yield_now().await;
            transport_clone.push_line("<Idle|MPos:0,0,0>").await;
        });

        let supervisor = RecoverySupervisor::new(controller);
        let diagnosis = alarm_diagnosis(9); // homing fail -> high -> confirmation step present

        let acknowledged = Arc::new(AtomicUsize::new(0));
        let acknowledged_clone = acknowledged.clone();
        let result = supervisor
            .execute_recovery(&diagnosis, move |_step| {
                let acknowledged = acknowledged_clone.clone();
                async move {
                    acknowledged.fetch_add(1, Ordering::Relaxed);
                }
            })
            .await;

        assert!(result.is_ok(), "{result:?}");
        assert_eq!(acknowledged.load(Ordering::Relaxed), 1);
    }
}
