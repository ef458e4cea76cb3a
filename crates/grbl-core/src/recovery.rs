use serde::{Deserialize, Serialize};

use crate::position::{Axis, Position};

/// How urgently a diagnosis needs attention (§3). Only `Critical` triggers
/// fully-automatic recovery (§7); everything else waits for an explicit
/// `auto_recover` call from the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Worth surfacing, no action required.
    Low,
    /// Likely recoverable without operator help.
    Medium,
    /// Needs attention soon; the current job should not continue blind.
    High,
    /// Unsafe to proceed; recovery runs automatically.
    Critical,
}

/// What the [`RecoverySupervisor`] believes is currently wrong.
///
/// [`RecoverySupervisor`]: https://docs.rs/grbl-engine (see `grbl_engine::recovery_supervisor`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosedState {
    /// No problem detected.
    Normal,
    /// The transport reports disconnected.
    ConnectionLost,
    /// The machine is in `Alarm(code)`.
    AlarmState(u8),
    /// `expected_position` and `last_known_position` have diverged past
    /// tolerance (§3, invariant 3).
    StepLossDetected,
}

/// A single scripted remediation action. The engine's `RecoverySupervisor`
/// executes these by driving the `Controller`; this crate only names them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Raise Z by the given number of millimetres (rapid, relative).
    RaiseZ(f64),
    /// Send `$X` to clear an alarm lock.
    ClearAlarm,
    /// Send `!` (feed hold).
    FeedHold,
    /// Send `0x18` (soft reset) and wait briefly for the reboot banner.
    SoftReset,
    /// Move to an absolute position at a conservative feed rate.
    MoveTo(Position),
    /// Stop and wait for an external operator acknowledgement before
    /// continuing — always paired with `confirmation_required: true`.
    PauseForManualIntervention,
}

/// One step of a recovery script (§3). Steps run in order; a step whose
/// `confirmation_required` is set suspends the script until the embedding
/// application calls back with an acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    /// Stable identifier within the owning [`RecoveryDiagnosis`], `0`-based.
    pub id: u32,
    /// Human-readable description of what this step does and why.
    pub description: String,
    /// The action to perform.
    pub action: RecoveryAction,
    /// Whether an external operator must acknowledge before this step runs.
    pub confirmation_required: bool,
}

/// The supervisor's full assessment of one abnormal condition, including the
/// script to fix it (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryDiagnosis {
    /// What is wrong.
    pub state: DiagnosedState,
    /// How urgently it needs attention.
    pub severity: Severity,
    /// Best-effort explanation of the likely root cause.
    pub probable_cause: String,
    /// Axes implicated, if the diagnosis is axis-specific.
    pub affected_axes: Vec<Axis>,
    /// Short human-readable summaries of the steps below, for display
    /// without walking the full script.
    pub recommended_actions: Vec<String>,
    /// The recovery script itself, in execution order.
    pub steps: Vec<RecoveryStep>,
}

impl RecoveryDiagnosis {
    /// The `Normal` diagnosis: nothing to recover from, no steps.
    pub fn normal() -> Self {
        Self {
            state: DiagnosedState::Normal,
            severity: Severity::Low,
            probable_cause: "no abnormal condition detected".to_string(),
            affected_axes: Vec::new(),
            recommended_actions: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Whether this diagnosis is the all-clear.
    pub fn is_normal(&self) -> bool {
        matches!(self.state, DiagnosedState::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_diagnosis_has_no_steps() {
        let d = RecoveryDiagnosis::normal();
        assert!(d.is_normal());
        assert!(d.steps.is_empty());
    }

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }
}
