//! Scripted multi-step procedures invoked by the Controller (§4.7–§4.9):
//! homing, jogging, and probing. Each sequencer is constructed fresh per
//! operation and holds only a non-owning back-reference to the Controller's
//! shared state (§9) — it is never stored between calls.

pub mod homing;
pub mod jogging;
pub mod probing;

/// One step of a scripted sequence, recorded for the caller regardless of
/// outcome (§4.7–§4.9 each narrate their own step list in this shape).
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceStep {
    /// Human-readable description of what this step attempted.
    pub description: String,
    /// Whether the step succeeded.
    pub success: bool,
    /// Whether a failure here is critical (stops the sequence) as opposed
    /// to retryable.
    pub critical: bool,
}

impl SequenceStep {
    /// A step that succeeded.
    pub fn ok(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            success: true,
            critical: false,
        }
    }

    /// A step that failed; `critical` controls whether the sequence halts.
    pub fn failed(description: impl Into<String>, critical: bool) -> Self {
        Self {
            description: description.into(),
            success: false,
            critical,
        }
    }
}
