#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared data model for the GRBL host controller.
//!
//! This crate holds only plain, serializable types — no transport, no
//! wire-protocol parsing, no scheduling. `grbl-engine` depends on it and
//! supplies the behavior.

pub mod error;
pub mod gcode;
pub mod job;
pub mod journal;
pub mod machine_state;
pub mod persistence;
pub mod position;
pub mod recovery;

pub use error::HostError;
pub use gcode::{Block, BoundingBox, Coordinates, ModalGroup, ParseIssue, ParseResult, SafetyCheck};
pub use job::{ExecutionResult, ExecutionStats, Job, JobOptions, JobState, JobStatus, JobTimestamps};
pub use journal::{BoundedRingBuffer, CommandJournalEntry};
pub use machine_state::{alarm_message, AlarmCode, MachineState};
pub use position::{Axis, Position, SoftLimits, SpeedLimits};
pub use recovery::{DiagnosedState, RecoveryAction, RecoveryDiagnosis, RecoveryStep, Severity};
