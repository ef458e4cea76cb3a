#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Behavior crate for the GRBL host controller.
//!
//! `grbl-core` supplies the data model; this crate supplies the wire
//! protocol, the command queue, the safety validator, the G-code parser,
//! the event bus, the `Controller` facade, the homing/jogging/probing
//! sequencers, the job runner and the recovery supervisor. Everything here
//! runs on a single cooperative `tokio` task at a time — see `controller`
//! for the concurrency discipline.

pub mod codec;
pub mod controller;
pub mod events;
pub mod job;
pub mod parser;
pub mod queue;
pub mod recovery_supervisor;
pub mod safety;
pub mod sequences;
pub mod transport;

pub use codec::{AlarmEvent, ProbeReport, ProtocolCodec, StatusReport};
pub use controller::{Controller, ControllerConfig};
pub use events::{EventBus, EventListener, HostEvent, ListenerId};
pub use job::runner::{JobRunner, JobRunnerConfig};
pub use queue::{CommandQueue, QueueError};
pub use recovery_supervisor::RecoverySupervisor;
pub use safety::{SafetyValidator, ValidationOutcome};
pub use sequences::homing::{HomingResult, HomingSequencer};
pub use sequences::jogging::{JogResult, JoggingSequencer};
pub use sequences::probing::{GridProbeResult, ProbeResult, ProbingSequencer};
pub use transport::{ConnectionQuality, LoopbackTransport, Transport, TransportError};
