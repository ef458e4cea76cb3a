use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gcode::{Block, ParseResult, SafetyCheck};
use crate::position::Position;

/// Lifecycle of a [`Job`] (§3): `Pending -> Ready` on load, `Ready -> Running`
/// on start, `Running <-> Paused` any number of times, then exactly one of
/// the three terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Loaded but not yet parsed/validated.
    Pending,
    /// Parsed, validated, and queued to run.
    Ready,
    /// Currently streaming blocks.
    Running,
    /// Streaming suspended by `pause_job`; resumable.
    Paused,
    /// Ran to completion without a stop-on-error failure.
    Completed,
    /// Stopped by a block error under `stop_on_error`.
    Failed,
    /// Stopped by an explicit `stop_job` call (not an error).
    Stopped,
}

impl JobStatus {
    /// Whether this status is one of the three terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }
}

/// Per-job execution policy (§4.10).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Fail the job on the first block error rather than retrying/skipping.
    pub stop_on_error: bool,
    /// When `stop_on_error` is false, retry a failed block instead of
    /// skipping it immediately.
    pub retry_on_error: bool,
    /// Maximum retry attempts per block when `retry_on_error` is set.
    pub retry_count: u32,
    /// Refuse to start unless the machine has completed homing this session.
    pub require_homed: bool,
    /// Require an external tool-change acknowledgement before starting.
    pub require_tool_confirmation: bool,
    /// Require an external material-loaded acknowledgement before starting.
    pub require_material_confirmation: bool,
    /// Extra commands to send after the fixed preamble and before the first
    /// program block.
    pub pre_job_commands: Vec<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            retry_on_error: false,
            retry_count: 3,
            require_homed: false,
            require_tool_confirmation: false,
            require_material_confirmation: false,
            pre_job_commands: Vec::new(),
        }
    }
}

/// Wall-clock markers for a job's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobTimestamps {
    /// When the job was loaded.
    pub created_at: DateTime<Utc>,
    /// When `start_job` was first called, if ever.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status, if ever.
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobTimestamps {
    /// A fresh timestamp set with only `created_at` populated.
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Running counters for one job's execution, independent of its terminal
/// outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Blocks sent and resolved (successfully or via a recorded skip).
    pub blocks_executed: usize,
    /// Total blocks in the program.
    pub blocks_total: usize,
    /// Blocks skipped after exhausting retries (non-`stop_on_error` jobs).
    pub blocks_skipped: usize,
    /// Total retry attempts issued across all blocks.
    pub blocks_retried: usize,
    /// Wall-clock milliseconds spent actively running (excludes paused
    /// time).
    pub elapsed_ms: u64,
}

/// The final outcome of a completed, failed, or stopped job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the job reached `Completed`.
    pub success: bool,
    /// Final counters.
    pub stats: ExecutionStats,
    /// The error that ended the job, if it did not complete successfully.
    pub error: Option<String>,
}

/// A loaded G-code program and everything known about it (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, stable for the job's lifetime.
    pub id: String,
    /// Human-readable name (typically the source filename).
    pub name: String,
    /// The raw G-code text this job was loaded from.
    pub source: String,
    /// Parsed blocks, once parsing has run.
    pub blocks: Vec<Block>,
    /// Parser output (errors, warnings, bounding box, time estimate).
    pub parse_result: ParseResult,
    /// Safety-validator scan of `blocks` against the machine's current
    /// limits, computed at load time.
    pub safety_check: SafetyCheck,
    /// `0.0..=100.0`.
    pub progress_percent: f64,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Execution policy for this job.
    pub options: JobOptions,
    /// Lifecycle timestamps.
    pub timestamps: JobTimestamps,
    /// Populated once the job reaches a terminal status.
    pub execution_result: Option<ExecutionResult>,
}

impl Job {
    /// Blocks actually executed so far, derived from `progress_percent` and
    /// the total block count (used to resume streaming after a crash, §4.10).
    pub fn estimated_block_index(&self) -> usize {
        let total = self.blocks.len();
        if total == 0 {
            return 0;
        }
        let estimated = (self.progress_percent / 100.0 * total as f64).floor();
        (estimated as usize).min(total)
    }
}

/// A point-in-time snapshot of a running/paused job, serialised by the
/// autosave and crash-recovery paths (§4.10, §6). This is the only type in
/// the data model with a prescribed on-wire JSON shape, because external
/// sinks (see `grbl_core::persistence`) read and write it directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    /// The job this snapshot belongs to.
    pub job_id: String,
    /// `0.0..=100.0` at the time of the snapshot.
    pub progress_percent: f64,
    /// Lifecycle state at the time of the snapshot.
    pub status: JobStatus,
    /// Whether the job was paused at the time of the snapshot.
    pub paused: bool,
    /// The most recently observed machine position, if any status report
    /// had arrived yet.
    pub last_known_position: Option<Position>,
    /// The position recorded at the moment of pausing (used to resume after
    /// a crash — §4.10 step (5)). `None` if the job was never paused.
    pub paused_position: Option<Position>,
    /// Execution counters at the time of the snapshot.
    pub stats: ExecutionStats,
    /// Blocks executed, duplicated from `stats` for convenient access by
    /// external readers of the persisted file.
    pub blocks_executed: usize,
    /// Milliseconds since the Unix epoch when this snapshot was taken.
    pub saved_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimated_block_index_floors_and_clamps() {
        let mut job = sample_job();
        job.blocks = vec![block(); 10];
        job.progress_percent = 45.0;
        assert_eq!(job.estimated_block_index(), 4);
        job.progress_percent = 100.0;
        assert_eq!(job.estimated_block_index(), 10);
        job.progress_percent = 0.0;
        assert_eq!(job.estimated_block_index(), 0);
    }

    fn block() -> Block {
        Block {
            line_number: 1,
            raw: "G0 X0".to_string(),
            g_code: Some(0.0),
            m_code: None,
            modal_groups: Default::default(),
            coordinates: None,
            feed_rate: None,
            spindle_speed: None,
            tool_number: None,
            parameters: Default::default(),
            valid: true,
        }
    }

    fn sample_job() -> Job {
        Job {
            id: "job-1".to_string(),
            name: "test.nc".to_string(),
            source: String::new(),
            blocks: Vec::new(),
            parse_result: ParseResult {
                blocks: Vec::new(),
                errors: Vec::new(),
                warnings: Vec::new(),
                bounding_box: None,
                estimated_seconds: 0.0,
            },
            safety_check: SafetyCheck::default(),
            progress_percent: 0.0,
            status: JobStatus::Ready,
            options: JobOptions::default(),
            timestamps: JobTimestamps::new(Utc::now()),
            execution_result: None,
        }
    }
}
