//! Block-by-block job execution (§4.10): load, pre-flight, fixed preamble,
//! per-block retry/skip policy, pause/resume, periodic autosave and
//! crash recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use grbl_core::journal::BoundedRingBuffer;
use grbl_core::persistence::{JobStateSink, SnapshotKind};
use grbl_core::{
    ExecutionResult, ExecutionStats, HostError, Job, JobOptions, JobState, JobStatus, JobTimestamps,
    Position,
};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::controller::Controller;
use crate::events::HostEvent;
use crate::parser::GCodeParser;

const JOB_HISTORY_CAPACITY: usize = 100;
const RETRY_BACKOFF_MS_PER_ATTEMPT: u64 = 500;
const RECOVERY_RAISE_MM: f64 = 10.0;
const RECOVERY_DESCENT_CLEARANCE_MM: f64 = 10.0;
const FIXED_PREAMBLE: [&str; 4] = ["G0 Z20 F500", "G90", "G21", "G92 X0 Y0 Z0"];

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Construction-time tuning for a [`JobRunner`].
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// How often a running/paused job's state is persisted.
    pub autosave_interval: Duration,
    /// Per-block send timeout.
    pub block_timeout: Duration,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            autosave_interval: Duration::from_secs(60),
            block_timeout: Duration::from_secs(10),
        }
    }
}

struct RunningJob {
    job_id: String,
    pause_tx: watch::Sender<bool>,
    run_handle: JoinHandle<()>,
    autosave_handle: JoinHandle<()>,
}

/// Streams a loaded [`Job`] block-by-block against a [`Controller`],
/// persisting periodic snapshots through an injected [`JobStateSink`] (§6).
/// Cheaply shared: constructed once and handed out as an `Arc` (§9).
pub struct JobRunner {
    controller: Controller,
    sink: Arc<dyn JobStateSink>,
    config: JobRunnerConfig,
    jobs: Arc<AsyncMutex<HashMap<String, Job>>>,
    history: Arc<AsyncMutex<BoundedRingBuffer<Job>>>,
    paused_positions: Arc<AsyncMutex<HashMap<String, Position>>>,
    stats: Arc<AsyncMutex<HashMap<String, ExecutionStats>>>,
    running: Arc<AsyncMutex<Option<RunningJob>>>,
    next_id: AtomicU64,
}

impl JobRunner {
    /// Build a runner around `controller`, persisting through `sink`.
    /// Returned as an `Arc` since every embedding API call needs to spawn
    /// tasks that outlive the caller's borrow.
    pub fn new(controller: Controller, config: JobRunnerConfig, sink: Arc<dyn JobStateSink>) -> Arc<Self> {
        Arc::new(Self {
            controller,
            sink,
            config,
            jobs: Arc::new(AsyncMutex::new(HashMap::new())),
            history: Arc::new(AsyncMutex::new(BoundedRingBuffer::new(JOB_HISTORY_CAPACITY))),
            paused_positions: Arc::new(AsyncMutex::new(HashMap::new())),
            stats: Arc::new(AsyncMutex::new(HashMap::new())),
            running: Arc::new(AsyncMutex::new(None)),
            next_id: AtomicU64::new(0),
        })
    }

    /// Parse `source`, run the safety scan, and register a new `Ready` job.
    /// When `strict` is set, any parser error fails the load outright rather
    /// than producing a job with `parse_result.errors` populated (§7).
    pub async fn load_job(
        &self,
        name: String,
        source: String,
        options: JobOptions,
        strict: bool,
    ) -> Result<String, HostError> {
        let parse_result = GCodeParser::parse(&source);
        if strict && !parse_result.errors.is_empty() {
            let first = &parse_result.errors[0];
            return Err(HostError::InvalidGCode(format!(
                "line {}: {}",
                first.line_number, first.message
            )));
        }

        let safety_check = GCodeParser::check_safety(
            &parse_result.blocks,
            &self.controller.soft_limits(),
            &self.controller.speed_limits(),
        );

        let id = format!("job-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let job = Job {
            id: id.clone(),
            name,
            source,
            blocks: parse_result.blocks.clone(),
            parse_result,
            safety_check,
            progress_percent: 0.0,
            status: JobStatus::Ready,
            options,
            timestamps: JobTimestamps::new(Utc::now()),
            execution_result: None,
        };
        self.jobs.lock().await.insert(id.clone(), job);
        Ok(id)
    }

    /// Run pre-flight checks, send the fixed preamble, and begin streaming
    /// blocks in the background.
    pub async fn start_job(&self, job_id: &str) -> Result<(), HostError> {
        if self.running.lock().await.is_some() {
            return Err(HostError::MachineNotReady("a job is already running".to_string()));
        }

        {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| HostError::MachineNotReady(format!("job {job_id} is not loaded")))?;
            if !matches!(job.status, JobStatus::Ready) {
                return Err(HostError::MachineNotReady(format!(
                    "job {job_id} is not ready to start (status {:?})",
                    job.status
                )));
            }
            self.pre_flight(job).await?;
            job.status = JobStatus::Running;
            job.timestamps.started_at = Some(Utc::now());
        }

        self.stats.lock().await.insert(
            job_id.to_string(),
            ExecutionStats {
                blocks_total: self.jobs.lock().await.get(job_id).map(|j| j.blocks.len()).unwrap_or(0),
                ..ExecutionStats::default()
            },
        );

        self.spawn_run(job_id.to_string(), 0, true).await;
        Ok(())
    }

    async fn pre_flight(&self, job: &Job) -> Result<(), HostError> {
        if !self.controller.is_connected() {
            return Err(HostError::ConnectionFailed("controller is not connected".to_string()));
        }
        if self.controller.machine_state().await.is_alarm() {
            return Err(HostError::MachineNotReady("machine is in alarm".to_string()));
        }
        if job.options.require_homed && !self.controller.is_homed().await {
            return Err(HostError::MachineNotReady("job requires homing first".to_string()));
        }
        // Tool/material confirmation has no external acknowledgement seam in
        // the embedding API (§6); treated as informational-only for now.
        if job.options.require_tool_confirmation {
            self.controller
                .events()
                .emit(HostEvent::Warning("job requires tool confirmation; proceeding unconfirmed".to_string()));
        }
        if job.options.require_material_confirmation {
            self.controller.events().emit(HostEvent::Warning(
                "job requires material confirmation; proceeding unconfirmed".to_string(),
            ));
        }
        if let Some(bounding_box) = job.parse_result.bounding_box {
            let limits = self.controller.soft_limits();
            if !limits.contains(bounding_box.min) || !limits.contains(bounding_box.max) {
                self.controller
                    .events()
                    .emit(HostEvent::Warning(format!("job {} bounding box exceeds the soft envelope", job.id)));
            }
        }
        Ok(())
    }

    /// Spawn the block-execution loop and the periodic autosave loop for
    /// `job_id`, starting at `resume_from_block`. `run_preamble` is false
    /// when resuming after a crash (§4.10 step 5 does not replay it).
    async fn spawn_run(&self, job_id: String, resume_from_block: usize, run_preamble: bool) {
        let (pause_tx, pause_rx) = watch::channel(false);

        let run_handle = tokio::spawn(run_job(
            self.controller.clone(),
            self.jobs.clone(),
            self.history.clone(),
            self.paused_positions.clone(),
            self.stats.clone(),
            job_id.clone(),
            pause_rx,
            self.config.block_timeout,
            resume_from_block,
            run_preamble,
        ));

        let autosave_handle = tokio::spawn(autosave_loop(
            self.sink.clone(),
            self.controller.clone(),
            self.jobs.clone(),
            self.stats.clone(),
            self.paused_positions.clone(),
            job_id.clone(),
            self.config.autosave_interval,
        ));

        *self.running.lock().await = Some(RunningJob {
            job_id,
            pause_tx,
            run_handle,
            autosave_handle,
        });
    }

    /// Feed-hold, record the pause position, and mark the job `Paused`.
    pub async fn pause_job(&self, job_id: &str) -> Result<(), HostError> {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(running) if running.job_id == job_id => {
                let mut jobs = self.jobs.lock().await;
                let job = jobs
                    .get_mut(job_id)
                    .ok_or_else(|| HostError::MachineNotReady(format!("job {job_id} is not loaded")))?;
                if job.status != JobStatus::Running {
                    return Err(HostError::MachineNotReady(format!("job {job_id} is not running")));
                }
                self.controller.feed_hold().await?;
                let position = match self.controller.last_known_position().await {
                    Some(position) => position,
                    None => self.controller.expected_position().await,
                };
                job.status = JobStatus::Paused;
                drop(jobs);
                self.paused_positions.lock().await.insert(job_id.to_string(), position);
                let _ = running.pause_tx.send(true);
                Ok(())
            }
            _ => Err(HostError::MachineNotReady(format!("job {job_id} is not running"))),
        }
    }

    /// Cycle-start and mark the job `Running` again.
    pub async fn resume_job(&self, job_id: &str) -> Result<(), HostError> {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(running) if running.job_id == job_id => {
                let mut jobs = self.jobs.lock().await;
                let job = jobs
                    .get_mut(job_id)
                    .ok_or_else(|| HostError::MachineNotReady(format!("job {job_id} is not loaded")))?;
                if job.status != JobStatus::Paused {
                    return Err(HostError::MachineNotReady(format!("job {job_id} is not paused")));
                }
                self.controller.cycle_start().await?;
                job.status = JobStatus::Running;
                drop(jobs);
                let _ = running.pause_tx.send(false);
                Ok(())
            }
            _ => Err(HostError::MachineNotReady(format!("job {job_id} is not paused"))),
        }
    }

    /// Stop streaming, issue `emergency`'s corresponding realtime stop, and
    /// move the job into history as `Stopped`.
    pub async fn stop_job(&self, job_id: &str, emergency: bool) -> Result<(), HostError> {
        let running = self.running.lock().await.take();
        match running {
            Some(running) if running.job_id == job_id => {
                running.run_handle.abort();
                running.autosave_handle.abort();
                self.controller.stop_job(emergency).await;
                finish_job(&self.jobs, &self.history, &self.stats, job_id, JobStatus::Stopped, None).await;
                snapshot_and_save(&self.sink, &self.controller, &self.history, &self.paused_positions, job_id).await;
                Ok(())
            }
            Some(other) => {
                // Not the job we were asked to stop; put it back.
                *self.running.lock().await = Some(other);
                Err(HostError::MachineNotReady(format!("job {job_id} is not running")))
            }
            None => Err(HostError::MachineNotReady(format!("job {job_id} is not running"))),
        }
    }

    /// Resume a `Failed`/`Stopped` job from its last persisted snapshot:
    /// raise Z, clear the alarm, move back over the paused position, descend,
    /// then restart streaming from `estimated_block_index()` without
    /// replaying the fixed preamble (§4.10 step 5).
    pub async fn resume_after_crash(&self, job_id: &str) -> Result<(), HostError> {
        if self.running.lock().await.is_some() {
            return Err(HostError::MachineNotReady("a job is already running".to_string()));
        }

        let state = self
            .sink
            .load(job_id)
            .await
            .map_err(|err: anyhow::Error| HostError::HardwareError(err.to_string()))?
            .ok_or_else(|| HostError::MachineNotReady(format!("no persisted state for job {job_id}")))?;

        let mut job = self.history.lock().await.take(|candidate| candidate.id == job_id);
        if job.is_none() {
            job = self.jobs.lock().await.get(job_id).cloned();
        }
        let mut job = job.ok_or_else(|| HostError::MachineNotReady(format!("job {job_id} is unknown")))?;

        job.progress_percent = state.progress_percent;
        job.status = JobStatus::Running;
        self.stats.lock().await.insert(job_id.to_string(), state.stats);

        let paused_position = state.paused_position.unwrap_or(Position::ORIGIN);
        self.controller
            .send(&format!("G91 G0 Z{RECOVERY_RAISE_MM}"), None)
            .await?;
        self.controller.send("$X", None).await?;
        self.controller
            .send(
                &format!(
                    "G90 G0 X{} Y{} Z{}",
                    paused_position.x,
                    paused_position.y,
                    paused_position.z + RECOVERY_DESCENT_CLEARANCE_MM
                ),
                None,
            )
            .await?;
        self.controller
            .send(&format!("G90 G0 Z{}", paused_position.z), None)
            .await?;

        let resume_from_block = job.estimated_block_index();
        self.jobs.lock().await.insert(job_id.to_string(), job);

        self.spawn_run(job_id.to_string(), resume_from_block, false).await;
        Ok(())
    }

    /// The job currently running or paused, if any.
    pub async fn get_current_job(&self) -> Option<Job> {
        let job_id = self.running.lock().await.as_ref().map(|running| running.job_id.clone())?;
        self.jobs.lock().await.get(&job_id).cloned()
    }

    /// Every job loaded but not yet archived to history.
    pub async fn get_job_queue(&self) -> Vec<Job> {
        self.jobs.lock().await.values().cloned().collect()
    }

    /// Every job that has reached a terminal status, oldest first.
    pub async fn get_job_history(&self) -> Vec<Job> {
        self.history.lock().await.to_vec()
    }

    /// Running execution counters for `job_id`, if it has started.
    pub async fn get_execution_stats(&self, job_id: &str) -> Option<ExecutionStats> {
        self.stats.lock().await.get(job_id).copied()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_job(
    controller: Controller,
    jobs: Arc<AsyncMutex<HashMap<String, Job>>>,
    history: Arc<AsyncMutex<BoundedRingBuffer<Job>>>,
    paused_positions: Arc<AsyncMutex<HashMap<String, Position>>>,
    stats: Arc<AsyncMutex<HashMap<String, ExecutionStats>>>,
    job_id: String,
    mut pause_rx: watch::Receiver<bool>,
    block_timeout: Duration,
    resume_from_block: usize,
    run_preamble: bool,
) {
    let started = tokio::time::Instant::now();

    if run_preamble {
        let pre_job_commands = {
            let jobs = jobs.lock().await;
            match jobs.get(&job_id) {
                Some(job) => job.options.pre_job_commands.clone(),
                None => return,
            }
        };
        for command in FIXED_PREAMBLE.iter().map(|s| s.to_string()).chain(pre_job_commands) {
            if let Err(err) = controller.send(&command, None).await {
                warn!(%err, job_id, "job preamble failed");
                finish_job(&jobs, &history, &stats, &job_id, JobStatus::Failed, Some(err.to_string())).await;
                controller.events().emit(HostEvent::JobComplete { job_id, success: false });
                return;
            }
        }
    }

    let (blocks, total) = {
        let jobs = jobs.lock().await;
        match jobs.get(&job_id) {
            Some(job) => (job.blocks.clone(), job.blocks.len()),
            None => return,
        }
    };

    for (index, block) in blocks.iter().enumerate().skip(resume_from_block) {
        loop {
            if !*pause_rx.borrow() {
                break;
            }
            if pause_rx.changed().await.is_err() {
                return;
            }
        }

        {
            let jobs = jobs.lock().await;
            match jobs.get(&job_id).map(|job| job.status) {
                Some(JobStatus::Running) | Some(JobStatus::Paused) => {}
                _ => return,
            }
        }

        let (stop_on_error, retry_on_error, retry_count) = {
            let jobs = jobs.lock().await;
            let job = jobs.get(&job_id).expect("job present for the duration of run_job");
            (job.options.stop_on_error, job.options.retry_on_error, job.options.retry_count)
        };

        let mut attempt: u32 = 0;
        let outcome = loop {
            attempt += 1;
            match controller.send(&block.raw, Some(block_timeout)).await {
                Ok(_) => break BlockOutcome::Sent,
                Err(err) => {
                    if stop_on_error {
                        break BlockOutcome::Failed(err);
                    }
                    if retry_on_error && attempt <= retry_count {
                        stats.lock().await.entry(job_id.clone()).or_default().blocks_retried += 1;
                        let delay = Duration::from_millis(RETRY_BACKOFF_MS_PER_ATTEMPT * attempt as u64);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break BlockOutcome::Skipped(err);
                }
            }
        };

        match outcome {
            BlockOutcome::Sent => {
                let mut stats = stats.lock().await;
                let entry = stats.entry(job_id.clone()).or_default();
                entry.blocks_executed += 1;
                entry.elapsed_ms = started.elapsed().as_millis() as u64;
            }
            BlockOutcome::Skipped(err) => {
                warn!(%err, job_id, index, "block skipped after exhausting retries");
                controller
                    .events()
                    .emit(HostEvent::Warning(format!("block {index} skipped: {err}")));
                let mut stats = stats.lock().await;
                let entry = stats.entry(job_id.clone()).or_default();
                entry.blocks_executed += 1;
                entry.blocks_skipped += 1;
                entry.elapsed_ms = started.elapsed().as_millis() as u64;
            }
            BlockOutcome::Failed(err) => {
                finish_job(&jobs, &history, &stats, &job_id, JobStatus::Failed, Some(err.to_string())).await;
                controller.events().emit(HostEvent::JobComplete { job_id, success: false });
                return;
            }
        }

        let mut jobs_guard = jobs.lock().await;
        if let Some(job) = jobs_guard.get_mut(&job_id) {
            job.progress_percent = ((index + 1) as f64 / total.max(1) as f64) * 100.0;
            let percent = job.progress_percent;
            drop(jobs_guard);
            controller.events().emit(HostEvent::JobProgress {
                job_id: job_id.clone(),
                percent,
            });
        }
    }

    finish_job(&jobs, &history, &stats, &job_id, JobStatus::Completed, None).await;
    paused_positions.lock().await.remove(&job_id);
    controller.events().emit(HostEvent::JobComplete { job_id, success: true });
}

enum BlockOutcome {
    Sent,
    Skipped(HostError),
    Failed(HostError),
}

/// Remove `job_id` from the active map, attach its final [`ExecutionResult`],
/// and archive it into history. A job left `Failed`/`Stopped` keeps its
/// persisted snapshot so `resume_after_crash` has something to read; only a
/// clean `Completed` clears it (callers that need the snapshot-clear call
/// `sink.remove` themselves since this helper has no sink handle).
async fn finish_job(
    jobs: &AsyncMutex<HashMap<String, Job>>,
    history: &AsyncMutex<BoundedRingBuffer<Job>>,
    stats: &AsyncMutex<HashMap<String, ExecutionStats>>,
    job_id: &str,
    status: JobStatus,
    error: Option<String>,
) {
    let mut jobs_guard = jobs.lock().await;
    let Some(mut job) = jobs_guard.remove(job_id) else {
        return;
    };
    drop(jobs_guard);

    let job_stats = stats.lock().await.get(job_id).copied().unwrap_or_default();
    job.status = status;
    job.timestamps.completed_at = Some(Utc::now());
    job.execution_result = Some(ExecutionResult {
        success: status == JobStatus::Completed,
        stats: job_stats,
        error,
    });
    history.lock().await.push(job);
}

#[allow(clippy::too_many_arguments)]
async fn autosave_loop(
    sink: Arc<dyn JobStateSink>,
    controller: Controller,
    jobs: Arc<AsyncMutex<HashMap<String, Job>>>,
    stats: Arc<AsyncMutex<HashMap<String, ExecutionStats>>>,
    paused_positions: Arc<AsyncMutex<HashMap<String, Position>>>,
    job_id: String,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snapshot = {
            let jobs = jobs.lock().await;
            let Some(job) = jobs.get(&job_id) else { return };
            if job.status.is_terminal() {
                return;
            }
            let job_stats = stats.lock().await.get(&job_id).copied().unwrap_or_default();
            let paused_position = paused_positions.lock().await.get(&job_id).copied();
            JobState {
                job_id: job_id.clone(),
                progress_percent: job.progress_percent,
                status: job.status,
                paused: job.status == JobStatus::Paused,
                last_known_position: None,
                paused_position,
                stats: job_stats,
                blocks_executed: job_stats.blocks_executed,
                saved_at_ms: now_ms(),
            }
        };
        let mut snapshot = snapshot;
        snapshot.last_known_position = controller.last_known_position().await;
        if let Err(err) = sink.save(SnapshotKind::Autosave, &snapshot).await {
            warn!(%err, job_id, "job autosave failed");
        }
    }
}

/// Write a one-off crash-recovery snapshot at the moment a job is stopped, so
/// `resume_after_crash` has something fresher than the last autosave tick.
async fn snapshot_and_save(
    sink: &Arc<dyn JobStateSink>,
    controller: &Controller,
    history: &AsyncMutex<BoundedRingBuffer<Job>>,
    paused_positions: &AsyncMutex<HashMap<String, Position>>,
    job_id: &str,
) {
    let job = {
        let history = history.lock().await;
        history.to_vec().into_iter().rev().find(|job| job.id == job_id)
    };
    let Some(job) = job else { return };
    let Some(execution_result) = job.execution_result.clone() else {
        return;
    };
    let paused_position = paused_positions.lock().await.get(job_id).copied();
    let state = JobState {
        job_id: job_id.to_string(),
        progress_percent: job.progress_percent,
        status: job.status,
        paused: false,
        last_known_position: controller.last_known_position().await,
        paused_position,
        stats: execution_result.stats,
        blocks_executed: execution_result.stats.blocks_executed,
        saved_at_ms: now_ms(),
    };
    if let Err(err) = sink.save(SnapshotKind::CrashRecovery { epoch_secs: now_ms() / 1000 }, &state).await {
        warn!(%err, job_id, "crash-recovery snapshot failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use crate::transport::LoopbackTransport;
    use grbl_core::persistence::MemorySink;
    use std::sync::Arc as StdArc;

    async fn controller_with(lines: Vec<&'static str>) -> (Controller, StdArc<LoopbackTransport>) {
        let transport = LoopbackTransport::new();
        let controller = Controller::new(transport.clone(), ControllerConfig::default());
        controller.connect().await.unwrap();
        let transport_clone = transport.clone();
        tokio::spawn(async move {
            for line in lines {
                transport_clone.push_line(line).await;
                tokio::task::yield_now().await;
            }
        });
        (controller, transport)
    }

    fn feed_lines(count: usize) -> Vec<&'static str> {
        // Preamble (4 lines) + N block acks, all acked with a bare "ok".
        std::iter::repeat("ok").take(4 + count).collect()
    }

    #[tokio::test]
    async fn load_job_in_strict_mode_rejects_invalid_gcode() {
        let (controller, _transport) = controller_with(vec![]).await;
        let runner = JobRunner::new(controller, JobRunnerConfig::default(), Arc::new(MemorySink::default()));
        let err = runner
            .load_job("bad.nc".to_string(), "G0 X".to_string(), JobOptions::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::InvalidGCode(_)));
    }

    #[tokio::test]
    async fn happy_path_job_runs_to_completion() {
        let (controller, _transport) = controller_with(feed_lines(3)).await;
        let runner = JobRunner::new(controller, JobRunnerConfig::default(), Arc::new(MemorySink::default()));
        let id = runner
            .load_job(
                "square.nc".to_string(),
                "G0 X10 Y10\nG1 Z-5 F100\nG0 X0 Y0".to_string(),
                JobOptions::default(),
                true,
            )
            .await
            .unwrap();

        runner.start_job(&id).await.unwrap();

        for _ in 0..200 {
            if let Some(job) = runner.get_job_history().await.into_iter().find(|j| j.id == id) {
                assert_eq!(job.status, JobStatus::Completed);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not complete");
    }

    #[tokio::test]
    async fn failed_job_resumes_after_crash_and_completes() {
        let transport = LoopbackTransport::new();
        let controller = Controller::new(transport.clone(), ControllerConfig::default());
        controller.connect().await.unwrap();
        let sink = Arc::new(MemorySink::default());
        let runner = JobRunner::new(controller.clone(), JobRunnerConfig::default(), sink.clone());

        let id = runner
            .load_job(
                "square.nc".to_string(),
                "G0 X10 Y10\nG1 Z-5 F100\nG0 X0 Y0".to_string(),
                JobOptions {
                    stop_on_error: true,
                    ..JobOptions::default()
                },
                true,
            )
            .await
            .unwrap();

        // Preamble (4 ok) + block 1 ok, then the transport stops responding
        // so block 2's send times out and the job fails.
        let transport_clone = transport.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                transport_clone.push_line("ok").await;
                tokio::task::yield_now().await;
            }
        });

        runner.start_job(&id).await.unwrap();

        let failed = loop {
            if let Some(job) = runner.get_job_history().await.into_iter().find(|j| j.id == id) {
                break job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(failed.status, JobStatus::Failed);

        sink.save(
            SnapshotKind::Autosave,
            &JobState {
                job_id: id.clone(),
                progress_percent: failed.progress_percent,
                status: JobStatus::Failed,
                paused: false,
                last_known_position: None,
                paused_position: Some(Position::ORIGIN),
                stats: failed.execution_result.as_ref().unwrap().stats,
                blocks_executed: failed.execution_result.as_ref().unwrap().stats.blocks_executed,
                saved_at_ms: 0,
            },
        )
        .await
        .unwrap();

        let transport_clone = transport.clone();
        tokio::spawn(async move {
            // recovery moves (raise, $X, move-over, descend) + remaining blocks
            for _ in 0..6 {
                transport_clone.push_line("ok").await;
                tokio::task::yield_now().await;
            }
        });

        runner.resume_after_crash(&id).await.unwrap();

        for _ in 0..200 {
            if let Some(job) = runner.get_job_history().await.into_iter().find(|j| j.id == id) {
                if job.status == JobStatus::Completed {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not resume to completion");
    }
}
