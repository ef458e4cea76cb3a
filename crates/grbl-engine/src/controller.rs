//! The facade that owns the transport, the command queue and the safety
//! validator, and tracks expected-position accounting (§4.6).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use grbl_core::journal::{BoundedRingBuffer, CommandJournalEntry};
use grbl_core::persistence::{JobStateSink, NullSink};
use grbl_core::{Coordinates, HostError, JobOptions, MachineState, Position, SoftLimits, SpeedLimits};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{ProtocolCodec, StatusReport};
use crate::events::{EventBus, HostEvent};
use crate::job::runner::{JobRunner, JobRunnerConfig};
use crate::queue::{CommandQueue, CommandResponse, QueueError};
use crate::safety::{SafetyValidator, ValidationOutcome};
use crate::sequences::homing::{HomingResult, HomingSequencer};
use crate::sequences::jogging::{JogResult, JoggingSequencer};
use crate::sequences::probing::{GridProbeResult, ProbeResult, ProbingSequencer};
use crate::transport::{ConnectionSupervisor, Transport};

/// Default interval for `start_status_polling` when the caller doesn't
/// specify one.
const DEFAULT_STATUS_POLL_MS: u64 = 250;
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
const JOURNAL_CAPACITY: usize = 1_000;

/// Construction-time configuration for a [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Host-side travel envelope enforced by the safety validator.
    pub soft_limits: SoftLimits,
    /// Feed/acceleration caps enforced by the safety validator.
    pub speed_limits: SpeedLimits,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            soft_limits: SoftLimits::default(),
            speed_limits: SpeedLimits::default(),
        }
    }
}

struct AccountingState {
    machine_state: MachineState,
    last_known_position: Option<Position>,
    expected_position: Position,
    absolute_mode: bool,
    last_alarm_code: Option<u8>,
    homed: bool,
    journal: BoundedRingBuffer<CommandJournalEntry>,
}

impl Default for AccountingState {
    fn default() -> Self {
        Self {
            machine_state: MachineState::Disconnected,
            last_known_position: None,
            expected_position: Position::ORIGIN,
            absolute_mode: true,
            last_alarm_code: None,
            homed: false,
            journal: BoundedRingBuffer::new(JOURNAL_CAPACITY),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct ControllerInner {
    transport: Arc<ConnectionSupervisor>,
    queue: CommandQueue,
    events: EventBus,
    config: ControllerConfig,
    accounting: AsyncMutex<AccountingState>,
    codec: ProtocolCodec,
    polling: AsyncMutex<Option<JoinHandle<()>>>,
    jog_in_progress: Arc<AtomicBool>,
    /// Encodes `ConnectionQuality` at last observation, exposed for the
    /// recovery supervisor without requiring it to touch the transport.
    quality_hint: AtomicU8,
    /// Lazily constructed so that `stream_gcode` has somewhere to run a job
    /// without every embedding application having to build its own
    /// `JobRunner` just to use that one convenience method.
    job_runner: OnceCell<Arc<JobRunner>>,
}

/// Facade over the transport/queue/safety stack (§4.6). Cheaply cloneable —
/// every clone shares the same inner state, matching the back-reference
/// discipline §9 requires for sequencer construction.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    /// Build a controller around `transport`, not yet connected.
    pub fn new(transport: Arc<dyn Transport>, config: ControllerConfig) -> Self {
        let supervisor = Arc::new(ConnectionSupervisor::new(transport));
        let queue = CommandQueue::new(supervisor.clone());
        Self {
            inner: Arc::new(ControllerInner {
                transport: supervisor,
                queue,
                events: EventBus::new(),
                config,
                accounting: AsyncMutex::new(AccountingState::default()),
                codec: ProtocolCodec,
                polling: AsyncMutex::new(None),
                jog_in_progress: Arc::new(AtomicBool::new(false)),
                quality_hint: AtomicU8::new(0),
                job_runner: OnceCell::new(),
            }),
        }
    }

    /// The event bus subscribers attach to.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Currently configured soft limits.
    pub fn soft_limits(&self) -> SoftLimits {
        self.inner.config.soft_limits
    }

    /// Currently configured speed limits.
    pub fn speed_limits(&self) -> SpeedLimits {
        self.inner.config.speed_limits
    }

    /// Open the transport and emit `connected`.
    pub async fn connect(&self) -> Result<(), HostError> {
        self.inner.transport.connect().await.map_err(HostError::from)?;
        self.inner.events.emit(HostEvent::Connected);
        info!("controller connected");
        Ok(())
    }

    /// Tear down the transport and emit `disconnected`.
    pub async fn disconnect(&self) {
        self.stop_status_polling().await;
        self.inner.transport.disconnect().await;
        self.inner.events.emit(HostEvent::Disconnected);
        info!("controller disconnected");
    }

    /// Whether the link is currently usable.
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// The most recent status report's `MachineState`, if any has arrived.
    pub async fn machine_state(&self) -> MachineState {
        self.inner.accounting.lock().await.machine_state
    }

    /// The most recently observed alarm code, if any.
    pub async fn last_alarm_code(&self) -> Option<u8> {
        self.inner.accounting.lock().await.last_alarm_code
    }

    /// Validate, account for, journal, and dispatch one line command.
    pub async fn send(&self, line: &str, timeout: Option<Duration>) -> Result<CommandResponse, HostError> {
        let (limits, speed) = (self.inner.config.soft_limits, self.inner.config.speed_limits);
        let current = {
            let accounting = self.inner.accounting.lock().await;
            accounting.expected_position
        };

        match SafetyValidator::validate(line, &limits, &speed, current) {
            ValidationOutcome::Invalid(reason) => {
                let err = HostError::SafetyViolation(format!("{line}: {reason}"));
                self.inner.events.emit(HostEvent::Error(err.to_string()));
                return Err(err);
            }
            ValidationOutcome::Warn(message) => {
                self.inner.events.emit(HostEvent::Warning(message));
            }
            ValidationOutcome::Valid => {}
        }

        self.account_motion(line).await;

        let response = self
            .inner
            .queue
            .execute(line, timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT))
            .await
            .map_err(|err: QueueError| {
                let host_err: HostError = err.into();
                self.inner.events.emit(HostEvent::Error(host_err.to_string()));
                host_err
            })?;

        if let Some(err) = self.observe_response(&response).await {
            self.inner.events.emit(HostEvent::Error(err.to_string()));
            return Err(err);
        }
        Ok(response)
    }

    async fn account_motion(&self, line: &str) {
        let trimmed = line.trim();
        let mut accounting = self.inner.accounting.lock().await;
        let before = accounting.expected_position;

        if trimmed.contains("G90") {
            accounting.absolute_mode = true;
        }
        if trimmed.contains("G91") {
            accounting.absolute_mode = false;
        }

        let coordinates = extract_coordinates(trimmed);
        let is_jog = trimmed.starts_with("$J=");
        let is_motion = is_jog
            || ["G0", "G1", "G2", "G3"]
                .iter()
                .any(|prefix| first_word(trimmed) == *prefix);

        if is_motion {
            if is_jog || !accounting.absolute_mode {
                accounting.expected_position = Position::new(
                    accounting.expected_position.x + coordinates.x.unwrap_or(0.0),
                    accounting.expected_position.y + coordinates.y.unwrap_or(0.0),
                    accounting.expected_position.z + coordinates.z.unwrap_or(0.0),
                );
            } else {
                let mut pos = accounting.expected_position;
                if let Some(x) = coordinates.x {
                    pos.x = x;
                }
                if let Some(y) = coordinates.y {
                    pos.y = y;
                }
                if let Some(z) = coordinates.z {
                    pos.z = z;
                }
                accounting.expected_position = pos;
            }
        }

        let after = accounting.expected_position;
        let delta = if is_motion {
            Some(Position::new(after.x - before.x, after.y - before.y, after.z - before.z))
        } else {
            None
        };
        accounting.journal.push(CommandJournalEntry {
            command: trimmed.to_string(),
            timestamp_ms: now_ms(),
            expected_position_delta: delta,
        });
    }

    /// Ingest every collected line, returning the device's `error:<n>` as a
    /// `HardwareError` if one surfaced. Alarms are events only (§7) — only
    /// `error:` lines fail the command.
    async fn observe_response(&self, response: &CommandResponse) -> Option<HostError> {
        let mut failure = None;
        for line in &response.lines {
            match self.inner.codec.classify(line) {
                crate::codec::LineKind::Status(status) => self.ingest_status(status, line).await,
                crate::codec::LineKind::Probe(_) => {}
                crate::codec::LineKind::Alarm(alarm) => {
                    self.inner.accounting.lock().await.last_alarm_code = Some(alarm.code);
                    warn!(code = alarm.code, "alarm observed");
                    self.inner.events.emit(HostEvent::Alarm(alarm));
                }
                crate::codec::LineKind::Error(error) => {
                    warn!(code = error.code, "device reported error");
                    failure.get_or_insert_with(|| {
                        HostError::HardwareError(format!("error:{} {}", error.code, error.message))
                    });
                }
                crate::codec::LineKind::Ok | crate::codec::LineKind::Other(_) => {}
            }
        }
        failure
    }

    async fn ingest_status(&self, status: StatusReport, raw: &str) {
        let mut accounting = self.inner.accounting.lock().await;
        accounting.machine_state = status.state;
        if let Some(position) = status.machine_position {
            accounting.last_known_position = Some(position);
        }
        drop(accounting);
        self.inner.events.emit(HostEvent::Status(status));
        self.inner.events.emit(HostEvent::StatusUpdate(raw.to_string()));
    }

    /// Send `?` and decode the reply.
    pub async fn get_status(&self) -> Result<StatusReport, HostError> {
        let response = self
            .inner
            .queue
            .execute("?", DEFAULT_COMMAND_TIMEOUT)
            .await
            .map_err(HostError::from)?;
        let status = ProtocolCodec::parse_status(response.terminator())
            .ok_or_else(|| HostError::HardwareError("unparsable status reply".to_string()))?;
        self.ingest_status(status, response.terminator()).await;
        Ok(status)
    }

    /// `|expected − last_known| > 0.1 mm on any axis`, or `false` if no
    /// status has arrived yet.
    pub async fn check_position_mismatch(&self) -> bool {
        let accounting = self.inner.accounting.lock().await;
        match accounting.last_known_position {
            Some(last_known) => !accounting.expected_position.within_tolerance(last_known),
            None => false,
        }
    }

    /// Best-effort recurring `?`; polling errors are swallowed. Default
    /// interval 250 ms.
    pub async fn start_status_polling(&self, interval_ms: Option<u64>) {
        self.stop_status_polling().await;
        let interval = Duration::from_millis(interval_ms.unwrap_or(DEFAULT_STATUS_POLL_MS));
        let controller = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !controller.is_connected() {
                    continue;
                }
                if let Err(err) = controller.get_status().await {
                    debug!(%err, "status poll failed");
                }
            }
        });
        *self.inner.polling.lock().await = Some(handle);
    }

    /// Stop the recurring poll started by `start_status_polling`, if any.
    pub async fn stop_status_polling(&self) {
        if let Some(handle) = self.inner.polling.lock().await.take() {
            handle.abort();
        }
    }

    /// Raw `0x18`, clears the queue, emits `emergency_stop`. Never fails.
    pub async fn emergency_stop(&self) {
        let _ = self.inner.transport.send(&[0x18]).await;
        self.inner.queue.clear();
        self.inner.events.emit(HostEvent::EmergencyStop);
        warn!("emergency stop issued");
    }

    /// Raw `!`.
    pub async fn feed_hold(&self) -> Result<(), HostError> {
        self.inner.transport.send(b"!").await?;
        self.inner.events.emit(HostEvent::FeedHold);
        Ok(())
    }

    /// Raw `0x18`, waits 1 s, clears the queue.
    pub async fn soft_reset(&self) -> Result<(), HostError> {
        self.inner.transport.send(&[0x18]).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.inner.queue.clear();
        self.inner.events.emit(HostEvent::SoftReset);
        Ok(())
    }

    /// Feed-hold + soft reset, or an emergency stop, depending on `emergency`.
    pub async fn stop_job(&self, emergency: bool) {
        if emergency {
            self.emergency_stop().await;
        } else {
            if let Err(err) = self.feed_hold().await {
                warn!(%err, "feed hold failed during stop_job");
            }
            if let Err(err) = self.soft_reset().await {
                warn!(%err, "soft reset failed during stop_job");
            }
        }
    }

    /// Acquire the single-outstanding-jog guard (§9); returns `None` if a
    /// jog is already in progress.
    pub(crate) fn try_acquire_jog_guard(&self) -> Option<JogGuard> {
        if self
            .inner
            .jog_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(JogGuard {
                flag: self.inner.jog_in_progress.clone(),
            })
        } else {
            None
        }
    }

    /// Queue length, for diagnostics.
    pub fn queued_commands(&self) -> usize {
        self.inner.queue.len()
    }

    /// Snapshot of the command journal, oldest first.
    pub async fn journal(&self) -> Vec<CommandJournalEntry> {
        self.inner.accounting.lock().await.journal.to_vec()
    }

    /// The host's current best guess of machine position, derived from
    /// emitted motion rather than a status report.
    pub async fn expected_position(&self) -> Position {
        self.inner.accounting.lock().await.expected_position
    }

    /// The position from the most recent status report, if any has arrived.
    pub async fn last_known_position(&self) -> Option<Position> {
        self.inner.accounting.lock().await.last_known_position
    }

    /// Whether a homing cycle has completed successfully since connecting.
    pub async fn is_homed(&self) -> bool {
        self.inner.accounting.lock().await.homed
    }

    /// Record the outcome of a homing attempt (§4.7); called by the
    /// `HomingSequencer` through `home()`.
    pub(crate) async fn set_homed(&self, homed: bool) {
        self.inner.accounting.lock().await.homed = homed;
    }

    /// Raw `~` (cycle start / resume), bypassing the command queue for
    /// realtime semantics (§9).
    pub async fn cycle_start(&self) -> Result<(), HostError> {
        self.inner.transport.send(b"~").await?;
        Ok(())
    }

    /// Run the homing sequence (§4.7), updating `is_homed` and emitting
    /// `homingStep`/`homingCompleted` as it progresses.
    pub async fn home(&self, axes: Option<Vec<char>>) -> HomingResult {
        let result = HomingSequencer::new(self).home(axes.as_deref()).await;
        for step in &result.steps {
            self.inner.events.emit(HostEvent::HomingStep {
                description: step.description.clone(),
            });
        }
        self.set_homed(result.success).await;
        self.inner.events.emit(HostEvent::HomingCompleted { success: result.success });
        result
    }

    /// Issue a single incremental jog (§4.8).
    pub async fn jog(&self, delta: Coordinates, feed: f64) -> JogResult {
        JoggingSequencer::new(self).jog(delta, feed).await
    }

    /// Issue a single probe along one axis (§4.9).
    pub async fn probe(&self, axis: char, feed: f64, distance: f64) -> ProbeResult {
        ProbingSequencer::new(self).probe(axis, feed, distance).await
    }

    /// Run a grid probe scan (§4.9).
    pub async fn probe_grid(
        &self,
        grid_size: (f64, f64),
        step: f64,
        feed: f64,
    ) -> Result<GridProbeResult, HostError> {
        ProbingSequencer::new(self).probe_grid(grid_size.0, grid_size.1, step, feed).await
    }

    /// The `JobRunner` backing `stream_gcode`, built lazily on first use and
    /// shared across calls.
    pub async fn job_runner(&self) -> Arc<JobRunner> {
        self.inner
            .job_runner
            .get_or_init(|| async {
                JobRunner::new(self.clone(), JobRunnerConfig::default(), Arc::new(NullSink))
            })
            .await
            .clone()
    }

    /// Convenience that loads `source` as a job and starts it immediately.
    pub async fn stream_gcode(&self, source: &str) -> Result<(), HostError> {
        let runner = self.job_runner().await;
        let id = runner
            .load_job("stream".to_string(), source.to_string(), JobOptions::default(), false)
            .await?;
        runner.start_job(&id).await
    }
}

/// RAII guard releasing the at-most-one-jog flag on drop, even on panic or
/// early return (§9's strengthening of the spec's "weakly enforced" flag).
pub(crate) struct JogGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for JogGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn first_word(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

fn extract_coordinates(line: &str) -> Coordinates {
    let mut coordinates = Coordinates::default();
    for token in line.split_whitespace() {
        let mut chars = token.chars();
        let Some(letter) = chars.next() else { continue };
        let rest: String = chars.collect();
        let Ok(value) = rest.parse::<f64>() else { continue };
        match letter.to_ascii_uppercase() {
            'X' => coordinates.x = Some(value),
            'Y' => coordinates.y = Some(value),
            'Z' => coordinates.z = Some(value),
            _ => {}
        }
    }
    coordinates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn controller() -> (Controller, Arc<LoopbackTransport>) {
        let transport = LoopbackTransport::new();
        let controller = Controller::new(transport.clone(), ControllerConfig::default());
        (controller, transport)
    }

    #[tokio::test]
    async fn send_rejects_unsafe_travel_without_touching_transport() {
        let (controller, transport) = controller();
        controller.connect().await.unwrap();
        let err = controller.send("G0 X1000", None).await.unwrap_err();
        assert!(matches!(err, HostError::SafetyViolation(_)));
        assert!(transport.written().await.is_empty());
    }

    #[tokio::test]
    async fn send_accounts_absolute_motion() {
        let (controller, transport) = controller();
        controller.connect().await.unwrap();

        let transport_clone = transport.clone();
        tokio::spawn(async move {
            transport_clone.push_line("ok").await;
        });
        controller.send("G90", None).await.unwrap();

        let transport_clone = transport.clone();
        tokio::spawn(async move {
            transport_clone.push_line("ok").await;
        });
        controller.send("G0 X10 Y20", None).await.unwrap();

        let journal = controller.journal().await;
        let last = journal.last().unwrap();
        assert_eq!(last.expected_position_delta, Some(Position::new(10.0, 20.0, 0.0)));
    }

    #[tokio::test]
    async fn emergency_stop_clears_queue_and_never_fails() {
        let (controller, _transport) = controller();
        controller.connect().await.unwrap();
        controller.emergency_stop().await;
        assert_eq!(controller.queued_commands(), 0);
    }
}
