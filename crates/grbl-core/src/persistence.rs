use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::job::JobState;

/// Where an autosave or crash-recovery snapshot came from, for naming
/// purposes (§6's two filename conventions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// `autosave_<jobId>.json`, written periodically while a job runs.
    Autosave,
    /// `crash_recovery_<jobId>_<epoch>.json`, written once at the moment a
    /// job is stopped so `resume_after_crash` has something to read even if
    /// the process exits before the next autosave.
    CrashRecovery {
        /// Seconds since the Unix epoch, baked into the filename so repeated
        /// crashes for the same job don't overwrite each other.
        epoch_secs: i64,
    },
}

/// The persistence seam named in §6: "the core does not prescribe a
/// filesystem path." The `JobRunner`'s autosave and crash-recovery logic
/// depend on this trait, not on any concrete storage.
#[async_trait::async_trait]
pub trait JobStateSink: Send + Sync {
    /// Persist `state`, tagged with `kind` for naming/retention purposes.
    async fn save(&self, kind: SnapshotKind, state: &JobState) -> anyhow::Result<()>;

    /// Load the most recently saved state for `job_id`, if any. Prefers a
    /// crash-recovery snapshot over an autosave one when both exist, since
    /// the crash snapshot is written closer to the moment of the stop.
    async fn load(&self, job_id: &str) -> anyhow::Result<Option<JobState>>;

    /// Remove any persisted state for `job_id` (called once a job completes
    /// normally, so a later crash of an unrelated job doesn't trip over it).
    async fn remove(&self, job_id: &str) -> anyhow::Result<()>;
}

/// A [`JobStateSink`] that persists nothing. The `JobRunner` still calls it
/// on schedule (so the autosave/crash-recovery code paths are exercised the
/// same way in tests as in production), it just has nowhere to land.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait::async_trait]
impl JobStateSink for NullSink {
    async fn save(&self, _kind: SnapshotKind, _state: &JobState) -> anyhow::Result<()> {
        Ok(())
    }

    async fn load(&self, _job_id: &str) -> anyhow::Result<Option<JobState>> {
        Ok(None)
    }

    async fn remove(&self, _job_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An in-memory [`JobStateSink`] for tests: behaves like a single-entry
/// store per job id, without touching the filesystem.
#[derive(Debug, Default)]
pub struct MemorySink {
    states: Mutex<std::collections::HashMap<String, JobState>>,
}

#[async_trait::async_trait]
impl JobStateSink for MemorySink {
    async fn save(&self, _kind: SnapshotKind, state: &JobState) -> anyhow::Result<()> {
        self.states
            .lock()
            .expect("memory sink mutex poisoned")
            .insert(state.job_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, job_id: &str) -> anyhow::Result<Option<JobState>> {
        Ok(self
            .states
            .lock()
            .expect("memory sink mutex poisoned")
            .get(job_id)
            .cloned())
    }

    async fn remove(&self, job_id: &str) -> anyhow::Result<()> {
        self.states
            .lock()
            .expect("memory sink mutex poisoned")
            .remove(job_id);
        Ok(())
    }
}

/// The default, convenience [`JobStateSink`]: JSON files under a
/// caller-supplied directory, written atomically (temp file + rename) the
/// same way the corpus this crate is grounded on persists its lease file and
/// its submitter config.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    /// Persist snapshots under `dir`, creating it on first write if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn autosave_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("autosave_{job_id}.json"))
    }

    fn crash_recovery_path(&self, job_id: &str, epoch_secs: i64) -> PathBuf {
        self.dir
            .join(format!("crash_recovery_{job_id}_{epoch_secs}.json"))
    }

    fn path_for(&self, kind: SnapshotKind, job_id: &str) -> PathBuf {
        match kind {
            SnapshotKind::Autosave => self.autosave_path(job_id),
            SnapshotKind::CrashRecovery { epoch_secs } => {
                self.crash_recovery_path(job_id, epoch_secs)
            }
        }
    }

    /// Every crash-recovery file present for `job_id`, newest first.
    fn crash_recovery_candidates(&self, job_id: &str) -> Vec<PathBuf> {
        let prefix = format!("crash_recovery_{job_id}_");
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".json"))
            })
            .collect();
        candidates.sort();
        candidates.reverse();
        candidates
    }
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait::async_trait]
impl JobStateSink for JsonFileSink {
    async fn save(&self, kind: SnapshotKind, state: &JobState) -> anyhow::Result<()> {
        let path = self.path_for(kind, &state.job_id);
        let json = serde_json::to_string_pretty(state)?;
        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|err| anyhow::anyhow!("persist job state: {err:#}"))??;
        Ok(())
    }

    async fn load(&self, job_id: &str) -> anyhow::Result<Option<JobState>> {
        let crash_candidates = self.crash_recovery_candidates(job_id);
        let path = crash_candidates
            .into_iter()
            .next()
            .unwrap_or_else(|| self.autosave_path(job_id));
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let state: JobState = serde_json::from_str(&raw)?;
        Ok(Some(state))
    }

    async fn remove(&self, job_id: &str) -> anyhow::Result<()> {
        let autosave = self.autosave_path(job_id);
        if autosave.exists() {
            std::fs::remove_file(&autosave)?;
        }
        for candidate in self.crash_recovery_candidates(job_id) {
            std::fs::remove_file(candidate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ExecutionStats, JobStatus};

    fn sample_state(job_id: &str) -> JobState {
        JobState {
            job_id: job_id.to_string(),
            progress_percent: 42.0,
            status: JobStatus::Paused,
            paused: true,
            last_known_position: None,
            paused_position: None,
            stats: ExecutionStats::default(),
            blocks_executed: 3,
            saved_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn memory_sink_round_trips() {
        let sink = MemorySink::default();
        sink.save(SnapshotKind::Autosave, &sample_state("job-1"))
            .await
            .unwrap();
        let loaded = sink.load("job-1").await.unwrap().expect("state present");
        assert_eq!(loaded.blocks_executed, 3);
        sink.remove("job-1").await.unwrap();
        assert!(sink.load("job-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_file_sink_prefers_crash_recovery_over_autosave() {
        let dir = std::env::temp_dir().join(format!(
            "grbl-core-persistence-test-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let sink = JsonFileSink::new(&dir);

        let mut autosaved = sample_state("job-2");
        autosaved.blocks_executed = 1;
        sink.save(SnapshotKind::Autosave, &autosaved).await.unwrap();

        let mut crashed = sample_state("job-2");
        crashed.blocks_executed = 7;
        sink.save(SnapshotKind::CrashRecovery { epoch_secs: 100 }, &crashed)
            .await
            .unwrap();

        let loaded = sink.load("job-2").await.unwrap().expect("state present");
        assert_eq!(loaded.blocks_executed, 7);

        sink.remove("job-2").await.unwrap();
        assert!(sink.load("job-2").await.unwrap().is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
