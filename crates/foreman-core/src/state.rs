use crate::error::{ForemanError, Result};
use crate::{io, paths};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    AwaitingHuman,
    Completed,
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::AwaitingHuman => "awaiting_human",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Audit records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub step: u32,
    pub iteration: u32,
    pub id: String,
    pub summary: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    NoChange,
    Cosmetic,
    Substantive,
    Enforced,
    Timeout,
    Held,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub step: u32,
    pub iteration: u32,
    pub outcome: IterationOutcome,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    /// 0-based position in the step catalog.
    pub step_index: usize,
    /// Iteration within the current step, reset on advance.
    pub iteration: u32,
    pub no_change_streak: u32,
    pub total_commits: u32,
    /// Per current step, reset on advance.
    pub enforcement_attempts: u32,
    /// Watchdog error-restart tally for the whole run.
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_stash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub commits: Vec<CommitRecord>,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
}

impl RunState {
    pub fn new(vars: BTreeMap<String, String>) -> Self {
        let now = Utc::now();
        let short = Uuid::new_v4().simple().to_string();
        Self {
            run_id: format!("run-{}-{}", now.format("%Y%m%d-%H%M%S"), &short[..8]),
            status: RunStatus::Running,
            step_index: 0,
            iteration: 0,
            no_change_streak: 0,
            total_commits: 0,
            enforcement_attempts: 0,
            error_count: 0,
            recovery_stash: None,
            escalation_reason: None,
            started_at: now,
            updated_at: now,
            vars,
            commits: Vec::new(),
            iterations: Vec::new(),
        }
    }

    /// 1-based step number for display and commit labels.
    pub fn step_display(&self) -> u32 {
        self.step_index as u32 + 1
    }

    pub fn record_iteration(&mut self, outcome: IterationOutcome) {
        self.iterations.push(IterationRecord {
            step: self.step_display(),
            iteration: self.iteration,
            outcome,
            at: Utc::now(),
        });
    }

    pub fn record_commit(&mut self, id: String, summary: String) {
        self.commits.push(CommitRecord {
            step: self.step_display(),
            iteration: self.iteration,
            id,
            summary,
            at: Utc::now(),
        });
        self.total_commits += 1;
    }

    /// Move to the next step, resetting all per-step counters.
    pub fn advance_step(&mut self) {
        self.step_index += 1;
        self.iteration = 0;
        self.no_change_streak = 0;
        self.enforcement_attempts = 0;
    }

    pub fn escalate(&mut self, reason: impl Into<String>) {
        self.status = RunStatus::AwaitingHuman;
        self.escalation_reason = Some(reason.into());
    }
}

// ---------------------------------------------------------------------------
// RunLock
// ---------------------------------------------------------------------------

/// Advisory single-writer lock, one file per run plus one for the whole
/// project so concurrent supervisors of different runs still contend. Each
/// lock file holds the owner pid and run id; both files are removed when
/// the guard drops.
#[derive(Debug)]
pub struct RunLock {
    paths: Vec<PathBuf>,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: state_dir.into(),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Persist a snapshot. The previous snapshot (if any) becomes the rolling
    /// backup before the primary is replaced atomically, so a crash at any
    /// point leaves a readable state on disk.
    pub fn save(&self, state: &mut RunState) -> Result<()> {
        state.updated_at = Utc::now();
        let path = paths::snapshot_path(&self.dir, &state.run_id);
        if path.exists() {
            let backup = paths::backup_path(&self.dir, &state.run_id);
            std::fs::copy(&path, &backup).map_err(|e| {
                ForemanError::PersistenceFailure(format!(
                    "backup of {}: {e}",
                    path.display()
                ))
            })?;
        }
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| ForemanError::PersistenceFailure(format!("serialize: {e}")))?;
        io::atomic_write(&path, &data)
            .map_err(|e| ForemanError::PersistenceFailure(format!("write {}: {e}", path.display())))
    }

    /// Load a snapshot, falling back to the rolling backup when the primary
    /// is missing or unreadable.
    pub fn load(&self, run_id: &str) -> Result<RunState> {
        let path = paths::snapshot_path(&self.dir, run_id);
        match Self::read_snapshot(&path) {
            Ok(state) => Ok(state),
            Err(primary_err) => {
                let backup = paths::backup_path(&self.dir, run_id);
                if backup.exists() {
                    tracing::warn!(
                        run_id,
                        error = %primary_err,
                        "primary snapshot unreadable, loading backup"
                    );
                    Self::read_snapshot(&backup)
                } else if path.exists() {
                    Err(primary_err)
                } else {
                    Err(ForemanError::NoRunFound)
                }
            }
        }
    }

    fn read_snapshot(path: &std::path::Path) -> Result<RunState> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Run ids with a snapshot on disk, most recently written first.
    pub fn list_runs(&self) -> Result<Vec<String>> {
        let runs = paths::runs_dir(&self.dir);
        if !runs.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<(String, std::time::SystemTime)> = Vec::new();
        for entry in std::fs::read_dir(&runs)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            entries.push((id.to_string(), modified));
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(entries.into_iter().map(|(id, _)| id).collect())
    }

    pub fn latest(&self) -> Result<Option<String>> {
        Ok(self.list_runs()?.into_iter().next())
    }

    /// Acquire the exclusive writer lock for a run. Only one run may be
    /// supervised per project, so this takes a project-wide lock first and
    /// the per-run lock second; either being held by another live process
    /// fails with `LockHeld` naming the holder.
    pub fn acquire(&self, run_id: &str) -> Result<RunLock> {
        io::ensure_dir(&paths::runs_dir(&self.dir))?;
        let project = paths::project_lock_path(&self.dir);
        create_lock(&project, run_id)?;
        let run = paths::lock_path(&self.dir, run_id);
        if let Err(e) = create_lock(&run, run_id) {
            let _ = std::fs::remove_file(&project);
            return Err(e);
        }
        Ok(RunLock {
            paths: vec![run, project],
        })
    }

    /// Operator override for locks left behind by a dead process.
    pub fn break_lock(&self, run_id: &str) -> Result<bool> {
        let mut removed = false;
        let run = paths::lock_path(&self.dir, run_id);
        if run.exists() {
            std::fs::remove_file(&run)?;
            removed = true;
        }
        let project = paths::project_lock_path(&self.dir);
        if let Some((_, holder)) = read_lock(&project) {
            if holder == run_id {
                std::fs::remove_file(&project)?;
                removed = true;
            }
        }
        Ok(removed)
    }

    /// Remove snapshots and locks; rolling backups are kept.
    pub fn clear(&self) -> Result<()> {
        let runs = paths::runs_dir(&self.dir);
        if !runs.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&runs)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") || name.ends_with(".lock") {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Create a lock file holding `<pid> <run_id>`, or report the holder.
fn create_lock(path: &Path, run_id: &str) -> Result<()> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut f) => {
            let _ = write!(f, "{} {run_id}", std::process::id());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let (pid, holder) = read_lock(path)
                .unwrap_or_else(|| (String::new(), run_id.to_string()));
            Err(ForemanError::LockHeld {
                run_id: holder,
                pid,
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn read_lock(path: &Path) -> Option<(String, String)> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut parts = content.split_whitespace();
    let pid = parts.next()?.to_string();
    let run_id = parts.next().unwrap_or_default().to_string();
    Some((pid, run_id))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join(".foreman"));
        (dir, store)
    }

    #[test]
    fn save_load_roundtrip() {
        let (_dir, store) = store();
        let mut state = RunState::new(BTreeMap::new());
        state.step_index = 2;
        state.iteration = 4;
        state.no_change_streak = 1;
        store.save(&mut state).unwrap();
        let loaded = store.load(&state.run_id).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn second_save_creates_rolling_backup() {
        let (_dir, store) = store();
        let mut state = RunState::new(BTreeMap::new());
        store.save(&mut state).unwrap();
        state.iteration = 1;
        store.save(&mut state).unwrap();
        let backup = paths::backup_path(store.dir(), &state.run_id);
        assert!(backup.exists());
        let prior: RunState =
            serde_json::from_str(&std::fs::read_to_string(&backup).unwrap()).unwrap();
        assert_eq!(prior.iteration, 0);
    }

    #[test]
    fn load_falls_back_to_backup_when_primary_corrupt() {
        let (_dir, store) = store();
        let mut state = RunState::new(BTreeMap::new());
        store.save(&mut state).unwrap();
        state.iteration = 7;
        store.save(&mut state).unwrap();
        let primary = paths::snapshot_path(store.dir(), &state.run_id);
        std::fs::write(&primary, b"{ not json").unwrap();
        let loaded = store.load(&state.run_id).unwrap();
        assert_eq!(loaded.iteration, 0);
    }

    #[test]
    fn failed_save_leaves_previous_snapshot_intact() {
        let (_dir, store) = store();
        let mut state = RunState::new(BTreeMap::new());
        store.save(&mut state).unwrap();
        // Occupy the backup path with a directory so the next save fails
        // before it can touch the primary.
        let backup = paths::backup_path(store.dir(), &state.run_id);
        std::fs::create_dir_all(&backup).unwrap();
        state.iteration = 9;
        let err = store.save(&mut state).unwrap_err();
        assert!(matches!(err, ForemanError::PersistenceFailure(_)));
        let on_disk = store.load(&state.run_id).unwrap();
        assert_eq!(on_disk.iteration, 0);
    }

    #[test]
    fn missing_run_is_no_run_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load("run-unknown"),
            Err(ForemanError::NoRunFound)
        ));
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let (_dir, store) = store();
        let lock = store.acquire("run-a").unwrap();
        let err = store.acquire("run-a").unwrap_err();
        assert!(matches!(err, ForemanError::LockHeld { .. }));
        drop(lock);
        store.acquire("run-a").unwrap();
    }

    #[test]
    fn a_second_run_contends_on_the_project_lock() {
        let (_dir, store) = store();
        let lock = store.acquire("run-a").unwrap();
        // Different run id, same project: still exactly one supervisor.
        let err = store.acquire("run-b").unwrap_err();
        assert!(
            matches!(err, ForemanError::LockHeld { ref run_id, .. } if run_id == "run-a")
        );
        drop(lock);
        store.acquire("run-b").unwrap();
    }

    #[test]
    fn break_lock_removes_stale_lock() {
        let (_dir, store) = store();
        let lock = store.acquire("run-a").unwrap();
        std::mem::forget(lock);
        assert!(store.break_lock("run-a").unwrap());
        store.acquire("run-a").unwrap();
    }

    #[test]
    fn list_runs_newest_first() {
        let (_dir, store) = store();
        let mut a = RunState::new(BTreeMap::new());
        a.run_id = "run-a".to_string();
        store.save(&mut a).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut b = RunState::new(BTreeMap::new());
        b.run_id = "run-b".to_string();
        store.save(&mut b).unwrap();
        assert_eq!(store.list_runs().unwrap(), vec!["run-b", "run-a"]);
        assert_eq!(store.latest().unwrap().as_deref(), Some("run-b"));
    }

    #[test]
    fn clear_keeps_backups() {
        let (_dir, store) = store();
        let mut state = RunState::new(BTreeMap::new());
        store.save(&mut state).unwrap();
        state.iteration = 1;
        store.save(&mut state).unwrap();
        store.clear().unwrap();
        assert!(store.list_runs().unwrap().is_empty());
        assert!(paths::backup_path(store.dir(), &state.run_id).exists());
    }

    #[test]
    fn advance_step_resets_per_step_counters() {
        let mut state = RunState::new(BTreeMap::new());
        state.iteration = 5;
        state.no_change_streak = 2;
        state.enforcement_attempts = 3;
        state.total_commits = 4;
        state.advance_step();
        assert_eq!(state.step_index, 1);
        assert_eq!(state.iteration, 0);
        assert_eq!(state.no_change_streak, 0);
        assert_eq!(state.enforcement_attempts, 0);
        assert_eq!(state.total_commits, 4);
    }
}
