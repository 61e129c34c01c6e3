use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const FOREMAN_DIR: &str = ".foreman";
pub const RUNS_DIR: &str = "runs";
pub const SNAPSHOT_EXT: &str = "json";
pub const BACKUP_EXT: &str = "json.bak";
pub const LOCK_EXT: &str = "lock";
pub const PROJECT_LOCK: &str = "supervisor.lock";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn state_dir(project: &Path, configured: &str) -> PathBuf {
    project.join(configured)
}

pub fn runs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(RUNS_DIR)
}

pub fn snapshot_path(state_dir: &Path, run_id: &str) -> PathBuf {
    runs_dir(state_dir).join(format!("{run_id}.{SNAPSHOT_EXT}"))
}

pub fn backup_path(state_dir: &Path, run_id: &str) -> PathBuf {
    runs_dir(state_dir).join(format!("{run_id}.{BACKUP_EXT}"))
}

pub fn lock_path(state_dir: &Path, run_id: &str) -> PathBuf {
    runs_dir(state_dir).join(format!("{run_id}.{LOCK_EXT}"))
}

pub fn project_lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(PROJECT_LOCK)
}

pub fn config_path(project: &Path) -> PathBuf {
    project.join(crate::config::CONFIG_FILE)
}

pub fn steps_path(project: &Path, configured: &str) -> PathBuf {
    project.join(configured)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
