pub mod clear;
pub mod resume;
pub mod run;
pub mod runs;
pub mod status;
pub mod steps;

use anyhow::Context;
use foreman_core::config::Config;
use foreman_core::paths;
use foreman_core::state::{RunStatus, StateStore};
use foreman_core::step::StepCatalog;
use std::path::Path;

/// Exit codes shared by `run` and `resume`. Zero is a completed pipeline;
/// anything the operator must look at gets its own code.
pub fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Completed => 0,
        RunStatus::Running => 0,
        RunStatus::AwaitingHuman => 2,
        RunStatus::Aborted => 3,
    }
}

pub fn load_config(project: &Path, override_path: Option<&Path>) -> anyhow::Result<Config> {
    let path = match override_path {
        Some(p) => p.to_path_buf(),
        None => paths::config_path(project),
    };
    Config::load(&path).with_context(|| format!("failed to load {}", path.display()))
}

pub fn load_catalog(project: &Path, config: &Config) -> anyhow::Result<StepCatalog> {
    let path = paths::steps_path(project, &config.steps_file);
    StepCatalog::load(&path).with_context(|| format!("failed to load {}", path.display()))
}

pub fn store_for(project: &Path, config: &Config) -> StateStore {
    StateStore::new(paths::state_dir(project, &config.state_dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_terminal_status() {
        assert_eq!(exit_code(RunStatus::Completed), 0);
        assert_eq!(exit_code(RunStatus::AwaitingHuman), 2);
        assert_eq!(exit_code(RunStatus::Aborted), 3);
    }
}
