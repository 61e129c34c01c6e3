use crate::cmd;
use std::path::Path;

pub fn run(project: &Path, config_path: Option<&Path>) -> anyhow::Result<i32> {
    let config = cmd::load_config(project, config_path)?;
    let store = cmd::store_for(project, &config);
    let runs = store.list_runs()?;
    if runs.is_empty() {
        println!("no runs recorded");
        return Ok(0);
    }
    for run_id in runs {
        match store.load(&run_id) {
            Ok(state) => println!(
                "{run_id}  {}  step {} iter {}  {} commit(s)",
                state.status,
                state.step_display(),
                state.iteration,
                state.total_commits
            ),
            Err(e) => println!("{run_id}  (unreadable: {e})"),
        }
    }
    Ok(0)
}
