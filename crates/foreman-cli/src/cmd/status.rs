use crate::cmd;
use crate::output::print_json;
use anyhow::Context;
use std::path::Path;

pub fn run(project: &Path, config_path: Option<&Path>, json: bool) -> anyhow::Result<i32> {
    let config = cmd::load_config(project, config_path)?;
    let store = cmd::store_for(project, &config);
    let run_id = store
        .latest()?
        .context("no run state found, start one with `foreman run`")?;
    let state = store.load(&run_id)?;

    if json {
        print_json(&state)?;
        return Ok(0);
    }

    println!("run:          {}", state.run_id);
    println!("status:       {}", state.status);
    println!(
        "position:     step {}, iteration {}",
        state.step_display(),
        state.iteration
    );
    println!("streak:       {} no-change confirmation(s)", state.no_change_streak);
    println!("commits:      {}", state.total_commits);
    println!("enforcement:  {} attempt(s) this step", state.enforcement_attempts);
    println!("errors:       {} watchdog restart(s)", state.error_count);
    if let Some(stash) = &state.recovery_stash {
        println!("parked work:  {stash}");
    }
    if let Some(reason) = &state.escalation_reason {
        println!("escalation:   {reason}");
    }
    println!("started:      {}", state.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("updated:      {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(last) = state.commits.last() {
        println!(
            "last commit:  {} (step {}, iteration {}) {}",
            last.id, last.step, last.iteration, last.summary
        );
    }
    Ok(0)
}
