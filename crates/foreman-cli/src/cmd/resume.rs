use crate::{cmd, notify::Notifier, output::ConsoleSink};
use anyhow::{bail, Context};
use foreman_core::analyzer::ResponseAnalyzer;
use foreman_core::orchestrator::{Collaborators, Orchestrator};
use foreman_core::recovery;
use foreman_core::state::RunStatus;
use foreman_core::vcs::GitCli;
use std::path::Path;
use tmux_agent::TmuxBackend;

pub async fn run(project: &Path, config_path: Option<&Path>, discard: bool) -> anyhow::Result<i32> {
    let config = cmd::load_config(project, config_path)?;
    let catalog = cmd::load_catalog(project, &config)?;
    let store = cmd::store_for(project, &config);

    let run_id = store.latest()?.context("no runs to resume")?;
    let mut state = store.load(&run_id)?;
    if state.status == RunStatus::Completed {
        bail!("run {run_id} already completed, start a new one with `foreman run`");
    }
    let _lock = store.acquire(&run_id)?;
    println!(
        "resuming {run_id} at step {}, iteration {} (was {})",
        state.step_display(),
        state.iteration,
        state.status
    );

    let vcs = GitCli::new(project).with_dry_run(config.git.dry_run);
    let sink = ConsoleSink;

    // Work left in the tree by a crash mid-iteration gets parked first, so
    // the discard/restore decision below covers it too.
    recovery::stash_if_dirty(&vcs, &mut state, &sink).await?;

    let initial_prompt = if discard {
        if recovery::discard(&vcs, &mut state, &sink).await? {
            println!("recovery stash discarded, restarting the step from scratch");
        }
        state.iteration = 0;
        state.no_change_streak = 0;
        None
    } else if recovery::restore(&vcs, &mut state, &sink).await?.is_some() {
        match catalog.get(state.step_index) {
            Some(step) => {
                let rendered = step.render_prompt(&state.vars)?;
                Some(recovery::directive_prompt(
                    state.step_display(),
                    &step.name,
                    state.iteration,
                    &rendered,
                ))
            }
            None => None,
        }
    } else {
        None
    };

    state.status = RunStatus::Running;
    state.escalation_reason = None;
    state.enforcement_attempts = 0;
    store.save(&mut state).context("could not persist resumed state")?;

    let router = foreman_providers::build_router(&config)?;
    let analyzer = ResponseAnalyzer::new(router);
    let session = TmuxBackend::new(project, config.session.clone());
    let notifier = Notifier::from_config(config.notify.as_ref());
    let abort = cmd::run::abort_channel();

    let mut orchestrator = Orchestrator::new(
        config,
        catalog,
        analyzer,
        Collaborators {
            session: Box::new(session),
            vcs: Box::new(vcs),
            sink: Box::new(sink),
        },
        store,
        abort,
    );
    let status = orchestrator.run(&mut state, initial_prompt).await?;
    notifier.run_finished(&state).await;
    Ok(cmd::exit_code(status))
}
