use crate::{cmd, notify::Notifier, output::ConsoleSink, preflight};
use anyhow::{bail, Context};
use foreman_core::analyzer::ResponseAnalyzer;
use foreman_core::orchestrator::{Collaborators, Orchestrator};
use foreman_core::recovery;
use foreman_core::state::RunState;
use foreman_core::vcs::GitCli;
use std::path::Path;
use tmux_agent::TmuxBackend;
use tokio::sync::watch;

pub async fn run(
    project: &Path,
    config_path: Option<&Path>,
    var_flags: &[String],
    from_step: Option<u32>,
    no_push: bool,
    check: bool,
) -> anyhow::Result<i32> {
    let mut config = cmd::load_config(project, config_path)?;
    if no_push {
        config.git.auto_push = false;
    }

    let mut vars = config.vars.clone();
    for flag in var_flags {
        let (key, value) = parse_var(flag)?;
        vars.insert(key, value);
    }

    let catalog = cmd::load_catalog(project, &config)?;
    if let Some(n) = from_step {
        if n == 0 || n as usize > catalog.len() {
            bail!(
                "--from-step {n} is out of range, the catalog has {} steps",
                catalog.len()
            );
        }
    }

    println!("preflight for {}:", project.display());
    let checks = preflight::run_checks(project, &config, &catalog, &vars);
    preflight::print_report(&checks);
    if !preflight::all_passed(&checks) {
        bail!("preflight failed");
    }
    if check {
        return Ok(0);
    }

    let router = foreman_providers::build_router(&config)?;
    let analyzer = ResponseAnalyzer::new(router);

    let store = cmd::store_for(project, &config);
    let mut state = RunState::new(vars);
    if let Some(n) = from_step {
        state.step_index = (n - 1) as usize;
    }
    let _lock = store.acquire(&state.run_id)?;

    let vcs = GitCli::new(project).with_dry_run(config.git.dry_run);
    let sink = ConsoleSink;

    // A dirty tree at startup is someone else's unfinished work. Park it so
    // the run starts from a clean baseline; `resume` can bring it back.
    recovery::stash_if_dirty(&vcs, &mut state, &sink).await?;
    store.save(&mut state).context("could not persist initial state")?;

    // Run state must never look like agent work to the analyzer's commits.
    foreman_core::io::ensure_gitignore_entry(project, &format!("{}/", config.state_dir))?;

    let session = TmuxBackend::new(project, config.session.clone());
    let notifier = Notifier::from_config(config.notify.as_ref());
    let abort = abort_channel();

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
    let status = orchestrator.run(&mut state, None).await?;
    notifier.run_finished(&state).await;
    Ok(cmd::exit_code(status))
}

/// Abort flips on the first Ctrl-C; the orchestrator observes it between
/// polls and persists before exiting.
pub(crate) fn abort_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, aborting after the current poll");
            let _ = tx.send(true);
        }
    });
    rx
}

fn parse_var(flag: &str) -> anyhow::Result<(String, String)> {
    match flag.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => bail!("--var must be key=value, got '{flag}'"),
    }
}
