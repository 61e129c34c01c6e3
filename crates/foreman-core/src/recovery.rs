use crate::error::Result;
use crate::events::{EventSink, ProgressEvent};
use crate::state::RunState;
use crate::vcs::VersionControl;
use chrono::{DateTime, Utc};

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Label for a recovery stash. Grep-able in `git stash list` and unique
/// enough to find the right entry after a crash.
pub fn stash_label(step: u32, iteration: u32, at: DateTime<Utc>) -> String {
    format!(
        "foreman-recovery step{step} iter{iteration} {}",
        at.format("%Y-%m-%dT%H:%M:%SZ")
    )
}

/// Park uncommitted work from an interrupted run so the loop starts from a
/// clean tree. The label is recorded in the run state; nothing is lost even
/// if the process dies again right after.
pub async fn stash_if_dirty(
    vcs: &dyn VersionControl,
    state: &mut RunState,
    sink: &dyn EventSink,
) -> Result<Option<String>> {
    if state.recovery_stash.is_some() {
        // Unresolved parked work already exists; stacking a second stash on
        // top of it would make the pop ambiguous.
        return Ok(None);
    }
    let status = vcs.status().await?;
    if status.is_clean() {
        return Ok(None);
    }
    let label = stash_label(state.step_display(), state.iteration, Utc::now());
    vcs.stash(&label).await?;
    state.recovery_stash = Some(label.clone());
    tracing::info!(%label, files = status.entries.len(), "stashed uncommitted work");
    sink.emit(&ProgressEvent::RecoveryStashed {
        stash: label.clone(),
    });
    Ok(Some(label))
}

/// Bring parked work back before resuming. Returns the popped label so the
/// first prompt can tell the agent what happened.
pub async fn restore(
    vcs: &dyn VersionControl,
    state: &mut RunState,
    sink: &dyn EventSink,
) -> Result<Option<String>> {
    let Some(label) = state.recovery_stash.take() else {
        return Ok(None);
    };
    vcs.stash_pop(&label).await?;
    tracing::info!(%label, "restored stashed work");
    sink.emit(&ProgressEvent::RecoveryApplied {
        stash: label.clone(),
    });
    Ok(Some(label))
}

/// Drop parked work instead of restoring it.
pub async fn discard(
    vcs: &dyn VersionControl,
    state: &mut RunState,
    sink: &dyn EventSink,
) -> Result<bool> {
    let Some(label) = state.recovery_stash.take() else {
        return Ok(false);
    };
    vcs.stash_drop(&label).await?;
    tracing::info!(%label, "discarded stashed work");
    sink.emit(&ProgressEvent::RecoveryApplied {
        stash: format!("{label} (discarded)"),
    });
    Ok(true)
}

/// First prompt after a resume that restored work. The agent sees what was
/// interrupted and is told to reconcile before continuing.
pub fn directive_prompt(
    step: u32,
    step_name: &str,
    iteration: u32,
    step_prompt: &str,
) -> String {
    format!(
        "A previous supervised run was interrupted during step {step} (\"{step_name}\"), \
         iteration {iteration}. Uncommitted work from that session has been restored to \
         the working tree. Review the tree, reconcile it with the task below, and \
         continue from where things actually stand rather than starting over.\n\n\
         {step_prompt}"
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
