use foreman_core::events::{EventSink, ProgressEvent};
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// ConsoleSink
// ---------------------------------------------------------------------------

/// Renders orchestrator progress as one line per event. Printing never
/// fails the loop; stdout backpressure is the operator's terminal, not ours.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn emit(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { run_id, steps } => {
                println!("run {run_id} started ({steps} steps)");
            }
            ProgressEvent::IterationStarted {
                step,
                step_name,
                iteration,
            } => {
                println!("step {step} \"{step_name}\", iteration {iteration}");
            }
            ProgressEvent::OutputStable {
                step,
                iteration,
                bytes,
            } => {
                println!("  step {step}.{iteration}: agent settled ({bytes} bytes)");
            }
            ProgressEvent::Classified {
                step,
                iteration,
                has_change,
                substantive,
                step_satisfied,
            } => {
                let change = match (has_change, substantive) {
                    (false, _) => "no change",
                    (true, true) => "substantive change",
                    (true, false) => "cosmetic change",
                };
                let satisfied = if *step_satisfied { "satisfied" } else { "unsatisfied" };
                println!("  step {step}.{iteration}: {change}, step {satisfied}");
            }
            ProgressEvent::AnalysisHeld {
                step,
                iteration,
                reason,
            } => {
                println!("  step {step}.{iteration}: analysis unavailable, holding ({reason})");
            }
            ProgressEvent::Committed {
                step,
                iteration,
                commit_id,
                summary,
            } => {
                println!("  step {step}.{iteration}: committed {commit_id}: {summary}");
            }
            ProgressEvent::SessionRecycled {
                step,
                iteration,
                reason,
            } => {
                println!("  step {step}.{iteration}: session recycled ({reason})");
            }
            ProgressEvent::EnforcementSent { step, attempt } => {
                println!("  step {step}: enforcement prompt sent (attempt {attempt})");
            }
            ProgressEvent::StepAdvanced {
                completed_step,
                iterations,
            } => {
                println!("step {completed_step} complete after {iterations} iterations");
            }
            ProgressEvent::RecoveryStashed { stash } => {
                println!("uncommitted work parked: {stash}");
            }
            ProgressEvent::RecoveryApplied { stash } => {
                println!("recovery stash resolved: {stash}");
            }
            ProgressEvent::Escalated { step, reason } => {
                println!("step {step} escalated to human review: {reason}");
            }
            ProgressEvent::RunFinished {
                status,
                total_commits,
            } => {
                println!("run finished: {status} ({total_commits} commits)");
            }
        }
    }
}
