use crate::state::RunStatus;
use serde::Serialize;

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// Emitted once per notable orchestrator action. Sinks are fire-and-forget:
/// the loop never waits on them and ignores their failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: String,
        steps: usize,
    },
    IterationStarted {
        step: u32,
        step_name: String,
        iteration: u32,
    },
    OutputStable {
        step: u32,
        iteration: u32,
        bytes: usize,
    },
    Classified {
        step: u32,
        iteration: u32,
        has_change: bool,
        substantive: bool,
        step_satisfied: bool,
    },
    AnalysisHeld {
        step: u32,
        iteration: u32,
        reason: String,
    },
    Committed {
        step: u32,
        iteration: u32,
        commit_id: String,
        summary: String,
    },
    SessionRecycled {
        step: u32,
        iteration: u32,
        reason: String,
    },
    EnforcementSent {
        step: u32,
        attempt: u32,
    },
    StepAdvanced {
        completed_step: u32,
        iterations: u32,
    },
    RecoveryStashed {
        stash: String,
    },
    RecoveryApplied {
        stash: String,
    },
    Escalated {
        step: u32,
        reason: String,
    },
    RunFinished {
        status: RunStatus,
        total_commits: u32,
    },
}

// ---------------------------------------------------------------------------
// EventSink
// ---------------------------------------------------------------------------

pub trait EventSink: Send + Sync {
    /// Must not block; the orchestrator calls this inline.
    fn emit(&self, event: &ProgressEvent);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Forwards events over an unbounded channel; drops them once the receiver
/// is gone.
#[derive(Debug)]
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &ProgressEvent) {
        let _ = self.tx.send(event.clone());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
