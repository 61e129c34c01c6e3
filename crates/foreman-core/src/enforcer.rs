use crate::analyzer::Analysis;
use crate::config::EnforcerConfig;
use crate::step::PipelineStep;

// ---------------------------------------------------------------------------
// TaskEnforcer
// ---------------------------------------------------------------------------

/// Pushes back when the agent stalls on a step or declares victory early.
/// Each failed attempt gets a firmer prompt; past the ceiling the run stops
/// and waits for a human.
pub struct TaskEnforcer {
    max_attempts: u32,
}

/// One opener per rung. Attempts past the last rung reuse it.
const LADDER: [&str; 5] = [
    "The step is not finished yet. Keep working on it.",
    "The step is still not finished. Re-read the completion criteria below and address each one.",
    "This step has now failed verification several times. Go through the criteria below one by one, check each against the actual state of the repository, and fix what is missing.",
    "Do not report this step as complete again until every criterion below is genuinely met. Verify your work before answering.",
    "Final attempt. If the criteria below are not met after this response, the run escalates to a human operator.",
];

impl TaskEnforcer {
    pub fn new(cfg: &EnforcerConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.max_attempts
    }

    /// `attempts` is the per-step failure count including the one just
    /// recorded. The ceiling itself is still enforced; only the attempt
    /// after it escalates.
    pub fn should_escalate(&self, attempts: u32) -> bool {
        attempts > self.max_attempts
    }

    pub fn enforcement_prompt(
        &self,
        step: &PipelineStep,
        attempts: u32,
        analysis: &Analysis,
    ) -> String {
        let rung = (attempts.saturating_sub(1) as usize).min(LADDER.len() - 1);
        let mut prompt = format!("{}\n\nStep: {}\n", LADDER[rung], step.name);
        if !step.completion_criteria.is_empty() {
            prompt.push_str("Completion criteria:\n");
            for criterion in &step.completion_criteria {
                prompt.push_str("  - ");
                prompt.push_str(criterion);
                prompt.push('\n');
            }
        }
        if !analysis.issues.is_empty() {
            prompt.push_str("Observed problems:\n");
            for issue in &analysis.issues {
                prompt.push_str("  - ");
                prompt.push_str(issue);
                prompt.push('\n');
            }
        }
        prompt
    }

    pub fn escalation_reason(&self, step: &PipelineStep, attempts: u32) -> String {
        format!(
            "step '{}' failed enforcement {} times (ceiling {})",
            step.name, attempts, self.max_attempts
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
