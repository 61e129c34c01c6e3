use crate::error::{ForemanError, Result};
use crate::router::{LlmRequest, LlmRouter};
use crate::step::PipelineStep;
use serde::{Deserialize, Serialize};

/// How much of each capture goes into the analysis prompt. Session output
/// can be megabytes of scrollback; the decision-bearing part is the tail.
pub const ANALYSIS_TAIL_CHARS: usize = 2000;

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Cosmetic,
    Substantive,
}

/// What the model concluded about one iteration's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default)]
    pub has_change: bool,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub step_satisfied: bool,
    /// The agent's own output claims the step is finished.
    #[serde(default)]
    pub claims_complete: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl Analysis {
    /// A change with no stated severity is treated as substantive so its
    /// work gets committed rather than dropped.
    pub fn substantive(&self) -> bool {
        self.has_change && !matches!(self.severity, Some(Severity::Cosmetic))
    }

    fn unchanged() -> Self {
        Self {
            has_change: false,
            severity: None,
            step_satisfied: true,
            claims_complete: false,
            summary: "output identical to previous iteration".to_string(),
            issues: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ResponseAnalyzer
// ---------------------------------------------------------------------------

/// Classifies agent output via the router. Holds the router exclusively;
/// classification is the only LLM traffic in the control loop.
pub struct ResponseAnalyzer {
    router: LlmRouter,
}

impl ResponseAnalyzer {
    pub fn new(router: LlmRouter) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &LlmRouter {
        &self.router
    }

    /// Compare this iteration's output against the previous one. Byte-equal
    /// captures never reach the router.
    pub async fn classify(
        &mut self,
        step: &PipelineStep,
        prev_output: Option<&str>,
        output: &str,
    ) -> Result<Analysis> {
        if prev_output == Some(output) {
            tracing::debug!(step = step.id, "output unchanged, skipping analysis call");
            return Ok(Analysis::unchanged());
        }

        let prompt = analysis_prompt(step, prev_output, output);
        let response = match self.router.complete(&LlmRequest::structured(prompt)).await {
            Ok(response) => response,
            Err(ForemanError::AllProvidersExhausted { attempts, last_error }) => {
                return Err(ForemanError::AnalysisUnavailable(format!(
                    "all providers failed after {attempts} attempts: {last_error}"
                )));
            }
            Err(e) => return Err(e),
        };

        let provider = response.provider.clone();
        let json = response.json.ok_or_else(|| ForemanError::AnalysisUnavailable(
            "structured response missing decoded payload".to_string(),
        ))?;
        let analysis: Analysis =
            serde_json::from_value(json).map_err(|e| ForemanError::MalformedStructuredResponse {
                provider,
                detail: format!("analysis fields did not decode: {e}"),
            })?;
        tracing::debug!(
            step = step.id,
            has_change = analysis.has_change,
            step_satisfied = analysis.step_satisfied,
            "classified iteration output"
        );
        Ok(analysis)
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

fn analysis_prompt(step: &PipelineStep, prev_output: Option<&str>, output: &str) -> String {
    let criteria = if step.completion_criteria.is_empty() {
        "  (none given; judge from the step name)".to_string()
    } else {
        step.completion_criteria
            .iter()
            .map(|c| format!("  - {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let previous = match prev_output {
        Some(prev) => tail(prev, ANALYSIS_TAIL_CHARS).to_string(),
        None => "(first iteration, no previous output)".to_string(),
    };
    format!(
        "You are supervising a coding agent working on the step \"{name}\".\n\
         Completion criteria:\n{criteria}\n\n\
         PREVIOUS OUTPUT (tail):\n{previous}\n\n\
         CURRENT OUTPUT (tail):\n{current}\n\n\
         Compare the outputs and reply with ONLY a JSON object, no prose:\n\
         {{\"has_change\": <bool, did the agent do meaningful new work>,\n \
         \"severity\": <\"cosmetic\" for formatting or phrasing only, \"substantive\" for logic, files, or tests>,\n \
         \"step_satisfied\": <bool, do the criteria above appear met>,\n \
         \"claims_complete\": <bool, does the agent say it is done>,\n \
         \"summary\": <one line describing what changed>,\n \
         \"issues\": <array of strings, problems you noticed>}}",
        name = step.name,
        criteria = criteria,
        previous = previous,
        current = tail(output, ANALYSIS_TAIL_CHARS),
    )
}

/// Last `max_chars` characters of `text`, on a char boundary.
pub fn tail(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
