use crate::error::{ForemanError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// PipelineStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// 1-based, consecutive across the catalog.
    pub id: u32,
    pub name: String,
    /// Prompt template with `{{placeholder}}` slots.
    pub prompt: String,
    #[serde(default)]
    pub completion_criteria: Vec<String>,
}

impl PipelineStep {
    pub fn render_prompt(&self, vars: &BTreeMap<String, String>) -> Result<String> {
        render(&self.prompt, vars)
    }
}

// ---------------------------------------------------------------------------
// StepCatalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCatalog {
    pub steps: Vec<PipelineStep>,
}

impl StepCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ForemanError::StepCatalog(format!(
                "step catalog not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let catalog: StepCatalog = serde_yaml::from_str(&data)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(ForemanError::StepCatalog("no steps defined".to_string()));
        }
        let mut names = BTreeSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            let expected = i as u32 + 1;
            if step.id != expected {
                return Err(ForemanError::StepCatalog(format!(
                    "step ids must be consecutive from 1: found id {} at position {}",
                    step.id, expected
                )));
            }
            if step.name.trim().is_empty() {
                return Err(ForemanError::StepCatalog(format!(
                    "step {} has an empty name",
                    step.id
                )));
            }
            if !names.insert(step.name.clone()) {
                return Err(ForemanError::StepCatalog(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
            if step.prompt.trim().is_empty() {
                return Err(ForemanError::StepCatalog(format!(
                    "step {} ('{}') has an empty prompt",
                    step.id, step.name
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step at a 0-based pipeline position.
    pub fn get(&self, index: usize) -> Option<&PipelineStep> {
        self.steps.get(index)
    }

    /// Every placeholder used across all prompts.
    pub fn placeholders(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .flat_map(|s| placeholders_in(&s.prompt))
            .collect()
    }

    /// Checked once at run start, when the variable map is known.
    pub fn check_vars(&self, vars: &BTreeMap<String, String>) -> Result<()> {
        let missing: Vec<String> = self
            .placeholders()
            .into_iter()
            .filter(|p| !vars.contains_key(p))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ForemanError::StepCatalog(format!(
                "unbound placeholders: {}",
                missing.join(", ")
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Template rendering
// ---------------------------------------------------------------------------

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap())
}

pub fn placeholders_in(template: &str) -> Vec<String> {
    placeholder_re()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let missing: BTreeSet<String> = placeholders_in(template)
        .into_iter()
        .filter(|p| !vars.contains_key(p))
        .collect();
    if !missing.is_empty() {
        return Err(ForemanError::StepCatalog(format!(
            "unbound placeholders: {}",
            missing.into_iter().collect::<Vec<_>>().join(", ")
        )));
    }
    let rendered = placeholder_re().replace_all(template, |caps: &regex::Captures| {
        vars[&caps[1]].clone()
    });
    Ok(rendered.into_owned())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
