use thiserror::Error;

use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum ForemanError {
    #[error("config: {0}")]
    Config(String),

    #[error("model '{model}' on provider '{provider}' is denied by the configured denylist")]
    ModelDenied { provider: String, model: String },

    #[error("step catalog: {0}")]
    StepCatalog(String),

    #[error("all providers exhausted after {attempts} attempts: {last_error}")]
    AllProvidersExhausted { attempts: u32, last_error: String },

    #[error("provider '{provider}' returned unparseable structured output: {detail}")]
    MalformedStructuredResponse { provider: String, detail: String },

    #[error("analysis unavailable: {0}")]
    AnalysisUnavailable(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("git {op} failed: {detail}")]
    Vcs { op: String, detail: String },

    #[error("version control needs a human: {0}")]
    VersionControlConflict(String),

    #[error("state persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("run '{run_id}' is locked by pid {pid}")]
    LockHeld { run_id: String, pid: String },

    #[error("no run state found")]
    NoRunFound,

    #[error("human intervention required: {0}")]
    HumanEscalationRequired(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ForemanError>;
