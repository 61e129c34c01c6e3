use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    /// Ask the provider for a JSON object and decode it before returning.
    pub structured: bool,
}

impl LlmRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            structured: false,
        }
    }

    pub fn structured(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            structured: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    /// Decoded payload, present only for structured requests.
    pub json: Option<serde_json::Value>,
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    /// Attempts spent across all providers before this response.
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("http {status}: {detail}")]
    Http { status: u16, detail: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unusable response: {0}")]
    Invalid(String),
}

impl ProviderError {
    /// Whether another attempt against the same provider can help. Client
    /// errors other than throttling mean the request itself is wrong.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::RateLimited(_) | Self::QuotaExhausted(_) | Self::Transport(_) => {
                true
            }
            Self::Http { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::Invalid(_) => false,
        }
    }

    /// Whether the failure is tied to the credential rather than the
    /// provider, so the next attempt should use a different key.
    pub fn rotates_credential(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::QuotaExhausted(_))
    }
}

// ---------------------------------------------------------------------------
// CompletionBackend
// ---------------------------------------------------------------------------

/// One upstream LLM endpoint. Implementations are stateless with respect to
/// credentials: the router owns key selection and passes the credential for
/// each call.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(
        &self,
        request: &LlmRequest,
        credential: &str,
    ) -> Result<String, ProviderError>;
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    pub provider: String,
    pub model: String,
    pub attempts: u32,
    pub successes: u32,
    pub rate_limits: u32,
    pub failures: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
