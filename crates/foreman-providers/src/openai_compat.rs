use async_trait::async_trait;
use foreman_core::router::{CompletionBackend, LlmRequest, ProviderError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.cerebras.ai/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// OpenaiCompatProvider
// ---------------------------------------------------------------------------

/// Backend for any service exposing the OpenAI `chat/completions` shape
/// (Cerebras, Groq, OpenRouter, llama.cpp servers and the rest).
pub struct OpenaiCompatProvider {
    client: Client,
    name: String,
    model: String,
    base_url: String,
}

impl OpenaiCompatProvider {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::default(),
            name: name.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[async_trait]
impl CompletionBackend for OpenaiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: &LlmRequest,
        credential: &str,
    ) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: 0.0,
            response_format: request
                .structured
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .client
            .post(self.completions_url())
            .timeout(REQUEST_TIMEOUT)
            .header("Authorization", format!("Bearer {credential}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = snippet(&response.text().await.unwrap_or_default());
            return Err(match status.as_u16() {
                429 => ProviderError::RateLimited(detail),
                402 => ProviderError::QuotaExhausted(detail),
                403 if quota_hint(&detail) => ProviderError::QuotaExhausted(detail),
                code => ProviderError::Http {
                    status: code,
                    detail,
                },
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Invalid(format!("malformed completion payload: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::Invalid("response carried no choices".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// First 300 chars of an error body, single line.
pub(crate) fn snippet(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    flat.chars().take(300).collect()
}

/// Some services report exhausted balances as 403 rather than 402.
pub(crate) fn quota_hint(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("quota") || lower.contains("billing") || lower.contains("credit")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
