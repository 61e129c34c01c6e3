mod decode;
mod provider;
mod rotation;

pub use decode::extract_json;
pub use provider::{CompletionBackend, LlmRequest, LlmResponse, ProviderError, ProviderStats};
pub use rotation::KeyRotator;

use crate::error::{ForemanError, Result};
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// LlmRouter
// ---------------------------------------------------------------------------

struct ProviderSlot {
    backend: Box<dyn CompletionBackend>,
    rotator: KeyRotator,
    max_attempts: u32,
    backoff: Duration,
    stats: ProviderStats,
}

/// Ordered fallback over configured providers. Each provider gets a bounded
/// number of attempts with exponential backoff before the next one is tried;
/// only transport-level failures fall through. A provider that answers with
/// an undecodable structured payload stops the chain, because switching
/// providers would hide a prompt or format problem.
pub struct LlmRouter {
    providers: Vec<ProviderSlot>,
}

impl LlmRouter {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        backend: Box<dyn CompletionBackend>,
        keys: Vec<String>,
        max_attempts: u32,
        backoff: Duration,
        cooldown: Duration,
    ) {
        let stats = ProviderStats {
            provider: backend.name().to_string(),
            model: backend.model().to_string(),
            ..ProviderStats::default()
        };
        self.providers.push(ProviderSlot {
            backend,
            rotator: KeyRotator::new(keys, cooldown),
            max_attempts: max_attempts.max(1),
            backoff,
            stats,
        });
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn stats(&self) -> Vec<ProviderStats> {
        self.providers.iter().map(|p| p.stats.clone()).collect()
    }

    /// Route `request` through the provider chain.
    pub async fn complete(&mut self, request: &LlmRequest) -> Result<LlmResponse> {
        if self.providers.is_empty() {
            return Err(ForemanError::Config("no providers configured".to_string()));
        }

        let mut total_attempts = 0u32;
        let mut last_error = String::from("no attempts made");

        for slot in &mut self.providers {
            let name = slot.backend.name().to_string();
            let model = slot.backend.model().to_string();
            let mut malformed: Option<String> = None;

            for attempt in 0..slot.max_attempts {
                let delay = backoff_delay(slot.backoff, attempt);
                if !delay.is_zero() {
                    tracing::debug!(provider = %name, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::time::sleep(delay).await;
                }

                let Some((key_idx, key)) = slot.rotator.next() else {
                    last_error = format!("{name}: no usable credentials");
                    tracing::warn!(provider = %name, "no usable credentials, skipping provider");
                    break;
                };

                total_attempts += 1;
                slot.stats.attempts += 1;
                let started = std::time::Instant::now();

                match slot.backend.complete(request, &key).await {
                    Ok(text) => {
                        let latency_ms = started.elapsed().as_millis() as u64;
                        if !request.structured {
                            slot.stats.successes += 1;
                            return Ok(LlmResponse {
                                text,
                                json: None,
                                provider: name,
                                model,
                                latency_ms,
                                attempts: total_attempts,
                            });
                        }
                        match extract_json(&text) {
                            Ok(value) => {
                                slot.stats.successes += 1;
                                return Ok(LlmResponse {
                                    text,
                                    json: Some(value),
                                    provider: name,
                                    model,
                                    latency_ms,
                                    attempts: total_attempts,
                                });
                            }
                            Err(detail) => {
                                tracing::warn!(provider = %name, attempt, %detail, "structured response did not decode");
                                slot.stats.failures += 1;
                                last_error = format!("{name}: {detail}");
                                malformed = Some(detail);
                            }
                        }
                    }
                    Err(e) => {
                        slot.stats.failures += 1;
                        if matches!(e, ProviderError::RateLimited(_)) {
                            slot.stats.rate_limits += 1;
                        }
                        last_error = format!("{name}: {e}");
                        if e.rotates_credential() {
                            slot.rotator.penalize(key_idx);
                        }
                        if e.is_retryable() {
                            tracing::warn!(provider = %name, attempt, error = %e, "provider attempt failed");
                        } else {
                            tracing::warn!(provider = %name, error = %e, "unrecoverable provider error, moving on");
                            break;
                        }
                    }
                }
            }

            if let Some(detail) = malformed {
                return Err(ForemanError::MalformedStructuredResponse {
                    provider: name,
                    detail,
                });
            }
        }

        Err(ForemanError::AllProvidersExhausted {
            attempts: total_attempts,
            last_error,
        })
    }
}

impl Default for LlmRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// First attempt goes out immediately; each retry doubles the wait, capped.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u64 << (attempt - 1).min(16);
    let ms = (base.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(ms).min(MAX_BACKOFF)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedProvider {
        name: String,
        script: Mutex<VecDeque<std::result::Result<String, ProviderError>>>,
        credentials_seen: std::sync::Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedProvider {
        fn new(name: &str, script: Vec<std::result::Result<String, ProviderError>>) -> Box<Self> {
            Box::new(Self {
                name: name.to_string(),
                script: Mutex::new(script.into()),
                credentials_seen: std::sync::Arc::default(),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn model(&self) -> &str {
            "scripted-model"
        }

        async fn complete(
            &self,
            _request: &LlmRequest,
            credential: &str,
        ) -> std::result::Result<String, ProviderError> {
            self.credentials_seen
                .lock()
                .unwrap()
                .push(credential.to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ProviderError::Timeout))
        }
    }

    fn router_with(slots: Vec<(Box<ScriptedProvider>, Vec<&str>)>) -> LlmRouter {
        let mut router = LlmRouter::new();
        for (backend, keys) in slots {
            router.push(
                backend,
                keys.iter().map(|k| k.to_string()).collect(),
                3,
                Duration::from_millis(100),
                Duration::from_secs(60),
            );
        }
        router
    }

    #[tokio::test(start_paused = true)]
    async fn first_provider_success_short_circuits() {
        let mut router = router_with(vec![
            (ScriptedProvider::new("alpha", vec![Ok("done".into())]), vec!["k"]),
            (ScriptedProvider::new("beta", vec![Ok("unused".into())]), vec!["k"]),
        ]);
        let resp = router.complete(&LlmRequest::text("hi")).await.unwrap();
        assert_eq!(resp.text, "done");
        assert_eq!(resp.provider, "alpha");
        assert_eq!(resp.attempts, 1);
        let stats = router.stats();
        assert_eq!(stats[0].successes, 1);
        assert_eq!(stats[1].attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_after_retries_exhausted() {
        let mut router = router_with(vec![
            (
                ScriptedProvider::new(
                    "alpha",
                    vec![
                        Err(ProviderError::Timeout),
                        Err(ProviderError::Transport("reset".into())),
                        Err(ProviderError::Timeout),
                    ],
                ),
                vec!["k"],
            ),
            (ScriptedProvider::new("beta", vec![Ok("rescued".into())]), vec!["k"]),
        ]);
        let resp = router.complete(&LlmRequest::text("hi")).await.unwrap();
        assert_eq!(resp.provider, "beta");
        assert_eq!(resp.attempts, 4);
        assert_eq!(router.stats()[0].failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_error_abandons_provider_at_once() {
        let alpha = ScriptedProvider::new(
            "alpha",
            vec![Err(ProviderError::Http {
                status: 401,
                detail: "bad key".into(),
            })],
        );
        let mut router = router_with(vec![
            (alpha, vec!["k"]),
            (ScriptedProvider::new("beta", vec![Ok("rescued".into())]), vec!["k"]),
        ]);
        let resp = router.complete(&LlmRequest::text("hi")).await.unwrap();
        assert_eq!(resp.provider, "beta");
        assert_eq!(resp.attempts, 2);
        assert_eq!(router.stats()[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rotates_to_next_credential() {
        let alpha = ScriptedProvider::new(
            "alpha",
            vec![
                Err(ProviderError::RateLimited("429".into())),
                Ok("second key worked".into()),
            ],
        );
        let seen = alpha.credentials_seen.clone();
        let mut router = router_with(vec![(alpha, vec!["key-one", "key-two"])]);
        let resp = router.complete(&LlmRequest::text("hi")).await.unwrap();
        assert_eq!(resp.text, "second key worked");

        assert_eq!(*seen.lock().unwrap(), ["key-one", "key-two"]);
        assert_eq!(router.stats()[0].rate_limits, 1);
        assert_eq!(router.stats()[0].successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_total_attempts() {
        let mut router = router_with(vec![
            (
                ScriptedProvider::new("alpha", vec![]),
                vec!["k"],
            ),
            (
                ScriptedProvider::new("beta", vec![]),
                vec!["k"],
            ),
        ]);
        let err = router.complete(&LlmRequest::text("hi")).await.unwrap_err();
        match err {
            ForemanError::AllProvidersExhausted { attempts, last_error } => {
                assert_eq!(attempts, 6);
                assert!(last_error.contains("beta"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_structured_payload_does_not_fall_back() {
        let beta = ScriptedProvider::new("beta", vec![Ok("{\"fine\": true}".into())]);
        let mut router = router_with(vec![
            (
                ScriptedProvider::new(
                    "alpha",
                    vec![
                        Ok("not json at all".into()),
                        Ok("still prose".into()),
                        Ok("more prose".into()),
                    ],
                ),
                vec!["k"],
            ),
            (beta, vec!["k"]),
        ]);
        let err = router
            .complete(&LlmRequest::structured("report"))
            .await
            .unwrap_err();
        match err {
            ForemanError::MalformedStructuredResponse { provider, .. } => {
                assert_eq!(provider, "alpha");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(router.stats()[1].attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn structured_success_carries_decoded_json() {
        let alpha = ScriptedProvider::new(
            "alpha",
            vec![Ok("```json\n{\"severity\": \"cosmetic\"}\n```".into())],
        );
        let mut router = router_with(vec![(alpha, vec!["k"])]);
        let resp = router
            .complete(&LlmRequest::structured("report"))
            .await
            .unwrap();
        let json = resp.json.unwrap();
        assert_eq!(json["severity"], "cosmetic");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(2000);
        assert_eq!(backoff_delay(base, 0), Duration::ZERO);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(8000));
        assert_eq!(backoff_delay(base, 10), MAX_BACKOFF);
    }
}
