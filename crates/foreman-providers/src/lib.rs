pub mod gemini;
pub mod openai_compat;

pub use gemini::GeminiProvider;
pub use openai_compat::OpenaiCompatProvider;

use foreman_core::config::{Config, ProviderKind};
use foreman_core::router::{CompletionBackend, LlmRouter};
use foreman_core::Result;
use std::time::Duration;

/// Build the failover router from a validated configuration. Provider order
/// in the file is the fallback order; credentials resolve at build time so a
/// missing key surfaces before any agent work starts.
pub fn build_router(config: &Config) -> Result<LlmRouter> {
    let mut router = LlmRouter::new();
    for provider in &config.providers {
        let keys = provider.resolve_keys()?;
        tracing::debug!(
            provider = %provider.name,
            model = %provider.model,
            keys = keys.len(),
            "registering completion backend"
        );
        let backend: Box<dyn CompletionBackend> = match provider.kind {
            ProviderKind::OpenaiCompat => {
                let mut built = OpenaiCompatProvider::new(&provider.name, &provider.model);
                if let Some(url) = &provider.base_url {
                    built = built.with_base_url(url);
                }
                Box::new(built)
            }
            ProviderKind::Gemini => {
                let mut built = GeminiProvider::new(&provider.name, &provider.model);
                if let Some(url) = &provider.base_url {
                    built = built.with_base_url(url);
                }
                Box::new(built)
            }
        };
        router.push(
            backend,
            keys,
            provider.max_attempts,
            Duration::from_millis(provider.backoff_ms),
            config.router.credential_cooldown(),
        );
    }
    Ok(router)
}
