use foreman_core::config::NotifyConfig;
use foreman_core::state::{RunState, RunStatus};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Sends terminal-state notifications to chat. Every failure is logged and
/// swallowed; a run never changes outcome because a webhook was down.
pub struct Notifier {
    telegram: Option<Telegram>,
    slack_webhook: Option<String>,
    client: reqwest::Client,
}

struct Telegram {
    token: String,
    chat_id: String,
}

impl Notifier {
    pub fn from_config(config: Option<&NotifyConfig>) -> Self {
        let mut telegram = None;
        let mut slack_webhook = None;

        if let Some(cfg) = config {
            if let Some(tg) = &cfg.telegram {
                match std::env::var(&tg.token_env) {
                    Ok(token) if !token.trim().is_empty() => {
                        telegram = Some(Telegram {
                            token,
                            chat_id: tg.chat_id.clone(),
                        });
                    }
                    _ => {
                        tracing::info!(env = %tg.token_env, "telegram disabled, token env unset");
                    }
                }
            }
            if let Some(slack) = &cfg.slack {
                match std::env::var(&slack.webhook_env) {
                    Ok(url) if !url.trim().is_empty() => slack_webhook = Some(url),
                    _ => {
                        tracing::info!(env = %slack.webhook_env, "slack disabled, webhook env unset");
                    }
                }
            }
        }

        Self {
            telegram,
            slack_webhook,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.telegram.is_some() || self.slack_webhook.is_some()
    }

    /// Fire a message at every configured channel.
    pub async fn send(&self, text: &str) {
        if let Some(tg) = &self.telegram {
            let url = format!("https://api.telegram.org/bot{}/sendMessage", tg.token);
            let body = serde_json::json!({
                "chat_id": tg.chat_id,
                "text": text,
            });
            if let Err(e) = self.post(&url, &body).await {
                tracing::warn!(error = %e, "telegram notification failed");
            }
        }
        if let Some(url) = &self.slack_webhook {
            let body = serde_json::json!({ "text": text });
            if let Err(e) = self.post(url, &body).await {
                tracing::warn!(error = %e, "slack notification failed");
            }
        }
    }

    pub async fn run_finished(&self, state: &RunState) {
        if !self.is_enabled() {
            return;
        }
        self.send(&summary(state)).await;
    }

    async fn post(&self, url: &str, body: &serde_json::Value) -> anyhow::Result<()> {
        let response = self.client.post(url).json(body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("status {}", response.status());
        }
        Ok(())
    }
}

/// Terminal-state message with enough context to resume informedly.
pub fn summary(state: &RunState) -> String {
    let headline = match state.status {
        RunStatus::Completed => "foreman: pipeline completed",
        RunStatus::AwaitingHuman => "foreman: run needs human attention",
        RunStatus::Aborted => "foreman: run aborted",
        RunStatus::Running => "foreman: run in progress",
    };
    let mut text = format!(
        "{headline}\nrun: {}\nstep {}, iteration {}, {} commit(s)",
        state.run_id,
        state.step_display(),
        state.iteration,
        state.total_commits
    );
    if let Some(reason) = &state.escalation_reason {
        text.push_str("\nreason: ");
        text.push_str(reason);
    }
    if let Some(stash) = &state.recovery_stash {
        text.push_str("\nparked work: ");
        text.push_str(stash);
    }
    text
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
