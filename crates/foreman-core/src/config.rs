use crate::error::{ForemanError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE: &str = "foreman.yaml";

// ---------------------------------------------------------------------------
// ProviderConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub name: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable names holding API keys, in rotation order.
    #[serde(default)]
    pub api_key_env: Vec<String>,
    /// Inline keys, appended after the env-resolved ones.
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    2000
}

impl ProviderConfig {
    /// Resolve the credential list for this provider. Env names that are
    /// unset are skipped; an empty result is a configuration error.
    pub fn resolve_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for var in &self.api_key_env {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    keys.push(value);
                }
            }
        }
        keys.extend(self.api_keys.iter().cloned());
        if keys.is_empty() {
            return Err(ForemanError::Config(format!(
                "provider '{}' has no usable credentials (checked env: {})",
                self.name,
                self.api_key_env.join(", ")
            )));
        }
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// RouterConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_credential_cooldown")]
    pub credential_cooldown_secs: u64,
}

fn default_credential_cooldown() -> u64 {
    60
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            credential_cooldown_secs: default_credential_cooldown(),
        }
    }
}

impl RouterConfig {
    pub fn credential_cooldown(&self) -> Duration {
        Duration::from_secs(self.credential_cooldown_secs)
    }
}

// ---------------------------------------------------------------------------
// WatchdogConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_iteration_timeout")]
    pub iteration_timeout_secs: u64,
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: u32,
    #[serde(default = "default_error_markers")]
    pub error_markers: Vec<String>,
    /// Sent once per idle stretch; an empty string sends a bare Enter.
    #[serde(default)]
    pub nudge_text: String,
}

fn default_poll_interval() -> u64 {
    300
}

fn default_iteration_timeout() -> u64 {
    3600
}

fn default_loop_threshold() -> u32 {
    3
}

fn default_error_markers() -> Vec<String> {
    [
        "Traceback (most recent call last)",
        "panic:",
        "FAILED",
        "Error:",
        "fatal:",
        "Exception",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            iteration_timeout_secs: default_iteration_timeout(),
            loop_threshold: default_loop_threshold(),
            error_markers: default_error_markers(),
            nudge_text: String::new(),
        }
    }
}

impl WatchdogConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// EnforcerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcerConfig {
    #[serde(default = "default_enforcer_attempts")]
    pub max_attempts: u32,
}

fn default_enforcer_attempts() -> u32 {
    5
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_enforcer_attempts(),
        }
    }
}

// ---------------------------------------------------------------------------
// GitConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_auto_push")]
    pub auto_push: bool,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_auto_push() -> bool {
    true
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            auto_push: default_auto_push(),
            dry_run: false,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_quiet_checks")]
    pub quiet_checks: u32,
    #[serde(default = "default_history_lines")]
    pub history_lines: u32,
    #[serde(default = "default_new_context_command")]
    pub new_context_command: String,
}

fn default_agent_command() -> String {
    "droid".to_string()
}

fn default_startup_delay() -> u64 {
    5
}

fn default_check_interval_ms() -> u64 {
    2000
}

fn default_quiet_checks() -> u32 {
    3
}

fn default_history_lines() -> u32 {
    1000
}

fn default_new_context_command() -> String {
    "/new".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            agent_command: default_agent_command(),
            startup_delay_secs: default_startup_delay(),
            check_interval_ms: default_check_interval_ms(),
            quiet_checks: default_quiet_checks(),
            history_lines: default_history_lines(),
            new_context_command: default_new_context_command(),
        }
    }
}

impl SessionConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// NotifyConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_telegram_token_env")]
    pub token_env: String,
    pub chat_id: String,
}

fn default_telegram_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default = "default_slack_webhook_env")]
    pub webhook_env: String,
}

fn default_slack_webhook_env() -> String {
    "SLACK_WEBHOOK_URL".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackConfig>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_steps_file")]
    pub steps_file: String,
    /// Placeholder values substituted into step prompt templates.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    pub providers: Vec<ProviderConfig>,
    #[serde(default = "default_denylist")]
    pub model_denylist: Vec<String>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub enforcer: EnforcerConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<NotifyConfig>,
}

fn default_state_dir() -> String {
    ".foreman".to_string()
}

fn default_steps_file() -> String {
    "steps.yaml".to_string()
}

fn default_denylist() -> Vec<String> {
    vec!["llama".to_string()]
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ForemanError::Config(format!(
                "config not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural validation, run at load so a bad config never reaches the
    /// orchestrator. Denied models are rejected here, before any router is
    /// constructed.
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(ForemanError::Config(
                "at least one provider must be configured".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            if !seen.insert(p.name.as_str()) {
                return Err(ForemanError::Config(format!(
                    "duplicate provider name '{}'",
                    p.name
                )));
            }
            if p.max_attempts == 0 {
                return Err(ForemanError::Config(format!(
                    "provider '{}': max_attempts must be at least 1",
                    p.name
                )));
            }
            if let Some(pattern) = self.denied_pattern(&p.name, &p.model) {
                tracing::error!(provider = %p.name, model = %p.model, pattern, "model denied");
                return Err(ForemanError::ModelDenied {
                    provider: p.name.clone(),
                    model: p.model.clone(),
                });
            }
        }
        if self.watchdog.poll_interval_secs == 0 {
            return Err(ForemanError::Config(
                "watchdog.poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.watchdog.iteration_timeout_secs < self.watchdog.poll_interval_secs {
            return Err(ForemanError::Config(
                "watchdog.iteration_timeout_secs must be at least one poll interval".to_string(),
            ));
        }
        if self.watchdog.loop_threshold < 2 {
            return Err(ForemanError::Config(
                "watchdog.loop_threshold must be at least 2".to_string(),
            ));
        }
        if self.enforcer.max_attempts == 0 {
            return Err(ForemanError::Config(
                "enforcer.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Case-insensitive substring match of any denylist pattern against the
    /// model name and the `provider/model` pair.
    fn denied_pattern(&self, provider: &str, model: &str) -> Option<&str> {
        let model_lc = model.to_lowercase();
        let pair_lc = format!("{}/{}", provider.to_lowercase(), model_lc);
        self.model_denylist
            .iter()
            .find(|pat| {
                let pat = pat.to_lowercase();
                !pat.is_empty() && (model_lc.contains(&pat) || pair_lc.contains(&pat))
            })
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
