use crate::error::{ForemanError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const PUSH_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Status types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Two-character porcelain code (`XY`).
    pub code: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStatus {
    pub entries: Vec<StatusEntry>,
}

impl TreeStatus {
    pub fn is_clean(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// Push cannot succeed without operator action (upstream, conflict, auth).
    NeedsHuman(String),
    /// Transient failure, safe to continue without the push.
    Retryable(String),
}

// ---------------------------------------------------------------------------
// VersionControl
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn status(&self) -> Result<TreeStatus>;

    /// Stash everything including untracked files under `label`; returns the
    /// label used to find it again.
    async fn stash(&self, label: &str) -> Result<String>;

    async fn stash_pop(&self, label: &str) -> Result<()>;

    async fn stash_drop(&self, label: &str) -> Result<()>;

    /// Stage all changes and commit; returns the new commit id.
    async fn commit(&self, message: &str) -> Result<String>;

    async fn push(&self) -> Result<PushOutcome>;
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

pub fn parse_porcelain(out: &str) -> Vec<StatusEntry> {
    out.lines()
        .filter(|l| l.len() > 3)
        .map(|l| StatusEntry {
            code: l[..2].to_string(),
            path: l[3..].to_string(),
        })
        .collect()
}

/// Map a failed `git push` stderr to an outcome. Upstream, non-fast-forward
/// and auth failures cannot be fixed by retrying.
pub fn classify_push_error(stderr: &str) -> PushOutcome {
    let s = stderr.to_lowercase();
    if s.contains("no upstream") || s.contains("--set-upstream") {
        return PushOutcome::NeedsHuman("no upstream branch configured".to_string());
    }
    if s.contains("rejected") && (s.contains("non-fast-forward") || s.contains("fetch first")) {
        return PushOutcome::NeedsHuman("remote has diverged, pull or rebase needed".to_string());
    }
    if s.contains("authentication") || s.contains("permission denied") || s.contains("403") {
        return PushOutcome::NeedsHuman("authentication or permission failure".to_string());
    }
    PushOutcome::Retryable(stderr.trim().to_string())
}

/// Locate `stash@{N}` for a stash whose message contains `label`.
pub fn find_stash_ref(list_output: &str, label: &str) -> Option<String> {
    list_output.lines().find_map(|line| {
        if !line.contains(label) {
            return None;
        }
        line.split(':').next().map(|r| r.trim().to_string())
    })
}

/// Commit subject: `Step {step}, iteration {iter}: {summary}` with the
/// summary flattened to one line and capped at 100 characters.
pub fn commit_message(step: u32, iteration: u32, summary: &str) -> String {
    let flat: String = summary
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let mut clean = flat.split_whitespace().collect::<Vec<_>>().join(" ");
    if clean.is_empty() {
        clean = "automated changes".to_string();
    }
    let capped: String = clean.chars().take(100).collect();
    format!("Step {step}, iteration {iteration}: {capped}")
}

// ---------------------------------------------------------------------------
// GitCli
// ---------------------------------------------------------------------------

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Thin `git -C <root>` wrapper. No state beyond the work-tree path; every
/// operation is one or two subprocess calls with a hard timeout.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    dry_run: bool,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<GitOutput> {
        let op = args.first().copied().unwrap_or("git");
        tracing::debug!(?args, "git");
        let fut = tokio::process::Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output();
        let output = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| ForemanError::Vcs {
                op: op.to_string(),
                detail: format!("timed out after {}s", timeout.as_secs()),
            })?
            .map_err(|e| ForemanError::Vcs {
                op: op.to_string(),
                detail: e.to_string(),
            })?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_checked(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let out = self.run(args, timeout).await?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(ForemanError::Vcs {
                op: args.first().copied().unwrap_or("git").to_string(),
                detail: out.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn status(&self) -> Result<TreeStatus> {
        let out = self
            .run_checked(&["status", "--porcelain"], COMMAND_TIMEOUT)
            .await?;
        Ok(TreeStatus {
            entries: parse_porcelain(&out),
        })
    }

    async fn stash(&self, label: &str) -> Result<String> {
        if self.dry_run {
            tracing::info!(label, "dry-run: skipping stash");
            return Ok(label.to_string());
        }
        self.run_checked(&["stash", "push", "-u", "-m", label], COMMAND_TIMEOUT)
            .await?;
        Ok(label.to_string())
    }

    async fn stash_pop(&self, label: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!(label, "dry-run: skipping stash pop");
            return Ok(());
        }
        let list = self.run_checked(&["stash", "list"], COMMAND_TIMEOUT).await?;
        let Some(stash_ref) = find_stash_ref(&list, label) else {
            return Err(ForemanError::Vcs {
                op: "stash pop".to_string(),
                detail: format!("no stash labeled '{label}'"),
            });
        };
        let out = self
            .run(&["stash", "pop", &stash_ref], COMMAND_TIMEOUT)
            .await?;
        if out.success {
            Ok(())
        } else {
            // A pop that conflicts leaves the work tree half-applied; that
            // is not something to retry blindly.
            Err(ForemanError::VersionControlConflict(format!(
                "stash pop of '{label}' failed: {}",
                out.stderr.trim()
            )))
        }
    }

    async fn stash_drop(&self, label: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!(label, "dry-run: skipping stash drop");
            return Ok(());
        }
        let list = self.run_checked(&["stash", "list"], COMMAND_TIMEOUT).await?;
        let Some(stash_ref) = find_stash_ref(&list, label) else {
            return Ok(());
        };
        self.run_checked(&["stash", "drop", &stash_ref], COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<String> {
        if self.dry_run {
            tracing::info!(message, "dry-run: skipping commit");
            return Ok("dry-run".to_string());
        }
        self.run_checked(&["add", "-A"], COMMAND_TIMEOUT).await?;
        self.run_checked(&["commit", "-m", message], COMMAND_TIMEOUT)
            .await?;
        let sha = self
            .run_checked(&["rev-parse", "HEAD"], COMMAND_TIMEOUT)
            .await?;
        Ok(sha.trim().to_string())
    }

    async fn push(&self) -> Result<PushOutcome> {
        if self.dry_run {
            tracing::info!("dry-run: skipping push");
            return Ok(PushOutcome::Pushed);
        }
        let out = self.run(&["push"], PUSH_TIMEOUT).await?;
        if out.success {
            Ok(PushOutcome::Pushed)
        } else {
            Ok(classify_push_error(&out.stderr))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
