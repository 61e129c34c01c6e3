use crate::pane;
use async_trait::async_trait;
use foreman_core::config::SessionConfig;
use foreman_core::session::{SessionBackend, SessionError, SessionHandle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TmuxBackend
// ---------------------------------------------------------------------------

/// Runs the coding agent inside a detached tmux session and talks to it
/// through `send-keys` / `capture-pane`. One backend can hold several live
/// sessions; the handle id is the tmux session name.
pub struct TmuxBackend {
    project: PathBuf,
    config: SessionConfig,
    /// Byte offset into the pane capture at the time of the last send, per
    /// session. Everything past it is the agent's response.
    markers: Mutex<HashMap<String, usize>>,
}

impl TmuxBackend {
    pub fn new(project: impl Into<PathBuf>, config: SessionConfig) -> Self {
        Self {
            project: project.into(),
            config,
            markers: Mutex::new(HashMap::new()),
        }
    }

    fn session_name() -> String {
        let short = Uuid::new_v4().simple().to_string();
        format!("foreman-{}", &short[..8])
    }

    async fn tmux(&self, args: &[String]) -> Result<std::process::Output, SessionError> {
        let op = args.first().cloned().unwrap_or_default();
        tokio::process::Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| SessionError::Spawn {
                command: format!("tmux {op}"),
                detail: e.to_string(),
            })
    }

    async fn tmux_checked(&self, args: &[String], session: &str) -> Result<String, SessionError> {
        let out = self.tmux(args).await?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.contains("can't find session") || stderr.contains("no server running") {
            return Err(SessionError::Gone(session.to_string()));
        }
        Err(SessionError::Transport {
            op: args.first().cloned().unwrap_or_default(),
            detail: stderr.trim().to_string(),
        })
    }

    async fn type_line(&self, session: &str, text: &str) -> Result<(), SessionError> {
        if !text.is_empty() {
            self.tmux_checked(&pane::send_text_args(session, text), session)
                .await?;
        }
        self.tmux_checked(&pane::send_enter_args(session), session)
            .await?;
        Ok(())
    }

    async fn capture(&self, session: &str) -> Result<String, SessionError> {
        self.tmux_checked(
            &pane::capture_args(session, self.config.history_lines),
            session,
        )
        .await
    }

    fn set_marker(&self, session: &str, offset: usize) {
        if let Ok(mut markers) = self.markers.lock() {
            markers.insert(session.to_string(), offset);
        }
    }

    fn marker(&self, session: &str) -> usize {
        self.markers
            .lock()
            .ok()
            .and_then(|markers| markers.get(session).copied())
            .unwrap_or(0)
    }

    fn clear_marker(&self, session: &str) {
        if let Ok(mut markers) = self.markers.lock() {
            markers.remove(session);
        }
    }

    async fn kill_if_present(&self, session: &str) {
        let alive = self
            .tmux(&pane::has_session_args(session))
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if alive {
            let _ = self.tmux(&pane::kill_session_args(session)).await;
        }
    }
}

#[async_trait]
impl SessionBackend for TmuxBackend {
    async fn start(&self) -> Result<SessionHandle, SessionError> {
        let session = Self::session_name();
        self.kill_if_present(&session).await;
        self.tmux_checked(&pane::new_session_args(&session), &session)
            .await?;
        tracing::info!(%session, project = %self.project.display(), "tmux session created");

        self.type_line(&session, &format!("cd {}", self.project.display()))
            .await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.type_line(&session, &self.config.agent_command).await?;
        tokio::time::sleep(self.config.startup_delay()).await;

        let initial = self.capture(&session).await?;
        tracing::debug!(%session, bytes = initial.len(), "agent startup output captured");
        self.set_marker(&session, initial.len());
        Ok(SessionHandle::new(session))
    }

    async fn send(&self, handle: &SessionHandle, text: &str) -> Result<(), SessionError> {
        let before = self.capture(handle.id()).await?;
        self.set_marker(handle.id(), before.len());
        self.type_line(handle.id(), text).await
    }

    // Leaves the response marker where the prompt set it, so the eventual
    // response delta still spans everything the agent produced.
    async fn nudge(&self, handle: &SessionHandle, text: &str) -> Result<(), SessionError> {
        self.type_line(handle.id(), text).await
    }

    async fn capture_output(&self, handle: &SessionHandle) -> Result<String, SessionError> {
        self.capture(handle.id()).await
    }

    async fn is_alive(&self, handle: &SessionHandle) -> bool {
        self.tmux(&pane::has_session_args(handle.id()))
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn await_quiet(
        &self,
        handle: &SessionHandle,
        deadline: Instant,
    ) -> Result<String, SessionError> {
        let session = handle.id();
        let mut last = String::new();
        let mut stable = 0u32;
        let mut last_timer: Option<String> = None;
        let mut timer_stable = 0u32;

        loop {
            if Instant::now() >= deadline {
                return Err(SessionError::Deadline);
            }
            let current = self.capture(session).await?;
            let busy = pane::is_busy(&current);
            let timer = pane::work_timer(&current);

            if let Some(t) = &timer {
                if last_timer.as_deref() == Some(t.as_str()) {
                    timer_stable += 1;
                } else {
                    // Timer ticked: the agent is still working.
                    timer_stable = 0;
                    stable = 0;
                }
            }
            last_timer = timer.clone();
            if busy {
                stable = 0;
                timer_stable = 0;
            }

            if current == last {
                stable += 1;
                let timer_settled = timer.is_none() || timer_stable >= self.config.quiet_checks;
                if stable >= self.config.quiet_checks && timer_settled && !busy {
                    let marker = self.marker(session);
                    let delta = pane::delta_since(&current, marker).to_string();
                    self.set_marker(session, current.len());
                    tracing::debug!(%session, bytes = delta.len(), "agent output settled");
                    return Ok(delta);
                }
            } else {
                stable = 0;
                last = current;
            }

            let next = Instant::now() + self.config.check_interval();
            tokio::time::sleep_until(next.min(deadline)).await;
        }
    }

    async fn new_session(&self, handle: &SessionHandle) -> Result<(), SessionError> {
        let session = handle.id();
        tracing::info!(%session, "resetting agent conversation context");
        self.type_line(session, &self.config.new_context_command)
            .await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let output = self.capture(session).await?;
        self.set_marker(session, output.len());
        Ok(())
    }

    async fn restart(&self, handle: &SessionHandle) -> Result<SessionHandle, SessionError> {
        tracing::warn!(session = %handle.id(), "restarting agent session");
        self.kill_if_present(handle.id()).await;
        self.clear_marker(handle.id());
        self.start().await
    }

    async fn stop(&self, handle: SessionHandle) -> Result<(), SessionError> {
        let session = handle.id();
        // Polite exit first; the kill catches an agent that ignores it.
        let _ = self.type_line(session, "exit").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let _ = self.tmux(&pane::kill_session_args(session)).await;
        self.clear_marker(session);
        tracing::info!(%session, "tmux session closed");
        Ok(())
    }
}
