use crate::config::WatchdogConfig;
use crate::error::Result;
use crate::health::{classify, hash_output, SampleWindow, Verdict};
use crate::session::{SessionBackend, SessionError, SessionHandle};
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// WatchdogSignal
// ---------------------------------------------------------------------------

/// A condition that interrupts the current iteration. Idle and active
/// sessions are handled inside the monitor loop and never surface here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogSignal {
    Crashed,
    Errored { marker: String, context: String },
    SuspectLoop { repeats: u32 },
    Timeout,
}

impl std::fmt::Display for WatchdogSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crashed => f.write_str("agent process crashed"),
            Self::Errored { marker, .. } => write!(f, "error marker '{marker}' in output"),
            Self::SuspectLoop { repeats } => {
                write!(f, "output unchanged for {repeats} consecutive polls")
            }
            Self::Timeout => f.write_str("iteration deadline passed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

/// Coarse health monitor. Runs concurrently with the session's own quiet
/// detection and polls on a much slower cadence; whichever resolves first
/// decides the iteration.
pub struct Watchdog {
    poll_interval: Duration,
    loop_threshold: u32,
    error_markers: Vec<String>,
    nudge_text: String,
    window_cap: usize,
}

impl Watchdog {
    pub fn new(cfg: &WatchdogConfig) -> Self {
        let polls_per_iteration =
            (cfg.iteration_timeout_secs + cfg.poll_interval_secs - 1) / cfg.poll_interval_secs;
        Self {
            poll_interval: cfg.poll_interval(),
            loop_threshold: cfg.loop_threshold,
            error_markers: cfg.error_markers.clone(),
            nudge_text: cfg.nudge_text.clone(),
            window_cap: (polls_per_iteration as usize)
                .max(cfg.loop_threshold as usize)
                .max(2),
        }
    }

    /// Observe `handle` until something needs intervention or `deadline`
    /// passes. An idle session is nudged once per idle stretch; the nudge
    /// re-arms when output moves again.
    pub async fn monitor<S>(
        &self,
        session: &S,
        handle: &SessionHandle,
        deadline: Instant,
    ) -> Result<WatchdogSignal>
    where
        S: SessionBackend + ?Sized,
    {
        let mut window = SampleWindow::new(self.window_cap);
        let mut prev_output = String::new();
        let mut nudged = false;

        loop {
            let next_poll = Instant::now() + self.poll_interval;
            if next_poll >= deadline {
                tokio::time::sleep_until(deadline).await;
                tracing::warn!("iteration deadline reached");
                return Ok(WatchdogSignal::Timeout);
            }
            tokio::time::sleep_until(next_poll).await;

            let alive = session.is_alive(handle).await;
            let output = if alive {
                match session.capture_output(handle).await {
                    Ok(out) => out,
                    Err(SessionError::Gone(_)) => {
                        return Ok(WatchdogSignal::Crashed);
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                prev_output.clone()
            };

            let hit =
                crate::health::new_error_marker(&prev_output, &output, &self.error_markers);
            let sample = window.observe(Utc::now(), hash_output(&output), alive);

            match classify(&window, hit, self.loop_threshold) {
                Verdict::Crashed => {
                    tracing::warn!(session = %handle, "agent process is gone");
                    return Ok(WatchdogSignal::Crashed);
                }
                Verdict::Errored(hit) => {
                    tracing::warn!(marker = %hit.marker, "error marker in session output");
                    return Ok(WatchdogSignal::Errored {
                        marker: hit.marker,
                        context: hit.context,
                    });
                }
                Verdict::SuspectLoop { repeats } => {
                    tracing::warn!(repeats, idle_secs = sample.idle_secs, "session output looks stuck");
                    return Ok(WatchdogSignal::SuspectLoop { repeats });
                }
                Verdict::Idle => {
                    if !nudged {
                        tracing::info!(session = %handle, idle_secs = sample.idle_secs, "idle session, sending nudge");
                        session.nudge(handle, &self.nudge_text).await?;
                        nudged = true;
                    }
                }
                Verdict::Active => {
                    nudged = false;
                }
            }
            prev_output = output;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
