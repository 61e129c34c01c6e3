use async_trait::async_trait;
use thiserror::Error;

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn '{command}': {detail}")]
    Spawn { command: String, detail: String },

    #[error("session transport {op} failed: {detail}")]
    Transport { op: String, detail: String },

    #[error("session '{0}' is gone")]
    Gone(String),

    #[error("no response before the deadline")]
    Deadline,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Opaque identifier for one live agent session. Only the backend that
/// issued it can interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    id: String,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

// ---------------------------------------------------------------------------
// SessionBackend
// ---------------------------------------------------------------------------

/// Transport to the interactive coding agent. The orchestrator drives the
/// agent exclusively through this interface; the backend owns idle
/// detection and any per-session bookkeeping.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Launch the agent and return a handle once it is ready for input.
    async fn start(&self) -> Result<SessionHandle, SessionError>;

    /// Type `text` into the session followed by a newline. An empty string
    /// sends a bare newline.
    async fn send(&self, handle: &SessionHandle, text: &str) -> Result<(), SessionError>;

    /// Poke an idle session without disturbing response tracking: the output
    /// of the in-flight prompt must still come back whole from
    /// [`Self::await_quiet`]. Defaults to a plain `send` for backends that
    /// keep no per-send bookkeeping.
    async fn nudge(&self, handle: &SessionHandle, text: &str) -> Result<(), SessionError> {
        self.send(handle, text).await
    }

    /// Current visible output, including scrollback.
    async fn capture_output(&self, handle: &SessionHandle) -> Result<String, SessionError>;

    async fn is_alive(&self, handle: &SessionHandle) -> bool;

    /// Resolve once the agent has stopped producing output, returning the
    /// output added since the last `send`. Fails with
    /// [`SessionError::Deadline`] when `deadline` passes first.
    async fn await_quiet(
        &self,
        handle: &SessionHandle,
        deadline: tokio::time::Instant,
    ) -> Result<String, SessionError>;

    /// Discard the conversation context, keeping the process alive.
    async fn new_session(&self, handle: &SessionHandle) -> Result<(), SessionError>;

    /// Kill the session and launch a fresh one.
    async fn restart(&self, handle: &SessionHandle) -> Result<SessionHandle, SessionError>;

    async fn stop(&self, handle: SessionHandle) -> Result<(), SessionError>;
}
