//! tmux transport for the foreman supervision loop.
//!
//! The subordinate coding agent is an interactive terminal program. Driving
//! it through a detached tmux session gives the supervisor three things a
//! plain pipe does not: scrollback capture for the watchdog, liveness via
//! `has-session`, and the ability to kill and relaunch the agent without
//! owning its pty.

mod backend;
pub mod pane;

pub use backend::TmuxBackend;
