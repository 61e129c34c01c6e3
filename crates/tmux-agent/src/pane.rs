use regex::Regex;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Busy / quiet detection
// ---------------------------------------------------------------------------

static BUSY_RE: OnceLock<Regex> = OnceLock::new();
static TIMER_RE: OnceLock<Regex> = OnceLock::new();

fn busy_re() -> &'static Regex {
    BUSY_RE.get_or_init(|| {
        Regex::new(r"(?i)(Executing\.\.\.|Running command|In progress|⏳)").unwrap()
    })
}

fn timer_re() -> &'static Regex {
    TIMER_RE.get_or_init(|| Regex::new(r"\[⏱\s*(\d+m\s*\d+s)\]").unwrap())
}

/// The agent is visibly in the middle of a tool call or command. Quiet
/// counting restarts whenever one of these markers is on screen.
pub fn is_busy(output: &str) -> bool {
    busy_re().is_match(output)
}

/// The agent's work timer reading, e.g. `02m13s` from `[⏱ 02m13s]`. A
/// ticking timer means work is still happening even when the rest of the
/// pane looks frozen.
pub fn work_timer(output: &str) -> Option<String> {
    timer_re()
        .captures(output)
        .map(|c| c[1].split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Slice of `full` past the byte offset recorded before the last send.
/// Falls back to the whole capture when the pane scrolled (shorter than the
/// marker) or the marker landed inside a multi-byte character.
pub fn delta_since(full: &str, marker: usize) -> &str {
    match full.get(marker..) {
        Some(tail) => tail,
        None => full,
    }
}

// ---------------------------------------------------------------------------
// tmux argument builders
// ---------------------------------------------------------------------------

pub fn new_session_args(session: &str) -> Vec<String> {
    args(&["new-session", "-d", "-s", session])
}

pub fn has_session_args(session: &str) -> Vec<String> {
    args(&["has-session", "-t", session])
}

pub fn kill_session_args(session: &str) -> Vec<String> {
    args(&["kill-session", "-t", session])
}

/// Literal text entry; a separate Enter keypress follows so tmux never
/// interprets the prompt as key names.
pub fn send_text_args(session: &str, text: &str) -> Vec<String> {
    args(&["send-keys", "-t", session, "-l", text])
}

pub fn send_enter_args(session: &str) -> Vec<String> {
    args(&["send-keys", "-t", session, "Enter"])
}

pub fn capture_args(session: &str, history_lines: u32) -> Vec<String> {
    args(&[
        "capture-pane",
        "-t",
        session,
        "-p",
        "-S",
        &format!("-{history_lines}"),
    ])
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
