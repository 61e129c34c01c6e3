use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

static FENCE_RE: OnceLock<Regex> = OnceLock::new();

fn fence_re() -> &'static Regex {
    FENCE_RE.get_or_init(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").unwrap())
}

// ---------------------------------------------------------------------------
// Extraction ladder
// ---------------------------------------------------------------------------

/// Pull a JSON value out of model output. Models wrap payloads in fences,
/// prose, or nothing at all, so the ladder is: fenced block, then the first
/// balanced object or array, then the whole text.
pub fn extract_json(text: &str) -> Result<Value, String> {
    if let Some(caps) = fence_re().captures(text) {
        if let Some(inner) = caps.get(1) {
            if let Ok(value) = serde_json::from_str(inner.as_str().trim()) {
                return Ok(value);
            }
        }
    }

    for (idx, ch) in text.char_indices() {
        if ch != '{' && ch != '[' {
            continue;
        }
        if let Some(candidate) = balanced_slice(text, idx) {
            if let Ok(value) = serde_json::from_str(candidate) {
                return Ok(value);
            }
        }
    }

    serde_json::from_str(text.trim()).map_err(|e| format!("no JSON payload found: {e}"))
}

/// Slice from the opening bracket at `open` to its matching close, skipping
/// brackets inside string literals.
fn balanced_slice(text: &str, open: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let (open_ch, close_ch) = match bytes[open] {
        b'{' => (b'{', b'}'),
        b'[' => (b'[', b']'),
        _ => return None,
    };
    let mut depth = 0u32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else if b == b'"' {
            in_string = true;
        } else if b == open_ch {
            depth += 1;
        } else if b == close_ch {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(&text[open..=i]);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
