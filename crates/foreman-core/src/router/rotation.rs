use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// KeyRotator
// ---------------------------------------------------------------------------

/// Round-robin credential selection with a cooldown after throttling.
/// A penalized key sits out until its cooldown lapses; when every key is
/// cooling down, the one penalized longest ago is used anyway.
#[derive(Debug)]
pub struct KeyRotator {
    keys: Vec<String>,
    cooldown: Duration,
    cursor: usize,
    cooldown_until: Vec<Option<Instant>>,
    last_penalty: Vec<Option<Instant>>,
}

impl KeyRotator {
    pub fn new(keys: Vec<String>, cooldown: Duration) -> Self {
        let n = keys.len();
        Self {
            keys,
            cooldown,
            cursor: 0,
            cooldown_until: vec![None; n],
            last_penalty: vec![None; n],
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Pick the credential for the next request.
    pub fn next(&mut self) -> Option<(usize, String)> {
        let n = self.keys.len();
        if n == 0 {
            return None;
        }
        let now = Instant::now();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            let cooling = self.cooldown_until[idx].is_some_and(|until| until > now);
            if !cooling {
                self.cursor = (idx + 1) % n;
                return Some((idx, self.keys[idx].clone()));
            }
        }
        let idx = (0..n).min_by_key(|&i| self.last_penalty[i])?;
        self.cursor = (idx + 1) % n;
        Some((idx, self.keys[idx].clone()))
    }

    /// Mark a credential as throttled.
    pub fn penalize(&mut self, idx: usize) {
        if idx >= self.keys.len() {
            return;
        }
        let now = Instant::now();
        self.cooldown_until[idx] = Some(now + self.cooldown);
        self.last_penalty[idx] = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
