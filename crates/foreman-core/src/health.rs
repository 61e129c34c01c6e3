use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// One observation of the agent session, taken each poll. `idle_secs` and
/// `repeat_count` accumulate across identical captures and reset the moment
/// the output hash moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSample {
    pub at: DateTime<Utc>,
    pub output_hash: u64,
    pub idle_secs: i64,
    pub repeat_count: u32,
    pub alive: bool,
}

pub fn hash_output(output: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    output.hash(&mut hasher);
    hasher.finish()
}

/// Rolling window of recent samples. One iteration timeout's worth of polls
/// is enough history for every verdict.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    cap: usize,
    samples: Vec<HealthSample>,
}

impl SampleWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            samples: Vec::new(),
        }
    }

    /// Record one poll. The idle clock and repeat streak carry over from the
    /// previous sample when the hash is unchanged, so a long streak survives
    /// even after its early samples are evicted.
    pub fn observe(&mut self, at: DateTime<Utc>, output_hash: u64, alive: bool) -> HealthSample {
        let (idle_secs, repeat_count) = match self.samples.last() {
            Some(prev) if prev.output_hash == output_hash => (
                prev.idle_secs + (at - prev.at).num_seconds().max(0),
                prev.repeat_count + 1,
            ),
            _ => (0, 1),
        };
        let sample = HealthSample {
            at,
            output_hash,
            idle_secs,
            repeat_count,
            alive,
        };
        self.samples.push(sample);
        if self.samples.len() > self.cap {
            self.samples.remove(0);
        }
        sample
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<&HealthSample> {
        self.samples.last()
    }

    /// Length of the current run of identical output hashes.
    pub fn trailing_repeats(&self) -> u32 {
        self.samples.last().map_or(0, |s| s.repeat_count)
    }
}

// ---------------------------------------------------------------------------
// Error markers
// ---------------------------------------------------------------------------

/// A marker match in session output, with surrounding lines for the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorHit {
    pub marker: String,
    pub context: String,
}

/// Detect a marker that appeared since the previous capture. Markers already
/// present last poll are not re-reported: when `cur` extends `prev` only the
/// appended suffix is scanned, otherwise occurrence counts are compared
/// (capture buffers rotate, so `prev` may no longer be a prefix).
pub fn new_error_marker(prev: &str, cur: &str, markers: &[String]) -> Option<ErrorHit> {
    if let Some(suffix) = cur.strip_prefix(prev) {
        for marker in markers {
            if suffix.contains(marker.as_str()) {
                return Some(ErrorHit {
                    marker: marker.clone(),
                    context: context_around(cur, marker),
                });
            }
        }
        return None;
    }
    for marker in markers {
        let before = prev.matches(marker.as_str()).count();
        let after = cur.matches(marker.as_str()).count();
        if after > before {
            return Some(ErrorHit {
                marker: marker.clone(),
                context: context_around(cur, marker),
            });
        }
    }
    None
}

/// Up to three lines either side of the last line containing `marker`.
fn context_around(output: &str, marker: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let Some(hit) = lines.iter().rposition(|l| l.contains(marker)) else {
        return String::new();
    };
    let start = hit.saturating_sub(3);
    let end = (hit + 4).min(lines.len());
    lines[start..end].join("\n")
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Output is still changing.
    Active,
    /// Output unchanged since the previous poll.
    Idle,
    /// Output identical across enough consecutive polls to look stuck.
    SuspectLoop { repeats: u32 },
    /// A configured error marker appeared in fresh output.
    Errored(ErrorHit),
    /// The agent process is gone.
    Crashed,
}

/// Decide the session's condition from the sample window. Precedence is
/// fixed: a dead process outranks an error marker, which outranks a
/// repetition loop, which outranks plain idleness.
pub fn classify(window: &SampleWindow, error: Option<ErrorHit>, loop_threshold: u32) -> Verdict {
    let Some(last) = window.last() else {
        return Verdict::Active;
    };
    if !last.alive {
        return Verdict::Crashed;
    }
    if let Some(hit) = error {
        return Verdict::Errored(hit);
    }
    let repeats = window.trailing_repeats();
    if repeats >= loop_threshold.max(2) {
        return Verdict::SuspectLoop { repeats };
    }
    if repeats >= 2 {
        return Verdict::Idle;
    }
    Verdict::Active
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
