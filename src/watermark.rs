/// monotonic freshness cursors.
///
/// a watermark remembers the last timestamp it has seen for one
/// cacheable dataset; only a strict advance counts as news.  the cursor
/// never moves backwards, so replayed or stale reads can delay an
/// invalidation but never re-fire one.
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Advanced,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    name: String,
    cursor_ms: u64,
}

impl Watermark {
    pub fn new(name: &str, cursor_ms: u64) -> Watermark {
        Watermark {
            name: name.to_string(),
            cursor_ms,
        }
    }

    /// cursor starts at the current wall clock; only updates written
    /// after process start will fire
    pub fn starting_now(name: &str) -> Watermark {
        Watermark::new(name, now_ms())
    }

    /// advance the cursor when the observed timestamp strictly exceeds
    /// it; equal or older observations leave it alone
    pub fn observe(&mut self, observed_ms: u64) -> Freshness {
        if observed_ms > self.cursor_ms {
            self.cursor_ms = observed_ms;
            Freshness::Advanced
        } else {
            Freshness::Unchanged
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cursor_ms(&self) -> u64 {
        self.cursor_ms
    }
}

/// milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
