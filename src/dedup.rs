//! Error dedup (§4.K): suppress repeated log lines keyed by `(session_id,
//! context)`, periodically emitting a `{first, last, count}` summary instead
//! of logging every occurrence.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Minimum gap between summary emissions for the same key.
pub const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Entry {
    first_message: String,
    last_message: String,
    count: u64,
    first_seen: Instant,
    last_emitted: Instant,
}

/// Tracks suppressed occurrences of repeated errors per `(session_id,
/// context)` key.
#[derive(Debug, Default)]
pub struct ErrorDedup {
    entries: Mutex<HashMap<(String, String), Entry>>,
}

impl ErrorDedup {
    /// Create an empty dedup table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of `message` for `(session_id, context)`.
    ///
    /// The first occurrence for a key is logged immediately. Subsequent
    /// occurrences are suppressed until [`SUMMARY_INTERVAL`] has elapsed
    /// since the last emission, at which point a summary line is logged and
    /// the count resets.
    pub fn record(&self, session_id: &str, context: &str, message: &str) {
        let key = (session_id.to_owned(), context.to_owned());
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        match entries.get_mut(&key) {
            None => {
                warn!(session_id, context, message, "first occurrence");
                entries.insert(
                    key,
                    Entry {
                        first_message: message.to_owned(),
                        last_message: message.to_owned(),
                        count: 1,
                        first_seen: now,
                        last_emitted: now,
                    },
                );
            }
            Some(entry) => {
                entry.count += 1;
                entry.last_message = message.to_owned();
                if now.duration_since(entry.last_emitted) >= SUMMARY_INTERVAL {
                    warn!(
                        session_id,
                        context,
                        first = %entry.first_message,
                        last = %entry.last_message,
                        count = entry.count,
                        since_secs = entry.first_seen.elapsed().as_secs(),
                        "suppressed repeated errors"
                    );
                    entry.last_emitted = now;
                }
            }
        }
    }

    /// Number of distinct `(session_id, context)` keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop all tracking for a session, e.g. once it exits.
    pub fn clear_session(&self, session_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _), _| id != session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_occurrence_creates_an_entry() {
        let dedup = ErrorDedup::new();
        dedup.record("sess1", "parser", "bad escape sequence");
        assert_eq!(dedup.tracked_keys(), 1);
    }

    #[test]
    fn repeated_occurrences_increment_count_without_new_entries() {
        let dedup = ErrorDedup::new();
        for _ in 0..5 {
            dedup.record("sess1", "parser", "bad escape sequence");
        }
        assert_eq!(dedup.tracked_keys(), 1);
    }

    #[test]
    fn distinct_keys_tracked_separately() {
        let dedup = ErrorDedup::new();
        dedup.record("sess1", "parser", "a");
        dedup.record("sess2", "parser", "a");
        dedup.record("sess1", "writer", "a");
        assert_eq!(dedup.tracked_keys(), 3);
    }

    #[test]
    fn clear_session_removes_only_that_sessions_keys() {
        let dedup = ErrorDedup::new();
        dedup.record("sess1", "parser", "a");
        dedup.record("sess2", "parser", "a");
        dedup.clear_session("sess1");
        assert_eq!(dedup.tracked_keys(), 1);
    }
}
