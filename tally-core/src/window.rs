use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Half-open time bucket `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// The end saturates at the latest representable instant.
    pub fn new(start: DateTime<Utc>, size: Duration) -> Self {
        Self {
            start,
            end: start.checked_add_signed(size).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn size(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Identity of one aggregate: the grouping key plus its window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WindowedKey {
    pub key: String,
    pub window: Window,
}

impl WindowedKey {
    pub fn new(key: impl Into<String>, window: Window) -> Self {
        Self {
            key: key.into(),
            window,
        }
    }
}

/// The single value emitted for a `WindowedKey` once its window is closed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalizedResult {
    pub key: String,
    pub window: Window,
    pub value: i64,
}

/// Live partial aggregate held by an `AggregateStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateEntry {
    pub value: i64,
    pub last_updated: DateTime<Utc>,
}

/// Outcome of a read-modify-write on an `AggregateStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub value: i64,
    /// True when the entry did not exist and was seeded by this call.
    pub created: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_half_open() {
        let start = DateTime::<Utc>::from_timestamp(3_600, 0).unwrap();
        let w = Window::new(start, Duration::hours(1));
        assert!(w.contains(start));
        assert!(w.contains(w.end - Duration::milliseconds(1)));
        assert!(!w.contains(w.end));
        assert_eq!(w.size(), Duration::hours(1));
    }

    #[test]
    fn window_end_saturates_near_the_time_limit() {
        let start = DateTime::<Utc>::MAX_UTC - Duration::minutes(30);
        let w = Window::new(start, Duration::hours(1));
        assert_eq!(w.end, DateTime::<Utc>::MAX_UTC);
        assert!(w.contains(start));
    }
}
