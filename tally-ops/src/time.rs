use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

const UNSET: i64 = i64::MIN;

/// Watermark of one aggregation lane: the latest event time, source watermark
/// or tick instant the lane has observed. Never moves backwards. There is no
/// allowed lateness, so the watermark equals the maximum observation.
#[derive(Debug)]
pub struct WatermarkClock {
    max_observed_ms: AtomicI64,
}

impl Default for WatermarkClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WatermarkClock {
    pub fn new() -> Self {
        Self {
            max_observed_ms: AtomicI64::new(UNSET),
        }
    }

    /// Folds `ts` into the clock and returns the resulting watermark.
    pub fn observe(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let ms = ts.timestamp_millis();
        let prev = self.max_observed_ms.fetch_max(ms, Ordering::AcqRel);
        if prev > ms {
            from_ms(prev)
        } else {
            ts
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        match self.max_observed_ms.load(Ordering::Acquire) {
            UNSET => None,
            ms => Some(from_ms(ms)),
        }
    }

    pub fn watermark_ms(&self) -> Option<i64> {
        match self.max_observed_ms.load(Ordering::Acquire) {
            UNSET => None,
            ms => Some(ms),
        }
    }
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
