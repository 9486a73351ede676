use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A keyed event read from an input channel.
///
/// `event_time` is the instant the event was observed unless the source was
/// configured to take it from the transport (e.g. the broker timestamp).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    #[serde(default)]
    pub key: Option<String>,
    pub value: String,
    pub event_time: DateTime<Utc>,
}

impl Event {
    pub fn new(key: Option<String>, value: impl Into<String>, event_time: DateTime<Utc>) -> Self {
        Self {
            key,
            value: value.into(),
            event_time,
        }
    }

    /// Event stamped with the current wall clock.
    pub fn observed(key: Option<String>, value: impl Into<String>) -> Self {
        Self::new(key, value, Utc::now())
    }

    pub fn keyed(key: impl Into<String>, value: impl Into<String>, event_time: DateTime<Utc>) -> Self {
        Self::new(Some(key.into()), value, event_time)
    }
}
