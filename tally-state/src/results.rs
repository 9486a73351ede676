use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tally_core::DecodedResult;

/// A decoded result as persisted by the storage consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredResult {
    pub id: u64,
    pub received_at: DateTime<Utc>,
    pub result: DecodedResult,
}

/// Append-only log of decoded results, queried read-only.
#[derive(Default)]
pub struct ResultLog {
    rows: RwLock<Vec<StoredResult>>,
    next_id: AtomicU64,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, result: DecodedResult) -> StoredResult {
        self.append_at(result, Utc::now())
    }

    pub fn append_at(&self, result: DecodedResult, received_at: DateTime<Utc>) -> StoredResult {
        let row = StoredResult {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            received_at,
            result,
        };
        self.rows.write().push(row.clone());
        tracing::debug!(id = row.id, key = row.result.key(), "result stored");
        row
    }

    /// Up to `n` rows, newest first.
    pub fn recent(&self, n: usize) -> Vec<StoredResult> {
        self.rows.read().iter().rev().take(n).cloned().collect()
    }

    /// Rows whose key dimension equals `key`, newest first.
    pub fn by_key(&self, key: &str) -> Vec<StoredResult> {
        self.rows
            .read()
            .iter()
            .rev()
            .filter(|r| r.result.key() == key)
            .cloned()
            .collect()
    }

    /// Rows received at or after `from`, newest first.
    pub fn since(&self, from: DateTime<Utc>) -> Vec<StoredResult> {
        self.rows
            .read()
            .iter()
            .rev()
            .filter(|r| r.received_at >= from)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
