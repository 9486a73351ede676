//! tally-state: state layer
//! Provides the in-memory `AggregateStore` and the `ResultLog` for decoded results.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tally_core::{AggregateEntry, AggregateStore, Upserted, WindowedKey};

pub mod results;

pub use results::{ResultLog, StoredResult};

/// Sharded map of live aggregates. Each read-modify-write holds only the lock
/// of the shard owning the key, so unrelated windows never contend on one lock.
#[derive(Default)]
pub struct InMemoryStore {
    map: DashMap<WindowedKey, AggregateEntry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AggregateStore for InMemoryStore {
    fn upsert(&self, key: &WindowedKey, seed: i64, update: &mut dyn FnMut(i64) -> i64) -> Upserted {
        let now = Utc::now();
        match self.map.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.value = update(entry.value);
                entry.last_updated = now;
                Upserted {
                    value: entry.value,
                    created: false,
                }
            }
            Entry::Vacant(vacant) => {
                let value = update(seed);
                vacant.insert(AggregateEntry {
                    value,
                    last_updated: now,
                });
                Upserted { value, created: true }
            }
        }
    }

    fn get(&self, key: &WindowedKey) -> Option<AggregateEntry> {
        self.map.get(key).map(|e| *e.value())
    }

    fn remove(&self, key: &WindowedKey) -> Option<AggregateEntry> {
        self.map.remove(key).map(|(_, e)| e)
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
