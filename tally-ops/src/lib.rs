//! tally-ops: operators built on top of tally-core.
//!
//! Included operators:
//! - `Map`: one-to-many mapping of event values
//! - `Filter`: predicate-based filtering
//! - `KeyBy`: re-key events from their contents
//! - `RunningCount`: per-key running occurrence count, emitted on every event
//! - `WindowedAggregate`: keyed tumbling-window sum/count, emitted once per window on close
//!
//! `pipelines` wires these into the six named pipelines and the `Topology`.

use std::collections::HashMap;

use async_trait::async_trait;
use tally_core::{Context, Event, Operator, Result};
use tracing::instrument;

pub mod pipelines;
pub mod time;
pub mod window;

pub use pipelines::{PipelineKind, PipelineOptions, Registration, Topology};
pub use time::WatermarkClock;
pub use window::{
    fold_count, fold_sum, AggregateConfig, FoldFn, WindowAssigner, WindowState, WindowedAggregate,
};

#[async_trait]
pub trait FnMap: Send + Sync {
    async fn call(&self, value: &str) -> Result<Vec<String>>;
}

pub struct MapFn<F>(pub F);
impl<F> MapFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}
#[async_trait]
impl<F> FnMap for MapFn<F>
where
    F: Fn(&str) -> Vec<String> + Send + Sync,
{
    async fn call(&self, value: &str) -> Result<Vec<String>> {
        Ok((self.0)(value))
    }
}

/// Map operator: applies a user function that returns zero or more values per input.
/// Outputs keep the key and event time of their input.
///
/// Example
/// ```no_run
/// use tally_ops::{Map, MapFn};
/// let map = Map::new(MapFn::new(|v: &str| vec![v.to_uppercase()]));
/// # let _ = map;
/// ```
pub struct Map<F> {
    func: F,
}
impl<F> Map<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Operator for Map<F>
where
    F: FnMap + Send + Sync + 'static,
{
    #[instrument(name = "map_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, event: Event) -> Result<()> {
        let outs = self.func.call(&event.value).await?;
        tally_core::metrics::OP_THROUGHPUT
            .with_label_values(&["Map", "receive"])
            .inc();
        for value in outs {
            ctx.collect(Event::new(event.key.clone(), value, event.event_time));
            tally_core::metrics::OP_THROUGHPUT
                .with_label_values(&["Map", "emit"])
                .inc();
        }
        Ok(())
    }
}

#[async_trait]
pub trait FnFilter: Send + Sync {
    async fn call(&self, value: &str) -> Result<bool>;
}

pub struct FilterFn<F>(pub F);
impl<F> FilterFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}
#[async_trait]
impl<F> FnFilter for FilterFn<F>
where
    F: Fn(&str) -> bool + Send + Sync,
{
    async fn call(&self, value: &str) -> Result<bool> {
        Ok((self.0)(value))
    }
}

/// Filter operator: keeps events whose value satisfies the predicate.
///
/// Example
/// ```no_run
/// use tally_ops::{Filter, FilterFn};
/// let filter = Filter::new(FilterFn::new(|v: &str| v.contains("중요")));
/// # let _ = filter;
/// ```
pub struct Filter<F> {
    pred: F,
}
impl<F> Filter<F> {
    pub fn new(pred: F) -> Self {
        Self { pred }
    }
}

#[async_trait]
impl<F> Operator for Filter<F>
where
    F: FnFilter + Send + Sync + 'static,
{
    #[instrument(name = "filter_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, event: Event) -> Result<()> {
        tally_core::metrics::OP_THROUGHPUT
            .with_label_values(&["Filter", "receive"])
            .inc();
        if self.pred.call(&event.value).await? {
            ctx.collect(event);
            tally_core::metrics::OP_THROUGHPUT
                .with_label_values(&["Filter", "emit"])
                .inc();
        }
        Ok(())
    }
}

type KeySelector = Box<dyn Fn(&Event) -> Option<String> + Send + Sync>;

/// KeyBy operator: replaces the event key with one derived from the event.
///
/// Example
/// ```no_run
/// use tally_ops::KeyBy;
/// let key_by = KeyBy::value();
/// # let _ = key_by;
/// ```
pub struct KeyBy {
    select: KeySelector,
}
impl KeyBy {
    pub fn new<F>(select: F) -> Self
    where
        F: Fn(&Event) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            select: Box::new(select),
        }
    }

    /// Keys each event by its own value.
    pub fn value() -> Self {
        Self::new(|e| Some(e.value.clone()))
    }
}

#[async_trait]
impl Operator for KeyBy {
    #[instrument(name = "keyby_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, mut event: Event) -> Result<()> {
        tally_core::metrics::OP_THROUGHPUT
            .with_label_values(&["KeyBy", "receive"])
            .inc();
        event.key = (self.select)(&event);
        ctx.collect(event);
        tally_core::metrics::OP_THROUGHPUT
            .with_label_values(&["KeyBy", "emit"])
            .inc();
        Ok(())
    }
}

/// Unwindowed running count per key. Every event emits the updated count for
/// its key (`key` = key, `value` = count).
///
/// Example
/// ```no_run
/// use tally_ops::RunningCount;
/// let counts = RunningCount::new();
/// # let _ = counts;
/// ```
#[derive(Default)]
pub struct RunningCount {
    counts: HashMap<String, i64>,
}

impl RunningCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, key: &str) -> i64 {
        self.counts.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Operator for RunningCount {
    #[instrument(name = "running_count_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, event: Event) -> Result<()> {
        let Some(key) = event.key else {
            tracing::warn!(value = %event.value, "event without key dropped");
            tally_core::metrics::DROPPED_EVENTS
                .with_label_values(&["missing_key"])
                .inc();
            return Ok(());
        };
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        tracing::debug!(key = %key, count = *count, "counted");
        ctx.collect(Event::new(Some(key), count.to_string(), event.event_time));
        tally_core::metrics::OP_THROUGHPUT
            .with_label_values(&["RunningCount", "emit"])
            .inc();
        Ok(())
    }
}

pub mod prelude {
    pub use super::{
        AggregateConfig, Filter, FilterFn, FnFilter, FnMap, KeyBy, Map, MapFn, PipelineKind, RunningCount,
        Topology, WindowedAggregate,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tally_core::Watermark;

    struct TestCtx {
        out: Vec<Event>,
    }

    impl Context for TestCtx {
        fn collect(&mut self, event: Event) {
            self.out.push(event);
        }
        fn watermark(&mut self, _wm: Watermark) {}
    }

    fn ts() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_763_010_000, 0).unwrap()
    }

    fn ev(key: Option<&str>, value: &str) -> Event {
        Event::new(key.map(str::to_string), value, ts())
    }

    #[tokio::test]
    async fn test_map() {
        let mut op = Map::new(MapFn::new(|v: &str| {
            v.split(' ').map(str::to_string).collect::<Vec<_>>()
        }));
        let mut ctx = TestCtx { out: vec![] };
        op.on_element(&mut ctx, ev(Some("k"), "a b")).await.unwrap();
        assert_eq!(ctx.out.len(), 2);
        assert_eq!(ctx.out[1].value, "b");
        assert_eq!(ctx.out[1].key.as_deref(), Some("k"));
        assert_eq!(ctx.out[1].event_time, ts());
    }

    #[tokio::test]
    async fn test_filter() {
        let mut op = Filter::new(FilterFn::new(|v: &str| v.contains("중요")));
        let mut ctx = TestCtx { out: vec![] };
        op.on_element(&mut ctx, ev(None, "중요한 메시지입니다")).await.unwrap();
        op.on_element(&mut ctx, ev(None, "일반 메시지입니다")).await.unwrap();
        assert_eq!(ctx.out.len(), 1);
        assert_eq!(ctx.out[0].value, "중요한 메시지입니다");
    }

    #[tokio::test]
    async fn test_keyby() {
        let mut op = KeyBy::value();
        let mut ctx = TestCtx { out: vec![] };
        op.on_element(&mut ctx, ev(None, "hello")).await.unwrap();
        assert_eq!(ctx.out[0].key.as_deref(), Some("hello"));

        let mut op = KeyBy::new(|_| None);
        op.on_element(&mut ctx, ev(Some("x"), "y")).await.unwrap();
        assert_eq!(ctx.out[1].key, None);
    }

    #[tokio::test]
    async fn test_running_count() {
        let mut op = RunningCount::new();
        let mut ctx = TestCtx { out: vec![] };
        for w in ["hello", "world", "hello"] {
            op.on_element(&mut ctx, ev(Some(w), w)).await.unwrap();
        }
        op.on_element(&mut ctx, ev(None, "orphan")).await.unwrap();
        let pairs: Vec<(String, String)> = ctx
            .out
            .iter()
            .map(|e| (e.key.clone().unwrap(), e.value.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("hello".to_string(), "1".to_string()),
                ("world".to_string(), "1".to_string()),
                ("hello".to_string(), "2".to_string()),
            ]
        );
        assert_eq!(op.count("hello"), 2);
        assert_eq!(op.count("orphan"), 0);
    }
}
