use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use tally_core::codec::{self, ResultCodec};
use tally_core::metrics;
use tally_core::{
    AggregateStore, Context, Event, FinalizedResult, Operator, Result, Watermark, Window, WindowedKey,
};
use tally_state::InMemoryStore;
use tracing::instrument;

use crate::time::WatermarkClock;

/// Epoch-aligned tumbling windows. Bucketing is plain millisecond arithmetic,
/// independent of any display time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAssigner {
    size: Duration,
}

impl WindowAssigner {
    pub fn tumbling(size: Duration) -> Result<Self> {
        if size <= Duration::zero() {
            return Err(tally_core::Error::Config(format!(
                "window size must be positive, got {}ms",
                size.num_milliseconds()
            )));
        }
        Ok(Self { size })
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    /// The window `[start, start + size)` holding `ts`; a timestamp on a
    /// boundary opens the window starting there.
    pub fn assign(&self, ts: DateTime<Utc>) -> Window {
        let size_ms = self.size.num_milliseconds();
        let ts_ms = ts.timestamp_millis();
        let start_ms = ts_ms - ts_ms.rem_euclid(size_ms);
        let start = DateTime::<Utc>::from_timestamp_millis(start_ms).unwrap_or(DateTime::<Utc>::MIN_UTC);
        Window::new(start, self.size)
    }
}

/// Folds one payload into the running aggregate. `None` marks a payload the
/// fold cannot use; the aggregate is then left unchanged.
pub type FoldFn = fn(i64, &str) -> Option<i64>;

pub fn fold_sum(acc: i64, value: &str) -> Option<i64> {
    value.parse::<i64>().ok().map(|x| acc.saturating_add(x))
}

pub fn fold_count(acc: i64, _value: &str) -> Option<i64> {
    Some(acc.saturating_add(1))
}

#[derive(Debug, Clone, Copy)]
pub struct AggregateConfig {
    pub window_size: Duration,
    pub fold: FoldFn,
    pub seed: i64,
}

impl AggregateConfig {
    pub fn sum(window_size: Duration) -> Self {
        Self {
            window_size,
            fold: fold_sum,
            seed: 0,
        }
    }

    pub fn count(window_size: Duration) -> Self {
        Self {
            window_size,
            fold: fold_count,
            seed: 0,
        }
    }
}

/// Lifecycle of one `WindowedKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Open,
    /// The watermark passed the window end; emission is pending.
    Closed,
    /// Finalized and removed from the store. Terminal.
    Emitted,
}

/// Keyed tumbling-window aggregation with suppression until window close.
///
/// Partial values live only in the `AggregateStore`. A `(key, window)` pair is
/// emitted exactly once, when the watermark reaches its end, and is then
/// removed from the store. Events for a window whose end the watermark already
/// reached are dropped as late.
///
/// The watermark is local to the instance and moves only with what arrives on
/// its own lane: events, watermarks and ticks, in order. Several instances (one
/// per lane) may share a store; each finalizes only the entries it created.
///
/// ```no_run
/// use chrono::Duration;
/// use tally_core::ResultCodec;
/// use tally_ops::{AggregateConfig, WindowedAggregate};
/// let op = WindowedAggregate::new("hourly-sales", AggregateConfig::sum(Duration::hours(1)), ResultCodec::HourlySales)
///     .expect("positive window");
/// # let _ = op;
/// ```
pub struct WindowedAggregate {
    name: String,
    assigner: WindowAssigner,
    config: AggregateConfig,
    codec: ResultCodec,
    display_offset: FixedOffset,
    store: Arc<dyn AggregateStore>,
    clock: WatermarkClock,
    // window end (ms) -> entries created by this instance
    close_index: BTreeMap<i64, Vec<WindowedKey>>,
}

impl WindowedAggregate {
    pub fn new(name: impl Into<String>, config: AggregateConfig, codec: ResultCodec) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            assigner: WindowAssigner::tumbling(config.window_size)?,
            config,
            codec,
            display_offset: codec::seoul(),
            store: Arc::new(InMemoryStore::new()),
            clock: WatermarkClock::new(),
            close_index: BTreeMap::new(),
        })
    }

    pub fn with_store(mut self, store: Arc<dyn AggregateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_display_offset(mut self, offset: FixedOffset) -> Self {
        self.display_offset = offset;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.clock.watermark()
    }

    /// Folds one event and returns whatever the resulting watermark closed.
    pub fn on_event(&mut self, event: &Event) -> Vec<FinalizedResult> {
        metrics::OP_THROUGHPUT
            .with_label_values(&["WindowedAggregate", "receive"])
            .inc();
        let Some(key) = event.key.as_deref() else {
            tracing::warn!(pipeline = %self.name, value = %event.value, "event without key dropped");
            metrics::DROPPED_EVENTS.with_label_values(&["missing_key"]).inc();
            return self.close_due();
        };

        let window = self.assigner.assign(event.event_time);
        if let Some(wm) = self.clock.watermark() {
            if window.end <= wm {
                tracing::warn!(
                    pipeline = %self.name,
                    key,
                    event_time = %event.event_time,
                    window_end = %window.end,
                    watermark = %wm,
                    "late event dropped"
                );
                metrics::DROPPED_EVENTS.with_label_values(&["late"]).inc();
                return self.close_due();
            }
        }

        let wk = WindowedKey::new(key, window);
        let fold = self.config.fold;
        let mut malformed = false;
        let upserted = self.store.upsert(&wk, self.config.seed, &mut |acc| match fold(acc, &event.value) {
            Some(next) => next,
            None => {
                malformed = true;
                acc
            }
        });
        if malformed {
            tracing::warn!(pipeline = %self.name, key, value = %event.value, "malformed payload left aggregate unchanged");
            metrics::DROPPED_EVENTS.with_label_values(&["malformed"]).inc();
        } else {
            tracing::debug!(pipeline = %self.name, key, value = upserted.value, window_start = %window.start, "folded");
        }
        if upserted.created {
            self.close_index
                .entry(window.end.timestamp_millis())
                .or_default()
                .push(wk);
            metrics::OPEN_WINDOWS.with_label_values(&[self.name.as_str()]).inc();
        }

        self.clock.observe(event.event_time);
        self.close_due()
    }

    /// Moves the watermark forward (never back) and finalizes what closed.
    pub fn advance(&mut self, to: DateTime<Utc>) -> Vec<FinalizedResult> {
        self.clock.observe(to);
        self.close_due()
    }

    pub fn window_state(&self, wk: &WindowedKey) -> WindowState {
        let closed = self.clock.watermark().is_some_and(|wm| wk.window.end <= wm);
        match (closed, self.store.get(wk).is_some()) {
            (false, _) => WindowState::Open,
            (true, true) => WindowState::Closed,
            (true, false) => WindowState::Emitted,
        }
    }

    /// Live entries this instance still has to finalize.
    pub fn open_windows(&self) -> usize {
        self.close_index.values().map(Vec::len).sum()
    }

    fn close_due(&mut self) -> Vec<FinalizedResult> {
        let Some(wm_ms) = self.clock.watermark_ms() else {
            return Vec::new();
        };
        metrics::LAG_WATERMARK_MS.set(Utc::now().timestamp_millis().saturating_sub(wm_ms));
        let still_open = self.close_index.split_off(&wm_ms.saturating_add(1));
        let due = std::mem::replace(&mut self.close_index, still_open);
        let mut out = Vec::new();
        for wk in due.into_values().flatten() {
            metrics::OPEN_WINDOWS.with_label_values(&[self.name.as_str()]).dec();
            // already removed means already emitted
            let Some(entry) = self.store.remove(&wk) else { continue };
            metrics::WINDOWS_FINALIZED.with_label_values(&[self.name.as_str()]).inc();
            out.push(FinalizedResult {
                key: wk.key,
                window: wk.window,
                value: entry.value,
            });
        }
        out
    }

    fn emit(&self, ctx: &mut dyn Context, results: Vec<FinalizedResult>) {
        for result in results {
            let line = self.codec.encode(&result, &self.display_offset);
            tracing::info!(pipeline = %self.name, key = %result.key, value = result.value, "{}", line);
            metrics::OP_THROUGHPUT
                .with_label_values(&["WindowedAggregate", "emit"])
                .inc();
            ctx.collect(Event::new(Some(result.key), line, result.window.end));
        }
    }
}

#[async_trait]
impl Operator for WindowedAggregate {
    #[instrument(name = "windowed_aggregate_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, event: Event) -> Result<()> {
        let results = self.on_event(&event);
        self.emit(ctx, results);
        Ok(())
    }

    async fn on_watermark(&mut self, ctx: &mut dyn Context, wm: Watermark) -> Result<()> {
        let results = self.advance(wm.0);
        self.emit(ctx, results);
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &mut dyn Context, now: DateTime<Utc>) -> Result<()> {
        let results = self.advance(now);
        self.emit(ctx, results);
        Ok(())
    }
}
