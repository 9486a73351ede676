//! tally-core: fundamental types, traits and the event pump.
//!
//! - `Event`, `Watermark`, `Window`, `WindowedKey`, `FinalizedResult`
//! - Traits: `Source`, `Operator`, `Sink`, `Context`, `AggregateStore`
//! - `Executor`: tokio-based source -> lanes -> sink pump with key routing,
//!   periodic ticks and cooperative shutdown
//! - `codec`: the text encoding of finalized results
//!
//! Quick example:
//! ```no_run
//! use tally_core::{Context, Event, Executor, Operator, Sink, Source};
//! # #[tokio::main]
//! # async fn main() -> tally_core::Result<()> {
//! struct MySource;
//! #[async_trait::async_trait]
//! impl Source for MySource {
//!     async fn run(&mut self, ctx: &mut dyn Context) -> tally_core::Result<()> {
//!         ctx.collect(Event::observed(None, "hello"));
//!         Ok(())
//!     }
//! }
//!
//! struct MySink;
//! #[async_trait::async_trait]
//! impl Sink for MySink {
//!     async fn on_element(&mut self, _event: Event) -> tally_core::Result<()> { Ok(()) }
//! }
//!
//! let mut exec = Executor::new();
//! exec.source(MySource).sink(MySink);
//! exec.run().await?;
//! # Ok(()) }
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub mod codec;
pub mod config;
pub mod metrics;
pub mod record;
pub mod window;

pub use codec::{CodecError, DecodedResult, ResultCodec};
pub use record::Event;
pub use window::{AggregateEntry, FinalizedResult, Upserted, Window, WindowedKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark(pub DateTime<Utc>);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Mapping from `WindowedKey` to a partial aggregate.
///
/// `upsert` is an atomic read-modify-write for one key. Implementations must
/// not serialize updates to different keys behind a single lock.
pub trait AggregateStore: Send + Sync {
    /// Seeds the entry with `seed` if absent, then applies `update`.
    fn upsert(&self, key: &WindowedKey, seed: i64, update: &mut dyn FnMut(i64) -> i64) -> Upserted;
    fn get(&self, key: &WindowedKey) -> Option<AggregateEntry>;
    fn remove(&self, key: &WindowedKey) -> Option<AggregateEntry>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait Context: Send {
    fn collect(&mut self, event: Event);
    fn watermark(&mut self, wm: Watermark);
}

#[async_trait::async_trait]
pub trait Source: Send {
    async fn run(&mut self, ctx: &mut dyn Context) -> Result<()>;
}

#[async_trait::async_trait]
pub trait Operator: Send {
    async fn on_element(&mut self, ctx: &mut dyn Context, event: Event) -> Result<()>;
    async fn on_watermark(&mut self, _ctx: &mut dyn Context, _wm: Watermark) -> Result<()> {
        Ok(())
    }
    /// Periodic wall-clock tick, delivered even when no events arrive.
    async fn on_tick(&mut self, _ctx: &mut dyn Context, _now: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait Sink: Send {
    async fn on_element(&mut self, event: Event) -> Result<()>;
}

/// One operator chain. Every event of a given key is handled by the same lane.
pub type Lane = Vec<Box<dyn Operator>>;

/// Lane index for a key. Key-less events go to lane 0.
pub fn lane_for(key: Option<&str>, lanes: usize) -> usize {
    match key {
        Some(k) if lanes > 1 => {
            let mut h = DefaultHasher::new();
            k.hash(&mut h);
            (h.finish() % lanes as u64) as usize
        }
        _ => 0,
    }
}

enum Message {
    Event(Event),
    Watermark(Watermark),
}

#[derive(Clone, Copy)]
enum Signal {
    Watermark(Watermark),
    Tick(DateTime<Utc>),
}

struct SourceCtx {
    lanes: Vec<UnboundedSender<Message>>,
    follow_event_time: bool,
    max_event_time: Option<DateTime<Utc>>,
}

impl SourceCtx {
    fn broadcast(&self, wm: Watermark) {
        for lane in &self.lanes {
            if lane.send(Message::Watermark(wm)).is_ok() {
                metrics::QUEUE_DEPTH.inc();
            }
        }
    }

    /// Records `ts` and reports whether it moved the source watermark.
    fn raise(&mut self, ts: DateTime<Utc>) -> bool {
        if self.max_event_time.is_some_and(|m| ts <= m) {
            return false;
        }
        self.max_event_time = Some(ts);
        true
    }
}

impl Context for SourceCtx {
    fn collect(&mut self, event: Event) {
        let ts = event.event_time;
        let lane = lane_for(event.key.as_deref(), self.lanes.len());
        if self.lanes[lane].send(Message::Event(event)).is_ok() {
            metrics::QUEUE_DEPTH.inc();
        }
        // queued behind the event on its lane and ahead of later events on the others
        if self.follow_event_time && self.raise(ts) {
            self.broadcast(Watermark(ts));
        }
    }

    fn watermark(&mut self, wm: Watermark) {
        if self.follow_event_time && !self.raise(wm.0) {
            return;
        }
        self.broadcast(wm);
    }
}

struct LocalCtx<'a> {
    out: &'a mut Vec<Event>,
}

impl Context for LocalCtx<'_> {
    fn collect(&mut self, event: Event) {
        self.out.push(event);
    }
    fn watermark(&mut self, _wm: Watermark) {}
}

pub struct Executor {
    name: String,
    source: Option<Box<dyn Source>>,
    lanes: Vec<Lane>,
    sink: Option<Box<dyn Sink>>,
    tick: Option<std::time::Duration>,
    event_time_watermarks: bool,
    shutdown: CancellationToken,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::named("pipeline")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            lanes: Vec::new(),
            sink: None,
            tick: None,
            event_time_watermarks: false,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source<S: Source + 'static>(&mut self, s: S) -> &mut Self {
        self.source = Some(Box::new(s));
        self
    }

    /// Appends an operator to the single lane of an unpartitioned pipeline.
    pub fn operator<O: Operator + 'static>(&mut self, o: O) -> &mut Self {
        if self.lanes.is_empty() {
            self.lanes.push(Vec::new());
        }
        self.lanes[0].push(Box::new(o));
        self
    }

    /// Replaces the operator chains with one chain per lane.
    pub fn lanes(&mut self, lanes: Vec<Lane>) -> &mut Self {
        self.lanes = lanes;
        self
    }

    pub fn sink<K: Sink + 'static>(&mut self, s: K) -> &mut Self {
        self.sink = Some(Box::new(s));
        self
    }

    pub fn tick_every(&mut self, every: std::time::Duration) -> &mut Self {
        self.tick = Some(every);
        self
    }

    /// Follows every event that raises the highest event time seen so far
    /// with a watermark at that time, sent to all lanes. Each lane then sees
    /// the watermark in source order, and a closing window is finalized on
    /// every lane, not only on the one whose event moved time forward.
    pub fn event_time_watermarks(&mut self) -> &mut Self {
        self.event_time_watermarks = true;
        self
    }

    pub fn with_shutdown(&mut self, token: CancellationToken) -> &mut Self {
        self.shutdown = token;
        self
    }

    /// Token that stops the pipeline when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&mut self) -> Result<()> {
        let mut source = self.source.take().ok_or_else(|| anyhow::anyhow!("no source"))?;
        let mut sink = self.sink.take().ok_or_else(|| anyhow::anyhow!("no sink"))?;
        let mut lanes = std::mem::take(&mut self.lanes);
        if lanes.is_empty() {
            lanes.push(Vec::new());
        }
        let shutdown = self.shutdown.clone();
        let name = self.name.clone();
        tracing::info!(pipeline = %name, lanes = lanes.len(), "starting pipeline");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Event>();
        let mut lane_txs = Vec::with_capacity(lanes.len());
        let mut lane_handles = Vec::with_capacity(lanes.len());
        for (idx, ops) in lanes.into_iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel::<Message>();
            lane_txs.push(tx);
            lane_handles.push(tokio::spawn(run_lane(
                name.clone(),
                idx,
                ops,
                rx,
                out_tx.clone(),
                self.tick,
                shutdown.clone(),
            )));
        }
        // Lanes hold the remaining senders; the sink ends once they are gone.
        drop(out_tx);

        let sink_name = name.clone();
        let sink_shutdown = shutdown.clone();
        let sink_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = sink_shutdown.cancelled() => break,
                    next = out_rx.recv() => {
                        let Some(event) = next else { break };
                        let started = Instant::now();
                        if let Err(e) = sink.on_element(event).await {
                            tracing::warn!(pipeline = %sink_name, error = %e, "emission failed");
                            metrics::DROPPED_EVENTS.with_label_values(&["sink_error"]).inc();
                        }
                        metrics::SINK_PROC_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
                    }
                }
            }
        });

        let mut sctx = SourceCtx {
            lanes: lane_txs,
            follow_event_time: self.event_time_watermarks,
            max_event_time: None,
        };
        let mut src_handle = tokio::spawn(async move { source.run(&mut sctx).await });

        let source_result = tokio::select! {
            res = &mut src_handle => match res {
                Ok(r) => r,
                Err(e) => Err(Error::Anyhow(anyhow::anyhow!(e))),
            },
            _ = shutdown.cancelled() => {
                src_handle.abort();
                Ok(())
            }
        };

        for handle in lane_handles {
            if let Err(e) = handle.await {
                tracing::error!(pipeline = %name, error = %e, "lane task failed");
            }
        }
        sink_handle.await.map_err(|e| Error::Anyhow(anyhow::anyhow!(e)))?;
        tracing::info!(pipeline = %name, "pipeline stopped");
        source_result
    }
}

async fn run_lane(
    pipeline: String,
    lane: usize,
    mut ops: Lane,
    mut rx: UnboundedReceiver<Message>,
    out: UnboundedSender<Event>,
    tick: Option<std::time::Duration>,
    shutdown: CancellationToken,
) {
    let mut ticker = tick.map(|every| {
        // first tick one period in, not immediately
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::debug!(pipeline = %pipeline, lane, "lane cancelled");
                break;
            }
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                metrics::QUEUE_DEPTH.dec();
                match msg {
                    Message::Event(event) => push_through(&pipeline, &mut ops, vec![event], &out).await,
                    Message::Watermark(wm) => broadcast(&pipeline, &mut ops, Signal::Watermark(wm), &out).await,
                }
            }
            _ = next_tick(&mut ticker) => {
                broadcast(&pipeline, &mut ops, Signal::Tick(Utc::now()), &out).await;
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Pipes a batch through the chain; a failing event is dropped on its own.
async fn push_through(pipeline: &str, ops: &mut [Box<dyn Operator>], mut batch: Vec<Event>, out: &UnboundedSender<Event>) {
    for op in ops.iter_mut() {
        if batch.is_empty() {
            return;
        }
        let mut next = Vec::new();
        for item in batch.drain(..) {
            let started = Instant::now();
            let mut lctx = LocalCtx { out: &mut next };
            if let Err(e) = op.on_element(&mut lctx, item).await {
                operator_failed(pipeline, &e);
            }
            metrics::OP_PROC_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
        }
        batch = next;
    }
    for event in batch {
        let _ = out.send(event);
    }
}

/// Delivers a watermark or tick to each operator in order; whatever an
/// operator emits in response flows through the operators after it.
async fn broadcast(pipeline: &str, ops: &mut [Box<dyn Operator>], signal: Signal, out: &UnboundedSender<Event>) {
    for i in 0..ops.len() {
        let (head, tail) = ops.split_at_mut(i + 1);
        let mut produced = Vec::new();
        {
            let mut lctx = LocalCtx { out: &mut produced };
            let res = match signal {
                Signal::Watermark(wm) => head[i].on_watermark(&mut lctx, wm).await,
                Signal::Tick(now) => head[i].on_tick(&mut lctx, now).await,
            };
            if let Err(e) = res {
                operator_failed(pipeline, &e);
            }
        }
        push_through(pipeline, tail, produced, out).await;
    }
}

fn operator_failed(pipeline: &str, e: &Error) {
    tracing::warn!(pipeline = %pipeline, error = %e, "operator failed; event dropped");
    metrics::DROPPED_EVENTS.with_label_values(&["operator_error"]).inc();
}

pub mod prelude {
    pub use super::{
        AggregateStore, Context, Event, Executor, FinalizedResult, Operator, Result, Sink, Source, Watermark,
        Window, WindowedKey,
    };
}
