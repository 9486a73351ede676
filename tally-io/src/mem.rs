use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tally_core::{Context, Event, Result, Sink, Source, Watermark};

use crate::eof_watermark;

/// Emits a fixed list of events, then an optional final watermark.
pub struct VecSource {
    events: Vec<Event>,
    final_watermark: Option<Watermark>,
    hold_open: bool,
}

impl VecSource {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events,
            final_watermark: None,
            hold_open: false,
        }
    }

    /// Ends with a far-future watermark, closing every window it opened.
    pub fn bounded(events: Vec<Event>) -> Self {
        let final_watermark = events.iter().map(|e| e.event_time).max().map(eof_watermark);
        Self {
            events,
            final_watermark,
            hold_open: false,
        }
    }

    pub fn with_watermark(mut self, wm: Watermark) -> Self {
        self.final_watermark = Some(wm);
        self
    }

    /// Stays pending after the last event, like a live topic, until the
    /// pipeline is shut down.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[async_trait]
impl Source for VecSource {
    async fn run(&mut self, ctx: &mut dyn Context) -> Result<()> {
        for event in self.events.drain(..) {
            ctx.collect(event);
        }
        if let Some(wm) = self.final_watermark.take() {
            ctx.watermark(wm);
        }
        if self.hold_open {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Keeps every received event; clones share the same buffer.
#[derive(Clone, Default)]
pub struct CollectSink(Arc<Mutex<Vec<Event>>>);

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn values(&self) -> Vec<String> {
        self.0.lock().iter().map(|e| e.value.clone()).collect()
    }
}

#[async_trait]
impl Sink for CollectSink {
    async fn on_element(&mut self, event: Event) -> Result<()> {
        self.0.lock().push(event);
        Ok(())
    }
}
