//! The named pipelines and their registration against input channels.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, FixedOffset};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tally_core::config::AppConfig;
use tally_core::{codec, AggregateStore, Error, Executor, Lane, Operator, ResultCodec, Result, Sink, Source};
use tally_state::InMemoryStore;

use crate::window::{AggregateConfig, WindowedAggregate};
use crate::{Filter, FilterFn, KeyBy, Map, MapFn, RunningCount};

pub const DEFAULT_KEYWORD: &str = "중요";

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\W+").expect("valid pattern"));

/// Lower-cases `text` and splits it on runs of non-word characters.
pub fn split_words(text: &str) -> Vec<String> {
    NON_WORD
        .split(&text.to_lowercase())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineKind {
    Uppercase,
    KeywordFilter,
    WordCount,
    HourlySales,
    DailySales,
    EventCount,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 6] = [
        PipelineKind::Uppercase,
        PipelineKind::KeywordFilter,
        PipelineKind::WordCount,
        PipelineKind::HourlySales,
        PipelineKind::DailySales,
        PipelineKind::EventCount,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PipelineKind::Uppercase => "uppercase",
            PipelineKind::KeywordFilter => "keyword-filter",
            PipelineKind::WordCount => "word-count",
            PipelineKind::HourlySales => "hourly-sales",
            PipelineKind::DailySales => "daily-sales",
            PipelineKind::EventCount => "event-count",
        }
    }

    /// Default (input, output) channels.
    pub fn default_topics(&self) -> (&'static str, &'static str) {
        match self {
            PipelineKind::Uppercase => ("input-topic", "output-topic"),
            PipelineKind::KeywordFilter => ("filter-input-topic", "filter-output-topic"),
            PipelineKind::WordCount => ("word-input-topic", "word-count-output-topic"),
            PipelineKind::HourlySales => ("hourly-sales-topic", "hourly-sales-output-topic"),
            PipelineKind::DailySales => ("daily-sales-topic", "daily-sales-output-topic"),
            PipelineKind::EventCount => ("event-topic", "event-count-output-topic"),
        }
    }

    /// Codec of the encoded results, for the windowed pipelines.
    pub fn codec(&self) -> Option<ResultCodec> {
        match self {
            PipelineKind::HourlySales => Some(ResultCodec::HourlySales),
            PipelineKind::DailySales => Some(ResultCodec::DailySales),
            PipelineKind::EventCount => Some(ResultCodec::EventCount),
            _ => None,
        }
    }

    pub fn aggregate(&self) -> Option<AggregateConfig> {
        match self {
            PipelineKind::HourlySales => Some(AggregateConfig::sum(Duration::hours(1))),
            PipelineKind::DailySales => Some(AggregateConfig::sum(Duration::days(1))),
            PipelineKind::EventCount => Some(AggregateConfig::count(Duration::minutes(5))),
            _ => None,
        }
    }

    /// Whether keys may be spread over several lanes.
    pub fn partitionable(&self) -> bool {
        !matches!(self, PipelineKind::WordCount)
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PipelineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().replace('_', "-");
        PipelineKind::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| Error::Config(format!("unknown pipeline: {}", s)))
    }
}

/// Runtime knobs shared by every pipeline of a topology.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub partitions: usize,
    pub display_offset: FixedOffset,
    pub tick: Option<std::time::Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            partitions: 1,
            display_offset: codec::seoul(),
            tick: None,
        }
    }
}

/// One pipeline bound to its input and output channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub kind: PipelineKind,
    pub input: String,
    pub output: String,
    pub keyword: String,
}

impl Registration {
    pub fn new(kind: PipelineKind, input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            kind,
            input: input.into(),
            output: output.into(),
            keyword: DEFAULT_KEYWORD.to_string(),
        }
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = keyword.into();
        self
    }

    /// Builds the operator lanes. Windowed pipelines get a fresh store shared
    /// by all of their lanes; each lane keeps its own watermark.
    pub fn build_lanes(&self, opts: &PipelineOptions) -> Result<Vec<Lane>> {
        let lanes = if self.kind.partitionable() {
            opts.partitions.max(1)
        } else {
            1
        };
        let store: Arc<dyn AggregateStore> = Arc::new(InMemoryStore::new());
        (0..lanes)
            .map(|_| self.build_lane(opts, &store))
            .collect()
    }

    fn build_lane(
        &self,
        opts: &PipelineOptions,
        store: &Arc<dyn AggregateStore>,
    ) -> Result<Lane> {
        let lane: Lane = match self.kind {
            PipelineKind::Uppercase => {
                vec![Box::new(Map::new(MapFn::new(|v: &str| vec![v.to_uppercase()]))) as Box<dyn Operator>]
            }
            PipelineKind::KeywordFilter => {
                let keyword = self.keyword.clone();
                vec![Box::new(Filter::new(FilterFn::new(move |v: &str| v.contains(keyword.as_str())))) as Box<dyn Operator>]
            }
            PipelineKind::WordCount => vec![
                Box::new(Map::new(MapFn::new(split_words))) as Box<dyn Operator>,
                Box::new(KeyBy::value()) as Box<dyn Operator>,
                Box::new(RunningCount::new()) as Box<dyn Operator>,
            ],
            kind @ (PipelineKind::HourlySales | PipelineKind::DailySales | PipelineKind::EventCount) => {
                let (Some(config), Some(codec)) = (kind.aggregate(), kind.codec()) else {
                    return Err(Error::Config(format!("{} has no aggregation", kind)));
                };
                let op = WindowedAggregate::new(kind.name(), config, codec)?
                    .with_store(store.clone())
                    .with_display_offset(opts.display_offset);
                vec![Box::new(op) as Box<dyn Operator>]
            }
        };
        Ok(lane)
    }

    /// Assembles a runnable executor reading from `source` and writing to `sink`.
    pub fn executor<S, K>(&self, opts: &PipelineOptions, source: S, sink: K) -> Result<Executor>
    where
        S: Source + 'static,
        K: Sink + 'static,
    {
        let mut exec = Executor::named(self.kind.name());
        exec.source(source).lanes(self.build_lanes(opts)?).sink(sink);
        if self.kind.aggregate().is_some() {
            exec.event_time_watermarks();
        }
        if let Some(every) = opts.tick {
            exec.tick_every(every);
        }
        Ok(exec)
    }
}

/// Explicit registry of pipelines, filled once at startup.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub options: PipelineOptions,
    registrations: Vec<Registration>,
}

impl Topology {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            options,
            registrations: Vec::new(),
        }
    }

    /// Binds `input` to a pipeline. An input channel can be bound only once.
    pub fn register(
        &mut self,
        kind: PipelineKind,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Result<&mut Registration> {
        let reg = Registration::new(kind, input, output);
        if reg.input == reg.output {
            return Err(Error::Config(format!("{}: input and output are both {}", kind, reg.input)));
        }
        if let Some(existing) = self.registrations.iter().find(|r| r.input == reg.input) {
            return Err(Error::Config(format!(
                "input {} is already bound to {}",
                reg.input, existing.kind
            )));
        }
        tracing::info!(pipeline = %kind, input = %reg.input, output = %reg.output, "pipeline registered");
        self.registrations.push(reg);
        let last = self.registrations.len() - 1;
        Ok(&mut self.registrations[last])
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let display_offset = cfg.display_offset().map_err(|e| Error::Config(e.to_string()))?;
        let tick = cfg.tick_interval().map_err(|e| Error::Config(e.to_string()))?;
        let mut topology = Topology::new(PipelineOptions {
            partitions: cfg.runtime.partitions,
            display_offset,
            tick,
        });
        for (name, p) in cfg.pipelines.iter().filter(|(_, p)| p.enabled) {
            let kind: PipelineKind = name.parse()?;
            let reg = topology.register(kind, p.input.as_str(), p.output.as_str())?;
            if let Some(keyword) = &p.keyword {
                reg.keyword = keyword.clone();
            }
        }
        Ok(topology)
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn get(&self, kind: PipelineKind) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.kind == kind)
    }
}
