use std::collections::HashSet;
use std::path::Path;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

/// Where an event's timestamp comes from.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventTimeSource {
    /// The instant the consumer observed the event.
    #[default]
    Observed,
    /// The timestamp attached by the broker or producer.
    Broker,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Period of the close-check tick, e.g. "1s". "0s" disables it.
    pub tick_interval: String,
    /// Lanes per aggregation pipeline.
    pub partitions: usize,
    /// Offset used when rendering window bounds, e.g. "+09:00".
    pub display_offset: String,
    pub event_time: EventTimeSource,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval: "1s".into(),
            partitions: 1,
            display_offset: "+09:00".into(),
            event_time: EventTimeSource::Observed,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub group_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_offset_reset: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".into(),
            group_prefix: "tally".into(),
            auto_offset_reset: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Consume the result topics and persist decoded results in memory.
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub input: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

fn enabled() -> bool {
    true
}

impl PipelineConfig {
    fn topics(input: &str, output: &str) -> Self {
        Self {
            enabled: true,
            input: input.into(),
            output: output.into(),
            keyword: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PipelinesConfig {
    pub uppercase: PipelineConfig,
    pub keyword_filter: PipelineConfig,
    pub word_count: PipelineConfig,
    pub hourly_sales: PipelineConfig,
    pub daily_sales: PipelineConfig,
    pub event_count: PipelineConfig,
}

impl Default for PipelinesConfig {
    fn default() -> Self {
        Self {
            uppercase: PipelineConfig::topics("input-topic", "output-topic"),
            keyword_filter: PipelineConfig {
                keyword: Some("중요".into()),
                ..PipelineConfig::topics("filter-input-topic", "filter-output-topic")
            },
            word_count: PipelineConfig::topics("word-input-topic", "word-count-output-topic"),
            hourly_sales: PipelineConfig::topics("hourly-sales-topic", "hourly-sales-output-topic"),
            daily_sales: PipelineConfig::topics("daily-sales-topic", "daily-sales-output-topic"),
            event_count: PipelineConfig::topics("event-topic", "event-count-output-topic"),
        }
    }
}

impl PipelinesConfig {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &PipelineConfig)> {
        [
            ("uppercase", &self.uppercase),
            ("keyword-filter", &self.keyword_filter),
            ("word-count", &self.word_count),
            ("hourly-sales", &self.hourly_sales),
            ("daily-sales", &self.daily_sales),
            ("event-count", &self.event_count),
        ]
        .into_iter()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    pub kafka: KafkaConfig,
    pub storage: StorageConfig,
    pub pipelines: PipelinesConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let cfg: AppConfig = toml::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runtime.partitions == 0 {
            anyhow::bail!("runtime.partitions must be at least 1");
        }
        parse_duration_ms(&self.runtime.tick_interval)?;
        self.display_offset()?;
        let mut inputs = HashSet::new();
        for (name, p) in self.pipelines.iter().filter(|(_, p)| p.enabled) {
            if p.input.trim().is_empty() || p.output.trim().is_empty() {
                anyhow::bail!("pipelines.{}: input and output topics must be set", name);
            }
            if p.input == p.output {
                anyhow::bail!("pipelines.{}: input and output must differ ({})", name, p.input);
            }
            if !inputs.insert(p.input.as_str()) {
                anyhow::bail!("pipelines.{}: input topic {} is already bound", name, p.input);
            }
        }
        if let Some(k) = &self.pipelines.keyword_filter.keyword {
            if k.is_empty() {
                anyhow::bail!("pipelines.keyword_filter.keyword must not be empty");
            }
        }
        Ok(())
    }

    pub fn display_offset(&self) -> anyhow::Result<FixedOffset> {
        parse_offset(&self.runtime.display_offset)
    }

    pub fn tick_interval(&self) -> anyhow::Result<Option<std::time::Duration>> {
        let ms = parse_duration_ms(&self.runtime.tick_interval)?;
        Ok((ms > 0).then(|| std::time::Duration::from_millis(ms as u64)))
    }
}

pub fn parse_duration_ms(s: &str) -> anyhow::Result<i64> {
    // small parser for values like "10s", "500ms", "2m", "1d"
    let s = s.trim();
    let ms = if let Some(num) = s.strip_suffix("ms") {
        num.parse::<i64>()?
    } else if let Some(num) = s.strip_suffix('s') {
        num.parse::<i64>()? * 1_000
    } else if let Some(num) = s.strip_suffix('m') {
        num.parse::<i64>()? * 60_000
    } else if let Some(num) = s.strip_suffix('h') {
        num.parse::<i64>()? * 3_600_000
    } else if let Some(num) = s.strip_suffix('d') {
        num.parse::<i64>()? * 86_400_000
    } else {
        // default assume seconds
        s.parse::<i64>()? * 1_000
    };
    if ms < 0 {
        anyhow::bail!("duration must not be negative: {}", s);
    }
    Ok(ms)
}

/// Parses "+09:00", "-05:30" or "Z".
pub fn parse_offset(s: &str) -> anyhow::Result<FixedOffset> {
    let s = s.trim();
    if s == "Z" || s == "UTC" {
        return FixedOffset::east_opt(0).ok_or_else(|| anyhow::anyhow!("invalid offset: {}", s));
    }
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => anyhow::bail!("offset must start with + or -: {}", s),
    };
    let (h, m) = rest
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("offset must look like +HH:MM: {}", s))?;
    let secs = h.parse::<i32>()? * 3_600 + m.parse::<i32>()? * 60;
    FixedOffset::east_opt(sign * secs).ok_or_else(|| anyhow::anyhow!("offset out of range: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_the_standard_topics() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.pipelines.hourly_sales.input, "hourly-sales-topic");
        assert_eq!(cfg.pipelines.event_count.output, "event-count-output-topic");
        assert_eq!(cfg.pipelines.keyword_filter.keyword.as_deref(), Some("중요"));
        assert_eq!(cfg.display_offset().unwrap(), crate::codec::seoul());
        assert_eq!(cfg.tick_interval().unwrap(), Some(std::time::Duration::from_secs(1)));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [runtime]
            partitions = 4
            tick_interval = "0s"

            [pipelines.hourly_sales]
            input = "sales-in"
            output = "sales-out"
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.runtime.partitions, 4);
        assert_eq!(cfg.tick_interval().unwrap(), None);
        assert_eq!(cfg.pipelines.hourly_sales.input, "sales-in");
        assert!(cfg.pipelines.hourly_sales.enabled);
        assert_eq!(cfg.pipelines.daily_sales.input, "daily-sales-topic");
        assert_eq!(cfg.kafka.brokers, "localhost:9092");
    }

    #[test]
    fn validate_rejects_shared_inputs_and_loops() {
        let mut cfg = AppConfig::default();
        cfg.pipelines.daily_sales.input = "hourly-sales-topic".into();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.pipelines.uppercase.output = "input-topic".into();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.runtime.partitions = 0;
        assert!(cfg.validate().is_err());

        // a disabled pipeline does not claim its input
        let mut cfg = AppConfig::default();
        cfg.pipelines.hourly_sales.enabled = false;
        cfg.pipelines.daily_sales.input = "hourly-sales-topic".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn durations_and_offsets_parse() {
        assert_eq!(parse_duration_ms("500ms").unwrap(), 500);
        assert_eq!(parse_duration_ms("5m").unwrap(), 300_000);
        assert_eq!(parse_duration_ms("1d").unwrap(), 86_400_000);
        assert_eq!(parse_duration_ms("7").unwrap(), 7_000);
        assert!(parse_duration_ms("fast").is_err());
        assert_eq!(parse_offset("-05:30").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_offset("09:00").is_err());
    }
}
