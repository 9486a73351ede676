//! tally-io: sources and sinks.
//! - `FileSource`: reads JSONL events (`key`, `value`, event-time field)
//! - `FileSink`: writes events as JSON lines to stdout or a file
//! - `VecSource` / `CollectSink`: in-memory endpoints for tests and demos
//! - `StorageSink`: decodes result lines and appends them to a `ResultLog`
//! - `KafkaSource` / `KafkaSink`: rdkafka transport (feature `kafka`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_core::{Context, Event, Result, Sink, Source, Watermark};
use tokio::io::AsyncBufReadExt;

pub mod mem;
pub mod storage;

pub use mem::{CollectSink, VecSource};
pub use storage::StorageSink;

/// Watermark a bounded source emits after its last event so every open
/// window downstream closes.
pub fn eof_watermark(max_event_time: DateTime<Utc>) -> Watermark {
    // +100 years is a practical "infinity" for batch sources
    Watermark(
        max_event_time
            .checked_add_signed(chrono::Duration::days(365 * 100))
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    )
}

/// Reads a JSONL file and emits one event per line.
/// - `event_time_field`: RFC3339 string or epoch ms; the read instant when absent
///
/// Lines that are not JSON objects with a `value` are skipped with a warning.
pub struct FileSource {
    pub path: String,
    pub event_time_field: String,
}
impl FileSource {
    pub fn jsonl(path: impl Into<String>, event_time_field: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            event_time_field: event_time_field.into(),
        }
    }

    fn parse_line(&self, line: &str) -> Option<Event> {
        let v: serde_json::Value = serde_json::from_str(line).ok()?;
        let value = match v.get("value")? {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => return None,
            other => other.to_string(),
        };
        let key = match v.get("key") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        let ts = match v.get(&self.event_time_field) {
            Some(serde_json::Value::Number(n)) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
            Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
            _ => None,
        };
        Some(Event::new(key, value, ts.unwrap_or_else(Utc::now)))
    }
}

#[async_trait]
impl Source for FileSource {
    async fn run(&mut self, ctx: &mut dyn Context) -> Result<()> {
        let mut lines = tokio::io::BufReader::new(tokio::fs::File::open(&self.path).await?).lines();
        let mut max_ts: Option<DateTime<Utc>> = None;
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let Some(event) = self.parse_line(&line) else {
                tracing::warn!(path = %self.path, line = line_no, "skipping unreadable line");
                tally_core::metrics::DROPPED_EVENTS
                    .with_label_values(&["malformed"])
                    .inc();
                continue;
            };
            max_ts = Some(max_ts.map_or(event.event_time, |m| m.max(event.event_time)));
            ctx.collect(event);
        }
        if let Some(m) = max_ts {
            ctx.watermark(eof_watermark(m));
        }
        Ok(())
    }
}

/// Writes each event as a single JSON line to stdout or a file.
pub struct FileSink {
    pub path: Option<String>,
}
impl FileSink {
    pub fn stdout() -> Self {
        Self { path: None }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn on_element(&mut self, event: Event) -> Result<()> {
        let line = serde_json::to_string(&event)?;
        if let Some(p) = &self.path {
            use tokio::io::AsyncWriteExt;
            let mut f = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .await?;
            f.write_all(line.as_bytes()).await?;
            f.write_all(b"\n").await?;
        } else {
            println!("{}", line);
        }
        Ok(())
    }
}

// --- Optional Kafka integration (behind feature flag) ---
#[cfg(feature = "kafka")]
mod kafka {
    use super::*;
    use anyhow::Context as AnyhowContext;
    use futures::StreamExt;
    use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
    use rdkafka::message::{BorrowedMessage, Message};
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use rdkafka::ClientConfig;
    use tally_core::config::EventTimeSource;
    use tally_core::Error;

    pub(crate) fn text(bytes: Option<&[u8]>) -> Option<String> {
        bytes.map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub(crate) fn event_time(source: EventTimeSource, broker_ms: Option<i64>, observed: DateTime<Utc>) -> DateTime<Utc> {
        match source {
            EventTimeSource::Observed => observed,
            EventTimeSource::Broker => broker_ms
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .unwrap_or(observed),
        }
    }

    fn to_event(m: &BorrowedMessage, source: EventTimeSource) -> Option<Event> {
        let value = text(m.payload())?;
        let ts = event_time(source, m.timestamp().to_millis(), Utc::now());
        Some(Event::new(text(m.key()), value, ts))
    }

    pub struct KafkaSource {
        pub brokers: String,
        pub group_id: String,
        pub topic: String,
        pub event_time: EventTimeSource,
        pub auto_offset_reset: Option<String>,
        pub commit_interval: std::time::Duration,
    }

    impl KafkaSource {
        pub fn new(brokers: impl Into<String>, group_id: impl Into<String>, topic: impl Into<String>) -> Self {
            Self {
                brokers: brokers.into(),
                group_id: group_id.into(),
                topic: topic.into(),
                event_time: EventTimeSource::Observed,
                auto_offset_reset: None,
                commit_interval: std::time::Duration::from_secs(5),
            }
        }

        pub fn with_event_time(mut self, source: EventTimeSource) -> Self {
            self.event_time = source;
            self
        }

        pub fn with_auto_offset_reset(mut self, reset: Option<String>) -> Self {
            self.auto_offset_reset = reset;
            self
        }
    }

    #[async_trait]
    impl Source for KafkaSource {
        async fn run(&mut self, ctx: &mut dyn Context) -> Result<()> {
            let mut cfg = ClientConfig::new();
            cfg.set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.group_id)
                .set("enable.partition.eof", "false")
                .set("enable.auto.commit", "false")
                .set("session.timeout.ms", "10000");
            if let Some(r) = &self.auto_offset_reset {
                cfg.set("auto.offset.reset", r);
            }

            let consumer: StreamConsumer = cfg.create().context("failed to create kafka consumer")?;
            consumer
                .subscribe(&[&self.topic])
                .context("failed to subscribe to topic")?;
            tracing::info!(topic = %self.topic, group = %self.group_id, "consuming");

            let mut last_commit = std::time::Instant::now();
            let mut stream = consumer.stream();
            while let Some(ev) = stream.next().await {
                match ev {
                    Ok(m) => {
                        match to_event(&m, self.event_time) {
                            Some(event) => ctx.collect(event),
                            None => tracing::warn!(
                                topic = %self.topic,
                                partition = m.partition(),
                                offset = m.offset(),
                                "message without payload skipped"
                            ),
                        }
                        if last_commit.elapsed() >= self.commit_interval {
                            if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                                tracing::warn!(topic = %self.topic, error = %e, "offset commit failed");
                            }
                            last_commit = std::time::Instant::now();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(topic = %self.topic, error = %e, "consumer error");
                        // Backoff briefly on errors
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
            Ok(())
        }
    }

    pub struct KafkaSink {
        pub brokers: String,
        pub topic: String,
        pub acks: Option<String>,
        pub timeout: std::time::Duration,
        producer: Option<FutureProducer>,
    }

    impl KafkaSink {
        pub fn new(brokers: impl Into<String>, topic: impl Into<String>) -> Self {
            Self {
                brokers: brokers.into(),
                topic: topic.into(),
                acks: Some("all".into()),
                timeout: std::time::Duration::from_secs(5),
                producer: None,
            }
        }

        fn ensure_producer(&mut self) -> anyhow::Result<&FutureProducer> {
            if self.producer.is_none() {
                let mut cfg = ClientConfig::new();
                cfg.set("bootstrap.servers", &self.brokers);
                if let Some(a) = &self.acks {
                    cfg.set("acks", a);
                }
                self.producer = Some(cfg.create().context("failed to create kafka producer")?);
            }
            self.producer
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("kafka producer unavailable"))
        }

        /// Sends one event and waits for the broker's verdict.
        /// Returns the (partition, offset) the event was written to.
        pub async fn send(&mut self, event: &Event) -> Result<(i32, i64)> {
            let topic = self.topic.clone();
            let timeout = self.timeout;
            let producer = self.ensure_producer().map_err(Error::Anyhow)?;
            let mut record = FutureRecord::<str, str>::to(&topic).payload(event.value.as_str());
            if let Some(k) = &event.key {
                record = record.key(k.as_str());
            }
            producer.send(record, timeout).await.map_err(|(e, _msg)| {
                Error::Anyhow(anyhow::anyhow!("delivery to {} failed: {}", topic, e))
            })
        }
    }

    #[async_trait]
    impl Sink for KafkaSink {
        async fn on_element(&mut self, event: Event) -> Result<()> {
            let (partition, offset) = self.send(&event).await?;
            tracing::debug!(topic = %self.topic, partition, offset, "delivered");
            Ok(())
        }
    }
}

#[cfg(feature = "kafka")]
pub use kafka::{KafkaSink, KafkaSource};
