use std::sync::Arc;

use async_trait::async_trait;
use tally_core::{Event, Result, ResultCodec, Sink};
use tally_state::ResultLog;

/// Storage side of a result channel: decodes each line with the codec of the
/// producing pipeline and persists it. Lines that do not decode are logged
/// and discarded; nothing partial is stored.
pub struct StorageSink {
    codec: ResultCodec,
    log: Arc<ResultLog>,
}

impl StorageSink {
    pub fn new(codec: ResultCodec, log: Arc<ResultLog>) -> Self {
        Self { codec, log }
    }

    pub fn log(&self) -> &Arc<ResultLog> {
        &self.log
    }
}

#[async_trait]
impl Sink for StorageSink {
    async fn on_element(&mut self, event: Event) -> Result<()> {
        match self.codec.decode(&event.value) {
            Ok(result) => {
                let row = self.log.append(result);
                tracing::info!(
                    codec = self.codec.name(),
                    id = row.id,
                    key = row.result.key(),
                    total = row.result.total(),
                    "result persisted"
                );
            }
            Err(e) => {
                tracing::warn!(codec = self.codec.name(), error = %e, "undecodable result discarded");
                tally_core::metrics::DROPPED_EVENTS
                    .with_label_values(&["decode_error"])
                    .inc();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decodes_and_persists_matching_lines_only() {
        let log = Arc::new(ResultLog::new());
        let mut sink = StorageSink::new(ResultCodec::HourlySales, log.clone());
        sink.on_element(Event::observed(
            Some("노트북".into()),
            "상품:노트북, 시간대:2025-11-13 14:00~2025-11-13 15:00, 총매출:5300000",
        ))
        .await
        .unwrap();
        // a daily line on the hourly channel
        sink.on_element(Event::observed(None, "날짜:2025-11-13, 카테고리:의류, 일매출:350000"))
            .await
            .unwrap();
        sink.on_element(Event::observed(None, "garbage")).await.unwrap();

        assert_eq!(log.len(), 1);
        let stored = &log.recent(10)[0];
        assert_eq!(stored.result.key(), "노트북");
        assert_eq!(stored.result.total(), 5_300_000);
        assert_eq!(sink.log().by_key("노트북").len(), 1);
    }
}
