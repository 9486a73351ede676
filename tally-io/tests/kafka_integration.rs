#![cfg(feature = "kafka")]

use std::time::Duration;

use tally_core::{Context, Event, Source, Watermark};
use tally_io::{KafkaSink, KafkaSource};
use tokio::sync::mpsc;

struct ChanCtx {
    tx: mpsc::UnboundedSender<Event>,
}

impl Context for ChanCtx {
    fn collect(&mut self, event: Event) {
        let _ = self.tx.send(event);
    }
    fn watermark(&mut self, _wm: Watermark) {}
}

#[tokio::test]
async fn kafka_roundtrip_keyed_events_if_env_present() {
    let brokers = match std::env::var("KAFKA_BROKER") {
        Ok(v) => v,
        Err(_) => return,
    }; // skip if not configured
    let topic = std::env::var("KAFKA_TOPIC").unwrap_or_else(|_| "hourly-sales-topic".into());

    let mut sink = KafkaSink::new(brokers.clone(), topic.clone());
    for v in ["1500000", "1800000"] {
        sink.send(&Event::observed(Some("노트북".into()), v))
            .await
            .expect("delivery");
    }

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let mut src = KafkaSource::new(brokers, format!("g-{}", nanos), topic)
        .with_auto_offset_reset(Some("earliest".into()));
    src.commit_interval = Duration::from_millis(200);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut ctx = ChanCtx { tx };
    let handle = tokio::spawn(async move {
        let _ = src.run(&mut ctx).await;
    });

    let mut got = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while got.len() < 2 && tokio::time::Instant::now() < deadline {
        if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
            got.push(event);
        }
    }
    handle.abort();

    assert!(!got.is_empty(), "did not receive any events from Kafka");
    assert!(got.iter().any(|e| e.key.as_deref() == Some("노트북")));
}
