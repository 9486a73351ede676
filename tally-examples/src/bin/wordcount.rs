use anyhow::Result;
use chrono::Utc;
use tally_core::Event;
use tally_io::{FileSink, FileSource, VecSource};
use tally_ops::{PipelineKind, PipelineOptions, Registration};

/// Running word counts. Reads a JSONL file (`value` = sentence) when a path is
/// given, otherwise a few built-in sentences.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()))
        .init();

    let (input, output) = PipelineKind::WordCount.default_topics();
    let reg = Registration::new(PipelineKind::WordCount, input, output);
    let opts = PipelineOptions::default();

    let mut exec = match std::env::args().nth(1) {
        Some(path) => reg.executor(&opts, FileSource::jsonl(path, "event_time"), FileSink::stdout())?,
        None => {
            let now = Utc::now();
            let sentences = ["hello world hello", "Kafka Streams, hello!"];
            let events = sentences.iter().map(|s| Event::new(None, *s, now)).collect();
            reg.executor(&opts, VecSource::new(events), FileSink::stdout())?
        }
    };
    exec.run().await?;
    Ok(())
}
