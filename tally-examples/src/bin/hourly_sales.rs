use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use tally_core::Event;
use tally_io::{FileSink, VecSource};
use tally_ops::{PipelineKind, PipelineOptions, Registration};

/// Hourly revenue per product over a small batch of sales spread across two
/// hours. Each (product, hour) is printed once, after its hour has closed.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();

    // 2025-11-13 14:00 in Seoul
    let t0 = Utc.with_ymd_and_hms(2025, 11, 13, 5, 0, 0).unwrap();
    let sales = [
        ("노트북", "1500000", 5),
        ("노트북", "1800000", 20),
        ("마우스", "50000", 25),
        ("노트북", "2000000", 40),
        ("키보드", "120000", 50),
        ("마우스", "80000", 70),
        ("키보드", "150000", 95),
    ];
    let events = sales
        .iter()
        .map(|(product, amount, minute)| Event::keyed(*product, *amount, t0 + Duration::minutes(*minute)))
        .collect();

    let (input, output) = PipelineKind::HourlySales.default_topics();
    let reg = Registration::new(PipelineKind::HourlySales, input, output);
    let opts = PipelineOptions {
        partitions: 2,
        ..PipelineOptions::default()
    };
    let mut exec = reg.executor(&opts, VecSource::bounded(events), FileSink::stdout())?;
    exec.run().await?;
    Ok(())
}
