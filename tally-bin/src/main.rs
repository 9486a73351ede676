use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use tally_core::config::AppConfig;
use tally_ops::{PipelineKind, Topology};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "tally", version, about = "Windowed aggregation pipelines", disable_help_subcommand = false)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every enabled pipeline against Kafka
    Run {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        http_port: u16,
    },
    /// Feed a JSONL file through one pipeline and print its output
    Replay {
        #[arg(short, long)]
        pipeline: PipelineKind,
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "event_time")]
        time_field: String,
    },
    /// Publish one event to a pipeline's input topic
    Produce {
        #[arg(short, long)]
        pipeline: PipelineKind,
        #[arg(short, long)]
        key: Option<String>,
        #[arg(short, long)]
        value: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Serve only /metrics
    Serve {
        #[arg(long, default_value_t = 9898)]
        port: u16,
    },
}

fn app() -> Router {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics() -> String {
    tally_core::metrics::render_prometheus()
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(p) => AppConfig::load(p),
        None => Ok(AppConfig::default()),
    }
}

async fn serve_metrics(port: u16) -> anyhow::Result<tokio::net::TcpListener> {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("serving /metrics on {}", addr);
    Ok(listener)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port } => {
            let listener = serve_metrics(port).await?;
            axum::serve(listener, app()).await?;
            Ok(())
        }
        Commands::Run { config, http_port } => {
            let cfg = load_config(config.as_deref())?;
            if http_port != 0 {
                let listener = serve_metrics(http_port).await?;
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app()).await {
                        tracing::error!(error = %e, "metrics server stopped");
                    }
                });
            }
            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                    on_signal.cancel();
                }
            });
            run_all(cfg, shutdown).await
        }
        Commands::Replay {
            pipeline,
            input,
            output,
            config,
            time_field,
        } => {
            let cfg = load_config(config.as_deref())?;
            replay(&cfg, pipeline, &input, output.as_deref(), &time_field).await
        }
        Commands::Produce {
            pipeline,
            key,
            value,
            config,
        } => {
            let cfg = load_config(config.as_deref())?;
            produce(&cfg, pipeline, key, value).await
        }
    }
}

/// Replays a bounded file. Event times come from the file, so the wall-clock
/// tick stays off and the end-of-file watermark closes the remaining windows.
async fn replay(
    cfg: &AppConfig,
    kind: PipelineKind,
    input: &Path,
    output: Option<&Path>,
    time_field: &str,
) -> anyhow::Result<()> {
    let mut topology = Topology::from_config(cfg)?;
    topology.options.tick = None;
    let reg = match topology.get(kind) {
        Some(reg) => reg.clone(),
        None => {
            let (i, o) = kind.default_topics();
            tally_ops::Registration::new(kind, i, o)
        }
    };
    let source = tally_io::FileSource::jsonl(input.to_string_lossy(), time_field);
    let sink = match output {
        Some(p) => tally_io::FileSink::file(p.to_string_lossy()),
        None => tally_io::FileSink::stdout(),
    };
    let mut exec = reg.executor(&topology.options, source, sink)?;
    exec.run().await?;
    Ok(())
}

#[cfg(feature = "kafka")]
async fn run_all(cfg: AppConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    use std::sync::Arc;
    use tally_io::{KafkaSink, KafkaSource, StorageSink};
    use tally_state::ResultLog;

    let topology = Topology::from_config(&cfg)?;
    if topology.registrations().is_empty() {
        anyhow::bail!("no pipeline enabled");
    }
    let source = |group: String, topic: &str| {
        KafkaSource::new(cfg.kafka.brokers.clone(), group, topic)
            .with_event_time(cfg.runtime.event_time)
            .with_auto_offset_reset(cfg.kafka.auto_offset_reset.clone())
    };

    let mut tasks = tokio::task::JoinSet::new();
    for reg in topology.registrations() {
        let group = format!("{}-{}", cfg.kafka.group_prefix, reg.kind);
        let mut exec = reg.executor(
            &topology.options,
            source(group, &reg.input),
            KafkaSink::new(cfg.kafka.brokers.clone(), reg.output.clone()),
        )?;
        exec.with_shutdown(shutdown.clone());
        tasks.spawn(async move { exec.run().await });
    }

    let results = Arc::new(ResultLog::new());
    if cfg.storage.enabled {
        for reg in topology.registrations() {
            let Some(codec) = reg.kind.codec() else { continue };
            let group = format!("{}-storage-{}", cfg.kafka.group_prefix, reg.kind);
            let mut exec = tally_core::Executor::named(format!("storage-{}", reg.kind));
            exec.source(source(group, &reg.output))
                .sink(StorageSink::new(codec, results.clone()))
                .with_shutdown(shutdown.clone());
            tasks.spawn(async move { exec.run().await });
        }
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "pipeline failed"),
            Err(e) => tracing::error!(error = %e, "pipeline task panicked"),
        }
    }
    tracing::info!(stored = results.len(), "all pipelines stopped");
    Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn run_all(_cfg: AppConfig, _shutdown: CancellationToken) -> anyhow::Result<()> {
    anyhow::bail!("tally was built without the `kafka` feature; use `replay` or rebuild with --features kafka")
}

#[cfg(feature = "kafka")]
async fn produce(cfg: &AppConfig, kind: PipelineKind, key: Option<String>, value: String) -> anyhow::Result<()> {
    let topology = Topology::from_config(cfg)?;
    let topic = topology
        .get(kind)
        .map(|r| r.input.clone())
        .unwrap_or_else(|| kind.default_topics().0.to_string());
    let mut sink = tally_io::KafkaSink::new(cfg.kafka.brokers.clone(), topic.clone());
    let (partition, offset) = sink.send(&tally_core::Event::observed(key, value)).await?;
    tracing::info!(%topic, partition, offset, "event accepted");
    Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn produce(_cfg: &AppConfig, _kind: PipelineKind, _key: Option<String>, _value: String) -> anyhow::Result<()> {
    anyhow::bail!("tally was built without the `kafka` feature")
}
