use anyhow::Context;
use clap::{Parser, Subcommand};
use kafka_indexer::config::{KafkaConfig, PoolConfig, SinkConfig, StreamConfig};
use kafka_indexer::kafka::{KafkaBatchSource, KafkaProducerFactory, KeyedMessage};
use kafka_indexer::sink::OpenSearchSink;
use kafka_indexer::stream::BatchSource;
use kafka_indexer::{IngestPipeline, ProducerPool, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "kafka-indexer")]
#[command(about = "Kafka to OpenSearch stream indexer", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs", global = true)]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index every configured topic until interrupted (default)
    Run,
    /// Publish stdin lines to a topic through the producer pool
    Produce {
        #[arg(short, long)]
        topic: String,

        #[arg(short, long, help = "Key attached to every message")]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Loading configuration from {:?}", args.config);
    let settings = Settings::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;
    info!(keys = settings.len(), "Configuration loaded successfully");

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(&settings).await,
        Command::Produce { topic, key } => produce(&settings, topic, key).await,
    }
}

async fn run(settings: &Settings) -> anyhow::Result<()> {
    let kafka = KafkaConfig::from_settings(settings)?;
    let stream = StreamConfig::from_settings(settings)?;
    let sink_config = SinkConfig::from_settings(settings)?;

    info!(
        kafka_brokers = ?kafka.brokers,
        kafka_group = %kafka.group_id,
        topics = ?kafka.topics,
        sink_url = %sink_config.url(),
        batch_interval_ms = stream.batch_interval_ms,
        "Configuration summary"
    );

    let sink = Arc::new(OpenSearchSink::new(&sink_config)?);
    let pipeline = IngestPipeline::from_settings(settings, sink.clone())?;

    // Checked before any offset can be consumed.
    sink.ensure_ready(pipeline.resource())
        .await
        .context("indexing cluster is not ready")?;

    let sources: Vec<Box<dyn BatchSource>> = KafkaBatchSource::for_topics(&kafka, &stream)?
        .into_iter()
        .map(|source| Box::new(source) as Box<dyn BatchSource>)
        .collect();

    let stats = pipeline.stats();
    let handle = pipeline.start(sources);
    let stopper = handle.stopper();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, stopping pipeline");
            let _ = stopper.send(());
        }
    });

    let result = handle.await_termination().await;
    let totals = stats.snapshot();
    info!(
        batches = totals.batches,
        records = totals.records,
        empty_records = totals.empty_records,
        "Pipeline stopped"
    );

    if let Err(e) = &result {
        error!(error = %e, "Pipeline terminated with error");
    }
    result.map_err(Into::into)
}

async fn produce(settings: &Settings, topic: String, key: Option<String>) -> anyhow::Result<()> {
    let factory = KafkaProducerFactory::from_settings(settings)?;
    let pool = ProducerPool::for_producers(factory, PoolConfig::from_settings(settings)?);
    let evictor = pool.spawn_evictor();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sent = 0u64;
    let mut failed = 0u64;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let mut message = KeyedMessage::new(topic.as_str(), line);
        if let Some(key) = &key {
            message = message.with_key(key.clone());
        }

        match pool.send(message).await {
            Ok(()) => sent += 1,
            Err(e) => {
                failed += 1;
                warn!(topic = %topic, error = %e, "Failed to publish message");
            }
        }
    }

    evictor.abort();
    pool.close().await;

    let status = pool.status();
    info!(
        topic = %topic,
        sent,
        failed,
        connections_created = status.created,
        connections_destroyed = status.destroyed,
        "Finished publishing"
    );

    if failed > 0 {
        anyhow::bail!("{} of {} messages failed to publish", failed, sent + failed);
    }
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("kafka_indexer=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("kafka_indexer=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
