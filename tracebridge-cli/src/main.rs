//! Tracebridge CLI
//!
//! Reads newline-delimited JSON session events from a file or stdin,
//! feeds them through the consolidation pipeline, and reports what the
//! sink would receive.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tracebridge_core::{AuditSpoolConfig, Clock, RedactionMode, SystemClock};
use tracebridge_engine::{Pipeline, PipelineConfig};
use tracebridge_event::SessionEvent;
use tracebridge_sink::MemorySink;

#[derive(Parser)]
#[command(name = "tracebridge")]
#[command(about = "Consolidates session lifecycle events into trace/generation/span records", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum RedactMode {
    Full,
    MetadataOnly,
    Off,
}

impl From<RedactMode> for RedactionMode {
    fn from(mode: RedactMode) -> Self {
        match mode {
            RedactMode::Full => RedactionMode::Full,
            RedactMode::MetadataOnly => RedactionMode::MetadataOnly,
            RedactMode::Off => RedactionMode::Off,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over an event stream
    Run {
        /// Event stream file ("-" for stdin)
        #[arg(short, long, default_value = "-")]
        events: String,

        /// Debounce quiet period in milliseconds
        #[arg(long, default_value_t = 10_000)]
        quiet_period_ms: u64,

        /// Bounded queue capacity
        #[arg(long, default_value_t = 1000)]
        queue_capacity: usize,

        /// Redaction mode applied to user content
        #[arg(long, value_enum, default_value_t = RedactMode::Full)]
        redact_mode: RedactMode,

        /// Regex patterns scrubbed in full redaction mode
        #[arg(long)]
        redact_pattern: Vec<String>,

        /// Append audit entries to this JSONL file
        #[arg(long)]
        audit_file: Option<PathBuf>,

        /// Print consolidated records as JSON after shutdown
        #[arg(long)]
        dump: bool,

        /// Log level
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Parse and validate an event stream without exporting
    Check {
        /// Event stream file ("-" for stdin)
        #[arg(short, long, default_value = "-")]
        events: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            events,
            quiet_period_ms,
            queue_capacity,
            redact_mode,
            redact_pattern,
            audit_file,
            dump,
            log_level,
        } => {
            setup_logging(&log_level)?;
            let config = PipelineConfig {
                queue_capacity,
                quiet_period: Duration::from_millis(quiet_period_ms),
                redaction_mode: redact_mode.into(),
                redaction_patterns: redact_pattern,
                audit: AuditSpoolConfig {
                    file: audit_file,
                    ..Default::default()
                },
                ..Default::default()
            };
            run_pipeline(&events, config, dump).await?;
        }
        Commands::Check { events } => {
            setup_logging("info")?;
            check_events(&events).await?;
        }
    }

    Ok(())
}

fn setup_logging(level: &str) -> Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;

    Ok(())
}

async fn run_pipeline(events: &str, config: PipelineConfig, dump: bool) -> Result<()> {
    let sink = Arc::new(MemorySink::new());
    let pipeline = Pipeline::new(config, sink.clone()).context("Failed to build pipeline")?;

    tokio::select! {
        result = feed_events(events, &pipeline) => {
            let offered = result?;
            info!(offered, "Event stream finished, draining pipeline");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, draining pipeline");
        }
    }
    pipeline.shutdown().await;

    let metrics = pipeline.metrics();
    info!(
        mapped = metrics.events_mapped,
        coalesced = metrics.events_coalesced,
        deduped = metrics.events_deduped,
        dropped = metrics.events_dropped,
        sink_failures = metrics.sink_failures,
        traces = sink.trace_count(),
        generations = sink.generation_count(),
        spans = sink.span_count(),
        "Pipeline summary"
    );

    if dump {
        let output = serde_json::json!({
            "traces": sink.traces(),
            "generations": sink.generations(),
            "spans": sink.spans(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    Ok(())
}

async fn feed_events(events: &str, pipeline: &Pipeline) -> Result<u64> {
    let clock = SystemClock;
    let mut offered = 0u64;
    let mut lines = reader(events).await?.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionEvent>(&line) {
            Ok(mut event) => {
                event.ensure_arrival_time(clock.now_ms());
                pipeline
                    .offer(event)
                    .await
                    .map_err(|e| anyhow::anyhow!("Pipeline rejected event: {}", e))?;
                offered += 1;
            }
            Err(e) => warn!(error = %e, "Skipping malformed event line"),
        }
    }
    Ok(offered)
}

async fn check_events(events: &str) -> Result<()> {
    let mut valid = 0u64;
    let mut invalid = 0u64;
    let mut lines = reader(events).await?.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionEvent>(&line) {
            Ok(event) => {
                valid += 1;
                info!(kind = event.kind(), key = %event.key(), "ok");
            }
            Err(e) => {
                invalid += 1;
                warn!(error = %e, "invalid event");
            }
        }
    }

    info!(valid, invalid, "Check complete");
    if invalid > 0 {
        anyhow::bail!("{} invalid events", invalid);
    }
    Ok(())
}

async fn reader(events: &str) -> Result<BufReader<Box<dyn tokio::io::AsyncRead + Unpin + Send>>> {
    let input: Box<dyn tokio::io::AsyncRead + Unpin + Send> = if events == "-" {
        Box::new(tokio::io::stdin())
    } else {
        let file = tokio::fs::File::open(events)
            .await
            .with_context(|| format!("Failed to open {events}"))?;
        Box::new(file)
    };
    Ok(BufReader::new(input))
}
