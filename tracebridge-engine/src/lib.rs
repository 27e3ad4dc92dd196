//! Tracebridge Engine
//!
//! The event-consolidation pipeline: bounded ingestion queue, per-key
//! debounce/coalescing, deduplication, stateful session tracking, and the
//! mapping state machine that turns raw session events into
//! trace/generation/span mutations on a retrying sink.

pub mod debounce;
pub mod mapper;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use tracebridge_core::{
    AuditSpool, AuditSpoolConfig, DedupLedger, EventQueue, OfferError, RedactionMode, Redactor,
    SessionRegistry,
};
use tracebridge_event::SessionEvent;
use tracebridge_sink::{RetryPolicy, RetryingSink, TraceSink};

pub use debounce::{DebounceScheduler, EventHandler, DEFAULT_QUIET_PERIOD};
pub use mapper::{EventMapper, ASSISTANT_MESSAGE_GENERATION, USER_MESSAGE_SPAN};

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bounded queue capacity between source and consumer.
    pub queue_capacity: usize,

    /// Quiet period before a debounced key's latest event is mapped.
    pub quiet_period: Duration,

    /// Retry policy applied to every sink operation.
    pub retry: RetryPolicy,

    /// How much user content may leave the pipeline.
    pub redaction_mode: RedactionMode,

    /// Patterns scrubbed from content in full redaction mode.
    pub redaction_patterns: Vec<String>,

    /// Audit spool settings.
    pub audit: AuditSpoolConfig,

    /// How long shutdown waits for the consumer to drain the queue.
    pub drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: tracebridge_core::queue::DEFAULT_CAPACITY,
            quiet_period: DEFAULT_QUIET_PERIOD,
            retry: RetryPolicy::default(),
            redaction_mode: RedactionMode::Full,
            redaction_patterns: Vec::new(),
            audit: AuditSpoolConfig::default(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Pipeline construction errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid redaction pattern: {0}")]
    InvalidRedactionPattern(#[from] regex::Error),
}

/// Counters for monitoring (atomic for lock-free access).
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    events_offered: AtomicU64,
    events_mapped: AtomicU64,
    events_deduped: AtomicU64,
    events_dropped: AtomicU64,
    events_noop: AtomicU64,
    sink_failures: AtomicU64,
}

impl PipelineMetrics {
    pub(crate) fn incr_offered(&self) {
        self.events_offered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_mapped(&self) {
        self.events_mapped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_deduped(&self) {
        self.events_deduped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_noop(&self) {
        self.events_noop.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_sink_failures(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            events_offered: self.events_offered.load(Ordering::Relaxed),
            events_mapped: self.events_mapped.load(Ordering::Relaxed),
            events_deduped: self.events_deduped.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_noop: self.events_noop.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            events_coalesced: 0,
            dedup_ledger_size: 0,
            active_sessions: 0,
        }
    }
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineMetricsSnapshot {
    pub events_offered: u64,
    pub events_mapped: u64,
    pub events_deduped: u64,
    pub events_dropped: u64,
    pub events_noop: u64,
    pub events_coalesced: u64,
    pub sink_failures: u64,
    pub dedup_ledger_size: u64,
    pub active_sessions: u64,
}

/// The event-consolidation pipeline.
///
/// Constructed once, wired to a sink, and shared by handle. The queue,
/// registry, and ledger live for the pipeline's lifetime; nothing outside
/// the pipeline mutates them.
pub struct Pipeline {
    queue: Arc<EventQueue>,
    registry: Arc<SessionRegistry>,
    ledger: Arc<DedupLedger>,
    scheduler: Arc<DebounceScheduler<EventMapper>>,
    sink: Arc<dyn TraceSink>,
    metrics: Arc<PipelineMetrics>,
    consumer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    drain_timeout: Duration,
}

impl Pipeline {
    /// Build and start a pipeline exporting to `sink`.
    pub fn new(config: PipelineConfig, sink: Arc<dyn TraceSink>) -> Result<Self, PipelineError> {
        let redactor = Arc::new(Redactor::new(
            config.redaction_mode,
            &config.redaction_patterns,
        )?);

        let queue = Arc::new(EventQueue::new(config.queue_capacity));
        let registry = Arc::new(SessionRegistry::new());
        let ledger = Arc::new(DedupLedger::new());
        let metrics = Arc::new(PipelineMetrics::default());
        let audit = Arc::new(AuditSpool::new(config.audit));

        let retrying: Arc<dyn TraceSink> = Arc::new(RetryingSink::new(sink, config.retry));
        let mapper = Arc::new(EventMapper::new(
            registry.clone(),
            ledger.clone(),
            retrying.clone(),
            redactor,
            audit,
            metrics.clone(),
        ));
        let scheduler = Arc::new(DebounceScheduler::new(config.quiet_period, mapper.clone()));

        let consumer = {
            let queue = queue.clone();
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                while let Some(event) = queue.take().await {
                    if event.is_immediate() {
                        // Processed inline so state-establishing events
                        // are visible before any later event is taken.
                        mapper.process(event).await;
                    } else {
                        scheduler.submit(event);
                    }
                }
                info!("Pipeline consumer finished");
            })
        };

        info!(
            queue_capacity = config.queue_capacity,
            quiet_period_ms = config.quiet_period.as_millis() as u64,
            "Pipeline started"
        );

        Ok(Self {
            queue,
            registry,
            ledger,
            scheduler,
            sink: retrying,
            metrics,
            consumer: Mutex::new(Some(consumer)),
            drain_timeout: config.drain_timeout,
        })
    }

    /// Offer an event, suspending under backpressure while the queue is
    /// at capacity.
    pub async fn offer(&self, event: SessionEvent) -> Result<(), OfferError> {
        self.queue.offer(event).await?;
        self.metrics.incr_offered();
        Ok(())
    }

    /// Force delivery of records buffered in the sink.
    pub async fn flush(&self) {
        if let Err(e) = self.sink.flush().await {
            error!(error = %e, "Pipeline flush failed");
        }
    }

    /// Stop intake, drain the queue and pending debounced events through
    /// the mapper, then flush and shut the sink down.
    pub async fn shutdown(&self) {
        self.queue.close().await;

        if let Some(consumer) = self.consumer.lock().await.take() {
            match tokio::time::timeout(self.drain_timeout, consumer).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Pipeline consumer panicked"),
                Err(_) => warn!("Pipeline consumer did not drain within the timeout"),
            }
        }

        self.scheduler.drain().await;

        if let Err(e) = self.sink.shutdown().await {
            error!(error = %e, "Sink shutdown failed");
        }
        info!("Pipeline shut down");
    }

    /// Current counters, including ledger and registry sizes.
    pub fn metrics(&self) -> PipelineMetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.events_coalesced = self.scheduler.coalesced_count();
        snapshot.dedup_ledger_size = self.ledger.len() as u64;
        snapshot.active_sessions = self.registry.len() as u64;
        snapshot
    }

    /// Number of keys currently waiting out their quiet period.
    pub fn pending_debounced(&self) -> usize {
        self.scheduler.pending_count()
    }

    /// Shared session registry (read access for diagnostics and tests).
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}
