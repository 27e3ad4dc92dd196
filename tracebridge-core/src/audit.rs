//! Audit Spool
//!
//! Fire-and-forget side-channel persistence for offline debugging. Entries
//! are appended as JSON lines alongside (not instead of) sink delivery.
//! Spool failures never affect pipeline flow.

use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// What happened to an event at the mapper boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The event produced sink mutations.
    Mapped,
    /// The key was already in the dedup ledger.
    Deduped,
    /// Prerequisite state was missing; the event was dropped.
    Dropped,
    /// Sink delivery failed after retry exhaustion.
    SinkFailure,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at_ms: u64,
    pub kind: String,
    pub key: String,
    pub session_id: String,
    pub outcome: AuditOutcome,
}

/// Audit spool configuration.
#[derive(Debug, Clone)]
pub struct AuditSpoolConfig {
    /// Append target. `None` disables the spool entirely.
    pub file: Option<PathBuf>,

    /// Channel size for entry buffering.
    pub channel_size: usize,
}

impl Default for AuditSpoolConfig {
    fn default() -> Self {
        Self {
            file: None,
            channel_size: 1000,
        }
    }
}

/// JSONL audit spool backed by a writer task.
pub struct AuditSpool {
    sender: Option<mpsc::Sender<AuditEntry>>,
    _writer: Option<tokio::task::JoinHandle<()>>,
}

impl AuditSpool {
    pub fn new(config: AuditSpoolConfig) -> Self {
        let Some(path) = config.file else {
            return Self {
                sender: None,
                _writer: None,
            };
        };

        let (sender, mut receiver) = mpsc::channel::<AuditEntry>(config.channel_size);
        let writer = tokio::spawn(async move {
            while let Some(entry) = receiver.recv().await {
                if let Err(e) = Self::append(&path, &entry) {
                    error!(
                        path = %path.display(),
                        error = %e,
                        "Failed to write audit entry"
                    );
                }
            }
            debug!("Audit spool shutting down");
        });

        Self {
            sender: Some(sender),
            _writer: Some(writer),
        }
    }

    /// A spool that discards every entry.
    pub fn disabled() -> Self {
        Self::new(AuditSpoolConfig::default())
    }

    /// Record an entry. Never blocks; a full or closed channel drops the
    /// entry with a debug log.
    pub fn record(&self, entry: AuditEntry) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.try_send(entry) {
            debug!(error = %e, "Audit entry dropped");
        }
    }

    fn append(path: &std::path::Path, entry: &AuditEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}
