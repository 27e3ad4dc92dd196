//! In-Memory Sink
//!
//! Reference sink used by tests and the CLI dry-run path. Implements the
//! create-or-update contract: a second call with an existing id merges
//! into the stored record instead of duplicating it.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::{GenerationRecord, SinkError, SpanRecord, TraceRecord, TraceSink};

/// Sink that buffers records in memory, merging by id.
#[derive(Debug, Default)]
pub struct MemorySink {
    traces: DashMap<String, TraceRecord>,
    generations: DashMap<String, GenerationRecord>,
    spans: DashMap<String, SpanRecord>,
    flushes: AtomicU64,
    shutdowns: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trace(&self, id: &str) -> Option<TraceRecord> {
        self.traces.get(id).map(|r| r.clone())
    }

    pub fn generation(&self, id: &str) -> Option<GenerationRecord> {
        self.generations.get(id).map(|r| r.clone())
    }

    pub fn span(&self, id: &str) -> Option<SpanRecord> {
        self.spans.get(id).map(|r| r.clone())
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    pub fn generation_count(&self) -> usize {
        self.generations.len()
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Total distinct records of all three kinds.
    pub fn record_count(&self) -> usize {
        self.trace_count() + self.generation_count() + self.span_count()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> u64 {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// All spans, for assertions that scan by name.
    pub fn spans(&self) -> Vec<SpanRecord> {
        self.spans.iter().map(|r| r.clone()).collect()
    }

    pub fn traces(&self) -> Vec<TraceRecord> {
        self.traces.iter().map(|r| r.clone()).collect()
    }

    pub fn generations(&self) -> Vec<GenerationRecord> {
        self.generations.iter().map(|r| r.clone()).collect()
    }
}

#[async_trait::async_trait]
impl TraceSink for MemorySink {
    async fn create_trace(&self, record: TraceRecord) -> Result<(), SinkError> {
        self.traces
            .entry(record.id.clone())
            .and_modify(|existing| existing.merge_from(record.clone()))
            .or_insert(record);
        Ok(())
    }

    async fn create_generation(&self, record: GenerationRecord) -> Result<(), SinkError> {
        self.generations
            .entry(record.id.clone())
            .and_modify(|existing| existing.merge_from(record.clone()))
            .or_insert(record);
        Ok(())
    }

    async fn create_span(&self, record: SpanRecord) -> Result<(), SinkError> {
        self.spans
            .entry(record.id.clone())
            .and_modify(|existing| existing.merge_from(record.clone()))
            .or_insert(record);
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), SinkError> {
        self.flush().await?;
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_same_id_updates_not_duplicates() {
        let sink = MemorySink::new();

        let mut first = SpanRecord::new("sp1", "t1", "user-message");
        first.input = Some(json!("hi"));
        sink.create_span(first).await.unwrap();

        let mut second = SpanRecord::new("sp1", "t1", "user-message");
        second.input = Some(json!("hi there"));
        sink.create_span(second).await.unwrap();

        assert_eq!(sink.span_count(), 1);
        assert_eq!(sink.span("sp1").unwrap().input, Some(json!("hi there")));
    }

    #[tokio::test]
    async fn test_shutdown_implies_flush() {
        let sink = MemorySink::new();
        sink.create_trace(TraceRecord::new("t1", "s1", "T"))
            .await
            .unwrap();
        sink.shutdown().await.unwrap();
        assert_eq!(sink.flush_count(), 1);
        assert_eq!(sink.shutdown_count(), 1);
    }
}
