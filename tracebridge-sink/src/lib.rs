//! Tracebridge Sink
//!
//! Downstream export contract: idempotent-by-id create-or-update calls for
//! trace, generation, and span records, plus flush/shutdown. Creation
//! calls invoked again with the same id mean "merge/update", never
//! "duplicate". The [`retry`] module wraps any sink with bounded
//! exponential-backoff retry.

pub mod memory;
pub mod retry;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::MemorySink;
pub use retry::{RetryPolicy, RetryingSink};

/// Usage counters attached to a generation. Only reported fields are set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

impl UsageMetrics {
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.cache_read_tokens.is_none()
            && self.cache_write_tokens.is_none()
            && self.reasoning_tokens.is_none()
    }
}

/// Cost attached to a generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostDetails {
    pub total_usd: f64,
}

/// Top-level record representing one entire session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: String,
    pub session_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl TraceRecord {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            name: name.into(),
            input: None,
            output: None,
            metadata: None,
        }
    }

    /// Merge an update into an existing record: set fields override,
    /// absent fields keep their current value.
    pub fn merge_from(&mut self, update: TraceRecord) {
        self.session_id = update.session_id;
        self.name = update.name;
        if update.input.is_some() {
            self.input = update.input;
        }
        if update.output.is_some() {
            self.output = update.output;
        }
        if update.metadata.is_some() {
            self.metadata = update.metadata;
        }
    }
}

/// A model-produced response with usage/cost/model metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_observation_id: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_parameters: Option<serde_json::Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<u64>,
}

impl GenerationRecord {
    pub fn new(id: impl Into<String>, trace_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trace_id: trace_id.into(),
            parent_observation_id: None,
            name: name.into(),
            model: None,
            model_parameters: None,
            input: None,
            output: None,
            usage: None,
            cost: None,
            start_time_ms: None,
            end_time_ms: None,
        }
    }

    pub fn merge_from(&mut self, update: GenerationRecord) {
        self.trace_id = update.trace_id;
        self.name = update.name;
        if update.parent_observation_id.is_some() {
            self.parent_observation_id = update.parent_observation_id;
        }
        if update.model.is_some() {
            self.model = update.model;
        }
        if update.model_parameters.is_some() {
            self.model_parameters = update.model_parameters;
        }
        if update.input.is_some() {
            self.input = update.input;
        }
        if update.output.is_some() {
            self.output = update.output;
        }
        if update.usage.is_some() {
            self.usage = update.usage;
        }
        if update.cost.is_some() {
            self.cost = update.cost;
        }
        if update.start_time_ms.is_some() {
            self.start_time_ms = update.start_time_ms;
        }
        if update.end_time_ms.is_some() {
            self.end_time_ms = update.end_time_ms;
        }
    }
}

/// A bounded operation (user turn, tool invocation) within a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub id: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_observation_id: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<u64>,
}

impl SpanRecord {
    pub fn new(id: impl Into<String>, trace_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trace_id: trace_id.into(),
            parent_observation_id: None,
            name: name.into(),
            input: None,
            output: None,
            metadata: None,
            start_time_ms: None,
            end_time_ms: None,
        }
    }

    pub fn merge_from(&mut self, update: SpanRecord) {
        self.trace_id = update.trace_id;
        self.name = update.name;
        if update.parent_observation_id.is_some() {
            self.parent_observation_id = update.parent_observation_id;
        }
        if update.input.is_some() {
            self.input = update.input;
        }
        if update.output.is_some() {
            self.output = update.output;
        }
        if update.metadata.is_some() {
            self.metadata = update.metadata;
        }
        if update.start_time_ms.is_some() {
            self.start_time_ms = update.start_time_ms;
        }
        if update.end_time_ms.is_some() {
            self.end_time_ms = update.end_time_ms;
        }
    }
}

/// Sink errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The downstream call failed (network, auth, 4xx/5xx). Retryable.
    #[error("Sink API error: {0}")]
    Api(String),

    /// Retry budget exhausted for an operation.
    #[error("Sink operation '{operation}' failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: Box<SinkError>,
    },
}

/// Downstream tracing backend.
///
/// Creation calls enqueue into the sink's internal batch; `flush` forces
/// delivery of buffered records and `shutdown` flushes and releases
/// resources. All operations must tolerate repeated invocation.
#[async_trait::async_trait]
pub trait TraceSink: Send + Sync {
    async fn create_trace(&self, record: TraceRecord) -> Result<(), SinkError>;

    async fn create_generation(&self, record: GenerationRecord) -> Result<(), SinkError>;

    async fn create_span(&self, record: SpanRecord) -> Result<(), SinkError>;

    async fn flush(&self) -> Result<(), SinkError>;

    async fn shutdown(&self) -> Result<(), SinkError>;
}

#[async_trait::async_trait]
impl<S: TraceSink + ?Sized> TraceSink for std::sync::Arc<S> {
    async fn create_trace(&self, record: TraceRecord) -> Result<(), SinkError> {
        (**self).create_trace(record).await
    }

    async fn create_generation(&self, record: GenerationRecord) -> Result<(), SinkError> {
        (**self).create_generation(record).await
    }

    async fn create_span(&self, record: SpanRecord) -> Result<(), SinkError> {
        (**self).create_span(record).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        (**self).flush().await
    }

    async fn shutdown(&self) -> Result<(), SinkError> {
        (**self).shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trace_merge_keeps_unset_fields() {
        let mut record = TraceRecord::new("t1", "s1", "first");
        record.input = Some(json!("hello"));

        let mut update = TraceRecord::new("t1", "s1", "second");
        update.metadata = Some(json!({"k": 1}));
        record.merge_from(update);

        assert_eq!(record.name, "second");
        assert_eq!(record.input, Some(json!("hello")));
        assert_eq!(record.metadata, Some(json!({"k": 1})));
    }

    #[test]
    fn test_generation_merge_overrides_set_fields() {
        let mut record = GenerationRecord::new("g1", "t1", "assistant-message");
        record.output = Some(json!("partial"));

        let mut update = GenerationRecord::new("g1", "t1", "assistant-message");
        update.output = Some(json!("full"));
        update.usage = Some(UsageMetrics {
            output_tokens: Some(12),
            ..Default::default()
        });
        record.merge_from(update);

        assert_eq!(record.output, Some(json!("full")));
        assert_eq!(record.usage.unwrap().output_tokens, Some(12));
    }

    #[test]
    fn test_span_merge_joins_before_and_after() {
        let mut record = SpanRecord::new("sp1", "t1", "tool-grep");
        record.start_time_ms = Some(100);
        record.input = Some(json!({"q": "x"}));

        let mut update = SpanRecord::new("sp1", "t1", "tool-grep");
        update.end_time_ms = Some(250);
        update.output = Some(json!("3 matches"));
        record.merge_from(update);

        assert_eq!(record.start_time_ms, Some(100));
        assert_eq!(record.end_time_ms, Some(250));
        assert_eq!(record.input, Some(json!({"q": "x"})));
        assert_eq!(record.output, Some(json!("3 matches")));
    }

    #[test]
    fn test_usage_serialization_skips_unset() {
        let usage = UsageMetrics {
            input_tokens: Some(7),
            ..Default::default()
        };
        let json = serde_json::to_string(&usage).unwrap();
        assert_eq!(json, r#"{"input_tokens":7}"#);
    }
}
