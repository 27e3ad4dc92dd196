//! Event-to-Record Mapper
//!
//! Consumes finalized events, consults and updates the session registry,
//! and issues create-or-update calls for trace/generation/span records.
//! Every handler invocation has a single top-level failure boundary: a
//! sink failure (after the sink's own retry budget) is logged and audited
//! but never propagates to the caller.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use tracebridge_core::{
    new_observation_id, AuditEntry, AuditOutcome, AuditSpool, DedupLedger, Redactor,
    SessionRegistry,
};
use tracebridge_event::{PartPayload, Role, SessionEvent, TokenUsage};
use tracebridge_sink::{
    CostDetails, GenerationRecord, SinkError, SpanRecord, TraceRecord, TraceSink, UsageMetrics,
};

use crate::debounce::EventHandler;
use crate::PipelineMetrics;

/// Span name for the user turn of a message.
pub const USER_MESSAGE_SPAN: &str = "user-message";
/// Generation name for the assistant turn of a message.
pub const ASSISTANT_MESSAGE_GENERATION: &str = "assistant-message";

/// What a handler invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapOutcome {
    /// Sink mutations were issued.
    Mapped,
    /// Nothing to do (unchanged title, already-registered message).
    NoOp,
    /// The key was already in the dedup ledger.
    Deduped,
    /// Prerequisite state was missing; the event was dropped.
    Dropped,
}

/// The mapping state machine.
pub struct EventMapper {
    registry: Arc<SessionRegistry>,
    ledger: Arc<DedupLedger>,
    sink: Arc<dyn TraceSink>,
    redactor: Arc<Redactor>,
    audit: Arc<AuditSpool>,
    metrics: Arc<PipelineMetrics>,
}

impl EventMapper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        ledger: Arc<DedupLedger>,
        sink: Arc<dyn TraceSink>,
        redactor: Arc<Redactor>,
        audit: Arc<AuditSpool>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            registry,
            ledger,
            sink,
            redactor,
            audit,
            metrics,
        }
    }

    /// Process one finalized event. Never fails; this is the failure
    /// boundary for the whole handler chain.
    pub async fn process(&self, event: SessionEvent) {
        let kind = event.kind();
        let key = event.key();
        let session_id = event.session_id().to_owned();
        let at_ms = event.at_ms();

        let audit_outcome = match self.handle(event).await {
            Ok(MapOutcome::Mapped) => {
                self.metrics.incr_mapped();
                Some(AuditOutcome::Mapped)
            }
            Ok(MapOutcome::NoOp) => {
                self.metrics.incr_noop();
                None
            }
            Ok(MapOutcome::Deduped) => {
                self.metrics.incr_deduped();
                debug!(kind, key = %key, "Skipping already-processed key");
                Some(AuditOutcome::Deduped)
            }
            Ok(MapOutcome::Dropped) => {
                self.metrics.incr_dropped();
                warn!(
                    kind,
                    key = %key,
                    session_id = %session_id,
                    "Dropping event with missing prerequisite state"
                );
                Some(AuditOutcome::Dropped)
            }
            Err(e) => {
                self.metrics.incr_sink_failures();
                warn!(kind, key = %key, error = %e, "Sink delivery failed, event lost");
                Some(AuditOutcome::SinkFailure)
            }
        };

        if let Some(outcome) = audit_outcome {
            self.audit.record(AuditEntry {
                at_ms,
                kind: kind.to_owned(),
                key,
                session_id,
                outcome,
            });
        }
    }

    async fn handle(&self, event: SessionEvent) -> Result<MapOutcome, SinkError> {
        match event {
            SessionEvent::SessionCreated {
                session_id,
                title,
                at_ms,
            }
            | SessionEvent::SessionUpdated {
                session_id,
                title,
                at_ms,
            } => self.on_session_upsert(&session_id, &title, at_ms).await,

            SessionEvent::SessionDeleted { session_id, .. } => {
                self.on_session_deleted(&session_id).await
            }

            SessionEvent::MessageUpdated {
                session_id,
                message_id,
                role,
                model,
                parent_id,
                usage,
                cost_usd,
                started_at_ms,
                completed_at_ms,
                ..
            } => {
                self.on_message(
                    &session_id,
                    &message_id,
                    role,
                    model,
                    parent_id,
                    usage,
                    cost_usd,
                    started_at_ms,
                    completed_at_ms,
                )
                .await
            }

            // Part updates skip the ledger: the observation and span ids
            // they write through are stable, so a redelivery or a later
            // burst of the same part merges into the existing record
            // instead of truncating it.
            SessionEvent::PartUpdated {
                session_id,
                message_id,
                part_id,
                payload,
                ..
            } => {
                self.on_part(&session_id, &message_id, &part_id, &payload)
                    .await
            }

            // Tool hooks mint a fresh span id per dispatch, so redelivery
            // is not idempotent; the ledger is what keeps it out.
            SessionEvent::ToolStarted {
                ref session_id,
                ref tool_name,
                ref input,
                at_ms,
            } => {
                if !self.ledger.mark(&event.key()) {
                    return Ok(MapOutcome::Deduped);
                }
                self.on_tool_started(&event.key(), session_id, tool_name, input, at_ms)
                    .await
            }

            SessionEvent::ToolFinished {
                ref session_id,
                ref tool_name,
                ref output,
                failed,
                at_ms,
            } => {
                if !self.ledger.mark(&event.key()) {
                    return Ok(MapOutcome::Deduped);
                }
                self.on_tool_finished(&event.key(), session_id, tool_name, output, failed, at_ms)
                    .await
            }

            SessionEvent::ModelParams {
                session_id, params, ..
            } => self.on_model_params(&session_id, params),
        }
    }

    async fn on_session_upsert(
        &self,
        session_id: &str,
        title: &str,
        at_ms: u64,
    ) -> Result<MapOutcome, SinkError> {
        let created = self.registry.insert_session(session_id, title, at_ms);
        let trace_id = self
            .registry
            .read(session_id, |state| state.trace_id.clone())
            .unwrap_or_else(|| tracebridge_core::trace_id_for_session(session_id));

        if !created {
            let changed = self
                .registry
                .update(session_id, |state| {
                    if state.title == title {
                        false
                    } else {
                        state.title = title.to_owned();
                        true
                    }
                })
                .unwrap_or(false);
            if !changed {
                return Ok(MapOutcome::NoOp);
            }
        }

        let record = TraceRecord::new(trace_id, session_id, self.redactor.text(title));
        self.sink.create_trace(record).await?;
        Ok(MapOutcome::Mapped)
    }

    async fn on_session_deleted(&self, session_id: &str) -> Result<MapOutcome, SinkError> {
        // Best effort: get buffered records for this session out before
        // forgetting it. Flush failure must not keep the state alive.
        if let Err(e) = self.sink.flush().await {
            warn!(session_id = %session_id, error = %e, "Flush on session deletion failed");
        }
        if self.registry.remove(session_id).is_none() {
            return Ok(MapOutcome::Dropped);
        }
        Ok(MapOutcome::Mapped)
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_message(
        &self,
        session_id: &str,
        message_id: &str,
        role: Role,
        model: Option<String>,
        parent_id: Option<String>,
        usage: Option<TokenUsage>,
        cost_usd: Option<f64>,
        started_at_ms: Option<u64>,
        completed_at_ms: Option<u64>,
    ) -> Result<MapOutcome, SinkError> {
        // Resolve everything under one entry lock: registration is
        // one-time, parent threading resolves against already-registered
        // messages only, and pending parameters are drained exactly once.
        let prepared = self.registry.update(session_id, |state| {
            if state.message(message_id).is_some() {
                return None;
            }
            let observation_id = new_observation_id();
            let parent_observation_id = parent_id
                .as_deref()
                .and_then(|pid| state.message(pid))
                .map(|info| info.observation_id.clone());
            let params = match role {
                Role::Assistant => state.take_pending_params(),
                Role::User => None,
            };
            state.register_message(
                message_id,
                tracebridge_core::MessageInfo {
                    observation_id: observation_id.clone(),
                    role,
                    model: model.clone(),
                    parent_observation_id: parent_observation_id.clone(),
                },
            );
            Some((
                state.trace_id.clone(),
                observation_id,
                parent_observation_id,
                params,
            ))
        });

        let Some(prepared) = prepared else {
            return Ok(MapOutcome::Dropped);
        };
        let Some((trace_id, observation_id, parent_observation_id, params)) = prepared else {
            // Already registered; later lifecycle transitions of the same
            // message are no-ops.
            return Ok(MapOutcome::NoOp);
        };

        match role {
            Role::User => {
                let mut span = SpanRecord::new(observation_id, trace_id, USER_MESSAGE_SPAN);
                span.parent_observation_id = parent_observation_id;
                self.sink.create_span(span).await?;
            }
            Role::Assistant => {
                let mut generation =
                    GenerationRecord::new(observation_id, trace_id, ASSISTANT_MESSAGE_GENERATION);
                generation.parent_observation_id = parent_observation_id;
                generation.model = model;
                generation.usage = usage.and_then(usage_metrics);
                generation.cost = cost_usd
                    .filter(|cost| *cost > 0.0)
                    .map(|total_usd| CostDetails { total_usd });
                generation.start_time_ms = started_at_ms;
                generation.end_time_ms = completed_at_ms;
                generation.model_parameters = params;
                self.sink.create_generation(generation).await?;
            }
        }
        Ok(MapOutcome::Mapped)
    }

    async fn on_part(
        &self,
        session_id: &str,
        message_id: &str,
        part_id: &str,
        payload: &PartPayload,
    ) -> Result<MapOutcome, SinkError> {
        let Some(context) = self.registry.read(session_id, |state| {
            state
                .message(message_id)
                .map(|info| (state.trace_id.clone(), info.clone()))
        }) else {
            return Ok(MapOutcome::Dropped);
        };
        let Some((trace_id, info)) = context else {
            // A part for an unregistered message is unrecoverable ordering
            // skew; never retried.
            return Ok(MapOutcome::Dropped);
        };

        match payload {
            PartPayload::Text { content } => {
                let text = Value::String(self.redactor.text(content));
                match info.role {
                    Role::User => {
                        let mut span =
                            SpanRecord::new(info.observation_id, trace_id, USER_MESSAGE_SPAN);
                        span.input = Some(text);
                        self.sink.create_span(span).await?;
                    }
                    Role::Assistant => {
                        let mut generation = GenerationRecord::new(
                            info.observation_id,
                            trace_id,
                            ASSISTANT_MESSAGE_GENERATION,
                        );
                        generation.output = Some(text);
                        self.sink.create_generation(generation).await?;
                    }
                }
            }
            PartPayload::ToolCall {
                tool_name,
                input,
                output,
            } => {
                let span_id = self
                    .registry
                    .update(session_id, |state| match state.span_id(part_id) {
                        Some(existing) => existing.to_owned(),
                        None => {
                            let id = new_observation_id();
                            state.record_span(part_id, &id);
                            id
                        }
                    })
                    .unwrap_or_else(new_observation_id);

                // Tool parts arrive already completed: input and output go
                // out together, as a child of the owning message.
                let mut span =
                    SpanRecord::new(span_id, trace_id, format!("tool-{tool_name}"));
                span.parent_observation_id = Some(info.observation_id);
                span.input = Some(self.redactor.value(input));
                span.output = Some(self.redactor.value(output));
                self.sink.create_span(span).await?;
            }
        }
        Ok(MapOutcome::Mapped)
    }

    async fn on_tool_started(
        &self,
        key: &str,
        session_id: &str,
        tool_name: &str,
        input: &Value,
        at_ms: u64,
    ) -> Result<MapOutcome, SinkError> {
        let Some((trace_id, span_id)) = self.registry.update(session_id, |state| {
            let id = new_observation_id();
            state.record_span(key, &id);
            (state.trace_id.clone(), id)
        }) else {
            return Ok(MapOutcome::Dropped);
        };

        let mut span = SpanRecord::new(span_id, trace_id, format!("tool-{tool_name}"));
        span.start_time_ms = Some(at_ms);
        span.input = Some(self.redactor.value(input));
        self.sink.create_span(span).await?;
        Ok(MapOutcome::Mapped)
    }

    async fn on_tool_finished(
        &self,
        key: &str,
        session_id: &str,
        tool_name: &str,
        output: &Value,
        failed: bool,
        at_ms: u64,
    ) -> Result<MapOutcome, SinkError> {
        let Some((trace_id, span_id)) = self.registry.update(session_id, |state| {
            let id = new_observation_id();
            state.record_span(key, &id);
            (state.trace_id.clone(), id)
        }) else {
            return Ok(MapOutcome::Dropped);
        };

        let mut span = SpanRecord::new(span_id, trace_id, format!("tool-{tool_name}"));
        span.end_time_ms = Some(at_ms);
        span.output = Some(self.redactor.value(output));
        if failed {
            span.metadata = Some(serde_json::json!({ "error": true }));
        }
        self.sink.create_span(span).await?;
        Ok(MapOutcome::Mapped)
    }

    fn on_model_params(
        &self,
        session_id: &str,
        params: serde_json::Map<String, Value>,
    ) -> Result<MapOutcome, SinkError> {
        match self
            .registry
            .update(session_id, |state| state.set_pending_params(params))
        {
            Some(()) => Ok(MapOutcome::Mapped),
            None => Ok(MapOutcome::Dropped),
        }
    }
}

/// Build the usage bag, keeping only reported (non-zero) counters.
fn usage_metrics(usage: TokenUsage) -> Option<UsageMetrics> {
    if usage.is_empty() {
        return None;
    }
    let keep = |n: u64| if n > 0 { Some(n) } else { None };
    Some(UsageMetrics {
        input_tokens: keep(usage.input_tokens),
        output_tokens: keep(usage.output_tokens),
        cache_read_tokens: keep(usage.cache_read_tokens),
        cache_write_tokens: keep(usage.cache_write_tokens),
        reasoning_tokens: keep(usage.reasoning_tokens),
    })
}

#[async_trait::async_trait]
impl EventHandler for EventMapper {
    async fn handle(&self, event: SessionEvent) {
        self.process(event).await;
    }
}
