//! Tracebridge Event Model
//!
//! This crate defines the closed sum type for session lifecycle events and
//! the pure key-extraction rules used for coalescing and deduplication.
//! Events are immutable value objects produced by a source adapter and
//! consumed exactly once by the mapping pipeline.

use serde::{Deserialize, Serialize};

/// Role of a logical message within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Token counters reported for an assistant message.
///
/// Zero means "not reported"; the mapper only forwards non-zero counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl TokenUsage {
    /// True when no counter was reported at all.
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_read_tokens == 0
            && self.cache_write_tokens == 0
            && self.reasoning_tokens == 0
    }
}

/// Payload of a streaming content part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartPayload {
    /// Incremental text content. Each update carries the full text so far.
    Text { content: String },

    /// A completed tool call embedded in the message stream. Input and
    /// output arrive together in this model.
    ToolCall {
        tool_name: String,
        input: serde_json::Value,
        #[serde(default)]
        output: serde_json::Value,
    },
}

/// A single lifecycle event describing an interactive session.
///
/// The upstream source filters to "interesting" transitions before handing
/// events over; the pipeline never re-derives completeness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SessionEvent {
    /// A session came into existence.
    #[serde(rename = "session.created")]
    SessionCreated {
        session_id: String,
        title: String,
        #[serde(default)]
        at_ms: u64,
    },

    /// A session's display title (or other surface metadata) changed.
    #[serde(rename = "session.updated")]
    SessionUpdated {
        session_id: String,
        title: String,
        #[serde(default)]
        at_ms: u64,
    },

    /// A session was removed upstream.
    #[serde(rename = "session.deleted")]
    SessionDeleted {
        session_id: String,
        #[serde(default)]
        at_ms: u64,
    },

    /// A logical message reached a state worth surfacing. Re-delivery for
    /// an already-registered message id is a no-op downstream.
    #[serde(rename = "message.updated")]
    MessageUpdated {
        session_id: String,
        message_id: String,
        role: Role,
        #[serde(default)]
        model: Option<String>,
        /// Logical-message id of the parent turn, for threading.
        #[serde(default)]
        parent_id: Option<String>,
        #[serde(default)]
        usage: Option<TokenUsage>,
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default)]
        started_at_ms: Option<u64>,
        #[serde(default)]
        completed_at_ms: Option<u64>,
        #[serde(default)]
        at_ms: u64,
    },

    /// A streaming content part changed. These arrive once per chunk and
    /// are the reason the coalescing scheduler exists.
    #[serde(rename = "message.part.updated")]
    PartUpdated {
        session_id: String,
        message_id: String,
        part_id: String,
        payload: PartPayload,
        #[serde(default)]
        at_ms: u64,
    },

    /// Tool invocation "before" hook: precise start time and input only.
    #[serde(rename = "tool.started")]
    ToolStarted {
        session_id: String,
        tool_name: String,
        input: serde_json::Value,
        #[serde(default)]
        at_ms: u64,
    },

    /// Tool invocation "after" hook: end time, output, and failure flag.
    #[serde(rename = "tool.finished")]
    ToolFinished {
        session_id: String,
        tool_name: String,
        #[serde(default)]
        output: serde_json::Value,
        #[serde(default)]
        failed: bool,
        #[serde(default)]
        at_ms: u64,
    },

    /// Side-channel carrying model parameters for the next assistant
    /// message in the session.
    #[serde(rename = "model.params")]
    ModelParams {
        session_id: String,
        params: serde_json::Map<String, serde_json::Value>,
        #[serde(default)]
        at_ms: u64,
    },
}

impl SessionEvent {
    /// Owning session identifier.
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::SessionCreated { session_id, .. }
            | SessionEvent::SessionUpdated { session_id, .. }
            | SessionEvent::SessionDeleted { session_id, .. }
            | SessionEvent::MessageUpdated { session_id, .. }
            | SessionEvent::PartUpdated { session_id, .. }
            | SessionEvent::ToolStarted { session_id, .. }
            | SessionEvent::ToolFinished { session_id, .. }
            | SessionEvent::ModelParams { session_id, .. } => session_id,
        }
    }

    /// Arrival timestamp in milliseconds since the epoch.
    pub fn at_ms(&self) -> u64 {
        match self {
            SessionEvent::SessionCreated { at_ms, .. }
            | SessionEvent::SessionUpdated { at_ms, .. }
            | SessionEvent::SessionDeleted { at_ms, .. }
            | SessionEvent::MessageUpdated { at_ms, .. }
            | SessionEvent::PartUpdated { at_ms, .. }
            | SessionEvent::ToolStarted { at_ms, .. }
            | SessionEvent::ToolFinished { at_ms, .. }
            | SessionEvent::ModelParams { at_ms, .. } => *at_ms,
        }
    }

    /// Stamp the arrival time if the source left it unset.
    ///
    /// Tool-invocation keys embed the arrival time, so stamping must
    /// happen once, at ingestion, before key extraction.
    pub fn ensure_arrival_time(&mut self, now_ms: u64) {
        let at_ms = match self {
            SessionEvent::SessionCreated { at_ms, .. }
            | SessionEvent::SessionUpdated { at_ms, .. }
            | SessionEvent::SessionDeleted { at_ms, .. }
            | SessionEvent::MessageUpdated { at_ms, .. }
            | SessionEvent::PartUpdated { at_ms, .. }
            | SessionEvent::ToolStarted { at_ms, .. }
            | SessionEvent::ToolFinished { at_ms, .. }
            | SessionEvent::ModelParams { at_ms, .. } => at_ms,
        };
        if *at_ms == 0 {
            *at_ms = now_ms;
        }
    }

    /// Short kind tag for logging and audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::SessionCreated { .. } => "session.created",
            SessionEvent::SessionUpdated { .. } => "session.updated",
            SessionEvent::SessionDeleted { .. } => "session.deleted",
            SessionEvent::MessageUpdated { .. } => "message.updated",
            SessionEvent::PartUpdated { .. } => "message.part.updated",
            SessionEvent::ToolStarted { .. } => "tool.started",
            SessionEvent::ToolFinished { .. } => "tool.finished",
            SessionEvent::ModelParams { .. } => "model.params",
        }
    }

    /// Grouping/deduplication key.
    ///
    /// Part updates key on the part's own id so every streaming chunk of
    /// one part coalesces; messages key on the message id; session
    /// lifecycle keys on the session id; tool hooks key per invocation
    /// (session + tool + arrival time) so they never coalesce.
    pub fn key(&self) -> String {
        match self {
            SessionEvent::PartUpdated { part_id, .. } => part_id.clone(),
            SessionEvent::MessageUpdated { message_id, .. } => message_id.clone(),
            SessionEvent::SessionCreated { session_id, .. }
            | SessionEvent::SessionUpdated { session_id, .. }
            | SessionEvent::SessionDeleted { session_id, .. } => session_id.clone(),
            SessionEvent::ToolStarted {
                session_id,
                tool_name,
                at_ms,
                ..
            } => format!("{session_id}:{tool_name}:started:{at_ms}"),
            SessionEvent::ToolFinished {
                session_id,
                tool_name,
                at_ms,
                ..
            } => format!("{session_id}:{tool_name}:finished:{at_ms}"),
            SessionEvent::ModelParams { session_id, .. } => session_id.clone(),
        }
    }

    /// Whether this event bypasses the coalescing scheduler.
    ///
    /// Session, message, parameter, and tool-hook events establish state
    /// that later part events depend on (or carry precise timing), so they
    /// are dispatched immediately; only part updates are debounced.
    pub fn is_immediate(&self) -> bool {
        !matches!(self, SessionEvent::PartUpdated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part_event(part_id: &str, content: &str) -> SessionEvent {
        SessionEvent::PartUpdated {
            session_id: "s1".into(),
            message_id: "m1".into(),
            part_id: part_id.into(),
            payload: PartPayload::Text {
                content: content.into(),
            },
            at_ms: 42,
        }
    }

    #[test]
    fn test_part_keys_on_part_id() {
        let a = part_event("p1", "h");
        let b = part_event("p1", "hi");
        assert_eq!(a.key(), "p1");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_message_keys_on_message_id() {
        let event = SessionEvent::MessageUpdated {
            session_id: "s1".into(),
            message_id: "m1".into(),
            role: Role::User,
            model: None,
            parent_id: None,
            usage: None,
            cost_usd: None,
            started_at_ms: None,
            completed_at_ms: None,
            at_ms: 0,
        };
        assert_eq!(event.key(), "m1");
        assert!(event.is_immediate());
    }

    #[test]
    fn test_session_lifecycle_keys_on_session_id() {
        let created = SessionEvent::SessionCreated {
            session_id: "s1".into(),
            title: "T".into(),
            at_ms: 0,
        };
        let deleted = SessionEvent::SessionDeleted {
            session_id: "s1".into(),
            at_ms: 1,
        };
        assert_eq!(created.key(), "s1");
        assert_eq!(deleted.key(), "s1");
    }

    #[test]
    fn test_tool_hooks_key_per_invocation() {
        let first = SessionEvent::ToolStarted {
            session_id: "s1".into(),
            tool_name: "grep".into(),
            input: serde_json::json!({"q": "x"}),
            at_ms: 100,
        };
        let second = SessionEvent::ToolStarted {
            session_id: "s1".into(),
            tool_name: "grep".into(),
            input: serde_json::json!({"q": "x"}),
            at_ms: 101,
        };
        assert_ne!(first.key(), second.key());
        assert!(first.is_immediate());
    }

    #[test]
    fn test_only_parts_are_debounced() {
        assert!(!part_event("p1", "h").is_immediate());
        let params = SessionEvent::ModelParams {
            session_id: "s1".into(),
            params: serde_json::Map::new(),
            at_ms: 0,
        };
        assert!(params.is_immediate());
    }

    #[test]
    fn test_event_json_round_trip() {
        let event = part_event("p1", "hello");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"message.part.updated\""));
        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_arrival_time_stamped_only_when_unset() {
        let mut unset = SessionEvent::SessionDeleted {
            session_id: "s1".into(),
            at_ms: 0,
        };
        unset.ensure_arrival_time(777);
        assert_eq!(unset.at_ms(), 777);

        let mut set = part_event("p1", "h");
        set.ensure_arrival_time(777);
        assert_eq!(set.at_ms(), 42);
    }

    #[test]
    fn test_token_usage_is_empty() {
        assert!(TokenUsage::default().is_empty());
        let usage = TokenUsage {
            output_tokens: 5,
            ..Default::default()
        };
        assert!(!usage.is_empty());
    }
}
