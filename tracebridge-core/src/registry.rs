//! Session Registry
//!
//! Mutable map from session identifier to accumulated trace state. A
//! `TraceState` must exist for a session before any message or part event
//! referencing it is processed; handlers that find it absent drop the
//! event. Per-entry mutation is atomic (the map holds an entry lock for
//! the duration of an update closure).

use ahash::AHashMap;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracebridge_event::Role;

/// Derive the stable trace identifier for a session.
///
/// Deterministic so an exporter restart keeps appending to the same
/// backend trace instead of opening a fresh one.
pub fn trace_id_for_session(session_id: &str) -> String {
    let digest = Sha256::digest(session_id.as_bytes());
    let mut hex = String::with_capacity(32);
    for byte in &digest[..16] {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("trace-{hex}")
}

/// Generate a fresh observation identifier for a newly registered message.
pub fn new_observation_id() -> String {
    format!("obs-{}", uuid::Uuid::new_v4())
}

/// Bookkeeping for one registered logical message.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    /// Observation id issued to the sink for this message. Unique per
    /// logical message, never reused across coalescing cycles.
    pub observation_id: String,
    pub role: Role,
    pub model: Option<String>,
    /// Observation id of the parent turn, resolved at registration time.
    /// Omitted (never retried) when the parent is not yet registered.
    pub parent_observation_id: Option<String>,
}

/// Accumulated per-session trace state.
#[derive(Debug)]
pub struct TraceState {
    pub trace_id: String,
    pub session_id: String,
    pub title: String,
    pub created_at_ms: u64,
    messages: AHashMap<String, MessageInfo>,
    spans: AHashMap<String, String>,
    pending_params: Option<serde_json::Map<String, serde_json::Value>>,
}

impl TraceState {
    fn new(session_id: &str, title: String, created_at_ms: u64) -> Self {
        Self {
            trace_id: trace_id_for_session(session_id),
            session_id: session_id.to_owned(),
            title,
            created_at_ms,
            messages: AHashMap::new(),
            spans: AHashMap::new(),
            pending_params: None,
        }
    }

    /// Register a message. Returns `false` (leaving the original intact)
    /// if the message id is already registered.
    pub fn register_message(&mut self, message_id: &str, info: MessageInfo) -> bool {
        if self.messages.contains_key(message_id) {
            return false;
        }
        self.messages.insert(message_id.to_owned(), info);
        true
    }

    pub fn message(&self, message_id: &str) -> Option<&MessageInfo> {
        self.messages.get(message_id)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Remember the span id issued for a part or tool key.
    pub fn record_span(&mut self, key: &str, span_id: &str) {
        self.spans.insert(key.to_owned(), span_id.to_owned());
    }

    pub fn span_id(&self, key: &str) -> Option<&str> {
        self.spans.get(key).map(String::as_str)
    }

    /// Stash model parameters for the next assistant registration.
    pub fn set_pending_params(&mut self, params: serde_json::Map<String, serde_json::Value>) {
        self.pending_params = Some(params);
    }

    /// Drain pending parameters. Single consumption: a second call returns
    /// `None` until a new parameters event arrives.
    pub fn take_pending_params(&mut self) -> Option<serde_json::Map<String, serde_json::Value>> {
        self.pending_params.take()
    }
}

/// Process-wide registry of active sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, TraceState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create trace state for a session if none exists yet.
    ///
    /// Returns `true` when the state was created by this call.
    pub fn insert_session(&self, session_id: &str, title: &str, at_ms: u64) -> bool {
        let mut created = false;
        self.sessions.entry(session_id.to_owned()).or_insert_with(|| {
            created = true;
            TraceState::new(session_id, title.to_owned(), at_ms)
        });
        created
    }

    /// Run `f` against the session's state under the entry lock.
    ///
    /// Returns `None` when no state exists for the session.
    pub fn update<R>(&self, session_id: &str, f: impl FnOnce(&mut TraceState) -> R) -> Option<R> {
        self.sessions.get_mut(session_id).map(|mut state| f(&mut state))
    }

    /// Read-only variant of [`update`](Self::update).
    pub fn read<R>(&self, session_id: &str, f: impl FnOnce(&TraceState) -> R) -> Option<R> {
        self.sessions.get(session_id).map(|state| f(&state))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Remove a session's state, returning it if present.
    pub fn remove(&self, session_id: &str) -> Option<TraceState> {
        self.sessions.remove(session_id).map(|(_, state)| state)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_is_deterministic() {
        let a = trace_id_for_session("session-1");
        let b = trace_id_for_session("session-1");
        let other = trace_id_for_session("session-2");
        assert_eq!(a, b);
        assert_ne!(a, other);
        assert!(a.starts_with("trace-"));
        assert_eq!(a.len(), "trace-".len() + 32);
    }

    #[test]
    fn test_observation_ids_are_fresh() {
        assert_ne!(new_observation_id(), new_observation_id());
    }

    #[test]
    fn test_insert_session_is_create_once() {
        let registry = SessionRegistry::new();
        assert!(registry.insert_session("s1", "first", 1));
        assert!(!registry.insert_session("s1", "second", 2));

        let title = registry.read("s1", |state| state.title.clone()).unwrap();
        assert_eq!(title, "first");
    }

    #[test]
    fn test_message_registration_is_one_time() {
        let registry = SessionRegistry::new();
        registry.insert_session("s1", "t", 0);

        let info = MessageInfo {
            observation_id: "obs-a".into(),
            role: Role::User,
            model: None,
            parent_observation_id: None,
        };
        let first = registry
            .update("s1", |state| state.register_message("m1", info.clone()))
            .unwrap();
        let second = registry
            .update("s1", |state| state.register_message("m1", info))
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn test_pending_params_single_consumption() {
        let registry = SessionRegistry::new();
        registry.insert_session("s1", "t", 0);

        let mut params = serde_json::Map::new();
        params.insert("temperature".into(), serde_json::json!(0.7));
        registry
            .update("s1", |state| state.set_pending_params(params))
            .unwrap();

        let taken = registry
            .update("s1", |state| state.take_pending_params())
            .unwrap();
        assert!(taken.is_some());

        let again = registry
            .update("s1", |state| state.take_pending_params())
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_update_on_missing_session_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.update("ghost", |_| ()).is_none());
    }

    #[test]
    fn test_remove_returns_state() {
        let registry = SessionRegistry::new();
        registry.insert_session("s1", "t", 0);
        let state = registry.remove("s1").unwrap();
        assert_eq!(state.session_id, "s1");
        assert!(!registry.contains("s1"));
    }
}
