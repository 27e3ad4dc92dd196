//! Tracebridge Core
//!
//! Shared pipeline primitives: the bounded event queue, the deduplication
//! ledger, the session registry, redaction, the audit spool, and the clock
//! abstraction. All mutation of the registry and ledger goes through the
//! operation contracts exposed here.

pub mod audit;
pub mod clock;
pub mod dedup;
pub mod queue;
pub mod redact;
pub mod registry;

pub use audit::{AuditEntry, AuditOutcome, AuditSpool, AuditSpoolConfig};
pub use clock::{Clock, MockClock, SystemClock};
pub use dedup::DedupLedger;
pub use queue::{EventQueue, OfferError};
pub use redact::{RedactionMode, Redactor, REDACTED_PLACEHOLDER};
pub use registry::{new_observation_id, trace_id_for_session, MessageInfo, SessionRegistry, TraceState};
