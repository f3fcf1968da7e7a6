#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-types** – Shared primitive data structures for the Vigil replay core.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, hashing, or storage.

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Input validation limits
//─────────────────────────────

/// Maximum allowed length for source event names.
pub const MAX_EVENT_NAME_LEN: usize = 256;

/// Maximum allowed length for transaction signatures.
pub const MAX_SIGNATURE_LEN: usize = 256;

/// Maximum allowed length for a base58-rendered program-derived address.
pub const MAX_PDA_LEN: usize = 64;

/// Maximum allowed serialized payload size for a single raw event.
pub const MAX_PAYLOAD_BYTES: usize = 1_048_576; // 1MB

//─────────────────────────────
//  Lifecycle state machines
//─────────────────────────────

/// Canonical lifecycle kinds, trajectory sort keys and the three
/// finite-state machines enforced by the projector.
pub mod lifecycle;
pub use lifecycle::{
    DisputeState, InvalidTransition, LifecycleScope, SpeculationState, TaskState, TrajectoryKind,
};

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Opaque on-chain program-derived address, carried as its base58 string.
///
/// Vigil never interprets PDA bytes; the base58 rendering is the canonical
/// identity everywhere in the core (storage keys, graph nodes, ledger keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pda(pub String);

impl Pda {
    /// Borrow the base58 string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Pda {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Pda {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for Pda {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Address of a task account.
pub type TaskPda = Pda;
/// Address of a dispute account.
pub type DisputePda = Pda;
/// Address of a speculation commitment account.
pub type SpeculationPda = Pda;
/// Address of an agent account.
pub type AgentPda = Pda;

//─────────────────────────────
//  Trace identity
//─────────────────────────────

/// Propagated tracing identity attached to every projected record.
///
/// When the source event carries no context, the projector synthesizes one
/// deterministically so that two runs over the same inputs agree on every
/// span identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Session-level trace identifier.
    pub trace_id: String,
    /// Span identifier for this event.
    pub span_id: String,
    /// Parent span, when the event was emitted inside another span.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Deterministic sampling decision.
    pub sampled: bool,
}

//─────────────────────────────
//  Raw chain events
//─────────────────────────────

/// A parsed on-chain event as delivered by a `ChainSource`.
///
/// The quadruple `(slot, signature, event_name, source_event_sequence)` is
/// the canonical event tuple, the basis of all deterministic identity in
/// the pipeline. When the source omits `source_event_sequence`, the
/// projector assigns one by position within the transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChainEvent {
    /// Source event name as emitted by the on-chain program.
    pub event_name: String,
    /// Opaque event payload.
    pub payload: serde_json::Value,
    /// Slot the transaction landed in.
    pub slot: u64,
    /// Transaction signature.
    pub signature: String,
    /// Wall-clock timestamp in milliseconds, when the source provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
    /// Position of this event within its source transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_event_sequence: Option<u64>,
    /// Trace context propagated from the emitting side, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<TraceContext>,
}

impl RawChainEvent {
    /// Validate structural bounds before the event enters the pipeline.
    ///
    /// Oversized or empty identity fields mark the input malformed; the
    /// projector records such inputs in telemetry rather than aborting.
    pub fn validate(&self) -> Result<(), String> {
        if self.event_name.trim().is_empty() {
            return Err("event name cannot be empty".to_string());
        }
        if self.event_name.len() > MAX_EVENT_NAME_LEN {
            return Err(format!(
                "event name too long: {} > {}",
                self.event_name.len(),
                MAX_EVENT_NAME_LEN
            ));
        }
        if self.signature.trim().is_empty() {
            return Err("signature cannot be empty".to_string());
        }
        if self.signature.len() > MAX_SIGNATURE_LEN {
            return Err(format!(
                "signature too long: {} > {}",
                self.signature.len(),
                MAX_SIGNATURE_LEN
            ));
        }
        let payload_len = self.payload.to_string().len();
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(format!(
                "payload too large: {payload_len} > {MAX_PAYLOAD_BYTES}"
            ));
        }
        Ok(())
    }
}

//─────────────────────────────
//  Resume cursor
//─────────────────────────────

/// Opaque resume point for backfill, persisted atomically with the last
/// accepted record batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Slot of the last fully-persisted event.
    pub slot: u64,
    /// Signature of the last fully-persisted event.
    pub signature: String,
    /// Source event name at the cursor position, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    /// Trace session the cursor belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Span at the cursor position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_span_id: Option<String>,
}

impl Cursor {
    /// Ordering tuple `(slot, signature)` used for "newer than" comparisons.
    pub fn position(&self) -> (u64, &str) {
        (self.slot, self.signature.as_str())
    }
}

//─────────────────────────────
//  Dependency typing
//─────────────────────────────

/// How a child task depends on its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Child consumes the parent's output.
    Data,
    /// Child must run after the parent but shares no data.
    Order,
    /// Child's execution is conditional on the parent's outcome.
    Control,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_validation_rejects_empty_identity() {
        let mut ev = RawChainEvent {
            event_name: "taskCreated".into(),
            payload: serde_json::json!({}),
            slot: 1,
            signature: "sig".into(),
            timestamp_ms: None,
            source_event_sequence: None,
            trace_context: None,
        };
        assert!(ev.validate().is_ok());

        ev.event_name = "  ".into();
        assert!(ev.validate().is_err());

        ev.event_name = "taskCreated".into();
        ev.signature = String::new();
        assert!(ev.validate().is_err());
    }

    #[test]
    fn raw_event_validation_bounds_payload_size() {
        let mut ev = RawChainEvent {
            event_name: "taskCreated".into(),
            payload: serde_json::json!({"note": "ok"}),
            slot: 1,
            signature: "sig".into(),
            timestamp_ms: None,
            source_event_sequence: None,
            trace_context: None,
        };
        assert!(ev.validate().is_ok());

        ev.payload = serde_json::json!({"blob": "x".repeat(MAX_PAYLOAD_BYTES + 1)});
        assert!(ev.validate().is_err());
    }

    #[test]
    fn cursor_serde_round_trip() {
        let cursor = Cursor {
            slot: 42,
            signature: "AbC".into(),
            event_name: Some("taskClaimed".into()),
            trace_id: Some("session-1".into()),
            trace_span_id: None,
        };
        let json = serde_json::to_string(&cursor).unwrap();
        let back: Cursor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cursor);
    }
}
