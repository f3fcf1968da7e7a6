//! Projection telemetry: everything the projector counts instead of
//! failing on. In lenient mode these are the only trace a bad input leaves.

use serde::{Deserialize, Serialize};

use vigil_types::{DisputePda, TaskPda};

/// Counters and structured detail accumulated over one projected batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectionTelemetry {
    /// Raw inputs handed to the projector.
    pub total_inputs: u64,
    /// Records emitted into the batch.
    pub projected_events: u64,
    /// Inputs dropped because their dedup fingerprint was already seen.
    pub duplicates_dropped: u64,
    /// Inputs whose event name maps to no canonical kind.
    pub unknown_events: Vec<UnknownEvent>,
    /// Number of lifecycle conflicts observed (one per violation).
    pub transition_conflicts: u64,
    /// Structured lifecycle violations.
    pub transition_violations: Vec<TransitionViolation>,
    /// Inputs rejected by structural validation.
    pub malformed_inputs: Vec<MalformedInput>,
}

/// An input whose event name is outside the closed canonical set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownEvent {
    /// The unrecognized source event name.
    pub event_name: String,
    /// Slot of the offending input.
    pub slot: u64,
    /// Signature of the offending input.
    pub signature: String,
}

/// An input that failed structural validation before projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalformedInput {
    /// Array index of the input in the submitted batch.
    pub index: u64,
    /// Human-readable validation failure.
    pub reason: String,
    /// Slot of the offending input.
    pub slot: u64,
    /// Signature of the offending input, possibly empty.
    pub signature: String,
}

/// A lifecycle transition the relevant state machine does not allow.
///
/// The offending record is still projected; strict mode turns the presence
/// of any violation into a batch failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionViolation {
    /// State machine the violation occurred in (`task`/`dispute`/`speculation`).
    pub scope: String,
    /// Entity the transition applied to, when the payload named one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    /// State the entity was in; `None` when the entity was absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,
    /// Attempted target state.
    pub to_state: String,
    /// Stable machine-readable reason.
    pub reason: String,
    /// Slot of the offending input.
    pub slot: u64,
    /// Signature of the offending input.
    pub signature: String,
    /// Source event name of the offending input.
    pub source_event_name: String,
    /// Source sequence of the offending input.
    pub source_event_sequence: u64,
}

//─────────────────────────────
//  Dispute replay state
//─────────────────────────────

/// Auxiliary per-dispute projection: vote tallies, voter signatures, and
/// the resolution outcome, accumulated while the batch replays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisputeReplayState {
    /// Task under dispute, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_pda: Option<TaskPda>,
    /// Votes supporting the disputing side.
    pub votes_for: u64,
    /// Votes against.
    pub votes_against: u64,
    /// Transaction signatures of the vote events, in projection order.
    pub voter_signatures: Vec<String>,
    /// Terminal outcome (`resolved`/`cancelled`/`expired`), once reached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

/// Convenience alias for the dispute replay map.
pub type DisputeReplayStates = std::collections::BTreeMap<DisputePda, DisputeReplayState>;
