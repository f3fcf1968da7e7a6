//! Canonical lifecycle kinds and the three finite-state machines the
//! projector enforces (task, dispute, speculation).
//!
//! Each kind carries a fixed trajectory sort key so that lifecycle events
//! sharing a slot order sensibly after the primary `(slot, signature)` sort.

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Canonical trajectory kinds
//─────────────────────────────

/// Closed set of canonical lifecycle event kinds.
///
/// Source event names outside this set are captured in projection telemetry
/// only and never reach the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrajectoryKind {
    /// Task became visible on-chain.
    #[serde(rename = "discovered")]
    Discovered,
    /// An agent claimed the task.
    #[serde(rename = "claimed")]
    Claimed,
    /// The task finished successfully.
    #[serde(rename = "completed")]
    Completed,
    /// The task failed.
    #[serde(rename = "failed")]
    Failed,
    /// The task entered dispute.
    #[serde(rename = "disputed")]
    Disputed,
    /// A dispute was opened against a task.
    #[serde(rename = "dispute:initiated")]
    DisputeInitiated,
    /// A vote was cast in an open dispute.
    #[serde(rename = "dispute:vote_cast")]
    DisputeVoteCast,
    /// The dispute was resolved.
    #[serde(rename = "dispute:resolved")]
    DisputeResolved,
    /// The dispute was cancelled.
    #[serde(rename = "dispute:cancelled")]
    DisputeCancelled,
    /// The dispute expired without resolution.
    #[serde(rename = "dispute:expired")]
    DisputeExpired,
    /// Speculative execution of a dependent task began.
    #[serde(rename = "speculation_started")]
    SpeculationStarted,
    /// The speculated-on parent proof confirmed.
    #[serde(rename = "speculation_confirmed")]
    SpeculationConfirmed,
    /// The speculation was aborted.
    #[serde(rename = "speculation_aborted")]
    SpeculationAborted,
    /// An agent registered with the network.
    #[serde(rename = "agent:registered")]
    AgentRegistered,
    /// An agent updated its registration.
    #[serde(rename = "agent:updated")]
    AgentUpdated,
    /// An agent left the network.
    #[serde(rename = "agent:deregistered")]
    AgentDeregistered,
}

impl TrajectoryKind {
    /// Canonical string form, used in stored records and hashes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Disputed => "disputed",
            Self::DisputeInitiated => "dispute:initiated",
            Self::DisputeVoteCast => "dispute:vote_cast",
            Self::DisputeResolved => "dispute:resolved",
            Self::DisputeCancelled => "dispute:cancelled",
            Self::DisputeExpired => "dispute:expired",
            Self::SpeculationStarted => "speculation_started",
            Self::SpeculationConfirmed => "speculation_confirmed",
            Self::SpeculationAborted => "speculation_aborted",
            Self::AgentRegistered => "agent:registered",
            Self::AgentUpdated => "agent:updated",
            Self::AgentDeregistered => "agent:deregistered",
        }
    }

    /// Fixed secondary sort key so lifecycle events within one slot order
    /// by lifecycle position rather than arrival order.
    pub fn sort_key(&self) -> u32 {
        match self {
            Self::Discovered => 10,
            Self::Claimed => 20,
            Self::Completed => 30,
            Self::Failed => 40,
            Self::Disputed => 50,
            Self::DisputeInitiated => 60,
            Self::DisputeVoteCast => 70,
            Self::DisputeResolved => 80,
            Self::DisputeCancelled => 90,
            Self::DisputeExpired => 100,
            Self::SpeculationStarted => 110,
            Self::SpeculationConfirmed => 120,
            Self::SpeculationAborted => 130,
            Self::AgentRegistered => 140,
            Self::AgentUpdated => 150,
            Self::AgentDeregistered => 160,
        }
    }

    /// Which lifecycle state machine this kind belongs to.
    pub fn scope(&self) -> LifecycleScope {
        match self {
            Self::Discovered | Self::Claimed | Self::Completed | Self::Failed | Self::Disputed => {
                LifecycleScope::Task
            }
            Self::DisputeInitiated
            | Self::DisputeVoteCast
            | Self::DisputeResolved
            | Self::DisputeCancelled
            | Self::DisputeExpired => LifecycleScope::Dispute,
            Self::SpeculationStarted | Self::SpeculationConfirmed | Self::SpeculationAborted => {
                LifecycleScope::Speculation
            }
            Self::AgentRegistered | Self::AgentUpdated | Self::AgentDeregistered => {
                LifecycleScope::Agent
            }
        }
    }

    /// Map a source event name (program-emitted or already-canonical) onto
    /// its canonical kind. Unknown names return `None`.
    pub fn from_event_name(name: &str) -> Option<Self> {
        let kind = match name {
            "taskCreated" | "taskDiscovered" | "discovered" => Self::Discovered,
            "taskClaimed" | "claimed" => Self::Claimed,
            "taskCompleted" | "completed" => Self::Completed,
            "taskFailed" | "failed" => Self::Failed,
            "taskDisputed" | "disputed" => Self::Disputed,
            "disputeInitiated" | "dispute:initiated" => Self::DisputeInitiated,
            "disputeVoteCast" | "dispute:vote_cast" => Self::DisputeVoteCast,
            "disputeResolved" | "dispute:resolved" => Self::DisputeResolved,
            "disputeCancelled" | "dispute:cancelled" => Self::DisputeCancelled,
            "disputeExpired" | "dispute:expired" => Self::DisputeExpired,
            "speculationStarted" | "speculation_started" => Self::SpeculationStarted,
            "speculationConfirmed" | "speculation_confirmed" => Self::SpeculationConfirmed,
            "speculationAborted" | "speculation_aborted" => Self::SpeculationAborted,
            "agentRegistered" | "agent:registered" => Self::AgentRegistered,
            "agentUpdated" | "agent:updated" => Self::AgentUpdated,
            "agentDeregistered" | "agent:deregistered" => Self::AgentDeregistered,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for TrajectoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lifecycle family a canonical kind belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleScope {
    /// Task lifecycle.
    Task,
    /// Dispute lifecycle.
    Dispute,
    /// Speculation lifecycle.
    Speculation,
    /// Agent registry events (no state machine).
    Agent,
}

impl LifecycleScope {
    /// Stable string form used in violation reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Dispute => "dispute",
            Self::Speculation => "speculation",
            Self::Agent => "agent",
        }
    }
}

//─────────────────────────────
//  Transition errors
//─────────────────────────────

/// A lifecycle transition that the relevant state machine does not allow.
///
/// Violations are recorded in telemetry; the offending record is still
/// projected unless strict mode turns the whole batch into an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("invalid {scope} transition: {from:?} -> {to}")]
pub struct InvalidTransition {
    /// State machine the violation occurred in.
    pub scope: String,
    /// State the entity was in, `None` when the entity was absent.
    pub from: Option<String>,
    /// Attempted target state.
    pub to: String,
    /// Stable machine-readable reason.
    pub reason: String,
}

impl InvalidTransition {
    fn new(scope: LifecycleScope, from: Option<&str>, to: &str) -> Self {
        Self {
            scope: scope.as_str().to_string(),
            from: from.map(str::to_string),
            to: to.to_string(),
            reason: "invalid_transition".to_string(),
        }
    }
}

//─────────────────────────────
//  Task state machine
//─────────────────────────────

/// Task lifecycle states.
///
/// ```text
/// discovered → {claimed, failed}
/// claimed    → {completed, failed, disputed}
/// disputed   → {completed, failed}
/// completed, failed : terminal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Visible on-chain, unclaimed.
    Discovered,
    /// Claimed by an agent.
    Claimed,
    /// Under dispute.
    Disputed,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
}

impl TaskState {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Claimed => "claimed",
            Self::Disputed => "disputed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Apply a task-scoped kind to the current state (`None` = task absent).
    pub fn apply(
        current: Option<TaskState>,
        kind: TrajectoryKind,
    ) -> Result<TaskState, InvalidTransition> {
        let target = match kind {
            TrajectoryKind::Discovered => TaskState::Discovered,
            TrajectoryKind::Claimed => TaskState::Claimed,
            TrajectoryKind::Completed => TaskState::Completed,
            TrajectoryKind::Failed => TaskState::Failed,
            TrajectoryKind::Disputed => TaskState::Disputed,
            other => {
                return Err(InvalidTransition::new(
                    LifecycleScope::Task,
                    current.map(|s| s.as_str()),
                    other.as_str(),
                ))
            }
        };
        let allowed = match (current, target) {
            (None, TaskState::Discovered) => true,
            (Some(TaskState::Discovered), TaskState::Claimed | TaskState::Failed) => true,
            (
                Some(TaskState::Claimed),
                TaskState::Completed | TaskState::Failed | TaskState::Disputed,
            ) => true,
            (Some(TaskState::Disputed), TaskState::Completed | TaskState::Failed) => true,
            _ => false,
        };
        if allowed {
            Ok(target)
        } else {
            Err(InvalidTransition::new(
                LifecycleScope::Task,
                current.map(|s| s.as_str()),
                target.as_str(),
            ))
        }
    }
}

//─────────────────────────────
//  Dispute state machine
//─────────────────────────────

/// Dispute lifecycle states.
///
/// ```text
/// dispute:initiated → {dispute:vote_cast, dispute:resolved, dispute:cancelled, dispute:expired}
/// dispute:vote_cast → {dispute:resolved, dispute:cancelled, dispute:expired}
/// resolved, cancelled, expired : terminal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeState {
    /// Dispute opened.
    Initiated,
    /// At least one vote cast.
    VoteCast,
    /// Terminal: resolved.
    Resolved,
    /// Terminal: cancelled.
    Cancelled,
    /// Terminal: expired.
    Expired,
}

impl DisputeState {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::VoteCast => "vote_cast",
            Self::Resolved => "resolved",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Whether the state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Cancelled | Self::Expired)
    }

    /// Apply a dispute-scoped kind to the current state (`None` = absent).
    pub fn apply(
        current: Option<DisputeState>,
        kind: TrajectoryKind,
    ) -> Result<DisputeState, InvalidTransition> {
        let target = match kind {
            TrajectoryKind::DisputeInitiated => DisputeState::Initiated,
            TrajectoryKind::DisputeVoteCast => DisputeState::VoteCast,
            TrajectoryKind::DisputeResolved => DisputeState::Resolved,
            TrajectoryKind::DisputeCancelled => DisputeState::Cancelled,
            TrajectoryKind::DisputeExpired => DisputeState::Expired,
            other => {
                return Err(InvalidTransition::new(
                    LifecycleScope::Dispute,
                    current.map(|s| s.as_str()),
                    other.as_str(),
                ))
            }
        };
        let allowed = match (current, target) {
            (None, DisputeState::Initiated) => true,
            (
                Some(DisputeState::Initiated),
                DisputeState::VoteCast
                | DisputeState::Resolved
                | DisputeState::Cancelled
                | DisputeState::Expired,
            ) => true,
            (
                Some(DisputeState::VoteCast),
                DisputeState::Resolved | DisputeState::Cancelled | DisputeState::Expired,
            ) => true,
            _ => false,
        };
        if allowed {
            Ok(target)
        } else {
            Err(InvalidTransition::new(
                LifecycleScope::Dispute,
                current.map(|s| s.as_str()),
                target.as_str(),
            ))
        }
    }
}

//─────────────────────────────
//  Speculation state machine
//─────────────────────────────

/// Speculation lifecycle states.
///
/// ```text
/// speculation_started → {speculation_confirmed, speculation_aborted}
/// confirmed, aborted : terminal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeculationState {
    /// Speculative execution in flight.
    Started,
    /// Terminal: parent proof confirmed.
    Confirmed,
    /// Terminal: aborted.
    Aborted,
}

impl SpeculationState {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Confirmed => "confirmed",
            Self::Aborted => "aborted",
        }
    }

    /// Whether the state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Aborted)
    }

    /// Apply a speculation-scoped kind to the current state (`None` = absent).
    pub fn apply(
        current: Option<SpeculationState>,
        kind: TrajectoryKind,
    ) -> Result<SpeculationState, InvalidTransition> {
        let target = match kind {
            TrajectoryKind::SpeculationStarted => SpeculationState::Started,
            TrajectoryKind::SpeculationConfirmed => SpeculationState::Confirmed,
            TrajectoryKind::SpeculationAborted => SpeculationState::Aborted,
            other => {
                return Err(InvalidTransition::new(
                    LifecycleScope::Speculation,
                    current.map(|s| s.as_str()),
                    other.as_str(),
                ))
            }
        };
        let allowed = match (current, target) {
            (None, SpeculationState::Started) => true,
            (
                Some(SpeculationState::Started),
                SpeculationState::Confirmed | SpeculationState::Aborted,
            ) => true,
            _ => false,
        };
        if allowed {
            Ok(target)
        } else {
            Err(InvalidTransition::new(
                LifecycleScope::Speculation,
                current.map(|s| s.as_str()),
                target.as_str(),
            ))
        }
    }
}
