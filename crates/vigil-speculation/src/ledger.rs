//! Per-task stake commitments with cascade state transitions.
//!
//! The ledger tracks what each agent has at risk for speculatively-executed
//! tasks. A parent failure cascades: every descendant in the dependents DAG
//! rolls back unless it already reached a terminal state.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use vigil_types::{AgentPda, TaskPda};

use crate::SpeculationError;

/// Lifecycle of a commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    /// Registered, execution not started.
    Pending,
    /// Speculative execution in flight.
    Executing,
    /// Parent proof confirmed; stake safe.
    Confirmed,
    /// Proof failed or timed out.
    Failed,
    /// Undone by a cascade.
    RolledBack,
}

impl CommitmentStatus {
    /// Stable string form for stats keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Whether stake is currently at risk.
    pub fn at_risk(&self) -> bool {
        matches!(self, Self::Pending | Self::Executing)
    }

    /// Whether the status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed | Self::RolledBack)
    }
}

/// A staked speculative-execution commitment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    /// Task being executed speculatively.
    pub task_pda: TaskPda,
    /// Agent that staked.
    pub agent_pda: AgentPda,
    /// Commitment to the result hash, opaque bytes.
    pub result_hash_commitment: Vec<u8>,
    /// Stake amount in lamports.
    pub stake_lamports: u128,
    /// Current status.
    pub status: CommitmentStatus,
    /// Tasks whose commitments cascade if this one fails.
    pub dependents: BTreeSet<TaskPda>,
    /// Creation time, milliseconds.
    pub created_at_ms: u64,
    /// The parent task this speculation is waiting on, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_task_pda: Option<TaskPda>,
}

/// Aggregate ledger counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Total commitments ever created and still tracked.
    pub total: u64,
    /// Sum of stakes in `Pending`/`Executing`.
    pub total_stake_at_risk: u128,
    /// Commitment counts keyed by status string.
    pub by_status: BTreeMap<String, u64>,
}

/// Commitment ledger keyed by task address.
#[derive(Debug, Clone, Default)]
pub struct CommitmentLedger {
    commitments: HashMap<TaskPda, Commitment>,
}

impl CommitmentLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new commitment. A task can hold only one.
    pub fn create_commitment(&mut self, commitment: Commitment) -> Result<(), SpeculationError> {
        if self.commitments.contains_key(&commitment.task_pda) {
            return Err(SpeculationError::DuplicateCommitment(
                commitment.task_pda.0.clone(),
            ));
        }
        debug!(task = %commitment.task_pda, stake = commitment.stake_lamports, "commitment created");
        self.commitments
            .insert(commitment.task_pda.clone(), commitment);
        Ok(())
    }

    /// Update a commitment's status directly.
    pub fn update_status(
        &mut self,
        task: &TaskPda,
        status: CommitmentStatus,
    ) -> Result<(), SpeculationError> {
        let commitment = self
            .commitments
            .get_mut(task)
            .ok_or_else(|| SpeculationError::UnknownCommitment(task.0.clone()))?;
        commitment.status = status;
        Ok(())
    }

    /// Link `child` as cascading from `parent`.
    pub fn add_dependent(
        &mut self,
        parent: &TaskPda,
        child: TaskPda,
    ) -> Result<(), SpeculationError> {
        let commitment = self
            .commitments
            .get_mut(parent)
            .ok_or_else(|| SpeculationError::UnknownCommitment(parent.0.clone()))?;
        commitment.dependents.insert(child);
        Ok(())
    }

    /// Confirm a commitment; its stake is no longer at risk.
    pub fn mark_confirmed(&mut self, task: &TaskPda) -> Result<(), SpeculationError> {
        self.update_status(task, CommitmentStatus::Confirmed)
    }

    /// Fail a commitment and cascade-roll-back every descendant.
    pub fn mark_failed(&mut self, task: &TaskPda) -> Result<Vec<TaskPda>, SpeculationError> {
        self.update_status(task, CommitmentStatus::Failed)?;
        Ok(self.cascade_rollback(task))
    }

    /// Roll back a commitment and its descendants.
    ///
    /// Transitions are `Pending|Executing -> RolledBack`; terminal states
    /// are preserved. Returns every task actually rolled back.
    pub fn rollback_task(&mut self, task: &TaskPda) -> Vec<TaskPda> {
        let mut rolled = Vec::new();
        if let Some(commitment) = self.commitments.get_mut(task) {
            if commitment.status.at_risk() {
                commitment.status = CommitmentStatus::RolledBack;
                rolled.push(task.clone());
            }
        }
        rolled.extend(self.cascade_rollback(task));
        rolled
    }

    /// Roll back every descendant of `task` (not `task` itself).
    pub fn cascade_rollback(&mut self, task: &TaskPda) -> Vec<TaskPda> {
        let mut rolled = Vec::new();
        let mut seen: BTreeSet<TaskPda> = BTreeSet::new();
        let mut queue: VecDeque<TaskPda> = self
            .commitments
            .get(task)
            .map(|c| c.dependents.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(commitment) = self.commitments.get_mut(&next) {
                queue.extend(commitment.dependents.iter().cloned());
                if commitment.status.at_risk() {
                    commitment.status = CommitmentStatus::RolledBack;
                    rolled.push(next);
                }
            }
        }
        if !rolled.is_empty() {
            debug!(origin = %task, count = rolled.len(), "cascade rollback");
        }
        rolled
    }

    /// Look up a commitment.
    pub fn get_by_task(&self, task: &TaskPda) -> Option<&Commitment> {
        self.commitments.get(task)
    }

    /// Sum of stakes currently at risk.
    pub fn total_stake_at_risk(&self) -> u128 {
        self.commitments
            .values()
            .filter(|c| c.status.at_risk())
            .map(|c| c.stake_lamports)
            .sum()
    }

    /// Commitments currently in `Pending`/`Executing`.
    pub fn active_count(&self) -> u64 {
        self.commitments
            .values()
            .filter(|c| c.status.at_risk())
            .count() as u64
    }

    /// Aggregate counters.
    pub fn stats(&self) -> LedgerStats {
        let mut by_status: BTreeMap<String, u64> = BTreeMap::new();
        for commitment in self.commitments.values() {
            *by_status
                .entry(commitment.status.as_str().to_string())
                .or_default() += 1;
        }
        LedgerStats {
            total: self.commitments.len() as u64,
            total_stake_at_risk: self.total_stake_at_risk(),
            by_status,
        }
    }
}
