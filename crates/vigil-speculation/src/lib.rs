#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-speculation** – Speculative task scheduler for Vigil.
//!
//! The companion runtime subsystem that overlaps proof generation with
//! dependent-task execution. Three pieces cooperate:
//!
//! - a dependency [`graph`] tracking task prerequisites with topological
//!   depth,
//! - a commitment [`ledger`] accounting for staked speculative work and
//!   cascading rollbacks on parent failure,
//! - a [`scheduler`] binding both to proof-pipeline callbacks with rate
//!   limits and auto-disable.
//!
//! The scheduler is single-owner and cooperative: proof callbacks queue the
//! rollback cascade for a later [`SpeculativeScheduler::tick`], so an
//! observer always sees a parent's `failed` before any `rolled_back`.

pub mod graph;
pub mod ledger;
pub mod metrics;
pub mod scheduler;

pub use graph::{DependencyGraph, DependencyNode, TaskExecutionState};
pub use ledger::{Commitment, CommitmentLedger, CommitmentStatus, LedgerStats};
pub use metrics::SpeculationMetrics;
pub use scheduler::{
    ProofPipeline, RefusalReason, SchedulerConfig, SchedulerStatus, SpeculateOptions,
    SpeculationDecision, SpeculationObserver, SpeculativeScheduler,
};

/// Errors produced by the speculation subsystem.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SpeculationError {
    /// Adding the requested edge would create a dependency cycle.
    #[error("dependency cycle: {child} -> {parent}")]
    DependencyCycle {
        /// Child side of the rejected edge.
        child: String,
        /// Parent side of the rejected edge.
        parent: String,
    },
    /// The task is not registered in the dependency graph.
    #[error("unknown task {0}")]
    UnknownTask(String),
    /// The task already holds a commitment.
    #[error("commitment already exists for task {0}")]
    DuplicateCommitment(String),
    /// No commitment exists for the task.
    #[error("no commitment for task {0}")]
    UnknownCommitment(String),
}
