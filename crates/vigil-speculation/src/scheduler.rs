//! The speculative task scheduler.
//!
//! Binds the dependency graph and commitment ledger to proof-pipeline
//! callbacks. Rollback cascades run on the next cooperative tick, so
//! observers always see a parent's `failed` before any dependent's
//! `rolled_back`.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vigil_types::{DependencyType, TaskPda};

use crate::graph::{DependencyGraph, TaskExecutionState};
use crate::ledger::{Commitment, CommitmentLedger, CommitmentStatus};
use crate::metrics::SpeculationMetrics;
use crate::SpeculationError;

/// Outcomes kept for the rollback-rate window.
const ROLLBACK_WINDOW: usize = 20;
/// Minimum outcomes before the rate check can trip.
const ROLLBACK_WINDOW_MIN: usize = 5;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum topological depth a speculated task may sit at.
    pub max_speculation_depth: u32,
    /// Ceiling on total stake at risk, lamports.
    pub max_speculative_stake: u128,
    /// Master switch.
    pub enable_speculation: bool,
    /// Whether private tasks may be speculated on.
    pub allow_private_speculation: bool,
    /// Minimum agent reputation required.
    pub min_reputation_for_speculation: u32,
    /// How long to wait for a proof before failing it, milliseconds.
    pub proof_timeout_ms: u64,
    /// Auto-disable once the recent miss rate exceeds this percentage.
    pub max_rollback_rate_percent: u8,
    /// Dependency kinds eligible for speculation.
    pub speculatable_dependency_types: BTreeSet<DependencyType>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_speculation_depth: 3,
            max_speculative_stake: 1_000_000_000,
            enable_speculation: true,
            allow_private_speculation: false,
            min_reputation_for_speculation: 0,
            proof_timeout_ms: 60_000,
            max_rollback_rate_percent: 50,
            speculatable_dependency_types: [DependencyType::Data, DependencyType::Order]
                .into_iter()
                .collect(),
        }
    }
}

//─────────────────────────────
//  Decisions & callbacks
//─────────────────────────────

/// Why speculation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    /// Speculation is switched off (configured or auto-disabled).
    Disabled,
    /// The task sits at or beyond the depth limit.
    DepthLimit,
    /// The stake ceiling would be exceeded.
    StakeLimit,
    /// Private tasks are not eligible.
    PrivateSpeculationDisabled,
    /// The agent's reputation is below the floor.
    LowReputation,
    /// A parent dependency kind is not eligible.
    DependencyTypeNotSpeculatable,
    /// The recent rollback rate tripped the breaker.
    RollbackRateExceeded,
}

impl RefusalReason {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::DepthLimit => "depth_limit",
            Self::StakeLimit => "stake_limit",
            Self::PrivateSpeculationDisabled => "private_speculation_disabled",
            Self::LowReputation => "low_reputation",
            Self::DependencyTypeNotSpeculatable => "dependency_type_not_speculatable",
            Self::RollbackRateExceeded => "rollback_rate_exceeded",
        }
    }
}

/// Outcome of a `should_speculate` consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeculationDecision {
    /// Whether the scheduler permits speculation.
    pub allowed: bool,
    /// Populated when refused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RefusalReason>,
}

impl SpeculationDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn refuse(reason: RefusalReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Task-level context for a `should_speculate` consultation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeculateOptions {
    /// Stake the new speculation would add, lamports.
    pub task_stake: u128,
    /// Whether the task is private.
    pub is_private: bool,
    /// Reputation of the agent asking to speculate.
    pub agent_reputation: u32,
}

/// Host-supplied observer for scheduler events. All hooks default to no-ops.
pub trait SpeculationObserver: Send + Sync {
    /// A consultation was refused on the depth limit.
    fn on_depth_limit_reached(&self, _task: &TaskPda, _depth: u32) {}
    /// A consultation was refused on the stake ceiling.
    fn on_stake_limit_reached(&self, _task: &TaskPda, _at_risk: u128, _requested: u128) {}
    /// A speculative execution failed and its cascade was scheduled.
    fn on_speculation_failed(&self, _task: &TaskPda, _reason: &str) {}
}

/// Outbound proof submission; confirmation and failure arrive back through
/// [`SpeculativeScheduler::on_proof_confirmed`] / [`on_proof_failed`].
///
/// [`on_proof_failed`]: SpeculativeScheduler::on_proof_failed
pub trait ProofPipeline: Send + Sync {
    /// Fire-and-forget proof submission.
    fn submit(&self, task: &TaskPda, proof: &[u8]);
}

/// Live scheduler status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// Whether the scheduler is running.
    pub running: bool,
    /// Whether speculation is currently permitted.
    pub speculation_enabled: bool,
    /// Commitments currently pending or executing.
    pub active_speculations: u64,
    /// Stake at risk across those commitments.
    pub total_stake_at_risk: u128,
}

//─────────────────────────────
//  Scheduler
//─────────────────────────────

/// Deferred cooperative actions, processed on [`SpeculativeScheduler::tick`].
#[derive(Debug, Clone, PartialEq)]
enum SchedulerAction {
    CascadeRollback { origin: TaskPda },
}

/// Speculative task scheduler.
///
/// Owns the dependency graph and the commitment ledger outright; hosts
/// mutate both only through the scheduler's methods.
pub struct SpeculativeScheduler {
    config: SchedulerConfig,
    enabled: bool,
    running: bool,
    graph: DependencyGraph,
    ledger: CommitmentLedger,
    metrics: SpeculationMetrics,
    observer: Option<Arc<dyn SpeculationObserver>>,
    pipeline: Option<Arc<dyn ProofPipeline>>,
    pending: VecDeque<SchedulerAction>,
    ready: VecDeque<TaskPda>,
    recent_outcomes: VecDeque<bool>,
    proof_deadlines: HashMap<TaskPda, u64>,
}

impl SpeculativeScheduler {
    /// Create a scheduler with the given configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        let enabled = config.enable_speculation;
        Self {
            config,
            enabled,
            running: true,
            graph: DependencyGraph::new(),
            ledger: CommitmentLedger::new(),
            metrics: SpeculationMetrics::default(),
            observer: None,
            pipeline: None,
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            recent_outcomes: VecDeque::new(),
            proof_deadlines: HashMap::new(),
        }
    }

    /// Attach an observer.
    pub fn with_observer(mut self, observer: Arc<dyn SpeculationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Attach a proof pipeline.
    pub fn with_pipeline(mut self, pipeline: Arc<dyn ProofPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    //───────────────────── graph & ledger surface ─────────────────────

    /// Register a dependency-free task.
    pub fn register_task(&mut self, task: TaskPda) {
        self.graph.add_task(task);
    }

    /// Register `child` depending on `parent`.
    pub fn register_dependency(
        &mut self,
        child: TaskPda,
        parent: TaskPda,
        dependency: DependencyType,
    ) -> Result<(), SpeculationError> {
        self.graph.add_task_with_parent(child, parent, dependency)
    }

    /// Read access to the dependency graph.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Read access to the commitment ledger.
    pub fn ledger(&self) -> &CommitmentLedger {
        &self.ledger
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> &SpeculationMetrics {
        &self.metrics
    }

    /// Start a speculative execution: creates the commitment, marks the
    /// graph node executing, arms the proof timeout, and submits the proof
    /// when a pipeline is attached.
    pub fn begin_speculation(
        &mut self,
        commitment: Commitment,
        proof: Option<&[u8]>,
    ) -> Result<(), SpeculationError> {
        let task = commitment.task_pda.clone();
        let created_at = commitment.created_at_ms;
        let mut commitment = commitment;
        commitment.status = CommitmentStatus::Executing;
        self.ledger.create_commitment(commitment)?;
        if let Some(source) = self.ledger.get_by_task(&task).and_then(|c| c.source_task_pda.clone())
        {
            // The parent's failure must cascade onto this commitment.
            if self.ledger.get_by_task(&source).is_some() {
                self.ledger.add_dependent(&source, task.clone())?;
            }
        }

        self.graph.add_task(task.clone());
        self.graph
            .update_status(&task, TaskExecutionState::Executing)?;
        self.metrics.record_execution();
        self.proof_deadlines
            .insert(task.clone(), created_at.saturating_add(self.config.proof_timeout_ms));

        if let (Some(pipeline), Some(proof)) = (&self.pipeline, proof) {
            pipeline.submit(&task, proof);
        }
        info!(task = %task, "speculative execution started");
        Ok(())
    }

    //───────────────────── admission control ─────────────────────

    /// Decide whether `task` may be executed speculatively right now.
    pub fn should_speculate(
        &mut self,
        task: &TaskPda,
        opts: SpeculateOptions,
    ) -> SpeculationDecision {
        if !self.enabled {
            return SpeculationDecision::refuse(RefusalReason::Disabled);
        }

        let depth = self.graph.depth(task).unwrap_or(0);
        if depth >= self.config.max_speculation_depth {
            if let Some(observer) = &self.observer {
                observer.on_depth_limit_reached(task, depth);
            }
            return SpeculationDecision::refuse(RefusalReason::DepthLimit);
        }

        let at_risk = self.ledger.total_stake_at_risk();
        if at_risk.saturating_add(opts.task_stake) > self.config.max_speculative_stake {
            if let Some(observer) = &self.observer {
                observer.on_stake_limit_reached(task, at_risk, opts.task_stake);
            }
            return SpeculationDecision::refuse(RefusalReason::StakeLimit);
        }

        if opts.is_private && !self.config.allow_private_speculation {
            return SpeculationDecision::refuse(RefusalReason::PrivateSpeculationDisabled);
        }

        if opts.agent_reputation < self.config.min_reputation_for_speculation {
            return SpeculationDecision::refuse(RefusalReason::LowReputation);
        }

        if let Some(node) = self.graph.node(task) {
            let ineligible = node
                .dependency_types
                .values()
                .any(|dep| !self.config.speculatable_dependency_types.contains(dep));
            if ineligible {
                return SpeculationDecision::refuse(RefusalReason::DependencyTypeNotSpeculatable);
            }
        }

        if self.rollback_rate_exceeded() {
            warn!("rollback rate breaker tripped; speculation auto-disabled");
            self.enabled = false;
            return SpeculationDecision::refuse(RefusalReason::RollbackRateExceeded);
        }

        SpeculationDecision::allow()
    }

    /// Re-enable speculation after an auto-disable.
    pub fn enable_speculation(&mut self) {
        self.enabled = true;
        self.recent_outcomes.clear();
    }

    /// Disable speculation manually.
    pub fn disable_speculation(&mut self) {
        self.enabled = false;
    }

    //───────────────────── proof pipeline callbacks ─────────────────────

    /// The parent proof confirmed: the commitment and node settle, and any
    /// dependents that became speculatable are queued.
    pub fn on_proof_confirmed(&mut self, task: &TaskPda) -> Result<(), SpeculationError> {
        self.ledger.mark_confirmed(task)?;
        self.graph.update_status(task, TaskExecutionState::Completed)?;
        self.record_outcome(true);

        let saved = self.elapsed_since_commitment(task);
        self.metrics.record_hit(saved);
        self.proof_deadlines.remove(task);

        let newly_ready: Vec<TaskPda> = self
            .graph
            .speculatable_tasks()
            .iter()
            .filter(|node| node.parents.contains(task))
            .map(|node| node.task_pda.clone())
            .collect();
        for ready in newly_ready {
            debug!(task = %ready, "dependent became speculatable");
            self.ready.push_back(ready);
        }
        Ok(())
    }

    /// The parent proof failed: the commitment fails now; the cascade onto
    /// dependents runs on the next tick so observers see `failed` strictly
    /// before `rolled_back`.
    pub fn on_proof_failed(
        &mut self,
        task: &TaskPda,
        reason: &str,
    ) -> Result<(), SpeculationError> {
        warn!(task = %task, %reason, "speculative proof failed");
        self.ledger.update_status(task, CommitmentStatus::Failed)?;
        self.graph.update_status(task, TaskExecutionState::Failed)?;
        self.record_outcome(false);

        let wasted = self.elapsed_since_commitment(task);
        self.metrics.record_miss(wasted);
        self.proof_deadlines.remove(task);

        self.pending.push_back(SchedulerAction::CascadeRollback {
            origin: task.clone(),
        });
        if let Some(observer) = &self.observer {
            observer.on_speculation_failed(task, reason);
        }
        Ok(())
    }

    //───────────────────── cooperative execution ─────────────────────

    /// Process deferred actions. Returns how many were handled.
    pub fn tick(&mut self) -> usize {
        let mut handled = 0;
        while let Some(action) = self.pending.pop_front() {
            match action {
                SchedulerAction::CascadeRollback { origin } => {
                    let rolled = self.ledger.cascade_rollback(&origin);
                    for task in &rolled {
                        // Ledger and graph agree after the cascade.
                        let _ = self
                            .graph
                            .update_status(task, TaskExecutionState::RolledBack);
                        self.proof_deadlines.remove(task);
                    }
                    if !rolled.is_empty() {
                        info!(origin = %origin, count = rolled.len(), "cascade rolled back");
                    }
                }
            }
            handled += 1;
        }
        handled
    }

    /// Fail every speculation whose proof deadline has passed.
    ///
    /// Returns the tasks that timed out; their cascades are queued for the
    /// next tick like any other failure.
    pub fn check_proof_timeouts(&mut self, now_ms: u64) -> Vec<TaskPda> {
        let expired: Vec<TaskPda> = self
            .proof_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now_ms)
            .map(|(task, _)| task.clone())
            .collect();
        let mut timed_out = Vec::new();
        for task in expired {
            if self.on_proof_failed(&task, "timeout").is_ok() {
                timed_out.push(task);
            }
        }
        timed_out
    }

    /// Drain tasks that became speculatable since the last call.
    pub fn drain_ready(&mut self) -> Vec<TaskPda> {
        self.ready.drain(..).collect()
    }

    /// Live status snapshot.
    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.running,
            speculation_enabled: self.enabled,
            active_speculations: self.ledger.active_count(),
            total_stake_at_risk: self.ledger.total_stake_at_risk(),
        }
    }

    /// Stop the scheduler. Deferred actions already queued still run on
    /// subsequent ticks.
    pub fn stop(&mut self) {
        self.running = false;
    }

    //───────────────────── internals ─────────────────────

    fn record_outcome(&mut self, hit: bool) {
        if self.recent_outcomes.len() == ROLLBACK_WINDOW {
            self.recent_outcomes.pop_front();
        }
        self.recent_outcomes.push_back(hit);
    }

    fn rollback_rate_exceeded(&self) -> bool {
        if self.recent_outcomes.len() < ROLLBACK_WINDOW_MIN {
            return false;
        }
        let misses = self.recent_outcomes.iter().filter(|hit| !**hit).count();
        let rate = (misses as f64 / self.recent_outcomes.len() as f64) * 100.0;
        rate > self.config.max_rollback_rate_percent as f64
    }

    fn elapsed_since_commitment(&self, task: &TaskPda) -> u64 {
        let created = self
            .ledger
            .get_by_task(task)
            .map(|c| c.created_at_ms)
            .unwrap_or(0);
        now_ms().saturating_sub(created)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
