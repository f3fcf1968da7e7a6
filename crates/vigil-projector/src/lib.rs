#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-projector** – Deterministic event projector for Vigil.
//!
//! Consumes batches of raw on-chain events and produces an idempotent
//! timeline: inputs are validated, canonicalized, totally ordered,
//! deduplicated, and replayed through the three lifecycle state machines.
//! The output is a [`ProjectionResult`] whose records carry content hashes
//! stable across runs.
//!
//! Projection never aborts on bad inputs in lenient mode: malformed inputs,
//! unknown event names, and lifecycle violations all land in telemetry and
//! ingestion continues. Strict mode turns any of them into a batch error.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use vigil_canonical::{canonicalize, stable_stringify, CanonicalValue, EncoderError};
use vigil_store_core::TimelineRecord;
use vigil_types::{
    DisputeState, InvalidTransition, LifecycleScope, Pda, RawChainEvent, SpeculationState,
    TaskState, TraceContext, TrajectoryKind, MAX_PDA_LEN,
};

pub mod telemetry;
pub mod trace;

pub use telemetry::{
    DisputeReplayState, DisputeReplayStates, MalformedInput, ProjectionTelemetry,
    TransitionViolation, UnknownEvent,
};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Projection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectorConfig {
    /// Fail the whole batch on any violation, unknown event, or malformed
    /// input.
    pub strict: bool,
    /// Trace session id used when synthesizing contexts.
    pub trace_id: String,
    /// Deterministic sampling rate in `[0, 1]`.
    pub sample_rate: f64,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            strict: false,
            trace_id: "vigil".to_string(),
            sample_rate: 1.0,
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Fatal projection failures. Everything else is telemetry.
#[derive(Debug, thiserror::Error)]
pub enum ProjectorError {
    /// Canonical encoding failed; the input batch is malformed.
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    /// Strict mode rejected the batch.
    #[error(
        "strict projection failed: {transition_violations} transition violation(s), \
         {unknown_events} unknown event(s), {malformed_inputs} malformed input(s)"
    )]
    Strict {
        /// Lifecycle violations observed.
        transition_violations: u64,
        /// Unknown event names observed.
        unknown_events: u64,
        /// Structurally invalid inputs observed.
        malformed_inputs: u64,
    },
}

//─────────────────────────────
//  Projection result
//─────────────────────────────

/// Output of one projected batch.
#[derive(Debug, Clone)]
pub struct ProjectionResult {
    /// Projected records with dense 1-based `seq`, in canonical order.
    pub events: Vec<TimelineRecord>,
    /// Counters and structured detail for everything skipped or flagged.
    pub telemetry: ProjectionTelemetry,
    /// Accumulated per-dispute vote/outcome replay state.
    pub dispute_replays: DisputeReplayStates,
    /// Batch-level trace context.
    pub trace: TraceContext,
}

//─────────────────────────────
//  Entity context
//─────────────────────────────

/// Entity references extracted from a canonical payload.
#[derive(Debug, Clone, Default)]
struct EntityContext {
    task_pda: Option<Pda>,
    dispute_pda: Option<Pda>,
    speculation_pda: Option<Pda>,
}

impl EntityContext {
    const TASK_KEYS: &'static [&'static str] = &["taskPda", "task_pda", "taskId", "task"];
    const DISPUTE_KEYS: &'static [&'static str] =
        &["disputePda", "dispute_pda", "disputeId", "dispute"];
    const SPECULATION_KEYS: &'static [&'static str] =
        &["speculationPda", "speculation_pda", "speculationId", "commitmentPda"];

    fn extract(payload: &CanonicalValue) -> Self {
        let CanonicalValue::Object(map) = payload else {
            return Self::default();
        };
        let lookup = |keys: &[&str]| {
            keys.iter().find_map(|k| match map.get(*k) {
                Some(CanonicalValue::Str(s)) if !s.is_empty() => Some(Pda::from(s.as_str())),
                _ => None,
            })
        };
        Self {
            task_pda: lookup(Self::TASK_KEYS),
            dispute_pda: lookup(Self::DISPUTE_KEYS),
            speculation_pda: lookup(Self::SPECULATION_KEYS),
        }
    }

    /// Bound every extracted address before it enters the pipeline.
    fn validate(&self) -> Result<(), String> {
        let checks = [
            ("task address", &self.task_pda),
            ("dispute address", &self.dispute_pda),
            ("speculation address", &self.speculation_pda),
        ];
        for (label, pda) in checks {
            if let Some(pda) = pda {
                if pda.0.len() > MAX_PDA_LEN {
                    return Err(format!(
                        "{label} too long: {} > {}",
                        pda.0.len(),
                        MAX_PDA_LEN
                    ));
                }
            }
        }
        Ok(())
    }
}

//─────────────────────────────
//  Projector
//─────────────────────────────

/// Deterministic batch projector.
///
/// Stateless between batches: two runs over the same inputs produce
/// identical results regardless of arrival order within a slot.
#[derive(Debug, Clone, Default)]
pub struct Projector {
    config: ProjectorConfig,
}

/// Pre-sorted view over one input.
struct SortEntry<'a> {
    event: &'a RawChainEvent,
    kind: TrajectoryKind,
    payload: CanonicalValue,
    ctx: EntityContext,
    fingerprint: String,
    /// Source sequence when the input carried one explicitly. Defaulted
    /// sequences are assigned after the canonical sort, by position within
    /// the `(slot, signature)` transaction group, so arrival order can
    /// never leak into record identity.
    explicit_sequence: Option<u64>,
}

impl Projector {
    /// Create a projector with the given configuration.
    pub fn new(config: ProjectorConfig) -> Self {
        Self { config }
    }

    /// Project a batch of raw events into timeline records.
    pub fn project(&self, inputs: &[RawChainEvent]) -> Result<ProjectionResult, ProjectorError> {
        let mut telemetry = ProjectionTelemetry {
            total_inputs: inputs.len() as u64,
            ..Default::default()
        };

        // Phase 1: validate, canonicalize, fingerprint.
        let mut entries: Vec<SortEntry<'_>> = Vec::with_capacity(inputs.len());
        for (index, event) in inputs.iter().enumerate() {
            if let Err(reason) = event.validate() {
                warn!(index, %reason, "malformed input rejected");
                telemetry.malformed_inputs.push(MalformedInput {
                    index: index as u64,
                    reason,
                    slot: event.slot,
                    signature: event.signature.clone(),
                });
                continue;
            }
            let Some(kind) = TrajectoryKind::from_event_name(&event.event_name) else {
                debug!(event_name = %event.event_name, slot = event.slot, "unknown event name");
                telemetry.unknown_events.push(UnknownEvent {
                    event_name: event.event_name.clone(),
                    slot: event.slot,
                    signature: event.signature.clone(),
                });
                continue;
            };
            let payload = canonicalize(&event.payload)?;
            let ctx = EntityContext::extract(&payload);
            if let Err(reason) = ctx.validate() {
                warn!(index, %reason, "malformed input rejected");
                telemetry.malformed_inputs.push(MalformedInput {
                    index: index as u64,
                    reason,
                    slot: event.slot,
                    signature: event.signature.clone(),
                });
                continue;
            }
            let fingerprint = dedup_fingerprint(event, &payload);
            entries.push(SortEntry {
                event,
                kind,
                payload,
                ctx,
                fingerprint,
                explicit_sequence: event.source_event_sequence,
            });
        }

        // Phase 2: total deterministic order. Timestamp is the final
        // tie-break so inputs sharing a fingerprint (true duplicates) still
        // order identically across runs.
        entries.sort_by(|a, b| {
            (
                a.event.slot,
                a.event.signature.as_str(),
                a.kind.sort_key(),
                a.event.event_name.as_str(),
                a.fingerprint.as_str(),
                a.explicit_sequence,
                a.event.timestamp_ms,
            )
                .cmp(&(
                    b.event.slot,
                    b.event.signature.as_str(),
                    b.kind.sort_key(),
                    b.event.event_name.as_str(),
                    b.fingerprint.as_str(),
                    b.explicit_sequence,
                    b.event.timestamp_ms,
                ))
        });

        // Phase 3: dedup, lifecycle replay, emission.
        let mut seen: HashSet<String> = HashSet::new();
        let mut tasks: HashMap<Pda, TaskState> = HashMap::new();
        let mut disputes: HashMap<Pda, DisputeState> = HashMap::new();
        let mut speculations: HashMap<Pda, SpeculationState> = HashMap::new();
        let mut dispute_replays = DisputeReplayStates::new();
        let mut events: Vec<TimelineRecord> = Vec::new();
        let mut group_positions: HashMap<(u64, String), u64> = HashMap::new();

        for mut entry in entries {
            if !seen.insert(entry.fingerprint.clone()) {
                telemetry.duplicates_dropped += 1;
                continue;
            }
            // Defaulted sequences number the surviving events of each
            // transaction in canonical order.
            let sequence = match entry.explicit_sequence {
                Some(seq) => seq,
                None => {
                    let counter = group_positions
                        .entry((entry.event.slot, entry.event.signature.clone()))
                        .or_insert(0);
                    let assigned = *counter;
                    *counter += 1;
                    assigned
                }
            };
            entry.explicit_sequence = Some(sequence);
            let ctx = entry.ctx.clone();

            match entry.kind.scope() {
                LifecycleScope::Task => {
                    if let Some(task) = ctx.task_pda.clone() {
                        let current = tasks.get(&task).copied();
                        match TaskState::apply(current, entry.kind) {
                            Ok(next) => {
                                tasks.insert(task, next);
                            }
                            Err(violation) => {
                                push_violation(&mut telemetry, &violation, &entry, Some(&task));
                                // Adopt the observed state so later events
                                // validate against on-chain reality.
                                if let Some(forced) = task_target(entry.kind) {
                                    tasks.insert(task, forced);
                                }
                            }
                        }
                    }
                }
                LifecycleScope::Dispute => {
                    if let Some(dispute) = ctx.dispute_pda.clone() {
                        let current = disputes.get(&dispute).copied();
                        match DisputeState::apply(current, entry.kind) {
                            Ok(next) => {
                                disputes.insert(dispute.clone(), next);
                            }
                            Err(violation) => {
                                push_violation(&mut telemetry, &violation, &entry, Some(&dispute));
                                if let Some(forced) = dispute_target(entry.kind) {
                                    disputes.insert(dispute.clone(), forced);
                                }
                            }
                        }
                        self.replay_dispute(&mut dispute_replays, &dispute, &ctx, &entry);
                    }
                    // Secondary projection: a dispute against a claimed task
                    // also moves the task to `disputed`.
                    if entry.kind == TrajectoryKind::DisputeInitiated {
                        if let Some(task) = ctx.task_pda.clone() {
                            if tasks.get(&task) == Some(&TaskState::Claimed) {
                                tasks.insert(task, TaskState::Disputed);
                            }
                        }
                    }
                }
                LifecycleScope::Speculation => {
                    if let Some(spec) = ctx.speculation_pda.clone() {
                        let current = speculations.get(&spec).copied();
                        match SpeculationState::apply(current, entry.kind) {
                            Ok(next) => {
                                speculations.insert(spec, next);
                            }
                            Err(violation) => {
                                push_violation(&mut telemetry, &violation, &entry, Some(&spec));
                                if let Some(forced) = speculation_target(entry.kind) {
                                    speculations.insert(spec, forced);
                                }
                            }
                        }
                    }
                }
                LifecycleScope::Agent => {
                    // Registry events carry no state machine.
                }
            }

            let trace = entry.event.trace_context.clone().unwrap_or_else(|| {
                trace::synthesize_context(
                    &self.config.trace_id,
                    self.config.sample_rate,
                    entry.event.slot,
                    &entry.event.signature,
                    &entry.event.event_name,
                    entry.explicit_sequence.unwrap_or(0),
                )
            });
            let payload = augment_payload(
                entry.payload.clone(),
                entry.event,
                entry.explicit_sequence.unwrap_or(0),
                &trace,
            );
            let mut record = TimelineRecord {
                seq: 0,
                kind: entry.kind,
                task_pda: ctx.task_pda,
                dispute_pda: ctx.dispute_pda,
                speculation_pda: ctx.speculation_pda,
                timestamp_ms: entry.event.timestamp_ms.unwrap_or(0),
                payload,
                slot: entry.event.slot,
                signature: entry.event.signature.clone(),
                source_event_name: entry.event.event_name.clone(),
                source_event_sequence: entry.explicit_sequence.unwrap_or(0),
                projection_hash: String::new(),
                trace,
            };
            record.projection_hash = record.compute_projection_hash();
            events.push(record);
        }

        // Phase 4: dense 1-based sequence in emission order.
        for (i, record) in events.iter_mut().enumerate() {
            record.seq = (i + 1) as u64;
        }
        telemetry.projected_events = events.len() as u64;

        if self.config.strict
            && (!telemetry.transition_violations.is_empty()
                || !telemetry.unknown_events.is_empty()
                || !telemetry.malformed_inputs.is_empty())
        {
            return Err(ProjectorError::Strict {
                transition_violations: telemetry.transition_violations.len() as u64,
                unknown_events: telemetry.unknown_events.len() as u64,
                malformed_inputs: telemetry.malformed_inputs.len() as u64,
            });
        }

        let batch_span = trace::synthesize_span_id(
            &self.config.trace_id,
            0,
            "batch",
            "projection",
            telemetry.total_inputs,
        );
        let trace = TraceContext {
            trace_id: self.config.trace_id.clone(),
            span_id: batch_span.clone(),
            parent_span_id: None,
            sampled: trace::deterministic_sample(self.config.sample_rate, &batch_span),
        };

        debug!(
            projected = telemetry.projected_events,
            duplicates = telemetry.duplicates_dropped,
            violations = telemetry.transition_conflicts,
            "batch projected"
        );

        Ok(ProjectionResult {
            events,
            telemetry,
            dispute_replays,
            trace,
        })
    }

    fn replay_dispute(
        &self,
        replays: &mut DisputeReplayStates,
        dispute: &Pda,
        ctx: &EntityContext,
        entry: &SortEntry<'_>,
    ) {
        let state = replays.entry(dispute.clone()).or_default();
        if state.task_pda.is_none() {
            state.task_pda = ctx.task_pda.clone();
        }
        match entry.kind {
            TrajectoryKind::DisputeVoteCast => {
                if vote_supports(&entry.payload) {
                    state.votes_for += 1;
                } else {
                    state.votes_against += 1;
                }
                state.voter_signatures.push(entry.event.signature.clone());
            }
            TrajectoryKind::DisputeResolved => {
                state.outcome = Some(resolution_outcome(&entry.payload));
            }
            TrajectoryKind::DisputeCancelled => {
                state.outcome = Some("cancelled".to_string());
            }
            TrajectoryKind::DisputeExpired => {
                state.outcome = Some("expired".to_string());
            }
            _ => {}
        }
    }
}

//─────────────────────────────
//  Helpers
//─────────────────────────────

/// Dedup fingerprint: `stable_stringify({slot, signature, sourceEventName,
/// eventPayload})`. Excludes the source sequence so re-ordered duplicates
/// collapse.
fn dedup_fingerprint(event: &RawChainEvent, payload: &CanonicalValue) -> String {
    let mut fields = BTreeMap::new();
    fields.insert("slot".to_string(), event.slot.into());
    fields.insert(
        "signature".to_string(),
        CanonicalValue::Str(event.signature.clone()),
    );
    fields.insert(
        "sourceEventName".to_string(),
        CanonicalValue::Str(event.event_name.clone()),
    );
    fields.insert("eventPayload".to_string(), payload.clone());
    stable_stringify(&CanonicalValue::Object(fields))
}

/// Augment the canonical payload with the `onchain` provenance envelope.
/// Non-object payloads are wrapped so the envelope always has a place.
fn augment_payload(
    payload: CanonicalValue,
    event: &RawChainEvent,
    sequence: u64,
    trace: &TraceContext,
) -> CanonicalValue {
    let mut envelope = BTreeMap::new();
    envelope.insert("slot".to_string(), event.slot.into());
    envelope.insert(
        "signature".to_string(),
        CanonicalValue::Str(event.signature.clone()),
    );
    envelope.insert(
        "sourceEventName".to_string(),
        CanonicalValue::Str(event.event_name.clone()),
    );
    envelope.insert("sourceEventSequence".to_string(), sequence.into());

    let mut trace_fields = BTreeMap::new();
    trace_fields.insert(
        "traceId".to_string(),
        CanonicalValue::Str(trace.trace_id.clone()),
    );
    trace_fields.insert(
        "spanId".to_string(),
        CanonicalValue::Str(trace.span_id.clone()),
    );
    if let Some(parent) = &trace.parent_span_id {
        trace_fields.insert(
            "parentSpanId".to_string(),
            CanonicalValue::Str(parent.clone()),
        );
    }
    trace_fields.insert("sampled".to_string(), CanonicalValue::Bool(trace.sampled));
    envelope.insert("trace".to_string(), CanonicalValue::Object(trace_fields));

    match payload {
        CanonicalValue::Object(mut map) => {
            map.insert("onchain".to_string(), CanonicalValue::Object(envelope));
            CanonicalValue::Object(map)
        }
        other => {
            let mut map = BTreeMap::new();
            map.insert("value".to_string(), other);
            map.insert("onchain".to_string(), CanonicalValue::Object(envelope));
            CanonicalValue::Object(map)
        }
    }
}

fn push_violation(
    telemetry: &mut ProjectionTelemetry,
    violation: &InvalidTransition,
    entry: &SortEntry<'_>,
    entity: Option<&Pda>,
) {
    warn!(
        scope = %violation.scope,
        from = ?violation.from,
        to = %violation.to,
        slot = entry.event.slot,
        "lifecycle violation"
    );
    telemetry.transition_conflicts += 1;
    telemetry.transition_violations.push(TransitionViolation {
        scope: violation.scope.clone(),
        entity: entity.map(|pda| pda.0.clone()),
        from_state: violation.from.clone(),
        to_state: violation.to.clone(),
        reason: violation.reason.clone(),
        slot: entry.event.slot,
        signature: entry.event.signature.clone(),
        source_event_name: entry.event.event_name.clone(),
        source_event_sequence: entry.explicit_sequence.unwrap_or(0),
    });
}

fn task_target(kind: TrajectoryKind) -> Option<TaskState> {
    match kind {
        TrajectoryKind::Discovered => Some(TaskState::Discovered),
        TrajectoryKind::Claimed => Some(TaskState::Claimed),
        TrajectoryKind::Completed => Some(TaskState::Completed),
        TrajectoryKind::Failed => Some(TaskState::Failed),
        TrajectoryKind::Disputed => Some(TaskState::Disputed),
        _ => None,
    }
}

fn dispute_target(kind: TrajectoryKind) -> Option<DisputeState> {
    match kind {
        TrajectoryKind::DisputeInitiated => Some(DisputeState::Initiated),
        TrajectoryKind::DisputeVoteCast => Some(DisputeState::VoteCast),
        TrajectoryKind::DisputeResolved => Some(DisputeState::Resolved),
        TrajectoryKind::DisputeCancelled => Some(DisputeState::Cancelled),
        TrajectoryKind::DisputeExpired => Some(DisputeState::Expired),
        _ => None,
    }
}

fn speculation_target(kind: TrajectoryKind) -> Option<SpeculationState> {
    match kind {
        TrajectoryKind::SpeculationStarted => Some(SpeculationState::Started),
        TrajectoryKind::SpeculationConfirmed => Some(SpeculationState::Confirmed),
        TrajectoryKind::SpeculationAborted => Some(SpeculationState::Aborted),
        _ => None,
    }
}

fn vote_supports(payload: &CanonicalValue) -> bool {
    if let CanonicalValue::Object(map) = payload {
        for key in ["support", "voteFor", "approve"] {
            if let Some(CanonicalValue::Bool(b)) = map.get(key) {
                return *b;
            }
        }
    }
    true
}

fn resolution_outcome(payload: &CanonicalValue) -> String {
    if let CanonicalValue::Object(map) = payload {
        if let Some(CanonicalValue::Str(s)) = map.get("outcome") {
            return s.clone();
        }
    }
    "resolved".to_string()
}
