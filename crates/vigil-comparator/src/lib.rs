#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-comparator** – Replay comparator for Vigil.
//!
//! Diffs a projected on-chain timeline slice against a locally-replayed
//! trajectory recorded by the agent's executor during the same window, and
//! emits stable anomaly records for incident reconstruction.
//!
//! The diff is two-phase: events are aligned by `(task, sequence)` when the
//! local side carries sequences, falling back to `(task, kind, timestamp)`;
//! aligned pairs then compare projection hashes. Whole-timeline replay
//! hashes summarize each side so a single comparison can be cheaply
//! re-checked later.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use vigil_canonical::CanonicalValue;
use vigil_store_core::TimelineRecord;
use vigil_types::{TaskPda, TrajectoryKind};

pub mod anomaly;

pub use anomaly::{
    dispatch_alert, AlertSink, AnomalyKind, AnomalyRecord, AnomalyRegistry, AnomalySeverity,
    TracingAlertSink,
};

//─────────────────────────────
//  Local trajectory
//─────────────────────────────

/// One event of the locally-replayed trajectory.
///
/// The local executor computes the same projection hash over its own view
/// of the event; the comparator never re-derives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryEvent {
    /// Task the event belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_pda: Option<TaskPda>,
    /// Canonical lifecycle kind.
    pub kind: TrajectoryKind,
    /// Event timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Source sequence, when the local recorder captured one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_event_sequence: Option<u64>,
    /// Locally-computed projection hash, lowercase hex.
    pub projection_hash: String,
}

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// How hard the comparator judges drift and one-sided events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparatorStrictness {
    /// Timestamp drift beyond epsilon and missing events are errors.
    Strict,
    /// The same findings surface as warnings.
    Lenient,
}

/// Comparator settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComparatorConfig {
    /// Strictness dial.
    pub strictness: ComparatorStrictness,
    /// Allowed timestamp drift between aligned events, milliseconds.
    pub timestamp_epsilon_ms: u64,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            strictness: ComparatorStrictness::Lenient,
            timestamp_epsilon_ms: 1_000,
        }
    }
}

//─────────────────────────────
//  Report
//─────────────────────────────

/// Overall comparison verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonStatus {
    /// Every aligned pair agreed and nothing was one-sided.
    Matched,
    /// At least one mismatch or one-sided event.
    Mismatched,
    /// The inputs were unusable (e.g. local events without hashes).
    InvalidInput,
}

/// Result of one comparison run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    /// Verdict.
    pub status: ComparisonStatus,
    /// Hash mismatches plus one-sided events.
    pub mismatch_count: u64,
    /// The first mismatch observed, in projected order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_mismatch: Option<AnomalyRecord>,
    /// Every anomaly the run produced.
    pub anomalies: Vec<AnomalyRecord>,
    /// Hash over the local trajectory's projection hashes, canonical order.
    pub local_replay_hash: String,
    /// Hash over the projected slice's projection hashes, canonical order.
    pub projected_replay_hash: String,
}

//─────────────────────────────
//  Comparator
//─────────────────────────────

/// Two-phase replay comparator.
#[derive(Debug, Clone, Default)]
pub struct Comparator {
    config: ComparatorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AlignKey {
    Sequence(Option<String>, u64),
    Shape(Option<String>, TrajectoryKind, u64),
}

impl Comparator {
    /// Create a comparator with the given configuration.
    pub fn new(config: ComparatorConfig) -> Self {
        Self { config }
    }

    /// Compare a projected timeline slice against a local trajectory.
    ///
    /// `now_ms` stamps any anomalies produced; identity hashing excludes
    /// it, so repeated runs coalesce in the caller's [`AnomalyRegistry`].
    pub fn compare(
        &self,
        projected: &[TimelineRecord],
        local: &[TrajectoryEvent],
        now_ms: u64,
    ) -> ComparisonReport {
        let projected_replay_hash = replay_hash(projected.iter().map(|r| &r.projection_hash));
        let local_replay_hash = replay_hash(sorted_local(local).map(|e| &e.projection_hash));

        if local.iter().any(|e| e.projection_hash.is_empty()) {
            return ComparisonReport {
                status: ComparisonStatus::InvalidInput,
                mismatch_count: 0,
                first_mismatch: None,
                anomalies: Vec::new(),
                local_replay_hash,
                projected_replay_hash,
            };
        }

        let one_sided_severity = match self.config.strictness {
            ComparatorStrictness::Strict => AnomalySeverity::Error,
            ComparatorStrictness::Lenient => AnomalySeverity::Warning,
        };

        // Index the local trajectory by both alignment keys.
        let mut unmatched: HashMap<usize, &TrajectoryEvent> = local.iter().enumerate().collect();
        let mut by_key: HashMap<AlignKey, Vec<usize>> = HashMap::new();
        for (i, event) in local.iter().enumerate() {
            by_key.entry(local_key(event)).or_default().push(i);
        }

        let mut anomalies: Vec<AnomalyRecord> = Vec::new();
        let mut mismatch_count: u64 = 0;

        for record in projected {
            // Sequence alignment first, then the shape fallback for local
            // recorders that captured no sequences.
            let seq_key = AlignKey::Sequence(
                record.task_pda.as_ref().map(|t| t.0.clone()),
                record.source_event_sequence,
            );
            let shape_key = AlignKey::Shape(
                record.task_pda.as_ref().map(|t| t.0.clone()),
                record.kind,
                record.timestamp_ms,
            );
            let mut take = |key: &AlignKey| -> Option<usize> {
                let candidates = by_key.get_mut(key)?;
                while !candidates.is_empty() {
                    let i = candidates.remove(0);
                    if unmatched.contains_key(&i) {
                        return Some(i);
                    }
                }
                None
            };
            let aligned = take(&seq_key).or_else(|| take(&shape_key));

            let Some(i) = aligned else {
                mismatch_count += 1;
                anomalies.push(self.one_sided(record, "replay.missing_local", one_sided_severity, now_ms));
                continue;
            };
            let Some(event) = unmatched.remove(&i) else {
                continue;
            };

            if event.projection_hash != record.projection_hash {
                mismatch_count += 1;
                anomalies.push(self.hash_mismatch(record, event, now_ms));
            }

            let drift = record.timestamp_ms.abs_diff(event.timestamp_ms);
            if drift > self.config.timestamp_epsilon_ms {
                if self.config.strictness == ComparatorStrictness::Strict {
                    mismatch_count += 1;
                }
                anomalies.push(self.timestamp_drift(record, drift, one_sided_severity, now_ms));
            }
        }

        // Anything still unmatched on the local side is missing on-chain.
        let mut leftovers: Vec<(&usize, &&TrajectoryEvent)> = unmatched.iter().collect();
        leftovers.sort_by_key(|(i, _)| **i);
        for (_, event) in leftovers {
            mismatch_count += 1;
            anomalies.push(self.missing_projected(event, one_sided_severity, now_ms));
        }

        let status = if mismatch_count == 0 {
            ComparisonStatus::Matched
        } else {
            ComparisonStatus::Mismatched
        };
        debug!(?status, mismatch_count, "comparison finished");

        ComparisonReport {
            status,
            mismatch_count,
            first_mismatch: anomalies.first().cloned(),
            anomalies,
            local_replay_hash,
            projected_replay_hash,
        }
    }

    fn hash_mismatch(
        &self,
        record: &TimelineRecord,
        event: &TrajectoryEvent,
        now_ms: u64,
    ) -> AnomalyRecord {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "localHash".to_string(),
            CanonicalValue::Str(event.projection_hash.clone()),
        );
        metadata.insert(
            "projectedHash".to_string(),
            CanonicalValue::Str(record.projection_hash.clone()),
        );
        AnomalyRecord {
            anomaly_id: String::new(),
            code: "replay.hash_mismatch".to_string(),
            kind: AnomalyKind::ReplayHashMismatch,
            severity: AnomalySeverity::Error,
            message: format!(
                "projection hash mismatch for {} at slot {}",
                record.kind, record.slot
            ),
            task_pda: record.task_pda.clone(),
            dispute_pda: record.dispute_pda.clone(),
            source_event_name: Some(record.source_event_name.clone()),
            signature: Some(record.signature.clone()),
            slot: Some(record.slot),
            source_event_sequence: Some(record.source_event_sequence),
            trace_id: Some(record.trace.trace_id.clone()),
            repeat_count: 1,
            emitted_at_ms: now_ms,
            metadata: CanonicalValue::Object(metadata),
        }
        .finalized()
    }

    fn one_sided(
        &self,
        record: &TimelineRecord,
        code: &str,
        severity: AnomalySeverity,
        now_ms: u64,
    ) -> AnomalyRecord {
        AnomalyRecord {
            anomaly_id: String::new(),
            code: code.to_string(),
            kind: AnomalyKind::ReplayAnomalyRepeat,
            severity,
            message: format!(
                "projected {} at slot {} has no local counterpart",
                record.kind, record.slot
            ),
            task_pda: record.task_pda.clone(),
            dispute_pda: record.dispute_pda.clone(),
            source_event_name: Some(record.source_event_name.clone()),
            signature: Some(record.signature.clone()),
            slot: Some(record.slot),
            source_event_sequence: Some(record.source_event_sequence),
            trace_id: Some(record.trace.trace_id.clone()),
            repeat_count: 1,
            emitted_at_ms: now_ms,
            metadata: CanonicalValue::Null,
        }
        .finalized()
    }

    fn missing_projected(
        &self,
        event: &TrajectoryEvent,
        severity: AnomalySeverity,
        now_ms: u64,
    ) -> AnomalyRecord {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "localHash".to_string(),
            CanonicalValue::Str(event.projection_hash.clone()),
        );
        AnomalyRecord {
            anomaly_id: String::new(),
            code: "replay.missing_projected".to_string(),
            kind: AnomalyKind::ReplayAnomalyRepeat,
            severity,
            message: format!(
                "local {} at {}ms was never projected on-chain",
                event.kind, event.timestamp_ms
            ),
            task_pda: event.task_pda.clone(),
            dispute_pda: None,
            source_event_name: None,
            signature: None,
            slot: None,
            source_event_sequence: event.source_event_sequence,
            trace_id: None,
            repeat_count: 1,
            emitted_at_ms: now_ms,
            metadata: CanonicalValue::Object(metadata),
        }
        .finalized()
    }

    fn timestamp_drift(
        &self,
        record: &TimelineRecord,
        drift_ms: u64,
        severity: AnomalySeverity,
        now_ms: u64,
    ) -> AnomalyRecord {
        let mut metadata = BTreeMap::new();
        metadata.insert("driftMs".to_string(), drift_ms.into());
        metadata.insert(
            "epsilonMs".to_string(),
            self.config.timestamp_epsilon_ms.into(),
        );
        AnomalyRecord {
            anomaly_id: String::new(),
            code: "replay.timestamp_drift".to_string(),
            kind: AnomalyKind::IngestionLag,
            severity,
            message: format!(
                "timestamp drift of {drift_ms}ms for {} at slot {}",
                record.kind, record.slot
            ),
            task_pda: record.task_pda.clone(),
            dispute_pda: record.dispute_pda.clone(),
            source_event_name: Some(record.source_event_name.clone()),
            signature: Some(record.signature.clone()),
            slot: Some(record.slot),
            source_event_sequence: Some(record.source_event_sequence),
            trace_id: Some(record.trace.trace_id.clone()),
            repeat_count: 1,
            emitted_at_ms: now_ms,
            metadata: CanonicalValue::Object(metadata),
        }
        .finalized()
    }
}

//─────────────────────────────
//  Alignment helpers
//─────────────────────────────

fn local_key(event: &TrajectoryEvent) -> AlignKey {
    match event.source_event_sequence {
        Some(seq) => AlignKey::Sequence(event.task_pda.as_ref().map(|t| t.0.clone()), seq),
        None => AlignKey::Shape(
            event.task_pda.as_ref().map(|t| t.0.clone()),
            event.kind,
            event.timestamp_ms,
        ),
    }
}

fn sorted_local<'a>(
    local: &'a [TrajectoryEvent],
) -> impl Iterator<Item = &'a TrajectoryEvent> + 'a {
    let mut sorted: Vec<&TrajectoryEvent> = local.iter().collect();
    sorted.sort_by(|a, b| {
        (
            a.task_pda.as_ref().map(|t| t.as_str().to_string()),
            a.source_event_sequence,
            a.timestamp_ms,
            a.kind.sort_key(),
        )
            .cmp(&(
                b.task_pda.as_ref().map(|t| t.as_str().to_string()),
                b.source_event_sequence,
                b.timestamp_ms,
                b.kind.sort_key(),
            ))
    });
    sorted.into_iter()
}

/// Hash of concatenated projection hashes, the whole-timeline summary.
fn replay_hash<'a>(hashes: impl Iterator<Item = &'a String>) -> String {
    let mut concatenated = String::new();
    for hash in hashes {
        concatenated.push_str(hash);
    }
    hex::encode(vigil_canonical::digest_bytes(concatenated.as_bytes()))
}
