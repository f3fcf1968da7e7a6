//! Anomaly records, the coalescing registry, and the alert sink contract.
//!
//! Anomaly identity is a content hash over the structural fields, so the
//! same defect observed twice (in one run or across comparator runs)
//! coalesces into a single record with a bumped repeat count.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use vigil_canonical::CanonicalValue;
use vigil_types::{DisputePda, TaskPda};

//─────────────────────────────
//  Anomaly model
//─────────────────────────────

/// Classification of an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// A lifecycle transition the state machine does not allow.
    TransitionValidation,
    /// Projected and locally-replayed records disagree on content.
    ReplayHashMismatch,
    /// An event present on only one side of a replay comparison.
    ReplayAnomalyRepeat,
    /// Timestamp drift or ingestion falling behind the chain.
    IngestionLag,
}

impl AnomalyKind {
    /// Stable string form used in hashing and sink payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransitionValidation => "transition_validation",
            Self::ReplayHashMismatch => "replay_hash_mismatch",
            Self::ReplayAnomalyRepeat => "replay_anomaly_repeat",
            Self::IngestionLag => "ingestion_lag",
        }
    }
}

/// How loudly an anomaly should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    /// Informational only.
    Info,
    /// Worth surfacing; ingestion continues.
    Warning,
    /// A correctness problem.
    Error,
}

/// A stable, deduplicatable anomaly observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    /// Deterministic identity over the structural fields, lowercase hex.
    pub anomaly_id: String,
    /// Machine-readable code, e.g. `replay.hash_mismatch`.
    pub code: String,
    /// Classification.
    pub kind: AnomalyKind,
    /// Severity.
    pub severity: AnomalySeverity,
    /// Human-readable description.
    pub message: String,
    /// Task the anomaly concerns, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_pda: Option<TaskPda>,
    /// Dispute the anomaly concerns, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute_pda: Option<DisputePda>,
    /// Source event name, when tied to one event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_event_name: Option<String>,
    /// Transaction signature, when tied to one event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Slot, when tied to one event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    /// Source sequence, when tied to one event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_event_sequence: Option<u64>,
    /// Trace session the anomaly was observed in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// How many times this identity has been observed.
    pub repeat_count: u32,
    /// Wall-clock time of the first observation, milliseconds.
    pub emitted_at_ms: u64,
    /// Structured context (e.g. both hashes of a mismatch).
    pub metadata: CanonicalValue,
}

impl AnomalyRecord {
    /// Compute the deterministic identity over the structural fields.
    ///
    /// `repeat_count`, `emitted_at_ms`, and `message` are excluded: repeats
    /// of the same defect must land on the same id.
    pub fn compute_anomaly_id(&self) -> String {
        let mut fields = BTreeMap::new();
        fields.insert(
            "code".to_string(),
            CanonicalValue::Str(self.code.clone()),
        );
        fields.insert(
            "kind".to_string(),
            CanonicalValue::Str(self.kind.as_str().to_string()),
        );
        if let Some(task) = &self.task_pda {
            fields.insert("taskPda".to_string(), CanonicalValue::Str(task.0.clone()));
        }
        if let Some(dispute) = &self.dispute_pda {
            fields.insert(
                "disputePda".to_string(),
                CanonicalValue::Str(dispute.0.clone()),
            );
        }
        if let Some(name) = &self.source_event_name {
            fields.insert(
                "sourceEventName".to_string(),
                CanonicalValue::Str(name.clone()),
            );
        }
        if let Some(signature) = &self.signature {
            fields.insert(
                "signature".to_string(),
                CanonicalValue::Str(signature.clone()),
            );
        }
        if let Some(slot) = self.slot {
            fields.insert("slot".to_string(), slot.into());
        }
        if let Some(seq) = self.source_event_sequence {
            fields.insert("sourceEventSequence".to_string(), seq.into());
        }
        if let Some(trace_id) = &self.trace_id {
            fields.insert("traceId".to_string(), CanonicalValue::Str(trace_id.clone()));
        }
        fields.insert("metadata".to_string(), self.metadata.clone());
        vigil_canonical::digest_hex(&CanonicalValue::Object(fields))
    }

    /// Fill in the computed identity and return the record.
    pub fn finalized(mut self) -> Self {
        self.anomaly_id = self.compute_anomaly_id();
        self
    }
}

//─────────────────────────────
//  Coalescing registry
//─────────────────────────────

/// Coalesces anomalies by identity across comparator and backfill runs.
#[derive(Debug, Default)]
pub struct AnomalyRegistry {
    by_id: HashMap<String, AnomalyRecord>,
}

impl AnomalyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation. A repeat bumps the existing record's count
    /// and keeps its first-emission timestamp. Returns the live record and
    /// whether it was newly inserted.
    pub fn observe(&mut self, record: AnomalyRecord) -> (&AnomalyRecord, bool) {
        let record = if record.anomaly_id.is_empty() {
            record.finalized()
        } else {
            record
        };
        let id = record.anomaly_id.clone();
        match self.by_id.entry(id) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                let existing = entry.into_mut();
                existing.repeat_count = existing.repeat_count.saturating_add(1);
                (existing, false)
            }
            std::collections::hash_map::Entry::Vacant(entry) => (entry.insert(record), true),
        }
    }

    /// All live records, ordered by anomaly id for determinism.
    pub fn records(&self) -> Vec<AnomalyRecord> {
        let mut records: Vec<AnomalyRecord> = self.by_id.values().cloned().collect();
        records.sort_by(|a, b| a.anomaly_id.cmp(&b.anomaly_id));
        records
    }

    /// Number of distinct anomaly identities observed.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the registry holds no anomalies.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

//─────────────────────────────
//  Alert sink
//─────────────────────────────

/// Outbound sink for Warning/Error anomalies.
///
/// Sink failures are logged by the dispatcher and never propagate into the
/// ingest path.
pub trait AlertSink: Send + Sync {
    /// Deliver one anomaly.
    fn emit(&self, anomaly: &AnomalyRecord) -> anyhow::Result<()>;
}

/// Default sink: structured log lines at a severity-mapped level.
#[derive(Debug, Clone, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, anomaly: &AnomalyRecord) -> anyhow::Result<()> {
        match anomaly.severity {
            AnomalySeverity::Info => info!(
                code = %anomaly.code,
                anomaly_id = %anomaly.anomaly_id,
                repeats = anomaly.repeat_count,
                "{}", anomaly.message
            ),
            AnomalySeverity::Warning => warn!(
                code = %anomaly.code,
                anomaly_id = %anomaly.anomaly_id,
                repeats = anomaly.repeat_count,
                "{}", anomaly.message
            ),
            AnomalySeverity::Error => error!(
                code = %anomaly.code,
                anomaly_id = %anomaly.anomaly_id,
                repeats = anomaly.repeat_count,
                "{}", anomaly.message
            ),
        }
        Ok(())
    }
}

/// Deliver an anomaly to an optional sink, swallowing sink failures.
pub fn dispatch_alert(sink: Option<&dyn AlertSink>, anomaly: &AnomalyRecord) {
    let Some(sink) = sink else {
        return;
    };
    if anomaly.severity < AnomalySeverity::Warning {
        return;
    }
    if let Err(err) = sink.emit(anomaly) {
        warn!(code = %anomaly.code, %err, "alert sink failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anomaly(code: &str, slot: u64) -> AnomalyRecord {
        AnomalyRecord {
            anomaly_id: String::new(),
            code: code.to_string(),
            kind: AnomalyKind::ReplayHashMismatch,
            severity: AnomalySeverity::Error,
            message: "hashes disagree".to_string(),
            task_pda: Some(TaskPda::from("task-1")),
            dispute_pda: None,
            source_event_name: Some("taskCompleted".to_string()),
            signature: Some("SIG".to_string()),
            slot: Some(slot),
            source_event_sequence: Some(0),
            trace_id: Some("session".to_string()),
            repeat_count: 1,
            emitted_at_ms: 1_000,
            metadata: CanonicalValue::Null,
        }
        .finalized()
    }

    #[test]
    fn anomaly_id_is_deterministic_and_structural() {
        let a = anomaly("replay.hash_mismatch", 10);
        let mut b = anomaly("replay.hash_mismatch", 10);
        b.message = "different wording".to_string();
        b.emitted_at_ms = 9_999;
        assert_eq!(a.anomaly_id, b.compute_anomaly_id());

        let c = anomaly("replay.hash_mismatch", 11);
        assert_ne!(a.anomaly_id, c.anomaly_id);
    }

    #[test]
    fn registry_coalesces_repeats() {
        let mut registry = AnomalyRegistry::new();
        let (_, inserted) = registry.observe(anomaly("replay.hash_mismatch", 10));
        assert!(inserted);
        let (record, inserted) = registry.observe(anomaly("replay.hash_mismatch", 10));
        assert!(!inserted);
        assert_eq!(record.repeat_count, 2);
        assert_eq!(registry.len(), 1);

        registry.observe(anomaly("replay.hash_mismatch", 11));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn dispatch_skips_info_and_swallows_failures() {
        struct FailingSink;
        impl AlertSink for FailingSink {
            fn emit(&self, _anomaly: &AnomalyRecord) -> anyhow::Result<()> {
                anyhow::bail!("sink down")
            }
        }

        let mut record = anomaly("replay.hash_mismatch", 10);
        // Does not panic or propagate.
        dispatch_alert(Some(&FailingSink), &record);

        record.severity = AnomalySeverity::Info;
        dispatch_alert(Some(&TracingAlertSink), &record);
        dispatch_alert(None, &record);
    }
}
