#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-store-core** – Core timeline storage abstractions for Vigil.
//!
//! This crate defines the contracts for persisting projected timeline
//! records without providing concrete implementations. Storage drivers
//! (in-memory, sled) implement these traits in separate crates that depend
//! on this core abstraction.
//!
//! The store is idempotent on `projection_hash`: re-inserting a record whose
//! hash is already present is a no-op and does not advance `seq`. Record
//! batches and the resume cursor commit atomically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vigil_canonical::CanonicalValue;
use vigil_types::{Cursor, DisputePda, SpeculationPda, TaskPda, TraceContext, TrajectoryKind};

/// Retention and compaction policies plus their pure enforcement helpers.
pub mod retention;
pub use retention::{
    coalesce_duplicate_spans, select_evictions, CompactedRun, CompactionPolicy, RetentionPolicy,
};

//─────────────────────────────
//  Projected timeline record
//─────────────────────────────

/// The persistent output unit of the projector.
///
/// `seq` is assigned by the store at insertion time, store-wide dense and
/// strictly increasing, so the final store state is independent of how the
/// input stream was paginated. The projection hash excludes `seq` for the
/// same reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineRecord {
    /// Post-projection monotonic sequence, assigned by insertion order.
    pub seq: u64,
    /// Canonical lifecycle type.
    pub kind: TrajectoryKind,
    /// Primary entity key, when the payload names a task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_pda: Option<TaskPda>,
    /// Dispute account, for dispute-scoped events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute_pda: Option<DisputePda>,
    /// Speculation commitment account, for speculation-scoped events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speculation_pda: Option<SpeculationPda>,
    /// Event timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Canonical payload, augmented with the `onchain` provenance envelope.
    pub payload: CanonicalValue,
    /// Slot the source transaction landed in.
    pub slot: u64,
    /// Source transaction signature.
    pub signature: String,
    /// Event name as emitted by the on-chain program.
    pub source_event_name: String,
    /// Position of the event within its source transaction.
    pub source_event_sequence: u64,
    /// Content hash over the record's identity fields, lowercase hex.
    pub projection_hash: String,
    /// Propagated tracing identity.
    pub trace: TraceContext,
}

impl TimelineRecord {
    /// Compute the content hash over `(type, taskPda?, timestampMs,
    /// canonical(payload), slot, signature, sourceEventName,
    /// sourceEventSequence)`.
    ///
    /// A pure function of the record's content: identical records in
    /// different runs hash equally.
    pub fn compute_projection_hash(&self) -> String {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert(
            "type".to_string(),
            CanonicalValue::Str(self.kind.as_str().to_string()),
        );
        if let Some(task) = &self.task_pda {
            fields.insert(
                "taskPda".to_string(),
                CanonicalValue::Str(task.0.clone()),
            );
        }
        fields.insert("timestampMs".to_string(), self.timestamp_ms.into());
        fields.insert("payload".to_string(), self.payload.clone());
        fields.insert("slot".to_string(), self.slot.into());
        fields.insert(
            "signature".to_string(),
            CanonicalValue::Str(self.signature.clone()),
        );
        fields.insert(
            "sourceEventName".to_string(),
            CanonicalValue::Str(self.source_event_name.clone()),
        );
        fields.insert(
            "sourceEventSequence".to_string(),
            self.source_event_sequence.into(),
        );
        vigil_canonical::digest_hex(&CanonicalValue::Object(fields))
    }

    /// The entity this record primarily belongs to, for per-entity retention.
    pub fn entity_key(&self) -> Option<&str> {
        self.task_pda
            .as_ref()
            .or(self.dispute_pda.as_ref())
            .or(self.speculation_pda.as_ref())
            .map(|pda| pda.as_str())
    }

    /// Ordering key `(slot, signature, seq)` used by every query path.
    pub fn order_key(&self) -> (u64, &str, u64) {
        (self.slot, self.signature.as_str(), self.seq)
    }
}

//─────────────────────────────
//  Query filter
//─────────────────────────────

/// Equality/range filter over the stored timeline.
///
/// All populated fields must match. Results are always ordered by
/// `(slot, signature, seq)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineFilter {
    /// Restrict to one trace session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Restrict to one task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_pda: Option<TaskPda>,
    /// Restrict to one dispute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute_pda: Option<DisputePda>,
    /// Inclusive slot lower bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_slot: Option<u64>,
    /// Inclusive slot upper bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_slot: Option<u64>,
    /// Inclusive sequence lower bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_seq: Option<u64>,
    /// Inclusive sequence upper bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_seq: Option<u64>,
    /// Restrict to these lifecycle kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<TrajectoryKind>>,
}

impl TimelineFilter {
    /// Whether a record passes every populated predicate.
    pub fn matches(&self, record: &TimelineRecord) -> bool {
        if let Some(trace_id) = &self.trace_id {
            if &record.trace.trace_id != trace_id {
                return false;
            }
        }
        if let Some(task) = &self.task_pda {
            if record.task_pda.as_ref() != Some(task) {
                return false;
            }
        }
        if let Some(dispute) = &self.dispute_pda {
            if record.dispute_pda.as_ref() != Some(dispute) {
                return false;
            }
        }
        if let Some(from) = self.from_slot {
            if record.slot < from {
                return false;
            }
        }
        if let Some(to) = self.to_slot {
            if record.slot > to {
                return false;
            }
        }
        if let Some(from) = self.from_seq {
            if record.seq < from {
                return false;
            }
        }
        if let Some(to) = self.to_seq {
            if record.seq > to {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&record.kind) {
                return false;
            }
        }
        true
    }
}

//─────────────────────────────
//  Save receipts
//─────────────────────────────

/// Outcome of a batch save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReceipt {
    /// Records newly inserted by this batch.
    pub inserted: u64,
    /// Records skipped because their projection hash was already stored.
    pub duplicates: u64,
}

//─────────────────────────────
//  Storage trait
//─────────────────────────────

/// Abstraction over an idempotent timeline sink with a single-slot cursor.
///
/// Implementations serialize writers: one batch commits at a time, and
/// `save_with_cursor` commits records and cursor atomically (either both
/// land or neither does). Readers observe the last committed batch.
#[async_trait]
pub trait TimelineStore: Send + Sync {
    /// Batch-insert records, deduplicating on `projection_hash`.
    async fn save(&self, records: &[TimelineRecord]) -> anyhow::Result<SaveReceipt> {
        self.save_with_cursor(records, None).await
    }

    /// Batch-insert records and advance the cursor in one atomic commit.
    async fn save_with_cursor(
        &self,
        records: &[TimelineRecord],
        cursor: Option<&Cursor>,
    ) -> anyhow::Result<SaveReceipt>;

    /// Query stored records, ordered by `(slot, signature, seq)`.
    async fn query(&self, filter: &TimelineFilter) -> anyhow::Result<Vec<TimelineRecord>>;

    /// Query with read-side compaction applied per the policy.
    ///
    /// Canonical records retain their identity; the coalesced view is for
    /// query responses only.
    async fn query_compacted(
        &self,
        filter: &TimelineFilter,
        policy: &CompactionPolicy,
    ) -> anyhow::Result<Vec<CompactedRun>> {
        let records = self.query(filter).await?;
        if policy.coalesce_duplicate_spans {
            Ok(coalesce_duplicate_spans(records))
        } else {
            Ok(records.into_iter().map(CompactedRun::Single).collect())
        }
    }

    /// Read the persisted resume cursor, if any.
    async fn cursor(&self) -> anyhow::Result<Option<Cursor>>;

    /// Persist the resume cursor alone.
    async fn save_cursor(&self, cursor: &Cursor) -> anyhow::Result<()>;

    /// Drop all records and the cursor.
    async fn clear(&self) -> anyhow::Result<()>;

    /// Number of records currently stored.
    async fn event_count(&self) -> anyhow::Result<u64>;
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A batch could not be committed.
    #[error("store write failed: {0}")]
    WriteFailed(String),
    /// Record serialization failed.
    #[error("failed to serialize record: {0}")]
    Serialization(String),
    /// Stored bytes could not be decoded.
    #[error("failed to decode stored record: {0}")]
    Decode(String),
    /// The persisted cursor no longer matches the stored timeline.
    #[error("cursor mismatch: {0}")]
    CursorMismatch(String),
    /// Backend-specific failure.
    #[error("store backend error: {0}")]
    Backend(String),
}
