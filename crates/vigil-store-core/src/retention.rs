//! Write-time retention and read-side compaction.
//!
//! Both policies are expressed as pure functions over an ordered record
//! slice so every driver enforces identical semantics. Retention runs under
//! the driver's write lock, in the same commit as `save`.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use vigil_types::Cursor;

use crate::TimelineRecord;

//─────────────────────────────
//  Policies
//─────────────────────────────

/// Write-time eviction limits. Unset fields impose no bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Drop records older than this many milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Keep at most this many records in total.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_events_total: Option<u64>,
    /// Keep at most this many records per entity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_events_per_entity: Option<u32>,
}

impl RetentionPolicy {
    /// Whether the policy can never evict anything.
    pub fn is_noop(&self) -> bool {
        self.ttl_ms.is_none()
            && self.max_events_total.is_none()
            && self.max_events_per_entity.is_none()
    }
}

/// Read-side compaction switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionPolicy {
    /// Compress repeated-identical-payload runs within one
    /// `(task_pda, kind)` into a first/last/repeat summary.
    pub coalesce_duplicate_spans: bool,
}

/// One element of a compacted query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompactedRun {
    /// A record that did not coalesce with its neighbors.
    Single(TimelineRecord),
    /// A run of identical-payload records collapsed to its endpoints.
    Span {
        /// First record of the run.
        first: Box<TimelineRecord>,
        /// Last record of the run.
        last: Box<TimelineRecord>,
        /// Total records in the run, endpoints included.
        repeat_count: u32,
    },
}

//─────────────────────────────
//  Retention selection
//─────────────────────────────

/// Select indices to evict from `records` (sorted by `(slot, signature,
/// seq)`) so the policy holds afterwards.
///
/// Eviction is oldest-first by that order and never touches rows strictly
/// newer than the cursor: those are not yet resumable from the source. The
/// cursor's own row is evictable.
pub fn select_evictions(
    records: &[TimelineRecord],
    policy: &RetentionPolicy,
    cursor: Option<&Cursor>,
    now_ms: u64,
) -> Vec<usize> {
    if policy.is_noop() || records.is_empty() {
        return Vec::new();
    }

    let newer_than_cursor = |rec: &TimelineRecord| match cursor {
        Some(c) => (rec.slot, rec.signature.as_str()) > c.position(),
        None => false,
    };

    let mut drops: BTreeSet<usize> = BTreeSet::new();

    if let Some(ttl) = policy.ttl_ms {
        for (i, rec) in records.iter().enumerate() {
            if newer_than_cursor(rec) {
                continue;
            }
            if rec.timestamp_ms.saturating_add(ttl) < now_ms {
                drops.insert(i);
            }
        }
    }

    if let Some(max_total) = policy.max_events_total {
        let mut live = records.len() - drops.len();
        for (i, rec) in records.iter().enumerate() {
            if live as u64 <= max_total {
                break;
            }
            if drops.contains(&i) || newer_than_cursor(rec) {
                continue;
            }
            drops.insert(i);
            live -= 1;
        }
    }

    if let Some(max_per_entity) = policy.max_events_per_entity {
        let mut live_per_entity: HashMap<&str, u64> = HashMap::new();
        for (i, rec) in records.iter().enumerate() {
            if drops.contains(&i) {
                continue;
            }
            if let Some(entity) = rec.entity_key() {
                *live_per_entity.entry(entity).or_default() += 1;
            }
        }
        for (i, rec) in records.iter().enumerate() {
            let Some(entity) = rec.entity_key() else {
                continue;
            };
            let Some(count) = live_per_entity.get_mut(entity) else {
                continue;
            };
            if *count <= max_per_entity as u64 {
                continue;
            }
            if drops.contains(&i) || newer_than_cursor(rec) {
                continue;
            }
            drops.insert(i);
            *count -= 1;
        }
    }

    drops.into_iter().collect()
}

//─────────────────────────────
//  Span coalescing
//─────────────────────────────

/// Collapse runs of records sharing `(task_pda, kind)` and an identical
/// payload into first/last/repeat summaries. Input order is preserved.
pub fn coalesce_duplicate_spans(records: Vec<TimelineRecord>) -> Vec<CompactedRun> {
    let mut out: Vec<CompactedRun> = Vec::new();
    let mut run: Vec<TimelineRecord> = Vec::new();

    let same_run = |a: &TimelineRecord, b: &TimelineRecord| {
        a.task_pda == b.task_pda && a.kind == b.kind && a.payload == b.payload
    };

    let flush = |run: &mut Vec<TimelineRecord>, out: &mut Vec<CompactedRun>| {
        match run.len() {
            0 => {}
            1 => out.push(CompactedRun::Single(run.remove(0))),
            n => {
                let last = run.pop().map(Box::new);
                let first = Box::new(run.remove(0));
                // `n >= 2` here, so both endpoints exist.
                if let Some(last) = last {
                    out.push(CompactedRun::Span {
                        first,
                        last,
                        repeat_count: n as u32,
                    });
                }
                run.clear();
            }
        }
    };

    for rec in records {
        if run.last().map(|prev| same_run(prev, &rec)).unwrap_or(false) || run.is_empty() {
            run.push(rec);
        } else {
            flush(&mut run, &mut out);
            run.push(rec);
        }
    }
    flush(&mut run, &mut out);
    out
}
