#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-store-sled** – Sled-based durable timeline store driver for Vigil.
//!
//! This crate provides an embedded, crash-safe store using the sled
//! database engine while maintaining the same interface as the in-memory
//! driver.
//!
//! One tree holds three prefixed keyspaces:
//! - `records/` `slot:u64be ++ signature ++ 0x00 ++ seq:u32be` → canonical
//!   record bytes (the stable stringification of the record).
//! - `by_hash/` projection hash → primary record key, the idempotency index.
//! - `meta/` the `cursor` (rmp-serde bytes) and the `next_seq` counter.
//!
//! A record batch and its cursor commit in one transaction, so a crash
//! never leaves the cursor ahead of its records.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sled::transaction::ConflictableTransactionError;
use sled::{Db, Tree};
use tokio::sync::{broadcast, Mutex};

use vigil_store_core::{
    select_evictions, RetentionPolicy, SaveReceipt, StoreError, TimelineFilter, TimelineRecord,
    TimelineStore,
};
use vigil_types::Cursor;

/// Default broadcast channel size for live record streaming.
const DEFAULT_BROADCAST_SIZE: usize = 256;

const RECORDS_PREFIX: &[u8] = b"records/";
const BY_HASH_PREFIX: &[u8] = b"by_hash/";
const META_CURSOR: &[u8] = b"meta/cursor";
const META_NEXT_SEQ: &[u8] = b"meta/next_seq";

//─────────────────────────────
//  Key layout
//─────────────────────────────

fn record_key(slot: u64, signature: &str, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(RECORDS_PREFIX.len() + 8 + signature.len() + 1 + 4);
    key.extend_from_slice(RECORDS_PREFIX);
    key.extend_from_slice(&slot.to_be_bytes());
    key.extend_from_slice(signature.as_bytes());
    key.push(0);
    key.extend_from_slice(&(seq as u32).to_be_bytes());
    key
}

fn hash_key(projection_hash: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(BY_HASH_PREFIX.len() + projection_hash.len());
    key.extend_from_slice(BY_HASH_PREFIX);
    key.extend_from_slice(projection_hash.as_bytes());
    key
}

fn record_key_slot(key: &[u8]) -> u64 {
    let start = RECORDS_PREFIX.len();
    let mut slot = [0u8; 8];
    if key.len() >= start + 8 {
        slot.copy_from_slice(&key[start..start + 8]);
    }
    u64::from_be_bytes(slot)
}

//─────────────────────────────
//  Sled store
//─────────────────────────────

/// A durable timeline store backed by the sled embedded database.
///
/// Writers are serialized behind a mutex; readers go straight to the tree
/// and observe the last committed transaction. The database handle is held
/// for the lifetime of the store; dropping it flushes pending writes.
#[derive(Debug)]
pub struct SledTimelineStore {
    _db: Db, // Keep reference to prevent premature database closure
    tree: Tree,
    retention: RetentionPolicy,
    write_lock: Mutex<()>,
    broadcast_tx: broadcast::Sender<TimelineRecord>,
}

impl SledTimelineStore {
    /// Open or create a store at the given path with no retention limits.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_retention(path, RetentionPolicy::default())
    }

    /// Open or create a store enforcing the given retention policy.
    pub fn open_with_retention<P: AsRef<Path>>(
        path: P,
        retention: RetentionPolicy,
    ) -> Result<Self> {
        let db = sled::Config::default().path(path).open()?;
        Self::from_db(db, retention)
    }

    /// Build a store from an existing sled database instance.
    pub fn from_db(db: Db, retention: RetentionPolicy) -> Result<Self> {
        let tree = db.open_tree("timeline")?;
        let (broadcast_tx, _) = broadcast::channel(DEFAULT_BROADCAST_SIZE);
        Ok(Self {
            _db: db,
            tree,
            retention,
            write_lock: Mutex::new(()),
            broadcast_tx,
        })
    }

    /// Create a temporary store for testing; the database is discarded
    /// when the store is dropped.
    #[cfg(test)]
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, RetentionPolicy::default())
    }

    /// Subscribe to the live stream of committed records.
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineRecord> {
        self.broadcast_tx.subscribe()
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        self.tree.flush_async().await?;
        Ok(())
    }

    /// Database size on disk, for operational introspection.
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self._db.size_on_disk()?)
    }

    fn next_seq(&self) -> Result<u64> {
        Ok(self
            .tree
            .get(META_NEXT_SEQ)?
            .map(|ivec| {
                let mut buf = [0u8; 8];
                if ivec.len() == 8 {
                    buf.copy_from_slice(&ivec);
                }
                u64::from_be_bytes(buf)
            })
            .unwrap_or(0))
    }

    fn decode(bytes: &[u8]) -> Result<TimelineRecord> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Decode(e.to_string()).into())
    }

    fn load_all_records(&self) -> Result<Vec<(Vec<u8>, TimelineRecord)>> {
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(RECORDS_PREFIX) {
            let (key, value) = entry?;
            out.push((key.to_vec(), Self::decode(&value)?));
        }
        Ok(out)
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Runs under the write lock, after a committed batch.
    fn enforce_retention(&self, cursor: Option<&Cursor>) -> Result<()> {
        if self.retention.is_noop() {
            return Ok(());
        }
        let rows = self.load_all_records()?;
        let records: Vec<TimelineRecord> = rows.iter().map(|(_, rec)| rec.clone()).collect();
        let drops = select_evictions(&records, &self.retention, cursor, Self::now_ms());
        for i in drops {
            let (key, rec) = &rows[i];
            self.tree.remove(key.as_slice())?;
            self.tree.remove(hash_key(&rec.projection_hash))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TimelineStore for SledTimelineStore {
    async fn save_with_cursor(
        &self,
        records: &[TimelineRecord],
        cursor: Option<&Cursor>,
    ) -> Result<SaveReceipt> {
        let _guard = self.write_lock.lock().await;
        let mut receipt = SaveReceipt::default();
        let mut next_seq = self.next_seq()?;

        // Prepare the batch outside the transaction closure: dedup probes,
        // sequence assignment, and canonical serialization.
        let mut prepared: Vec<(Vec<u8>, Vec<u8>, Vec<u8>, TimelineRecord)> = Vec::new();
        let mut batch_hashes = std::collections::HashSet::new();
        for record in records {
            if self.tree.get(hash_key(&record.projection_hash))?.is_some()
                || !batch_hashes.insert(record.projection_hash.clone())
            {
                receipt.duplicates += 1;
                continue;
            }
            next_seq += 1;
            let mut stored = record.clone();
            stored.seq = next_seq;
            let key = record_key(stored.slot, &stored.signature, stored.seq);
            let bytes = vigil_canonical::to_canonical_string(&stored)
                .map_err(|e| StoreError::Serialization(e.to_string()))?
                .into_bytes();
            prepared.push((key, bytes, hash_key(&stored.projection_hash), stored));
            receipt.inserted += 1;
        }

        let cursor_bytes = match cursor {
            Some(c) => Some(
                rmp_serde::to_vec_named(c).map_err(|e| StoreError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        let next_seq_bytes = next_seq.to_be_bytes();

        self.tree
            .transaction(|tx| {
                for (key, bytes, hash, _) in &prepared {
                    tx.insert(key.as_slice(), bytes.as_slice())?;
                    tx.insert(hash.as_slice(), key.as_slice())?;
                }
                tx.insert(META_NEXT_SEQ, &next_seq_bytes)?;
                if let Some(cursor_bytes) = &cursor_bytes {
                    tx.insert(META_CURSOR, cursor_bytes.as_slice())?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| StoreError::WriteFailed(format!("{:?}", e)))?;

        for (_, _, _, stored) in prepared {
            // Ignore errors if no subscribers.
            let _ = self.broadcast_tx.send(stored);
        }

        self.enforce_retention(cursor)?;
        Ok(receipt)
    }

    async fn query(&self, filter: &TimelineFilter) -> Result<Vec<TimelineRecord>> {
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(RECORDS_PREFIX) {
            let (key, value) = entry?;
            let slot = record_key_slot(&key);
            if let Some(from) = filter.from_slot {
                if slot < from {
                    continue;
                }
            }
            if let Some(to) = filter.to_slot {
                // Keys are slot-ordered within the prefix, so everything
                // past the bound is out.
                if slot > to {
                    break;
                }
            }
            let record = Self::decode(&value)?;
            if filter.matches(&record) {
                out.push(record);
            }
        }
        // Key order is (slot, signature, seq) already; queries stay sorted.
        Ok(out)
    }

    async fn cursor(&self) -> Result<Option<Cursor>> {
        match self.tree.get(META_CURSOR)? {
            Some(bytes) => {
                let cursor =
                    rmp_serde::from_slice(&bytes).map_err(|e| StoreError::Decode(e.to_string()))?;
                Ok(Some(cursor))
            }
            None => Ok(None),
        }
    }

    async fn save_cursor(&self, cursor: &Cursor) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let bytes =
            rmp_serde::to_vec_named(cursor).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.tree.insert(META_CURSOR, bytes)?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.tree.clear()?;
        Ok(())
    }

    async fn event_count(&self) -> Result<u64> {
        Ok(self.tree.scan_prefix(RECORDS_PREFIX).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::{TaskPda, TraceContext, TrajectoryKind};

    fn record(slot: u64, signature: &str, task: &str) -> TimelineRecord {
        let mut rec = TimelineRecord {
            seq: 0,
            kind: TrajectoryKind::Discovered,
            task_pda: Some(TaskPda::from(task)),
            dispute_pda: None,
            speculation_pda: None,
            timestamp_ms: 1_000,
            payload: vigil_canonical::canonicalize(&serde_json::json!({
                "task": task, "slot": slot, "sig": signature,
            }))
            .unwrap(),
            slot,
            signature: signature.to_string(),
            source_event_name: "taskCreated".to_string(),
            source_event_sequence: 0,
            projection_hash: String::new(),
            trace: TraceContext {
                trace_id: "trace-1".into(),
                span_id: "span".into(),
                parent_span_id: None,
                sampled: false,
            },
        };
        rec.projection_hash = rec.compute_projection_hash();
        rec
    }

    #[tokio::test]
    async fn save_query_round_trip() {
        let store = SledTimelineStore::temporary().unwrap();
        let receipt = store
            .save(&[record(20, "B", "t1"), record(10, "A", "t1")])
            .await
            .unwrap();
        assert_eq!(receipt.inserted, 2);

        let records = store.query(&TimelineFilter::default()).await.unwrap();
        let slots: Vec<u64> = records.iter().map(|r| r.slot).collect();
        assert_eq!(slots, vec![10, 20]);
        assert_eq!(records[0].task_pda, Some(TaskPda::from("t1")));
    }

    #[tokio::test]
    async fn save_is_idempotent_on_projection_hash() {
        let store = SledTimelineStore::temporary().unwrap();
        let batch = vec![record(10, "A", "t1")];
        store.save(&batch).await.unwrap();
        let receipt = store.save(&batch).await.unwrap();
        assert_eq!(receipt.inserted, 0);
        assert_eq!(receipt.duplicates, 1);
        assert_eq!(store.event_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cursor_commits_atomically_with_batch() {
        let store = SledTimelineStore::temporary().unwrap();
        let cursor = Cursor {
            slot: 10,
            signature: "A".into(),
            event_name: Some("taskCreated".into()),
            trace_id: None,
            trace_span_id: None,
        };
        store
            .save_with_cursor(&[record(10, "A", "t1")], Some(&cursor))
            .await
            .unwrap();
        assert_eq!(store.cursor().await.unwrap(), Some(cursor));
    }

    #[tokio::test]
    async fn slot_range_queries_respect_bounds() {
        let store = SledTimelineStore::temporary().unwrap();
        store
            .save(&[record(10, "A", "t1"), record(20, "B", "t1"), record(30, "C", "t1")])
            .await
            .unwrap();
        let records = store
            .query(&TimelineFilter {
                from_slot: Some(15),
                to_slot: Some(25),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].slot, 20);
    }

    #[tokio::test]
    async fn persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeline.db");
        let cursor = Cursor {
            slot: 10,
            signature: "A".into(),
            event_name: None,
            trace_id: None,
            trace_span_id: None,
        };

        {
            let store = SledTimelineStore::open(&path).unwrap();
            store
                .save_with_cursor(&[record(10, "A", "t1")], Some(&cursor))
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        {
            let store = SledTimelineStore::open(&path).unwrap();
            assert_eq!(store.event_count().await.unwrap(), 1);
            assert_eq!(store.cursor().await.unwrap(), Some(cursor));
            // Dedup survives reopen.
            let receipt = store.save(&[record(10, "A", "t1")]).await.unwrap();
            assert_eq!(receipt.duplicates, 1);
            // And the sequence counter continues instead of restarting.
            let receipt = store.save(&[record(20, "B", "t1")]).await.unwrap();
            assert_eq!(receipt.inserted, 1);
            let records = store.query(&TimelineFilter::default()).await.unwrap();
            assert_eq!(
                records.iter().map(|r| r.seq).collect::<Vec<_>>(),
                vec![1, 2]
            );
        }
    }

    #[tokio::test]
    async fn retention_drops_oldest_rows() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = SledTimelineStore::from_db(
            db,
            RetentionPolicy {
                max_events_total: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        store
            .save(&[record(10, "A", "t1"), record(20, "B", "t1"), record(30, "C", "t1")])
            .await
            .unwrap();
        let records = store.query(&TimelineFilter::default()).await.unwrap();
        let slots: Vec<u64> = records.iter().map(|r| r.slot).collect();
        assert_eq!(slots, vec![20, 30]);
    }

    #[tokio::test]
    async fn canonical_record_bytes_are_stored() {
        let store = SledTimelineStore::temporary().unwrap();
        let rec = record(10, "A", "t1");
        store.save(&[rec.clone()]).await.unwrap();

        // The raw value under the record key is the stable stringification
        // of the record: sorted keys, no whitespace.
        let (_, value) = store
            .tree
            .scan_prefix(RECORDS_PREFIX)
            .next()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(value.to_vec()).unwrap();
        assert!(text.starts_with('{'));
        assert!(!text.contains('\n'));
        assert!(text.contains(&rec.projection_hash));
    }
}
