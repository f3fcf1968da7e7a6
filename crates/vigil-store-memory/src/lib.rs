#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-store-memory** – In-memory timeline store driver for Vigil.
//!
//! This crate provides a fast, non-persistent store suitable for tests,
//! development, and ephemeral ingest sessions. All data is lost when the
//! process terminates.
//!
//! A single `RwLock` guards records, the hash index, and the cursor
//! together, so a record batch and its cursor commit atomically and readers
//! always observe the last committed batch.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use vigil_store_core::{
    select_evictions, RetentionPolicy, SaveReceipt, TimelineFilter, TimelineRecord, TimelineStore,
};
use vigil_types::Cursor;

/// Default buffer size for the live record broadcast channel.
const DEFAULT_BUFFER: usize = 1024;

#[derive(Debug, Default)]
struct Inner {
    /// Records ordered by `(slot, signature, seq)`.
    records: Vec<TimelineRecord>,
    /// Projection hashes of everything ever inserted and still live.
    hashes: HashSet<String>,
    /// Store-wide insertion counter; eviction leaves gaps at the head but
    /// ordering stays strictly increasing.
    next_seq: u64,
    cursor: Option<Cursor>,
}

//─────────────────────────────
//  In-memory store
//─────────────────────────────

/// An in-memory, non-persistent timeline store.
///
/// Also provides a live record stream via a broadcast channel, allowing
/// subscribers to observe commits in real time. Subscribers that fall
/// behind may miss records if the buffer overflows.
#[derive(Debug, Clone)]
pub struct MemoryTimelineStore {
    inner: Arc<RwLock<Inner>>,
    retention: RetentionPolicy,
    broadcast_tx: broadcast::Sender<TimelineRecord>,
}

impl Default for MemoryTimelineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTimelineStore {
    /// Create a new, empty store with no retention limits.
    pub fn new() -> Self {
        Self::with_retention(RetentionPolicy::default())
    }

    /// Create a store enforcing the given retention policy at write time.
    pub fn with_retention(retention: RetentionPolicy) -> Self {
        let (broadcast_tx, _) = broadcast::channel(DEFAULT_BUFFER);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            retention,
            broadcast_tx,
        }
    }

    /// Subscribe to the live stream of committed records.
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineRecord> {
        self.broadcast_tx.subscribe()
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn enforce_retention(&self, inner: &mut Inner) {
        if self.retention.is_noop() {
            return;
        }
        let drops = select_evictions(
            &inner.records,
            &self.retention,
            inner.cursor.as_ref(),
            Self::now_ms(),
        );
        for &i in drops.iter().rev() {
            let rec = inner.records.remove(i);
            inner.hashes.remove(&rec.projection_hash);
        }
    }
}

#[async_trait]
impl TimelineStore for MemoryTimelineStore {
    async fn save_with_cursor(
        &self,
        records: &[TimelineRecord],
        cursor: Option<&Cursor>,
    ) -> Result<SaveReceipt> {
        let mut inner = self.inner.write().await;
        let mut receipt = SaveReceipt::default();

        for record in records {
            if inner.hashes.contains(&record.projection_hash) {
                receipt.duplicates += 1;
                continue;
            }
            inner.next_seq += 1;
            let mut stored = record.clone();
            stored.seq = inner.next_seq;

            // Keep `(slot, signature, seq)` order on insert; batches arrive
            // mostly in order so the scan from the tail is short.
            let pos = inner
                .records
                .iter()
                .rposition(|r| r.order_key() <= stored.order_key())
                .map(|p| p + 1)
                .unwrap_or(0);
            inner.hashes.insert(stored.projection_hash.clone());
            inner.records.insert(pos, stored.clone());
            receipt.inserted += 1;

            // Ignore errors if no subscribers.
            let _ = self.broadcast_tx.send(stored);
        }

        if let Some(cursor) = cursor {
            inner.cursor = Some(cursor.clone());
        }
        self.enforce_retention(&mut inner);
        Ok(receipt)
    }

    async fn query(&self, filter: &TimelineFilter) -> Result<Vec<TimelineRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .filter(|rec| filter.matches(rec))
            .cloned()
            .collect())
    }

    async fn cursor(&self) -> Result<Option<Cursor>> {
        Ok(self.inner.read().await.cursor.clone())
    }

    async fn save_cursor(&self, cursor: &Cursor) -> Result<()> {
        self.inner.write().await.cursor = Some(cursor.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.records.clear();
        inner.hashes.clear();
        inner.cursor = None;
        inner.next_seq = 0;
        Ok(())
    }

    async fn event_count(&self) -> Result<u64> {
        Ok(self.inner.read().await.records.len() as u64)
    }
}
