#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-backfill** – Checkpointed backfill service for Vigil.
//!
//! Drains a [`ChainSource`] page by page into a timeline store: each page
//! is projected, saved, and checkpointed in one atomic commit, so a killed
//! backfill resumes exactly where the last fully-persisted page ended.
//! Retryable source errors back off exponentially; the store's hash
//! deduplication keeps retried pages idempotent.
//!
//! For the same source and the same starting cursor the final store state
//! is identical regardless of page size or the number of retries.

use std::cmp::min;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_canonical::CanonicalValue;
use vigil_comparator::{AnomalyKind, AnomalyRecord, AnomalyRegistry, AnomalySeverity};
use vigil_projector::{Projector, ProjectorError, TransitionViolation};
use vigil_store_core::TimelineStore;
use vigil_types::{Cursor, Pda, RawChainEvent};

//─────────────────────────────
//  Chain source contract
//─────────────────────────────

/// One page of parsed events from the chain.
///
/// Events arrive in `(slot, signature)` ascending order and a page never
/// splits a transaction across its boundary.
#[derive(Debug, Clone)]
pub struct ChainPage {
    /// Parsed events for this page.
    pub events: Vec<RawChainEvent>,
    /// Resume point after this page, when the source is not exhausted.
    pub next_cursor: Option<Cursor>,
    /// Whether the source has no further pages.
    pub done: bool,
}

/// Errors a chain source can surface.
#[derive(Debug, thiserror::Error)]
pub enum ChainSourceError {
    /// Timeout, rate-limit, or 5xx-class failure; retried with backoff.
    #[error("retryable chain source error: {0}")]
    Retryable(String),
    /// 4xx-class failure; aborts the backfill.
    #[error("fatal chain source error: {0}")]
    Fatal(String),
}

impl ChainSourceError {
    /// Whether the backfill should retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Paginated, idempotent source of parsed on-chain events.
///
/// Fetching with the same cursor must return the same page.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Fetch the page following `cursor` (or the first page when `None`).
    async fn fetch_page(
        &self,
        cursor: Option<&Cursor>,
        page_size: u32,
    ) -> Result<ChainPage, ChainSourceError>;
}

//─────────────────────────────
//  Configuration & results
//─────────────────────────────

/// Backfill settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillConfig {
    /// Stop once a page begins past this slot (inclusive bound).
    pub to_slot: Option<u64>,
    /// Events requested per page.
    pub page_size: u32,
    /// Retry budget for retryable source errors.
    pub max_retries: u32,
    /// First backoff delay.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling.
    pub max_backoff_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            to_slot: None,
            page_size: 100,
            max_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

/// Outcome of a completed backfill run.
#[derive(Debug, Clone, Default)]
pub struct BackfillResult {
    /// Records newly inserted into the store.
    pub processed: u64,
    /// Inputs suppressed as duplicates (projector and store combined).
    pub duplicates: u64,
    /// Pages drained from the source.
    pub pages_fetched: u64,
    /// Cursor after the last fully-persisted page.
    pub cursor: Option<Cursor>,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
    /// Lifecycle anomalies observed while projecting, coalesced.
    pub anomalies: Vec<AnomalyRecord>,
}

/// Fatal backfill failures.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    /// The source failed fatally or exhausted its retry budget.
    #[error(transparent)]
    Source(#[from] ChainSourceError),
    /// Projection failed (strict mode or malformed batch). The cursor is
    /// left untouched.
    #[error(transparent)]
    Projection(#[from] ProjectorError),
    /// The source rewound behind the resume cursor; resuming would corrupt
    /// the timeline, so the run aborts instead of silently resetting.
    #[error("cursor mismatch: {0}")]
    CursorMismatch(String),
    /// The store rejected a commit.
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}

//─────────────────────────────
//  Backfill service
//─────────────────────────────

/// Drives a chain source into a timeline store under a resumable cursor.
pub struct BackfillService {
    source: Arc<dyn ChainSource>,
    store: Arc<dyn TimelineStore>,
    projector: Projector,
    config: BackfillConfig,
    cancel: CancellationToken,
}

impl BackfillService {
    /// Create a backfill service.
    pub fn new(
        source: Arc<dyn ChainSource>,
        store: Arc<dyn TimelineStore>,
        projector: Projector,
        config: BackfillConfig,
    ) -> Self {
        Self {
            source,
            store,
            projector,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// A token that cancels this run. On cancel, the in-flight page is
    /// allowed to complete and persist before the loop exits.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the backfill to completion, cancellation, or the target slot.
    pub async fn run(&self) -> Result<BackfillResult, BackfillError> {
        let started = Instant::now();
        let mut result = BackfillResult::default();
        let mut registry = AnomalyRegistry::new();

        let mut cursor = self.store.cursor().await.map_err(BackfillError::Store)?;
        info!(resume = ?cursor.as_ref().map(|c| c.slot), "backfill starting");

        loop {
            if self.cancel.is_cancelled() {
                debug!("backfill cancelled before next fetch");
                break;
            }

            let page = self.fetch_with_retry(cursor.as_ref()).await?;
            result.pages_fetched += 1;

            if let (Some(resume), Some(first)) = (cursor.as_ref(), page.events.first()) {
                if (first.slot, first.signature.as_str()) < resume.position() {
                    return Err(BackfillError::CursorMismatch(format!(
                        "source rewound to slot {} behind cursor slot {}",
                        first.slot, resume.slot
                    )));
                }
            }

            // Truncate at the target slot so the final store state does not
            // depend on where page boundaries happened to fall.
            let (events, reached_target) = match self.config.to_slot {
                Some(to) => {
                    let kept: Vec<RawChainEvent> = page
                        .events
                        .iter()
                        .filter(|e| e.slot <= to)
                        .cloned()
                        .collect();
                    let truncated = kept.len() < page.events.len();
                    (kept, truncated)
                }
                None => (page.events.clone(), false),
            };

            if !events.is_empty() {
                let projection = self.projector.project(&events)?;
                for violation in &projection.telemetry.transition_violations {
                    registry.observe(violation_anomaly(violation, now_ms()));
                }
                result.duplicates += projection.telemetry.duplicates_dropped;

                let next_cursor = if reached_target {
                    // The page straddled the target; checkpoint at the last
                    // event actually persisted.
                    events.last().map(|e| Cursor {
                        slot: e.slot,
                        signature: e.signature.clone(),
                        event_name: Some(e.event_name.clone()),
                        trace_id: None,
                        trace_span_id: None,
                    })
                } else {
                    page.next_cursor.clone()
                };

                let receipt = self
                    .store
                    .save_with_cursor(&projection.events, next_cursor.as_ref())
                    .await
                    .map_err(BackfillError::Store)?;
                result.processed += receipt.inserted;
                result.duplicates += receipt.duplicates;
                if next_cursor.is_some() {
                    cursor = next_cursor;
                }
            } else if !reached_target {
                if let Some(next_cursor) = page.next_cursor.clone() {
                    self.store
                        .save_cursor(&next_cursor)
                        .await
                        .map_err(BackfillError::Store)?;
                    cursor = Some(next_cursor);
                }
            }

            if page.done || reached_target {
                debug!(done = page.done, reached_target, "backfill loop ending");
                break;
            }
            if page.events.is_empty() && page.next_cursor.is_none() {
                warn!("source returned an empty page without progress; stopping");
                break;
            }
        }

        result.cursor = self.store.cursor().await.map_err(BackfillError::Store)?;
        result.anomalies = registry.records();
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            processed = result.processed,
            duplicates = result.duplicates,
            pages = result.pages_fetched,
            "backfill finished"
        );
        Ok(result)
    }

    async fn fetch_with_retry(
        &self,
        cursor: Option<&Cursor>,
    ) -> Result<ChainPage, BackfillError> {
        let mut attempt: u32 = 0;
        loop {
            match self.source.fetch_page(cursor, self.config.page_size).await {
                Ok(page) => return Ok(page),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let backoff = min(
                        self.config
                            .initial_backoff_ms
                            .saturating_mul(1u64 << attempt.min(32)),
                        self.config.max_backoff_ms,
                    );
                    attempt += 1;
                    warn!(attempt, backoff_ms = backoff, %err, "retrying page fetch");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

//─────────────────────────────
//  Helpers
//─────────────────────────────

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Render a projector lifecycle violation as a coalescable anomaly.
///
/// Shared by the backfill loop and the live ingest path so both produce
/// identical anomaly identities for the same violation.
pub fn violation_anomaly(violation: &TransitionViolation, now_ms: u64) -> AnomalyRecord {
    let mut metadata = BTreeMap::new();
    if let Some(from) = &violation.from_state {
        metadata.insert("fromState".to_string(), CanonicalValue::Str(from.clone()));
    }
    metadata.insert(
        "toState".to_string(),
        CanonicalValue::Str(violation.to_state.clone()),
    );
    metadata.insert(
        "scope".to_string(),
        CanonicalValue::Str(violation.scope.clone()),
    );
    AnomalyRecord {
        anomaly_id: String::new(),
        code: "lifecycle.invalid_transition".to_string(),
        kind: AnomalyKind::TransitionValidation,
        severity: AnomalySeverity::Warning,
        message: format!(
            "invalid {} transition {:?} -> {} at slot {}",
            violation.scope, violation.from_state, violation.to_state, violation.slot
        ),
        task_pda: (violation.scope == "task")
            .then(|| violation.entity.clone().map(Pda::from))
            .flatten(),
        dispute_pda: (violation.scope == "dispute")
            .then(|| violation.entity.clone().map(Pda::from))
            .flatten(),
        source_event_name: Some(violation.source_event_name.clone()),
        signature: Some(violation.signature.clone()),
        slot: Some(violation.slot),
        source_event_sequence: Some(violation.source_event_sequence),
        trace_id: None,
        repeat_count: 1,
        emitted_at_ms: now_ms,
        metadata: CanonicalValue::Object(metadata),
    }
    .finalized()
}
