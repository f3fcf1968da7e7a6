//! The replay bridge: wires the configured store, projector, comparator,
//! backfill, and alert dispatch into one ingestion surface.
//!
//! Live path: `ingest` projects a batch and persists it. Reconstruction
//! path: `backfill` drains a `ChainSource` under the resumable cursor.
//! Either way, lifecycle anomalies coalesce in one registry and Warning+
//! anomalies go to the alert sink, whose failures never propagate.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{info, info_span};

use vigil_backfill::{BackfillConfig, BackfillResult, BackfillService, ChainSource};
use vigil_comparator::{
    dispatch_alert, AlertSink, AnomalyRecord, AnomalyRegistry, Comparator, ComparatorConfig,
    ComparatorStrictness, ComparisonReport, TrajectoryEvent,
};
use vigil_projector::{ProjectionTelemetry, Projector, ProjectorConfig};
use vigil_store_core::{TimelineFilter, TimelineRecord, TimelineStore};
use vigil_store_memory::MemoryTimelineStore;
use vigil_store_sled::SledTimelineStore;
use vigil_types::RawChainEvent;

use crate::config::{ReplayConfig, StoreKind};

/// Outcome of one live-path ingestion.
#[derive(Debug, Clone)]
pub struct IngestReport {
    /// Projection telemetry, with store-level duplicate suppression folded
    /// into `duplicates_dropped`.
    pub telemetry: ProjectionTelemetry,
    /// Records newly persisted by this batch.
    pub records_saved: u64,
    /// Anomalies the batch produced, after coalescing.
    pub anomalies: Vec<AnomalyRecord>,
}

/// Deterministic observability and replay bridge.
pub struct ReplayBridge {
    config: ReplayConfig,
    store: Arc<dyn TimelineStore>,
    projector: Projector,
    comparator: Comparator,
    registry: Mutex<AnomalyRegistry>,
    alert_sink: Option<Arc<dyn AlertSink>>,
}

impl ReplayBridge {
    /// Build a bridge from the full configuration, honoring the
    /// `replay.enabled` switch: a disabled replay section yields `None`.
    pub fn from_config(config: &crate::config::VigilConfig) -> Result<Option<Self>> {
        if !config.replay.enabled {
            return Ok(None);
        }
        Self::new(config.replay.clone()).map(Some)
    }

    /// Build a bridge with the store the configuration names.
    pub fn new(config: ReplayConfig) -> Result<Self> {
        let store: Arc<dyn TimelineStore> = match config.store.kind {
            StoreKind::Memory => Arc::new(MemoryTimelineStore::with_retention(
                config.store.retention,
            )),
            StoreKind::Durable => {
                let path = config
                    .store
                    .path
                    .as_ref()
                    .context("durable store requires replay.store.path")?;
                Arc::new(
                    SledTimelineStore::open_with_retention(path, config.store.retention)
                        .with_context(|| {
                            format!("failed to open timeline store at {}", path.display())
                        })?,
                )
            }
        };
        Ok(Self::with_store(config, store))
    }

    /// Build a bridge over a caller-supplied store.
    pub fn with_store(config: ReplayConfig, store: Arc<dyn TimelineStore>) -> Self {
        let projector = Projector::new(ProjectorConfig {
            strict: config.strict,
            trace_id: config.trace_id.clone(),
            sample_rate: config.tracing.sample_rate,
        });
        let comparator = Comparator::new(ComparatorConfig {
            strictness: if config.comparator.strict {
                ComparatorStrictness::Strict
            } else {
                ComparatorStrictness::Lenient
            },
            timestamp_epsilon_ms: config.comparator.timestamp_epsilon_ms,
        });
        Self {
            config,
            store,
            projector,
            comparator,
            registry: Mutex::new(AnomalyRegistry::new()),
            alert_sink: None,
        }
    }

    /// Attach an alert sink for Warning/Error anomalies.
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    /// The timeline store backing this bridge.
    pub fn store(&self) -> Arc<dyn TimelineStore> {
        Arc::clone(&self.store)
    }

    /// Live path: project a batch of raw events and persist the records.
    pub async fn ingest(&self, events: &[RawChainEvent]) -> Result<IngestReport> {
        let _span = self.span("replay.ingest");
        let projection = self.projector.project(events)?;
        let receipt = self.store.save(&projection.events).await?;

        let mut telemetry = projection.telemetry;
        telemetry.duplicates_dropped += receipt.duplicates;

        let anomalies = self
            .register_violations(&telemetry)
            .await;
        info!(
            saved = receipt.inserted,
            duplicates = telemetry.duplicates_dropped,
            "batch ingested"
        );
        Ok(IngestReport {
            telemetry,
            records_saved: receipt.inserted,
            anomalies,
        })
    }

    /// Reconstruction path: drain a chain source under the resumable
    /// cursor, then fold its anomalies into the bridge registry.
    pub async fn backfill(&self, source: Arc<dyn ChainSource>) -> Result<BackfillResult> {
        let _span = self.span("replay.backfill");
        let service = BackfillService::new(
            source,
            Arc::clone(&self.store),
            self.projector.clone(),
            BackfillConfig {
                to_slot: self.config.backfill.to_slot,
                page_size: self.config.backfill.page_size,
                ..BackfillConfig::default()
            },
        );
        let mut result = service.run().await?;

        let mut registry = self.registry.lock().await;
        let mut coalesced = Vec::with_capacity(result.anomalies.len());
        for anomaly in result.anomalies.drain(..) {
            let (live, _) = registry.observe(anomaly);
            let live = live.clone();
            dispatch_alert(self.alert_sink.as_deref(), &live);
            coalesced.push(live);
        }
        result.anomalies = coalesced;
        Ok(result)
    }

    /// Compare a stored timeline slice against a local trajectory.
    pub async fn compare(
        &self,
        filter: &TimelineFilter,
        local: &[TrajectoryEvent],
    ) -> Result<ComparisonReport> {
        let _span = self.span("replay.compare");
        let projected: Vec<TimelineRecord> = self.store.query(filter).await?;
        let mut report = self.comparator.compare(&projected, local, now_ms());

        let mut registry = self.registry.lock().await;
        let mut coalesced = Vec::with_capacity(report.anomalies.len());
        for anomaly in report.anomalies.drain(..) {
            let (live, _) = registry.observe(anomaly);
            let live = live.clone();
            dispatch_alert(self.alert_sink.as_deref(), &live);
            coalesced.push(live);
        }
        report.anomalies = coalesced;
        Ok(report)
    }

    /// Every anomaly observed by this bridge so far, coalesced.
    pub async fn anomalies(&self) -> Vec<AnomalyRecord> {
        self.registry.lock().await.records()
    }

    async fn register_violations(&self, telemetry: &ProjectionTelemetry) -> Vec<AnomalyRecord> {
        if telemetry.transition_violations.is_empty() {
            return Vec::new();
        }
        let mut registry = self.registry.lock().await;
        let mut out = Vec::new();
        for violation in &telemetry.transition_violations {
            let (live, _) =
                registry.observe(vigil_backfill::violation_anomaly(violation, now_ms()));
            let live = live.clone();
            dispatch_alert(self.alert_sink.as_deref(), &live);
            out.push(live);
        }
        out
    }

    fn span(&self, name: &'static str) -> Option<tracing::span::EnteredSpan> {
        if !self.config.tracing.emit_otel {
            return None;
        }
        Some(info_span!("vigil", op = name, trace_id = %self.config.trace_id).entered())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
