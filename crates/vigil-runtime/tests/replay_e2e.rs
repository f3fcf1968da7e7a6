use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;

use vigil_comparator::{AlertSink, AnomalyRecord, ComparisonStatus, TrajectoryEvent};
use vigil_runtime::{ReplayBridge, ReplayConfig, StoreKind, VigilConfig};
use vigil_store_core::{TimelineFilter, TimelineStore};
use vigil_types::{RawChainEvent, TrajectoryKind};

//──────────────────────────────────────────────────────────────────────────────
//  Fixtures
//──────────────────────────────────────────────────────────────────────────────

fn event(name: &str, slot: u64, signature: &str, task: &str) -> RawChainEvent {
    RawChainEvent {
        event_name: name.to_string(),
        payload: json!({ "taskPda": task }),
        slot,
        signature: signature.to_string(),
        timestamp_ms: Some(slot * 1_000),
        source_event_sequence: None,
        trace_context: None,
    }
}

fn lifecycle(task: &str) -> Vec<RawChainEvent> {
    vec![
        event("taskCreated", 10, "A", task),
        event("taskClaimed", 20, "B", task),
        event("taskCompleted", 30, "C", task),
    ]
}

fn bridge() -> ReplayBridge {
    ReplayBridge::new(ReplayConfig::default()).unwrap()
}

#[derive(Default)]
struct CountingSink {
    emitted: AtomicU32,
}

impl AlertSink for CountingSink {
    fn emit(&self, _anomaly: &AnomalyRecord) -> anyhow::Result<()> {
        self.emitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

//──────────────────────────────────────────────────────────────────────────────
//  Tests
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_lands_three_ordered_records() {
    let bridge = bridge();
    let report = bridge.ingest(&lifecycle("task-1")).await.unwrap();

    assert_eq!(report.records_saved, 3);
    assert_eq!(report.telemetry.duplicates_dropped, 0);
    assert!(report.anomalies.is_empty());

    let records = bridge
        .store()
        .query(&TimelineFilter::default())
        .await
        .unwrap();
    let kinds: Vec<TrajectoryKind> = records.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TrajectoryKind::Discovered,
            TrajectoryKind::Claimed,
            TrajectoryKind::Completed,
        ]
    );
    let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn refeeding_a_batch_drops_every_duplicate() {
    let bridge = bridge();
    bridge.ingest(&lifecycle("task-1")).await.unwrap();
    let report = bridge.ingest(&lifecycle("task-1")).await.unwrap();

    assert_eq!(report.records_saved, 0);
    assert_eq!(report.telemetry.duplicates_dropped, 3);
    assert_eq!(bridge.store().event_count().await.unwrap(), 3);
}

#[tokio::test]
async fn arrival_order_within_a_slot_does_not_change_the_store() {
    let same_slot = vec![
        event("taskCreated", 10, "A", "task-1"),
        event("taskClaimed", 10, "A", "task-1"),
        event("taskCompleted", 10, "A", "task-1"),
    ];
    let mut reversed = same_slot.clone();
    reversed.reverse();

    let forward_bridge = bridge();
    forward_bridge.ingest(&same_slot).await.unwrap();
    let reverse_bridge = bridge();
    reverse_bridge.ingest(&reversed).await.unwrap();

    let forward = forward_bridge
        .store()
        .query(&TimelineFilter::default())
        .await
        .unwrap();
    let reverse = reverse_bridge
        .store()
        .query(&TimelineFilter::default())
        .await
        .unwrap();
    assert_eq!(forward, reverse);
    assert_eq!(forward[0].kind, TrajectoryKind::Discovered);
}

#[tokio::test]
async fn lifecycle_violations_alert_and_coalesce() {
    let sink = Arc::new(CountingSink::default());
    let bridge = ReplayBridge::new(ReplayConfig::default())
        .unwrap()
        .with_alert_sink(sink.clone());

    let skipping = vec![
        event("taskCreated", 1, "A", "task-1"),
        event("taskCompleted", 2, "B", "task-1"),
    ];
    let report = bridge.ingest(&skipping).await.unwrap();
    assert_eq!(report.records_saved, 2);
    assert_eq!(report.anomalies.len(), 1);
    assert_eq!(report.anomalies[0].code, "lifecycle.invalid_transition");
    assert_eq!(sink.emitted.load(Ordering::SeqCst), 1);

    // The identical violation observed again coalesces onto the same id.
    bridge.ingest(&skipping).await.unwrap();
    let anomalies = bridge.anomalies().await;
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].repeat_count, 2);
}

#[tokio::test]
async fn strict_mode_refuses_the_batch() {
    let bridge = ReplayBridge::new(ReplayConfig {
        strict: true,
        ..Default::default()
    })
    .unwrap();

    let skipping = vec![
        event("taskCreated", 1, "A", "task-1"),
        event("taskCompleted", 2, "B", "task-1"),
    ];
    assert!(bridge.ingest(&skipping).await.is_err());
    assert_eq!(bridge.store().event_count().await.unwrap(), 0);
}

#[tokio::test]
async fn comparison_round_trip_through_the_store() {
    let bridge = bridge();
    bridge.ingest(&lifecycle("task-1")).await.unwrap();

    let projected = bridge
        .store()
        .query(&TimelineFilter::default())
        .await
        .unwrap();
    let mut local: Vec<TrajectoryEvent> = projected
        .iter()
        .map(|r| TrajectoryEvent {
            task_pda: r.task_pda.clone(),
            kind: r.kind,
            timestamp_ms: r.timestamp_ms,
            source_event_sequence: Some(r.source_event_sequence),
            projection_hash: r.projection_hash.clone(),
        })
        .collect();

    let report = bridge
        .compare(&TimelineFilter::default(), &local)
        .await
        .unwrap();
    assert_eq!(report.status, ComparisonStatus::Matched);
    assert_eq!(report.local_replay_hash, report.projected_replay_hash);

    // Tamper with the local replay and the bridge surfaces the mismatch.
    local[2].projection_hash = "0badc0de".to_string();
    let report = bridge
        .compare(&TimelineFilter::default(), &local)
        .await
        .unwrap();
    assert_eq!(report.status, ComparisonStatus::Mismatched);
    assert_eq!(report.mismatch_count, 1);
    assert_eq!(
        report.first_mismatch.unwrap().code,
        "replay.hash_mismatch"
    );
}

#[tokio::test]
async fn durable_store_survives_reopen_with_dedup_intact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("timeline.db");
    let config = || ReplayConfig {
        store: vigil_runtime::StoreConfig {
            kind: StoreKind::Durable,
            path: Some(path.clone()),
            ..Default::default()
        },
        ..Default::default()
    };

    {
        let bridge = ReplayBridge::new(config()).unwrap();
        let report = bridge.ingest(&lifecycle("task-1")).await.unwrap();
        assert_eq!(report.records_saved, 3);
    }

    let bridge = ReplayBridge::new(config()).unwrap();
    assert_eq!(bridge.store().event_count().await.unwrap(), 3);
    let report = bridge.ingest(&lifecycle("task-1")).await.unwrap();
    assert_eq!(report.records_saved, 0);
    assert_eq!(report.telemetry.duplicates_dropped, 3);
}

#[tokio::test]
async fn bridge_backfill_drains_a_source_with_checkpoints() {
    use vigil_backfill::{ChainPage, ChainSource, ChainSourceError};
    use vigil_types::Cursor;

    struct PagedSource {
        events: Vec<RawChainEvent>,
    }

    #[async_trait::async_trait]
    impl ChainSource for PagedSource {
        async fn fetch_page(
            &self,
            cursor: Option<&Cursor>,
            page_size: u32,
        ) -> Result<ChainPage, ChainSourceError> {
            let start = match cursor {
                Some(c) => self
                    .events
                    .iter()
                    .position(|e| (e.slot, e.signature.as_str()) > (c.slot, c.signature.as_str()))
                    .unwrap_or(self.events.len()),
                None => 0,
            };
            let end = (start + page_size as usize).min(self.events.len());
            let events = self.events[start..end].to_vec();
            let next_cursor = events.last().map(|e| Cursor {
                slot: e.slot,
                signature: e.signature.clone(),
                event_name: Some(e.event_name.clone()),
                trace_id: None,
                trace_span_id: None,
            });
            Ok(ChainPage {
                events,
                next_cursor,
                done: end == self.events.len(),
            })
        }
    }

    let bridge = ReplayBridge::new(ReplayConfig {
        backfill: vigil_runtime::BackfillSection {
            page_size: 2,
            to_slot: None,
        },
        ..Default::default()
    })
    .unwrap();

    let events: Vec<RawChainEvent> = (0..6)
        .map(|i| event("taskCreated", 100 + i, &format!("S{i}"), &format!("t{i}")))
        .collect();
    let result = bridge
        .backfill(Arc::new(PagedSource { events }))
        .await
        .unwrap();

    assert_eq!(result.processed, 6);
    assert_eq!(result.pages_fetched, 3);
    assert_eq!(result.cursor.unwrap().slot, 105);
    assert_eq!(bridge.store().event_count().await.unwrap(), 6);
}

#[tokio::test]
async fn disabled_replay_yields_no_bridge() {
    let config = VigilConfig::from_yaml("replay:\n  enabled: false\n").unwrap();
    assert!(ReplayBridge::from_config(&config).unwrap().is_none());
}

#[tokio::test]
async fn config_file_drives_the_bridge() {
    let yaml = r#"
replay:
  trace_id: e2e-session
  tracing:
    sample_rate: 1.0
"#;
    let config = VigilConfig::from_yaml(yaml).unwrap();
    let bridge = ReplayBridge::from_config(&config).unwrap().unwrap();
    bridge.ingest(&lifecycle("task-1")).await.unwrap();

    let records = bridge
        .store()
        .query(&TimelineFilter::default())
        .await
        .unwrap();
    assert!(records.iter().all(|r| r.trace.trace_id == "e2e-session"));
    assert!(records.iter().all(|r| r.trace.sampled));
}
