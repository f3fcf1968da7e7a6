use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use vigil_runtime::run_scheduler;
use vigil_speculation::{
    Commitment, CommitmentStatus, SchedulerConfig, SpeculativeScheduler,
};
use vigil_types::{AgentPda, DependencyType, TaskPda};

fn commitment(task: &str, source: Option<&str>, created_at_ms: u64) -> Commitment {
    Commitment {
        task_pda: TaskPda::from(task),
        agent_pda: AgentPda::from("agent-1"),
        result_hash_commitment: vec![0xee; 32],
        stake_lamports: 10,
        status: CommitmentStatus::Pending,
        dependents: BTreeSet::new(),
        created_at_ms,
        source_task_pda: source.map(TaskPda::from),
    }
}

fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[tokio::test]
async fn driver_sweeps_timeouts_and_cascades() {
    let mut scheduler = SpeculativeScheduler::new(SchedulerConfig {
        proof_timeout_ms: 1_000,
        ..Default::default()
    });
    scheduler
        .register_dependency(
            TaskPda::from("C"),
            TaskPda::from("P"),
            DependencyType::Data,
        )
        .unwrap();
    // P's deadline expired long ago; C's is far in the future, so only the
    // parent times out and the child is reached by the cascade.
    scheduler
        .begin_speculation(commitment("P", None, 5_000), None)
        .unwrap();
    scheduler
        .begin_speculation(commitment("C", Some("P"), wall_clock_ms() + 3_600_000), None)
        .unwrap();

    let scheduler = Arc::new(Mutex::new(scheduler));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_scheduler(
        Arc::clone(&scheduler),
        Duration::from_millis(5),
        cancel.clone(),
        |_| {},
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    handle.await.unwrap();

    let scheduler = scheduler.lock().await;
    assert_eq!(
        scheduler
            .ledger()
            .get_by_task(&TaskPda::from("P"))
            .unwrap()
            .status,
        CommitmentStatus::Failed
    );
    assert_eq!(
        scheduler
            .ledger()
            .get_by_task(&TaskPda::from("C"))
            .unwrap()
            .status,
        CommitmentStatus::RolledBack
    );
    assert!(scheduler.metrics().speculative_misses >= 1);
}
