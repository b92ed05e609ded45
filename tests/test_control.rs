//! Control surface: pause, resume, cancel, retry, conflicts, reset, dispose

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

use async_broadcast::RecvError;
use wavecoord::coord::{BlockStatus, RunStatus, WorkerStatus};
use wavecoord::{
    CoordError, Coordinator, CoordinatorConfig, PassingVerifier, Plan, SimulatedExecutor, Step,
};

fn coordinator(workers: usize, delay_ms: u64) -> Coordinator {
    coordinator_with(
        CoordinatorConfig::default()
            .with_max_workers(workers)
            .with_progress_interval_ms(20),
        delay_ms,
    )
}

fn coordinator_with(config: CoordinatorConfig, delay_ms: u64) -> Coordinator {
    Coordinator::with_collaborators(
        config,
        Arc::new(SimulatedExecutor::new(Duration::from_millis(delay_ms))),
        Arc::new(PassingVerifier),
    )
    .unwrap()
}

fn two_step_chain() -> Plan {
    Plan::new("p", "chain")
        .with_step(Step::new("1", "first").with_files(["A.cs"]))
        .with_step(Step::new("2", "second").with_files(["B.cs"]).with_dep("1"))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(60)).await;
}

/// Cancel mid-run stops workers, clears locks and records the end time
#[tokio::test]
async fn test_cancel_during_run() {
    let coord = coordinator(2, 2_000);
    let runner = {
        let coord = coord.clone();
        tokio::spawn(async move { coord.execute(two_step_chain()).await })
    };
    settle().await;

    assert_eq!(coord.status(), RunStatus::Executing);
    assert_eq!(coord.get_workers()[0].status, WorkerStatus::Working);
    assert_eq!(coord.held_locks().len(), 1);

    coord.cancel().unwrap();
    assert!(coord.held_locks().is_empty());

    let state = tokio::time::timeout(Duration::from_secs(1), runner)
        .await
        .expect("run did not stop after cancel")
        .unwrap()
        .unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);
    assert!(state.completed_at.is_some());
    assert_eq!(state.workers[0].status, WorkerStatus::Cancelled);
    assert_eq!(state.workers[1].status, WorkerStatus::Idle);
    assert!(state.blocks.iter().all(|b| b.status == BlockStatus::Pending));
    assert!(state.completed_blocks.is_empty());
}

/// Work already handed to the executor runs to completion after a cancel
#[tokio::test]
async fn test_cancel_lets_in_flight_executor_finish() {
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use wavecoord::coord::{BlockContext, ExecutionResult};
    use wavecoord::Executor;

    struct SlowWriter {
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Executor for SlowWriter {
        async fn execute(&self, ctx: &BlockContext) -> wavecoord::Result<ExecutionResult> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(ExecutionResult::success(ctx.referenced_files.clone()))
        }
    }

    let finished = Arc::new(AtomicBool::new(false));
    let coord = Coordinator::with_collaborators(
        CoordinatorConfig::default().with_max_workers(1),
        Arc::new(SlowWriter {
            finished: finished.clone(),
        }),
        Arc::new(PassingVerifier),
    )
    .unwrap();
    let runner = {
        let coord = coord.clone();
        tokio::spawn(async move { coord.execute(two_step_chain()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    coord.cancel().unwrap();
    let state = runner.await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);
    assert!(!finished.load(Ordering::SeqCst));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(finished.load(Ordering::SeqCst));
    // The late result is discarded
    let block = coord.get_state().block("block-1-default").cloned().unwrap();
    assert_eq!(block.status, BlockStatus::Pending);
    assert!(block.result.is_none());
}

/// Pause holds back the next wave; resume lets the run finish
#[tokio::test]
async fn test_pause_and_resume() {
    let coord = coordinator(1, 150);
    let runner = {
        let coord = coord.clone();
        tokio::spawn(async move { coord.execute(two_step_chain()).await })
    };
    settle().await;

    coord.pause().unwrap();
    assert_eq!(coord.status(), RunStatus::Paused);
    assert_eq!(coord.get_workers()[0].status, WorkerStatus::Paused);
    assert!(coord.pause().is_err());

    // The in-flight block finishes; the dependent one is held back
    tokio::time::sleep(Duration::from_millis(300)).await;
    let blocks = coord.get_work_blocks();
    assert_eq!(blocks[0].status, BlockStatus::Completed);
    assert_eq!(blocks[1].status, BlockStatus::Pending);
    assert_eq!(coord.status(), RunStatus::Paused);

    coord.resume().unwrap();
    let state = runner.await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.completed_blocks.len(), 2);
}

/// Cancelling a paused run ends it as cancelled
#[tokio::test]
async fn test_cancel_while_paused() {
    let coord = coordinator(1, 20);
    let runner = {
        let coord = coord.clone();
        tokio::spawn(async move { coord.execute(two_step_chain()).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    coord.pause().unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    coord.cancel().unwrap();
    let state = runner.await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(
        state.block("block-2-default").map(|b| b.status),
        Some(BlockStatus::Pending)
    );
}

/// Resume without a pause is rejected
#[tokio::test]
async fn test_resume_requires_pause() {
    let coord = coordinator(1, 5);
    let err = coord.resume().unwrap_err();
    assert_eq!(err.category(), "invalid_state");
    assert!(coord.cancel().is_err());
}

/// A second execute while one is running is refused
#[tokio::test]
async fn test_execute_while_running_is_rejected() {
    let coord = coordinator(1, 200);
    let runner = {
        let coord = coord.clone();
        tokio::spawn(async move { coord.execute(two_step_chain()).await })
    };
    settle().await;

    let err = coord.execute(two_step_chain()).await.unwrap_err();
    assert!(matches!(err, CoordError::Configuration { .. }));

    coord.cancel().unwrap();
    runner.await.unwrap().unwrap();
}

/// A finished run must be reset before the next one
#[tokio::test]
async fn test_reset_restores_fresh_state() {
    let config = CoordinatorConfig::default()
        .with_max_workers(2)
        .with_progress_interval_ms(20);
    let coord = coordinator_with(config.clone(), 5);
    coord.execute(two_step_chain()).await.unwrap();
    assert!(coord.execute(two_step_chain()).await.is_err());

    coord.reset().unwrap();
    let mut state = coord.get_state();
    let mut fresh = coordinator_with(config, 5).get_state();
    fresh.run_id = state.run_id.clone();
    state.started_at = None;
    state.completed_at = None;
    assert_eq!(state, fresh);

    let rerun = coord.execute(two_step_chain()).await.unwrap();
    assert_eq!(rerun.status, RunStatus::Completed);
}

/// Reset refuses to tear down a live run
#[tokio::test]
async fn test_reset_during_run_is_rejected() {
    let coord = coordinator(1, 200);
    let runner = {
        let coord = coord.clone();
        tokio::spawn(async move { coord.execute(two_step_chain()).await })
    };
    settle().await;

    assert!(coord.reset().is_err());
    coord.cancel().unwrap();
    runner.await.unwrap().unwrap();
    coord.reset().unwrap();
    assert_eq!(coord.status(), RunStatus::Idle);
}

/// A terminally failed worker can be put back in service
#[tokio::test]
async fn test_retry_worker() {
    use async_trait::async_trait;
    use wavecoord::coord::{BlockContext, ExecutionResult};
    use wavecoord::Executor;

    struct AlwaysFails;

    #[async_trait]
    impl Executor for AlwaysFails {
        async fn execute(&self, _ctx: &BlockContext) -> wavecoord::Result<ExecutionResult> {
            Ok(ExecutionResult::failure("no"))
        }
    }

    let coord = Coordinator::with_collaborators(
        CoordinatorConfig::default()
            .with_max_workers(1)
            .with_retries(false, 0),
        Arc::new(AlwaysFails),
        Arc::new(PassingVerifier),
    )
    .unwrap();

    let state = coord
        .execute(Plan::new("p", "fail").with_step(Step::new("1", "a")))
        .await
        .unwrap();
    assert_eq!(state.workers[0].status, WorkerStatus::Failed);
    assert_eq!(state.failed_blocks.len(), 1);

    coord.retry_worker("worker-1").unwrap();
    let state = coord.get_state();
    assert_eq!(state.workers[0].status, WorkerStatus::Idle);
    assert!(state.workers[0].last_error.is_none());
    assert_eq!(state.blocks[0].status, BlockStatus::Pending);
    assert!(state.failed_blocks.is_empty());

    let err = coord.retry_worker("worker-1").unwrap_err();
    assert_eq!(err.category(), "invalid_state");
    let err = coord.retry_worker("worker-9").unwrap_err();
    assert_eq!(err.category(), "not_found");
}

/// A worker whose block failed for good stays failed, so it can be retried
#[tokio::test]
async fn test_failed_worker_is_not_reused() {
    use async_trait::async_trait;
    use wavecoord::coord::{BlockContext, ExecutionResult};
    use wavecoord::Executor;

    struct FailsFirstBlock;

    #[async_trait]
    impl Executor for FailsFirstBlock {
        async fn execute(&self, ctx: &BlockContext) -> wavecoord::Result<ExecutionResult> {
            if ctx.block_id == "block-1-default" {
                return Ok(ExecutionResult::failure("no"));
            }
            Ok(ExecutionResult::success(vec![]))
        }
    }

    let coord = Coordinator::with_collaborators(
        CoordinatorConfig::default()
            .with_max_workers(1)
            .with_retries(false, 0),
        Arc::new(FailsFirstBlock),
        Arc::new(PassingVerifier),
    )
    .unwrap();

    let state = tokio::time::timeout(Duration::from_secs(2), coord.execute(two_step_chain()))
        .await
        .expect("run stalled without a live worker")
        .unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.workers[0].status, WorkerStatus::Failed);
    assert_eq!(
        state.workers[0].current_block.as_deref(),
        Some("block-1-default")
    );
    let dependent = state.block("block-2-default").cloned().unwrap();
    assert_eq!(dependent.status, BlockStatus::Failed);
    assert_eq!(dependent.last_error.as_deref(), Some("no worker left to run it"));

    coord.retry_worker("worker-1").unwrap();
    let state = coord.get_state();
    assert_eq!(state.workers[0].status, WorkerStatus::Idle);
    assert_eq!(
        state.block("block-1-default").map(|b| b.status),
        Some(BlockStatus::Pending)
    );
    assert_eq!(state.failed_blocks, vec!["block-2-default".to_string()]);
}

/// Dropping an execute future does not leave the coordinator busy
#[tokio::test]
async fn test_dropped_execute_releases_coordinator() {
    let coord = coordinator(1, 200);
    let abandoned =
        tokio::time::timeout(Duration::from_millis(30), coord.execute(two_step_chain())).await;
    assert!(abandoned.is_err());

    coord.reset().unwrap();
    assert_eq!(coord.initialize_workers(Some(2)).unwrap().len(), 2);

    let coord = coordinator(1, 5);
    let _ = tokio::time::timeout(Duration::from_millis(1), coord.execute(two_step_chain())).await;
    coord.reset().unwrap();
    let state = coord.execute(two_step_chain()).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
}

/// Conflicts block the final verdict until each is resolved
#[tokio::test]
async fn test_resolve_conflicts() {
    let plan = Plan::new("p", "overlap")
        .with_step(Step::new("1", "a").with_files(["Foo.cs", "Bar.cs"]))
        .with_step(Step::new("2", "b").with_files(["Foo.cs", "Bar.cs"]));
    let coord = coordinator(2, 5);

    let state = coord.execute(plan).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.conflicts.len(), 2);
    assert!(!coord.verify_final_result());

    let resolved = coord.resolve_conflict(0, "keep-first").unwrap();
    assert!(resolved.resolved);
    assert!(!coord.verify_final_result());
    coord.resolve_conflict(1, "manual").unwrap();
    assert!(coord.verify_final_result());

    assert!(coord.resolve_conflict(2, "x").is_err());
}

/// Worker set can be rebuilt between runs
#[tokio::test]
async fn test_initialize_workers() {
    let coord = coordinator(2, 5);
    let workers = coord.initialize_workers(Some(4)).unwrap();
    assert_eq!(workers.len(), 4);
    assert_eq!(coord.get_workers().len(), 4);

    assert!(coord.initialize_workers(Some(0)).is_err());
    assert_eq!(coord.initialize_workers(None).unwrap().len(), 2);
}

/// Progress notifications rise to 100 over a run
#[tokio::test]
async fn test_progress_updates() {
    use wavecoord::CoordinatorEvent;

    let coord = coordinator(1, 80);
    let mut rx = coord.subscribe();
    let state = coord.execute(two_step_chain()).await.unwrap();
    assert_eq!(state.progress, 100);

    let mut seen = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        if let CoordinatorEvent::Progress { progress } = envelope.event {
            seen.push(progress);
        }
    }
    assert!(seen.len() >= 2);
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|w| w[0] != w[1]));
}

/// Dispose closes subscriptions and retires the coordinator
#[tokio::test]
async fn test_dispose() {
    let coord = coordinator(1, 5);
    let mut rx = coord.subscribe();
    coord.dispose();

    assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    assert!(coord.execute(two_step_chain()).await.is_err());
    // Second dispose is a no-op
    coord.dispose();
}
