use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wavecoord::coord::{spawn_event_logger, BlockContext, ExecutionResult};
use wavecoord::{Coordinator, CoordinatorConfig, Executor, PassingVerifier, Plan};

// Example Executor implementation
//
// Fails the first attempt of every block whose prompt mentions tax, so the
// retry path shows up in the logs.
struct FlakyTaxExecutor {
    attempts: AtomicUsize,
}

#[async_trait]
impl Executor for FlakyTaxExecutor {
    fn name(&self) -> &str {
        "flaky-tax"
    }

    async fn execute(&self, ctx: &BlockContext) -> wavecoord::Result<ExecutionResult> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        if ctx.prompt.contains("tax") && attempt % 2 == 0 {
            return Ok(ExecutionResult::failure("tax tables not loaded yet"));
        }
        Ok(ExecutionResult {
            success: true,
            files_modified: ctx.referenced_files.clone(),
            diff: Some(format!("--- {} changes ---", ctx.block_id)),
            tokens_used: 250,
            duration_ms: 300,
            error: None,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    wavecoord::init_tracing(tracing::Level::INFO);

    let plan = Plan::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/plan.yaml"))?;
    let config = CoordinatorConfig::default()
        .with_max_workers(2)
        .with_progress_interval_ms(200);

    let coordinator = Coordinator::with_collaborators(
        config,
        Arc::new(FlakyTaxExecutor {
            attempts: AtomicUsize::new(0),
        }),
        Arc::new(PassingVerifier),
    )?;

    for (depth, wave) in coordinator.preview_waves(&plan).iter().enumerate() {
        println!("wave {}: {}", depth, wave.join(", "));
    }

    let logger = spawn_event_logger(coordinator.subscribe());
    let state = coordinator.execute(plan).await?;

    println!("status: {:?}, progress {}%", state.status, state.progress);
    for block in &state.blocks {
        println!(
            "  {} -> {:?} (retries: {})",
            block.id, block.status, block.retry_count
        );
    }
    for (index, conflict) in state.conflicts.iter().enumerate() {
        println!(
            "  conflict #{} on {}: {} vs {}",
            index, conflict.file, conflict.first_block, conflict.second_block
        );
        coordinator.resolve_conflict(index, "keep-latest")?;
    }
    println!("final result verified: {}", coordinator.verify_final_result());
    println!("{}", serde_json::to_string_pretty(&coordinator.get_workers())?);

    coordinator.dispose();
    logger.await?;
    Ok(())
}
