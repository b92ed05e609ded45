//! Executor and Verifier seams
//!
//! The coordinator never modifies code itself. It hands a block's context to
//! an `Executor` and optionally asks a `Verifier` to check the outcome.
//! Implementations are pure work: they report results and never touch run
//! state.

use async_trait::async_trait;
use std::time::{Duration, Instant};

use crate::core::errors::Result;
use crate::coord::types::{
    BlockContext, ExecutionResult, VerificationCheck, VerificationResult, WorkBlock,
};

/// Performs the work for one block
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        "executor"
    }

    /// Execute one attempt of a block.
    ///
    /// Returning `Ok` with `success == false` and returning `Err` are both
    /// treated as a failed attempt.
    async fn execute(&self, ctx: &BlockContext) -> Result<ExecutionResult>;
}

/// Checks a block's changes before they count as completed
#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &str {
        "verifier"
    }

    async fn verify(&self, block: &WorkBlock, result: &ExecutionResult)
        -> Result<VerificationResult>;
}

/// Stand-in executor: waits a fixed delay and reports every referenced file
/// as modified
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    delay: Duration,
    tokens_per_file: u64,
}

impl SimulatedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            tokens_per_file: 100,
        }
    }

    pub fn with_tokens_per_file(mut self, tokens: u64) -> Self {
        self.tokens_per_file = tokens;
        self
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn execute(&self, ctx: &BlockContext) -> Result<ExecutionResult> {
        let started = Instant::now();
        tracing::debug!(block_id = %ctx.block_id, "Simulating work for {:?}", self.delay);
        tokio::time::sleep(self.delay).await;

        Ok(ExecutionResult {
            success: true,
            files_modified: ctx.referenced_files.clone(),
            diff: None,
            tokens_used: self.tokens_per_file * ctx.referenced_files.len().max(1) as u64,
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
        })
    }
}

/// Stand-in verifier: passes whenever the executor reported success
#[derive(Debug, Clone, Copy, Default)]
pub struct PassingVerifier;

#[async_trait]
impl Verifier for PassingVerifier {
    fn name(&self) -> &str {
        "passing"
    }

    async fn verify(
        &self,
        _block: &WorkBlock,
        result: &ExecutionResult,
    ) -> Result<VerificationResult> {
        let check = VerificationCheck {
            name: "execution".to_string(),
            passed: result.success,
            message: result.error.clone(),
        };
        Ok(VerificationResult {
            passed: check.passed,
            checks: vec![check],
        })
    }
}
