//! Core types for wave-scheduled execution
//!
//! Everything here is plain data: snapshots of these types are what
//! subscribers and callers of `get_state()` see.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::plan::Plan;

/// Lifecycle of a work block within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl BlockStatus {
    /// Completed and failed blocks both satisfy their dependents
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Worker slot state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Assigned,
    Working,
    Verifying,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Planning,
    Executing,
    Paused,
    Merging,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Statuses in which the wave loop keeps going
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Executing | Self::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Payload handed to the executor for one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    pub block_id: String,
    pub step_id: String,
    /// Instruction text for the block
    pub prompt: String,
    /// Policy slice the block operates under (its sector)
    pub policy: Option<String>,
    pub referenced_files: Vec<String>,
}

/// What the executor reports back for one attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub files_modified: Vec<String>,
    pub diff: Option<String>,
    pub tokens_used: u64,
    pub duration_ms: u64,
    /// Executor-supplied reason when `success` is false
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(files_modified: Vec<String>) -> Self {
        Self {
            success: true,
            files_modified,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub checks: Vec<VerificationCheck>,
}

impl VerificationResult {
    pub fn failed_checks(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Recorded outcome of a block's successful attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResult {
    pub execution: ExecutionResult,
    pub verification: Option<VerificationResult>,
}

/// Atomic unit of scheduled execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkBlock {
    pub id: String,
    pub step_id: String,
    pub files: Vec<String>,
    pub sector: Option<String>,
    pub context: BlockContext,
    pub status: BlockStatus,
    pub assigned_worker: Option<String>,
    /// Ids of blocks that must settle before this one is dispatched
    pub dependencies: Vec<String>,
    pub retry_count: u32,
    pub result: Option<BlockResult>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A logical execution slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub status: WorkerStatus,
    pub current_step: Option<String>,
    pub current_block: Option<String>,
    pub target_files: Vec<String>,
    pub progress: u8,
    pub logs: VecDeque<WorkerLogEntry>,
    pub last_result: Option<BlockResult>,
    pub last_error: Option<String>,
}

impl Worker {
    pub fn new(index: usize) -> Self {
        Self {
            id: format!("worker-{}", index + 1),
            name: format!("Worker {}", index + 1),
            status: WorkerStatus::Idle,
            current_step: None,
            current_block: None,
            target_files: Vec::new(),
            progress: 0,
            logs: VecDeque::new(),
            last_result: None,
            last_error: None,
        }
    }

    /// Append a log entry, keeping only the newest `capacity` entries
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, capacity: usize) {
        self.logs.push_back(WorkerLogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
        while self.logs.len() > capacity {
            self.logs.pop_front();
        }
    }

    /// Detach from the current block and go back to idle
    pub fn release(&mut self) {
        self.status = WorkerStatus::Idle;
        self.current_step = None;
        self.current_block = None;
        self.target_files.clear();
        self.progress = 0;
    }

    /// Keep the identity, drop everything else
    pub fn clear(&mut self) {
        self.release();
        self.logs.clear();
        self.last_result = None;
        self.last_error = None;
    }
}

/// Exclusive claim on a file path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLock {
    pub file: String,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictType {
    #[serde(rename = "overlapping-edit")]
    OverlappingEdit,
}

/// Two completed blocks touched the same file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub file: String,
    pub first_block: String,
    pub second_block: String,
    pub conflict_type: ConflictType,
    pub resolution: Option<String>,
    pub resolved: bool,
}

/// All mutable state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    pub plan: Option<Plan>,
    pub blocks: Vec<WorkBlock>,
    pub workers: Vec<Worker>,
    pub completed_blocks: Vec<String>,
    pub failed_blocks: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub conflicts: Vec<MergeConflict>,
    pub error: Option<String>,
}

impl RunState {
    pub fn new(workers: Vec<Worker>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            status: RunStatus::Idle,
            plan: None,
            blocks: Vec::new(),
            workers,
            completed_blocks: Vec::new(),
            failed_blocks: Vec::new(),
            started_at: None,
            completed_at: None,
            progress: 0,
            conflicts: Vec::new(),
            error: None,
        }
    }

    pub fn block(&self, block_id: &str) -> Option<&WorkBlock> {
        self.blocks.iter().find(|b| b.id == block_id)
    }

    pub fn block_mut(&mut self, block_id: &str) -> Option<&mut WorkBlock> {
        self.blocks.iter_mut().find(|b| b.id == block_id)
    }

    pub fn worker(&self, worker_id: &str) -> Option<&Worker> {
        self.workers.iter().find(|w| w.id == worker_id)
    }

    pub fn worker_mut(&mut self, worker_id: &str) -> Option<&mut Worker> {
        self.workers.iter_mut().find(|w| w.id == worker_id)
    }

    pub fn count_workers(&self, status: WorkerStatus) -> usize {
        self.workers.iter().filter(|w| w.status == status).count()
    }

    /// Workers that can still take a block; failed ones wait for `retry_worker`
    pub fn live_workers(&self) -> usize {
        self.workers.len() - self.count_workers(WorkerStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_log_is_bounded() {
        let mut worker = Worker::new(0);
        for i in 0..150 {
            worker.log(LogLevel::Info, format!("entry {}", i), 100);
        }
        assert_eq!(worker.logs.len(), 100);
        assert_eq!(worker.logs.front().map(|e| e.message.as_str()), Some("entry 50"));
        assert_eq!(worker.logs.back().map(|e| e.message.as_str()), Some("entry 149"));
    }

    #[test]
    fn test_worker_clear_keeps_identity() {
        let mut worker = Worker::new(2);
        worker.status = WorkerStatus::Failed;
        worker.last_error = Some("boom".into());
        worker.log(LogLevel::Error, "boom", 100);
        worker.clear();

        assert_eq!(worker.id, "worker-3");
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert!(worker.logs.is_empty());
        assert!(worker.last_error.is_none());
    }

    #[test]
    fn test_conflict_type_serializes_with_dash() {
        let json = serde_json::to_string(&ConflictType::OverlappingEdit).unwrap();
        assert_eq!(json, "\"overlapping-edit\"");
    }

    #[test]
    fn test_status_helpers() {
        assert!(BlockStatus::Failed.is_settled());
        assert!(!BlockStatus::Assigned.is_settled());
        assert!(RunStatus::Paused.is_running());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Merging.is_terminal());
    }

    #[test]
    fn test_live_workers_excludes_failed() {
        let mut state = RunState::new(vec![Worker::new(0), Worker::new(1)]);
        assert_eq!(state.live_workers(), 2);
        state.workers[1].status = WorkerStatus::Failed;
        assert_eq!(state.live_workers(), 1);
    }
}
