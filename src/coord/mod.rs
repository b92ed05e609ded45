//! Wave-scheduled parallel execution of work blocks
//!
//! Blocks are batched by dependency depth and run on a bounded pool of
//! logical workers, with per-file locking, retries, pause/resume/cancel and
//! post-run conflict detection.

pub mod action;
pub mod conflicts;
pub mod coordinator;
pub mod events;
pub mod graph;
pub mod locks;
pub mod pool;
pub mod progress;
pub mod types;

mod executor;
mod guard;
mod scheduler;

pub use action::{Executor, PassingVerifier, SimulatedExecutor, Verifier};
pub use conflicts::{all_resolved, detect_conflicts};
pub use coordinator::Coordinator;
pub use events::{spawn_event_logger, CoordinatorEvent, EventEnvelope, EventKind};
pub use graph::{DependencyGraph, DependencyNode};
pub use locks::FileLockManager;
pub use progress::compute_progress;
pub use types::*;
