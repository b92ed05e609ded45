pub mod coord;
pub mod core;
pub mod plan;

pub use crate::coord::{
    Coordinator, CoordinatorEvent, EventEnvelope, Executor, SimulatedExecutor, PassingVerifier,
    Verifier,
};
pub use crate::core::config::CoordinatorConfig;
pub use crate::core::errors::{CoordError, Result};
pub use crate::plan::{Plan, Step};

/// Install a global fmt subscriber at `level`.
///
/// Returns `false` if a global subscriber was already set.
pub fn init_tracing(level: tracing::Level) -> bool {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}
