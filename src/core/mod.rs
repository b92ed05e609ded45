// Shared infrastructure: errors and configuration

pub mod config;
pub mod errors;

pub use config::CoordinatorConfig;
pub use errors::{CoordError, Result};
