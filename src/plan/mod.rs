//! Plan input and decomposition into work blocks

pub mod decompose;
pub mod types;

pub use decompose::{block_id, decompose, decompose_with, FileGroup, SectorSplitter, SingleSector};
pub use types::{Plan, Step};
