//! Plan decomposition into work blocks
//!
//! Each step expands into one block per sector group. A block depends on
//! every block produced by the steps its step depends on.

use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::coord::types::{BlockContext, BlockStatus, WorkBlock};
use crate::plan::types::{Plan, Step};

/// Files of one step that share a sector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroup {
    pub sector: Option<String>,
    pub files: Vec<String>,
}

/// Decides how a step's files are grouped into blocks
pub trait SectorSplitter: Send + Sync {
    fn split(&self, step: &Step) -> Vec<FileGroup>;
}

/// One group per step, tagged with the step's own sector
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleSector;

impl SectorSplitter for SingleSector {
    fn split(&self, step: &Step) -> Vec<FileGroup> {
        vec![FileGroup {
            sector: step.sector.clone(),
            files: step.files.clone(),
        }]
    }
}

/// `block-<stepId>-<sector or "default">`
pub fn block_id(step_id: &str, sector: Option<&str>) -> String {
    format!("block-{}-{}", step_id, sector.unwrap_or("default"))
}

/// Decompose with the default one-group-per-step splitter
pub fn decompose(plan: &Plan) -> Vec<WorkBlock> {
    decompose_with(plan, &SingleSector)
}

pub fn decompose_with(plan: &Plan, splitter: &dyn SectorSplitter) -> Vec<WorkBlock> {
    let mut blocks = Vec::new();
    let mut blocks_by_step: HashMap<&str, Vec<String>> = HashMap::new();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for step in &plan.steps {
        let mut dependencies = Vec::new();
        for dep_step in &step.dependencies {
            match blocks_by_step.get(dep_step.as_str()) {
                Some(dep_blocks) => {
                    for id in dep_blocks {
                        if !dependencies.contains(id) {
                            dependencies.push(id.clone());
                        }
                    }
                }
                None => debug!(
                    "Step {} depends on {} which produced no earlier blocks",
                    step.id, dep_step
                ),
            }
        }

        let mut created = Vec::new();
        for group in splitter.split(step) {
            let mut id = block_id(&step.id, group.sector.as_deref());
            if !seen_ids.insert(id.clone()) {
                let mut n = 2;
                while seen_ids.contains(&format!("{}-{}", id, n)) {
                    n += 1;
                }
                warn!("Duplicate block id {}, renaming to {}-{}", id, id, n);
                id = format!("{}-{}", id, n);
                seen_ids.insert(id.clone());
            }

            let context = BlockContext {
                block_id: id.clone(),
                step_id: step.id.clone(),
                prompt: step.description.clone(),
                policy: group.sector.clone(),
                referenced_files: group.files.clone(),
            };

            blocks.push(WorkBlock {
                id: id.clone(),
                step_id: step.id.clone(),
                files: group.files,
                sector: group.sector,
                context,
                status: BlockStatus::Pending,
                assigned_worker: None,
                dependencies: dependencies.clone(),
                retry_count: 0,
                result: None,
                last_error: None,
            });
            created.push(id);
        }

        blocks_by_step
            .entry(step.id.as_str())
            .or_default()
            .extend(created);
    }

    debug!(
        "Decomposed plan {} into {} blocks",
        plan.id,
        blocks.len()
    );
    blocks
}
