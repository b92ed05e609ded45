//! Merge conflict detection
//!
//! No content is merged. Any file touched by more than one completed block
//! is reported once as an overlapping edit naming its first two owners.

use std::collections::HashMap;
use tracing::{debug, info};

use crate::core::errors::{CoordError, Result};
use crate::coord::types::{BlockStatus, ConflictType, MergeConflict, WorkBlock};

/// Files a completed block touched: its declared files, then anything else
/// the executor reported modifying
fn touched_files(block: &WorkBlock) -> Vec<&str> {
    let mut files: Vec<&str> = block.files.iter().map(String::as_str).collect();
    if let Some(result) = &block.result {
        for file in &result.execution.files_modified {
            if !files.contains(&file.as_str()) {
                files.push(file);
            }
        }
    }
    files
}

/// One unresolved conflict per shared file, in first-touched order
pub fn detect_conflicts(blocks: &[WorkBlock]) -> Vec<MergeConflict> {
    let mut owners: Vec<(&str, Vec<&str>)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for block in blocks.iter().filter(|b| b.status == BlockStatus::Completed) {
        for file in touched_files(block) {
            let slot = *index.entry(file).or_insert_with(|| {
                owners.push((file, Vec::new()));
                owners.len() - 1
            });
            owners[slot].1.push(block.id.as_str());
        }
    }

    let conflicts: Vec<MergeConflict> = owners
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(file, ids)| MergeConflict {
            file: file.to_string(),
            first_block: ids[0].to_string(),
            second_block: ids[1].to_string(),
            conflict_type: ConflictType::OverlappingEdit,
            resolution: None,
            resolved: false,
        })
        .collect();

    if conflicts.is_empty() {
        debug!("No merge conflicts detected");
    } else {
        info!("Detected {} merge conflicts", conflicts.len());
    }
    conflicts
}

/// Mark the conflict at `index` resolved with the given resolution tag
pub fn resolve_conflict(
    conflicts: &mut [MergeConflict],
    index: usize,
    resolution: impl Into<String>,
) -> Result<&MergeConflict> {
    let conflict = conflicts
        .get_mut(index)
        .ok_or_else(|| CoordError::not_found("conflict", index.to_string()))?;
    conflict.resolution = Some(resolution.into());
    conflict.resolved = true;
    debug!("Resolved conflict on {}", conflict.file);
    Ok(conflict)
}

/// True when there are no conflicts or every one is resolved
pub fn all_resolved(conflicts: &[MergeConflict]) -> bool {
    conflicts.iter().all(|c| c.resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::types::{BlockResult, ExecutionResult};
    use crate::plan::{decompose, Plan, Step};
    use pretty_assertions::assert_eq;

    fn completed(plan: &Plan) -> Vec<WorkBlock> {
        let mut blocks = decompose(plan);
        for block in &mut blocks {
            block.status = BlockStatus::Completed;
        }
        blocks
    }

    #[test]
    fn test_shared_file_yields_one_conflict() {
        let plan = Plan::new("p", "shared")
            .with_step(Step::new("1", "a").with_files(["Foo.cs", "A.cs"]))
            .with_step(Step::new("2", "b").with_files(["Foo.cs"]))
            .with_step(Step::new("3", "c").with_files(["Foo.cs", "C.cs"]));

        let conflicts = detect_conflicts(&completed(&plan));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].file, "Foo.cs");
        assert_eq!(conflicts[0].first_block, "block-1-default");
        assert_eq!(conflicts[0].second_block, "block-2-default");
        assert_eq!(conflicts[0].conflict_type, ConflictType::OverlappingEdit);
        assert!(!conflicts[0].resolved);
    }

    #[test]
    fn test_pending_and_failed_blocks_are_ignored() {
        let plan = Plan::new("p", "partial")
            .with_step(Step::new("1", "a").with_files(["Foo.cs"]))
            .with_step(Step::new("2", "b").with_files(["Foo.cs"]));
        let mut blocks = completed(&plan);
        blocks[1].status = BlockStatus::Failed;

        assert!(detect_conflicts(&blocks).is_empty());
    }

    #[test]
    fn test_reported_modifications_count() {
        let plan = Plan::new("p", "reported")
            .with_step(Step::new("1", "a").with_files(["A.cs"]))
            .with_step(Step::new("2", "b").with_files(["B.cs"]));
        let mut blocks = completed(&plan);
        blocks[1].result = Some(BlockResult {
            execution: ExecutionResult::success(vec!["B.cs".into(), "A.cs".into()]),
            verification: None,
        });

        let conflicts = detect_conflicts(&blocks);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].file, "A.cs");
    }

    #[test]
    fn test_resolution_flow() {
        let plan = Plan::new("p", "resolve")
            .with_step(Step::new("1", "a").with_files(["A.cs", "B.cs"]))
            .with_step(Step::new("2", "b").with_files(["A.cs", "B.cs"]));
        let mut conflicts = detect_conflicts(&completed(&plan));
        assert_eq!(conflicts.len(), 2);
        assert!(!all_resolved(&conflicts));

        resolve_conflict(&mut conflicts, 0, "keep-first").unwrap();
        assert!(!all_resolved(&conflicts));
        resolve_conflict(&mut conflicts, 1, "keep-second").unwrap();
        assert!(all_resolved(&conflicts));
        assert_eq!(conflicts[0].resolution.as_deref(), Some("keep-first"));

        let err = resolve_conflict(&mut conflicts, 7, "x").unwrap_err();
        assert_eq!(err.category(), "not_found");
    }

    #[test]
    fn test_no_conflicts_means_verified() {
        assert!(all_resolved(&[]));
    }
}
