//! Dependency graph over work blocks
//!
//! Depth is the length of the longest dependency chain below a block and is
//! the only key the wave scheduler batches on. Cycles are tolerated: a block
//! met again on the current recursion path counts as depth 0.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::coord::types::WorkBlock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub block_id: String,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub depth: usize,
}

/// Depth-annotated graph, read-only once built
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<String, DependencyNode>,
    /// Block ids in decomposition order
    order: Vec<String>,
    graph: DiGraph<String, ()>,
}

impl DependencyGraph {
    pub fn build(blocks: &[WorkBlock]) -> Self {
        let known: HashSet<&str> = blocks.iter().map(|b| b.id.as_str()).collect();

        let mut graph = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();
        for block in blocks {
            index.insert(block.id.clone(), graph.add_node(block.id.clone()));
        }

        let mut deps_of: HashMap<String, Vec<String>> = HashMap::new();
        for block in blocks {
            let deps: Vec<String> = block
                .dependencies
                .iter()
                .filter(|dep| {
                    let found = known.contains(dep.as_str());
                    if !found {
                        warn!("Block {} depends on unknown block {}, ignoring", block.id, dep);
                    }
                    found
                })
                .cloned()
                .collect();
            for dep in &deps {
                graph.add_edge(index[dep], index[&block.id], ());
            }
            deps_of.insert(block.id.clone(), deps);
        }

        let cyclic = is_cyclic_directed(&graph);
        if cyclic {
            warn!("Dependency graph contains a cycle; depths on the cycle are truncated");
        }

        let mut memo: HashMap<String, usize> = HashMap::new();
        let mut nodes = HashMap::new();
        for block in blocks {
            // Truncated depths depend on the entry point, so only memoize a DAG
            let cache = if cyclic { None } else { Some(&mut memo) };
            let depth = depth_of(&block.id, &deps_of, &mut HashSet::new(), cache);

            let dependents = blocks
                .iter()
                .filter(|other| deps_of[&other.id].contains(&block.id))
                .map(|other| other.id.clone())
                .collect();

            nodes.insert(
                block.id.clone(),
                DependencyNode {
                    block_id: block.id.clone(),
                    dependencies: deps_of[&block.id].clone(),
                    dependents,
                    depth,
                },
            );
        }

        let built = Self {
            nodes,
            order: blocks.iter().map(|b| b.id.clone()).collect(),
            graph,
        };
        debug!(
            "Built dependency graph: {} nodes, max depth {:?}",
            built.len(),
            built.max_depth()
        );
        built
    }

    pub fn node(&self, block_id: &str) -> Option<&DependencyNode> {
        self.nodes.get(block_id)
    }

    pub fn depth(&self, block_id: &str) -> Option<usize> {
        self.nodes.get(block_id).map(|n| n.depth)
    }

    /// `None` for an empty graph
    pub fn max_depth(&self) -> Option<usize> {
        self.nodes.values().map(|n| n.depth).max()
    }

    /// Block ids at `depth`, in decomposition order
    pub fn blocks_at_depth(&self, depth: usize) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.nodes[*id].depth == depth)
            .cloned()
            .collect()
    }

    /// Block ids grouped by depth, shallowest first
    pub fn waves(&self) -> Vec<Vec<String>> {
        match self.max_depth() {
            Some(max) => (0..=max).map(|d| self.blocks_at_depth(d)).collect(),
            None => Vec::new(),
        }
    }

    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn depth_of(
    id: &str,
    deps_of: &HashMap<String, Vec<String>>,
    visiting: &mut HashSet<String>,
    mut memo: Option<&mut HashMap<String, usize>>,
) -> usize {
    if let Some(d) = memo.as_ref().and_then(|m| m.get(id)) {
        return *d;
    }
    if !visiting.insert(id.to_string()) {
        return 0;
    }

    let mut depth = 0;
    if let Some(deps) = deps_of.get(id) {
        for dep in deps {
            let d = depth_of(dep, deps_of, visiting, memo.as_deref_mut());
            depth = depth.max(d + 1);
        }
    }

    visiting.remove(id);
    if let Some(m) = memo {
        m.insert(id.to_string(), depth);
    }
    depth
}
