//! Wave scheduler
//!
//! Blocks are dispatched one depth at a time. Everything ready at the
//! current depth runs concurrently; the depth repeats while any of its
//! blocks is still pending (retries, no worker available).

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::core::errors::Result;
use crate::coord::coordinator::CoordinatorInner;
use crate::coord::executor;
use crate::coord::graph::DependencyGraph;
use crate::coord::types::{BlockStatus, RunState};

/// Pending blocks at `depth` whose dependencies have all settled
fn ready_at_depth(graph: &DependencyGraph, state: &RunState, depth: usize) -> Vec<String> {
    let settled = |id: &String| state.block(id).map_or(false, |b| b.status.is_settled());

    graph
        .blocks_at_depth(depth)
        .into_iter()
        .filter(|id| {
            let pending = state
                .block(id)
                .map_or(false, |b| b.status == BlockStatus::Pending);
            let deps_met = graph
                .node(id)
                .map_or(true, |n| n.dependencies.iter().all(|dep| settled(dep)));
            pending && deps_met
        })
        .collect()
}

fn pending_at_depth(graph: &DependencyGraph, state: &RunState, depth: usize) -> Vec<String> {
    graph
        .blocks_at_depth(depth)
        .into_iter()
        .filter(|id| {
            state
                .block(id)
                .map_or(false, |b| b.status == BlockStatus::Pending)
        })
        .collect()
}

/// Drive every wave until the graph is exhausted or the run stops.
///
/// Returns `Cancelled` when cancellation is observed during a pause.
pub(crate) async fn run_waves(inner: &CoordinatorInner, graph: &DependencyGraph) -> Result<()> {
    let Some(max_depth) = graph.max_depth() else {
        debug!("No blocks to schedule");
        return Ok(());
    };

    let mut depth = 0;
    let mut round = 0usize;
    while depth <= max_depth {
        if !inner.status().is_running() {
            debug!("Run left executing state, stopping at depth {}", depth);
            break;
        }
        inner.wait_while_paused("wave dispatch").await?;

        let ready = inner.read(|state| ready_at_depth(graph, state, depth));
        if ready.is_empty() {
            let stuck = inner.read(|state| pending_at_depth(graph, state, depth));
            if !stuck.is_empty() {
                // Dependencies that can no longer settle, e.g. blocks on a cycle
                warn!(
                    "Blocks at depth {} can never become ready: {:?}",
                    depth, stuck
                );
                inner.fail_unschedulable(&stuck, "dependencies can never settle");
            }
            depth += 1;
            round = 0;
            continue;
        }

        if inner.read(|state| state.live_workers()) == 0 {
            let stuck = inner.read(|state| pending_at_depth(graph, state, depth));
            warn!(
                "Every worker has failed, {} blocks at depth {} cannot run",
                stuck.len(),
                depth
            );
            inner.fail_unschedulable(&stuck, "no worker left to run it");
            depth += 1;
            round = 0;
            continue;
        }

        round += 1;
        info!(
            "Wave {} round {}: dispatching {} blocks",
            depth,
            round,
            ready.len()
        );
        join_all(ready.iter().map(|id| executor::dispatch(inner, id))).await;

        let still_pending = inner.read(|state| !pending_at_depth(graph, state, depth).is_empty());
        if still_pending {
            debug!("Depth {} still has pending blocks, repeating", depth);
        } else {
            depth += 1;
            round = 0;
        }
    }
    Ok(())
}
