//! Dependency-graph validation: reference checks and cycle detection.
//!
//! Uses `petgraph` to model step dependencies as a directed graph and
//! `toposort` to verify acyclicity. Runs at workflow creation time only --
//! the scheduler itself works off step statuses, so a cycle that slipped
//! through would starve rather than error, terminating the run as a vacuous
//! success. Rejecting cycles up front turns that authoring mistake into a
//! definition error.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use stepline_types::workflow::Step;

use super::definition::DefinitionError;

/// Validate that steps form a valid DAG: every dependency references an
/// existing step ID and no cycle exists.
pub fn validate_dag(steps: &[Step]) -> Result<(), DefinitionError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    // Edge from dependency -> dependent
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for step in steps {
        let to_idx = id_to_idx[step.id.as_str()];
        for dep in &step.dependencies {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                DefinitionError::InvalidDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let step_id = graph[cycle.node_id()];
        DefinitionError::CycleDetected(format!("cycle detected involving step '{step_id}'"))
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
