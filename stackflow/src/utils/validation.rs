//! Graph validation helpers shared by stack plans and workflow definitions.
//!
//! Both take a dependency map keyed by node name plus the declaration order,
//! and walk nodes in that order so that reported cycles are deterministic.

use crate::errors::CycleDetectedError;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Looks for a cycle, returning the first one found as a closed path.
///
/// Edges to nodes missing from `graph` are ignored; callers report those
/// separately.
pub fn detect_cycle<S: AsRef<str>>(
    graph: &HashMap<String, Vec<S>>,
    order: &[String],
) -> Result<(), CycleDetectedError> {
    let mut visited = HashSet::new();
    let mut in_stack = HashSet::new();
    let mut path = Vec::new();

    fn dfs<S: AsRef<str>>(
        node: &str,
        graph: &HashMap<String, Vec<S>>,
        visited: &mut HashSet<String>,
        in_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Result<(), Vec<String>> {
        if in_stack.contains(node) {
            let start_idx = path.iter().position(|n| n == node).unwrap_or(0);
            let mut cycle_path: Vec<String> = path[start_idx..].to_vec();
            cycle_path.push(node.to_string());
            return Err(cycle_path);
        }

        if visited.contains(node) {
            return Ok(());
        }

        visited.insert(node.to_string());
        in_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(edges) = graph.get(node) {
            for next in edges {
                if graph.contains_key(next.as_ref()) {
                    dfs(next.as_ref(), graph, visited, in_stack, path)?;
                }
            }
        }

        in_stack.remove(node);
        path.pop();
        Ok(())
    }

    for node in order {
        dfs(node, graph, &mut visited, &mut in_stack, &mut path).map_err(CycleDetectedError::new)?;
    }

    Ok(())
}

/// Returns every node reachable from `start` by following edges, excluding
/// `start` itself unless it sits on a cycle.
#[must_use]
pub fn reachable_from<S: AsRef<str>>(graph: &HashMap<String, Vec<S>>, start: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&str> = graph
        .get(start)
        .map(|edges| edges.iter().map(AsRef::as_ref).collect())
        .unwrap_or_default();

    while let Some(node) = stack.pop() {
        if !seen.insert(node.to_string()) {
            continue;
        }
        if let Some(edges) = graph.get(node) {
            stack.extend(edges.iter().map(AsRef::as_ref));
        }
    }

    seen
}

/// Returns true if the name is empty or whitespace-only.
#[must_use]
pub fn is_blank(name: &str) -> bool {
    name.trim().is_empty()
}
