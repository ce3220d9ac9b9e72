//! Reverse walk from graph outputs to graph inputs.

use crate::error::{Result, UnitError};
use crate::node::{Node, NodeId};
use crate::tensor::{Tensor, TensorId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

/// Result of walking a graph.
pub(crate) struct Walk {
    /// Non-source records, producers before consumers.
    pub order: Vec<Arc<Node>>,
    /// Graph inputs some output depends on.
    pub used_inputs: HashSet<TensorId>,
}

/// Iterative depth-first walk from `outputs`, stopping at `inputs`.
///
/// Records are appended in post-order, visiting dependencies in argument
/// order, so ties are broken by first discovery. A record reached again
/// while it is still being expanded means a cycle.
pub(crate) fn walk(graph: &str, inputs: &[TensorId], outputs: &[&Tensor]) -> Result<Walk> {
    let input_set: HashSet<TensorId> = inputs.iter().copied().collect();
    let mut marks: HashMap<NodeId, Mark> = HashMap::new();
    let mut order = Vec::new();
    let mut used_inputs = HashSet::new();
    let mut stack: Vec<(Arc<Node>, bool)> = Vec::new();

    for output in outputs {
        let start = match producer(graph, output, &input_set, &mut used_inputs, &order)? {
            Some(node) => node,
            None => continue,
        };
        stack.push((start, false));

        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                marks.insert(node.id(), Mark::Visited);
                order.push(node);
                continue;
            }
            match marks.get(&node.id()) {
                Some(Mark::Visited) => continue,
                Some(Mark::Visiting) => {
                    return Err(UnitError::usage(
                        graph,
                        format!(
                            "cycle detected: unit '{}' depends on its own output",
                            node.unit().core().name()
                        ),
                    ))
                }
                None => {}
            }
            marks.insert(node.id(), Mark::Visiting);
            stack.push((node.clone(), true));

            let mut children = Vec::new();
            for dep in node.dependencies() {
                if let Some(child) = producer(graph, dep, &input_set, &mut used_inputs, &order)? {
                    if marks.get(&child.id()) != Some(&Mark::Visited) {
                        children.push(child);
                    }
                }
            }
            for child in children.into_iter().rev() {
                stack.push((child, false));
            }
        }
    }
    Ok(Walk { order, used_inputs })
}

/// Record that produces `t`, or `None` when `t` is a graph input.
fn producer(
    graph: &str,
    t: &Tensor,
    inputs: &HashSet<TensorId>,
    used: &mut HashSet<TensorId>,
    visited: &[Arc<Node>],
) -> Result<Option<Arc<Node>>> {
    let id = match t.id() {
        Some(id) => id,
        None => return Ok(None),
    };
    if inputs.contains(&id) {
        used.insert(id);
        return Ok(None);
    }
    let history = t.history().ok_or_else(|| {
        UnitError::usage(graph, format!("tensor {} was not produced by a recorded invocation", id))
    })?;
    if history.node.is_source() {
        let seen: Vec<&str> = visited.iter().map(|n| n.unit().core().name()).collect();
        return Err(UnitError::usage(
            graph,
            format!(
                "graph disconnected: cannot obtain value for tensor {} from input unit '{}', \
                 which is not a graph input. Units reached without issue: {:?}",
                id,
                history.node.unit().core().name(),
                seen
            ),
        ));
    }
    Ok(Some(history.node.clone()))
}
