//! Record-level views of a graph built on `petgraph`.

use super::Graph;
use crate::node::NodeId;
use petgraph::dot::{Config as DotConfig, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use std::collections::HashMap;

/// A record in the exported graph, shown as `unit (class)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLabel {
    pub unit: String,
    pub class: String,
    pub index: usize,
}

impl std::fmt::Display for RecordLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.unit, self.class)
    }
}

impl Graph {
    /// One vertex per record, one edge per consumed tensor, weighted by the
    /// producer's output slot.
    pub fn to_petgraph(&self) -> DiGraph<RecordLabel, usize> {
        let mut graph = DiGraph::new();
        let mut index: HashMap<NodeId, NodeIndex> = HashMap::new();
        for node in self.nodes() {
            let ix = graph.add_node(RecordLabel {
                unit: node.unit().core().name().to_string(),
                class: node.unit().class_name().to_string(),
                index: node.index(),
            });
            index.insert(node.id(), ix);
        }
        for node in self.nodes() {
            let to = index[&node.id()];
            for (upstream, slot) in node.upstream() {
                if let Some(&from) = index.get(&upstream.id()) {
                    graph.add_edge(from, to, slot);
                }
            }
        }
        graph
    }

    /// Graphviz rendering of [`Graph::to_petgraph`].
    pub fn to_dot(&self) -> String {
        let graph = self.to_petgraph();
        format!("{}", Dot::with_config(&graph, &[DotConfig::EdgeNoLabel]))
    }

    /// Longest distance of each unit's records from the graph inputs.
    pub fn depths(&self) -> HashMap<String, usize> {
        let graph = self.to_petgraph();
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let mut by_unit = HashMap::new();
        let mut topo = Topo::new(&graph);
        while let Some(ix) = topo.next(&graph) {
            let d = graph
                .neighbors_directed(ix, petgraph::Direction::Incoming)
                .filter_map(|p| depth.get(&p))
                .max()
                .map_or(0, |d| d + 1);
            depth.insert(ix, d);
            let entry = by_unit.entry(graph[ix].unit.clone()).or_insert(d);
            *entry = (*entry).max(d);
        }
        by_unit
    }
}
