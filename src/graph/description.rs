//! Plain description of a graph and reconstruction from it.
//!
//! The description lists every unit once, in execution order, with its
//! class and config, plus one inbound entry per invocation inside the
//! graph. An edge `(producer, invocation, slot)` names an output of the
//! producer's `invocation`-th call *within this graph*, so descriptions do
//! not depend on how often the units were called elsewhere.

use super::Graph;
use crate::args::{Arg, CallArgs};
use crate::context::CallContext;
use crate::error::{Result, UnitError};
use crate::nest::Nest;
use crate::node::{InputRef, Node, NodeId};
use crate::registry::UnitRegistry;
use crate::tensor::Tensor;
use crate::unit::{Config, Invoke, Unit};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// `(producer unit name, invocation index within the graph, output slot)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeRef(pub String, pub usize, pub usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationEntry {
    /// One edge per input leaf, in flattened order.
    pub edges: Vec<EdgeRef>,
    pub structure: Nest<()>,
    /// Positional and keyword arguments; tensors appear as `{"edge": [...]}`.
    pub args: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitEntry {
    pub unit_name: String,
    pub unit_class: String,
    pub unit_config: Config,
    pub inbound: Vec<InvocationEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    pub name: String,
    pub units: Vec<UnitEntry>,
    pub inputs: Vec<EdgeRef>,
    pub outputs: Vec<EdgeRef>,
    pub input_structure: Nest<()>,
    pub output_structure: Nest<()>,
}

impl GraphDescription {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl Graph {
    pub fn describe(&self) -> Result<GraphDescription> {
        let name = self.core().name().to_string();
        let mut local_index: HashMap<NodeId, (String, usize)> = HashMap::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut inbound: HashMap<String, Vec<InvocationEntry>> = HashMap::new();

        for node in self.nodes() {
            let unit_name = node.unit().core().name().to_string();
            let count = counts.entry(unit_name.clone()).or_insert(0);
            local_index.insert(node.id(), (unit_name.clone(), *count));
            *count += 1;

            let entries = inbound.entry(unit_name).or_default();
            if node.is_source() {
                continue;
            }
            let edges = node
                .input_refs()?
                .iter()
                .map(|r| edge_of_ref(&name, r, &local_index))
                .collect::<Result<Vec<_>>>()?;
            entries.push(InvocationEntry {
                edges,
                structure: node.inputs().structure(),
                args: args_to_json(&name, node, &local_index)?,
            });
        }

        let mut units = Vec::with_capacity(self.units().len());
        for unit in self.units() {
            let unit_name = unit.core().name().to_string();
            units.push(UnitEntry {
                unit_class: unit.class_name().to_string(),
                unit_config: unit.config()?,
                inbound: inbound.remove(&unit_name).unwrap_or_default(),
                unit_name,
            });
        }

        let inputs = self
            .inputs()
            .flatten()
            .into_iter()
            .map(|t| edge_of(&name, t, &local_index))
            .collect::<Result<Vec<_>>>()?;
        let outputs = self
            .outputs()
            .flatten()
            .into_iter()
            .map(|t| edge_of(&name, t, &local_index))
            .collect::<Result<Vec<_>>>()?;

        Ok(GraphDescription {
            name,
            units,
            inputs,
            outputs,
            input_structure: self.inputs().structure(),
            output_structure: self.outputs().structure(),
        })
    }

    /// Rebuilds a graph from its description, creating units through `registry`.
    ///
    /// Invocations are replayed as soon as their inputs exist; a pass that
    /// makes no progress means the description is cyclic or refers to
    /// missing outputs.
    pub fn reconstruct(desc: &GraphDescription, registry: &UnitRegistry) -> Result<Arc<Graph>> {
        let mut created: HashMap<String, Arc<dyn Unit>> = HashMap::new();
        let mut produced: HashMap<(String, usize), Vec<Tensor>> = HashMap::new();
        let mut pending: VecDeque<(String, usize, &InvocationEntry)> = VecDeque::new();

        for entry in &desc.units {
            let unit = registry
                .create(&entry.unit_class, &entry.unit_config)
                .map_err(|e| UnitError::serialization(&entry.unit_class, &entry.unit_name, e))?;
            if unit.core().name() != entry.unit_name {
                return Err(UnitError::serialization(
                    &entry.unit_class,
                    &entry.unit_name,
                    UnitError::usage(
                        unit.core().name(),
                        "reconstructed unit name does not match its description entry",
                    ),
                ));
            }
            if entry.inbound.is_empty() {
                let t = Node::source(unit.clone())
                    .map_err(|e| UnitError::serialization(&entry.unit_class, &entry.unit_name, e))?;
                produced.insert((entry.unit_name.clone(), 0), vec![t]);
            }
            for (i, inv) in entry.inbound.iter().enumerate() {
                pending.push_back((entry.unit_name.clone(), i, inv));
            }
            created.insert(entry.unit_name.clone(), unit);
        }

        let mut next: HashMap<String, usize> = HashMap::new();
        let mut stalled = 0;
        while let Some((unit_name, index, inv)) = pending.pop_front() {
            let ready = next.get(&unit_name).copied().unwrap_or(0) == index
                && inv.edges.iter().all(|e| resolve(&produced, e).is_some())
                && arg_edges(&inv.args).iter().all(|e| resolve(&produced, e).is_some());
            if !ready {
                pending.push_back((unit_name, index, inv));
                stalled += 1;
                if stalled > pending.len() {
                    let blocked: Vec<&str> = pending.iter().map(|(n, _, _)| n.as_str()).collect();
                    return Err(UnitError::usage(
                        &desc.name,
                        format!(
                            "cannot reconstruct graph: cyclic or unresolvable dependencies among {:?}",
                            blocked
                        ),
                    ));
                }
                continue;
            }
            stalled = 0;

            let unit = created.get(&unit_name).ok_or_else(|| {
                UnitError::usage(&desc.name, format!("No such unit: {}", unit_name))
            })?;
            let flat: Vec<Tensor> = inv
                .edges
                .iter()
                .filter_map(|e| resolve(&produced, e))
                .collect();
            let inputs = inv.structure.pack(flat).ok_or_else(|| {
                UnitError::usage(&unit_name, "invocation structure does not match its edges")
            })?;
            let args = args_from_json(&unit_name, &inv.args, &produced)?;
            let outputs = unit
                .invoke_in(&mut CallContext::new(), &inputs, &args)
                .map_err(|e| UnitError::serialization(unit.class_name(), &unit_name, e))?;
            produced.insert((unit_name.clone(), index), outputs.into_flat());
            next.insert(unit_name, index + 1);
        }

        let lookup = |edges: &[EdgeRef]| -> Result<Vec<Tensor>> {
            edges
                .iter()
                .map(|e| {
                    resolve(&produced, e).ok_or_else(|| {
                        UnitError::usage(&desc.name, format!("edge {:?} does not exist", e))
                    })
                })
                .collect()
        };
        let inputs = desc
            .input_structure
            .pack(lookup(&desc.inputs)?)
            .ok_or_else(|| UnitError::usage(&desc.name, "input structure does not match inputs"))?;
        let outputs = desc
            .output_structure
            .pack(lookup(&desc.outputs)?)
            .ok_or_else(|| UnitError::usage(&desc.name, "output structure does not match outputs"))?;

        debug!(
            "reconstructed graph '{}' from {} unit entries",
            desc.name,
            desc.units.len()
        );
        Graph::assemble(inputs, outputs, Some(&desc.name))
    }

    /// Builds a graph from a config produced by [`Unit::config`] on a graph.
    pub fn from_config(config: &Config, registry: &UnitRegistry) -> Result<Arc<Graph>> {
        let desc: GraphDescription = serde_json::from_value(Json::Object(config.clone()))?;
        Graph::reconstruct(&desc, registry)
    }
}

fn resolve(produced: &HashMap<(String, usize), Vec<Tensor>>, edge: &EdgeRef) -> Option<Tensor> {
    produced
        .get(&(edge.0.clone(), edge.1))
        .and_then(|outs| outs.get(edge.2))
        .cloned()
}

fn edge_of(graph: &str, t: &Tensor, index: &HashMap<NodeId, (String, usize)>) -> Result<EdgeRef> {
    match t.history() {
        Some(h) => edge_to(graph, &h.node, h.slot, index),
        None => Err(constant_input(graph)),
    }
}

fn edge_of_ref(graph: &str, r: &InputRef, index: &HashMap<NodeId, (String, usize)>) -> Result<EdgeRef> {
    match r {
        InputRef::Upstream { node, slot } => edge_to(graph, node, *slot, index),
        InputRef::Constant(_) => Err(constant_input(graph)),
    }
}

fn edge_to(
    graph: &str,
    node: &Node,
    slot: usize,
    index: &HashMap<NodeId, (String, usize)>,
) -> Result<EdgeRef> {
    let (name, i) = index.get(&node.id()).ok_or_else(|| {
        UnitError::usage(graph, "tensor comes from a record outside this graph")
    })?;
    Ok(EdgeRef(name.clone(), *i, slot))
}

fn constant_input(graph: &str) -> UnitError {
    UnitError::usage(graph, "cannot describe a constant input; only recorded tensors have edges")
}

fn args_to_json(
    graph: &str,
    node: &Node,
    index: &HashMap<NodeId, (String, usize)>,
) -> Result<Json> {
    let args = node.args();
    let positional = args
        .positional
        .iter()
        .map(|a| arg_to_json(graph, a, index))
        .collect::<Result<Vec<_>>>()?;
    let mut keyword = serde_json::Map::new();
    for (k, a) in &args.keyword {
        keyword.insert(k.clone(), arg_to_json(graph, a, index)?);
    }
    Ok(json!({ "positional": positional, "keyword": keyword }))
}

fn arg_to_json(graph: &str, arg: &Arg, index: &HashMap<NodeId, (String, usize)>) -> Result<Json> {
    match arg {
        Arg::Tensor(t) => {
            let EdgeRef(name, i, slot) = edge_of(graph, t, index)?;
            Ok(json!({ "edge": [name, i, slot] }))
        }
        Arg::List(items) => Ok(Json::Array(
            items
                .iter()
                .map(|a| arg_to_json(graph, a, index))
                .collect::<Result<Vec<_>>>()?,
        )),
        other => other
            .to_json()
            .ok_or_else(|| UnitError::usage(graph, "argument cannot be described")),
    }
}

fn args_from_json(
    unit: &str,
    json: &Json,
    produced: &HashMap<(String, usize), Vec<Tensor>>,
) -> Result<CallArgs> {
    let bad = || UnitError::usage(unit, format!("malformed invocation arguments: {}", json));
    let mut args = CallArgs::new();
    if let Some(items) = json.get("positional").and_then(Json::as_array) {
        for item in items {
            args.positional
                .push(arg_from_json(item, produced).ok_or_else(bad)?);
        }
    }
    if let Some(map) = json.get("keyword").and_then(Json::as_object) {
        let mut keyword = BTreeMap::new();
        for (k, v) in map {
            keyword.insert(k.clone(), arg_from_json(v, produced).ok_or_else(bad)?);
        }
        args.keyword = keyword;
    }
    Ok(args)
}

/// Edges referenced by tensor arguments, which must exist before replay.
fn arg_edges(json: &Json) -> Vec<EdgeRef> {
    match json {
        Json::Object(map) => match map.get("edge") {
            Some(edge) => serde_json::from_value::<EdgeRef>(edge.clone()).into_iter().collect(),
            None => map.values().flat_map(arg_edges).collect(),
        },
        Json::Array(items) => items.iter().flat_map(arg_edges).collect(),
        _ => Vec::new(),
    }
}

fn arg_from_json(json: &Json, produced: &HashMap<(String, usize), Vec<Tensor>>) -> Option<Arg> {
    match json {
        Json::Object(map) => {
            let edge: EdgeRef = serde_json::from_value(map.get("edge")?.clone()).ok()?;
            resolve(produced, &edge).map(Arg::Tensor)
        }
        Json::Array(items) => items
            .iter()
            .map(|j| arg_from_json(j, produced))
            .collect::<Option<Vec<_>>>()
            .map(Arg::List),
        other => Arg::from_json(other),
    }
}
