//! Functional composition of units.
//!
//! [`Graph::assemble`] walks invocation records backwards from a set of
//! symbolic outputs to a set of symbolic inputs and keeps the records it
//! needs in execution order. The resulting graph is itself a [`Unit`]: it
//! replays its records on new inputs, can be nested in other graphs, and
//! can be described and reconstructed.

pub mod description;
pub mod dot;
mod topology;

pub use description::{EdgeRef, GraphDescription, InvocationEntry, UnitEntry};

use crate::args::{Arg, CallArgs};
use crate::context::{CallContext, TRAINING};
use crate::error::{Result, UnitError};
use crate::nest::Nest;
use crate::node::Node;
use crate::shape::Shape;
use crate::tensor::{Tensor, TensorId, TensorSpec};
use crate::unit::dispatch::MASK;
use crate::unit::{Config, Invoke, Unit, UnitCore, UnitId, UnitOptions};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const CLASS_NAME: &str = "Graph";

pub struct Graph {
    core: UnitCore,
    inputs: Nest<Tensor>,
    outputs: Nest<Tensor>,
    input_ids: Vec<TensorId>,
    /// Source records of the inputs, then the computing records in order.
    nodes: Vec<Arc<Node>>,
    units: Vec<Arc<dyn Unit>>,
}

impl Graph {
    /// Assembles the graph computing `outputs` from `inputs`.
    ///
    /// Inputs must be distinct tensors emitted by source units; every input
    /// must be used and every output must be computable from the inputs.
    /// Outputs may repeat.
    pub fn assemble(
        inputs: impl Into<Nest<Tensor>>,
        outputs: impl Into<Nest<Tensor>>,
        name: Option<&str>,
    ) -> Result<Arc<Graph>> {
        let inputs = inputs.into();
        let outputs = outputs.into();
        let mut options = UnitOptions::new().with_autocast(false);
        if let Some(n) = name {
            options = options.with_name(n);
        }
        let core = UnitCore::new(CLASS_NAME, options)?
            .with_masking(true)
            .accept_keyword(MASK)
            .with_context_arg(TRAINING, Arg::Null);
        let graph_name = core.name().to_string();

        let flat_inputs = inputs.flatten();
        let mut input_ids = Vec::with_capacity(flat_inputs.len());
        let mut seen = HashSet::new();
        for t in &flat_inputs {
            let id = t.id().ok_or_else(|| {
                UnitError::usage(&graph_name, "graph inputs must be symbolic tensors")
            })?;
            if !seen.insert(id) {
                return Err(UnitError::usage(
                    &graph_name,
                    format!("redundant inputs: tensor {} is passed more than once", id),
                ));
            }
            input_ids.push(id);
        }
        let mut sources = Vec::with_capacity(flat_inputs.len());
        for t in &flat_inputs {
            match t.history() {
                Some(h) if h.node.is_source() => sources.push(h.node.clone()),
                _ => {
                    return Err(UnitError::usage(
                        &graph_name,
                        format!("graph input {:?} must be emitted by an input unit", t),
                    ))
                }
            }
        }

        let flat_outputs = outputs.flatten();
        for t in &flat_outputs {
            if !t.is_symbolic() {
                return Err(UnitError::usage(&graph_name, "graph outputs must be symbolic tensors"));
            }
        }

        let walk = topology::walk(&graph_name, &input_ids, &flat_outputs)?;
        for (t, id) in flat_inputs.iter().zip(&input_ids) {
            if !walk.used_inputs.contains(id) {
                return Err(UnitError::usage(
                    &graph_name,
                    format!(
                        "graph disconnected: input {:?} is not used by any output",
                        t
                    ),
                ));
            }
        }

        let mut nodes = sources;
        nodes.extend(walk.order);
        let units = distinct_units(&graph_name, &nodes)?;
        for unit in &units {
            core.track_unit(unit.core().name(), unit.clone());
        }
        core.mark_built(inputs.map(Tensor::shape), inputs.structure());

        debug!(
            "assembled graph '{}' with {} units and {} records",
            graph_name,
            units.len(),
            nodes.len()
        );
        Ok(Arc::new(Graph {
            core,
            inputs,
            outputs,
            input_ids,
            nodes,
            units,
        }))
    }

    /// The symbolic inputs the graph was assembled from.
    pub fn inputs(&self) -> &Nest<Tensor> {
        &self.inputs
    }

    /// The symbolic outputs, in the structure they were requested in.
    pub fn outputs(&self) -> &Nest<Tensor> {
        &self.outputs
    }

    /// Records in execution order, input sources first.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Units in execution order, each once.
    pub fn units(&self) -> &[Arc<dyn Unit>] {
        &self.units
    }

    /// The unit called `name`; a usage error if the graph has none.
    pub fn get_unit(&self, name: &str) -> Result<Arc<dyn Unit>> {
        self.units
            .iter()
            .find(|u| u.core().name() == name)
            .cloned()
            .ok_or_else(|| UnitError::usage(self.core.name(), format!("No such unit: {}", name)))
    }

    /// The unit at `index` in execution order.
    pub fn unit_at(&self, index: usize) -> Result<Arc<dyn Unit>> {
        self.units.get(index).cloned().ok_or_else(|| {
            UnitError::usage(
                self.core.name(),
                format!(
                    "was asked to retrieve unit at index {} but the graph only has {} units",
                    index,
                    self.units.len()
                ),
            )
        })
    }

    /// Output shapes for `input_shapes`, propagated through the records
    /// without running any arithmetic. Losses added by units traced along
    /// the way are discarded.
    pub fn output_shape(&self, input_shapes: &Nest<Shape>) -> Result<Nest<Shape>> {
        let snapshot = self.core.loss_snapshot();
        let result = self.propagate_shapes(input_shapes);
        self.core.restore_losses(snapshot);
        result
    }

    fn propagate_shapes(&self, input_shapes: &Nest<Shape>) -> Result<Nest<Shape>> {
        let shapes = input_shapes.flatten();
        if shapes.len() != self.input_ids.len() {
            return Err(UnitError::usage(
                self.core.name(),
                format!("expected {} input shapes, got {}", self.input_ids.len(), shapes.len()),
            ));
        }
        let mut specs: HashMap<TensorId, TensorSpec> = HashMap::new();
        for ((id, shape), t) in self.input_ids.iter().zip(shapes).zip(self.inputs.flatten()) {
            specs.insert(*id, TensorSpec::new(shape.clone(), t.dtype()));
        }

        let mut ctx = CallContext::new();
        ctx.enter(self.core.name(), Default::default(), true);
        let result = self.replay_specs(&mut ctx, &mut specs);
        ctx.exit();
        result?;
        self.outputs
            .try_map(|t| self.spec_of(t, &specs).map(|s| s.shape))
    }

    fn replay_specs(
        &self,
        ctx: &mut CallContext,
        specs: &mut HashMap<TensorId, TensorSpec>,
    ) -> Result<()> {
        for node in self.computing_nodes() {
            let in_specs = node.inputs().try_map(|t| self.spec_of(t, specs))?;
            let in_shapes = in_specs.map(|s| s.shape.clone());
            let out_specs: Vec<TensorSpec> = match node.unit().compute_output_shape(&in_shapes)? {
                Some(out_shapes) => out_shapes
                    .flatten()
                    .into_iter()
                    .zip(node.output_specs().flatten())
                    .map(|(shape, recorded)| TensorSpec::new(shape.clone(), recorded.dtype))
                    .collect(),
                None => {
                    let placeholders = in_specs.map(|s| Tensor::placeholder(s.clone()));
                    let args = node.args().map_tensors(|t| {
                        self.spec_of(t, specs)
                            .map(|s| Arg::Tensor(Tensor::placeholder(s)))
                    })?;
                    node.unit()
                        .invoke_in(ctx, &placeholders, &args)?
                        .flatten()
                        .into_iter()
                        .map(Tensor::spec)
                        .collect()
                }
            };
            self.store(node, out_specs, specs)?;
        }
        Ok(())
    }

    fn computing_nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.iter().filter(|n| !n.is_source())
    }

    fn spec_of(&self, t: &Tensor, specs: &HashMap<TensorId, TensorSpec>) -> Result<TensorSpec> {
        match t.id() {
            Some(id) => specs.get(&id).cloned().ok_or_else(|| self.missing(id)),
            None => Ok(t.spec()),
        }
    }

    fn value_of(&self, t: &Tensor, values: &HashMap<TensorId, Tensor>) -> Result<Tensor> {
        match t.id() {
            Some(id) => values.get(&id).cloned().ok_or_else(|| self.missing(id)),
            None => Ok(t.clone()),
        }
    }

    fn store<T>(&self, node: &Node, outputs: Vec<T>, into: &mut HashMap<TensorId, T>) -> Result<()> {
        if outputs.len() != node.output_ids().len() {
            return Err(UnitError::state(
                node.unit().core().name(),
                format!(
                    "replay produced {} outputs, the record has {}",
                    outputs.len(),
                    node.output_ids().len()
                ),
            ));
        }
        for (id, out) in node.output_ids().iter().zip(outputs) {
            into.insert(*id, out);
        }
        Ok(())
    }

    fn missing(&self, id: TensorId) -> UnitError {
        UnitError::state(
            self.core.name(),
            format!("no value computed for tensor {} during replay", id),
        )
    }
}

fn distinct_units(graph: &str, nodes: &[Arc<Node>]) -> Result<Vec<Arc<dyn Unit>>> {
    let mut seen: HashSet<UnitId> = HashSet::new();
    let mut names: HashMap<String, usize> = HashMap::new();
    let mut units = Vec::new();
    for node in nodes {
        let unit = node.unit();
        if seen.insert(unit.core().id()) {
            *names.entry(unit.core().name().to_string()).or_insert(0) += 1;
            units.push(unit.clone());
        }
    }
    if let Some((name, count)) = names.iter().find(|(_, c)| **c > 1) {
        return Err(UnitError::usage(
            graph,
            format!(
                "the name '{}' is used {} times in the graph; unit names must be unique",
                name, count
            ),
        ));
    }
    Ok(units)
}

impl Unit for Graph {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn class_name(&self) -> &str {
        CLASS_NAME
    }

    fn call(
        &self,
        inputs: &Nest<Tensor>,
        args: &CallArgs,
        ctx: &mut CallContext,
    ) -> Result<Nest<Tensor>> {
        let flat = inputs.flatten();
        if flat.len() != self.input_ids.len() {
            return Err(UnitError::usage(
                self.core.name(),
                format!("expected {} inputs, got {}", self.input_ids.len(), flat.len()),
            ));
        }
        let masks: Vec<Option<Tensor>> = match args.get(MASK) {
            Some(Arg::Tensor(m)) => vec![Some(m.clone())],
            Some(Arg::List(items)) => items.iter().map(|a| a.as_tensor().cloned()).collect(),
            _ => Vec::new(),
        };

        let mut values: HashMap<TensorId, Tensor> = HashMap::new();
        for (i, (id, t)) in self.input_ids.iter().zip(flat).enumerate() {
            let t = match masks.get(i) {
                Some(Some(m)) => t.with_mask(Some(m.clone())),
                _ => t.clone(),
            };
            values.insert(*id, t);
        }

        for node in self.computing_nodes() {
            let node_inputs = node.inputs().try_map(|t| self.value_of(t, &values))?;
            let node_args = node
                .args()
                .map_tensors(|t| self.value_of(t, &values).map(Arg::Tensor))?;
            let outputs = node.unit().invoke_in(ctx, &node_inputs, &node_args)?;
            self.store(node, outputs.into_flat(), &mut values)?;
        }
        self.outputs.try_map(|t| self.value_of(t, &values))
    }

    fn compute_mask(
        &self,
        _inputs: &Nest<Tensor>,
        _masks: &Nest<Option<Tensor>>,
    ) -> Result<Option<Nest<Option<Tensor>>>> {
        Ok(None)
    }

    fn compute_output_shape(&self, input_shape: &Nest<Shape>) -> Result<Option<Nest<Shape>>> {
        self.output_shape(input_shape).map(Some)
    }

    fn config(&self) -> Result<Config> {
        match serde_json::to_value(self.describe()?)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Ok(Config::new()),
        }
    }
}
