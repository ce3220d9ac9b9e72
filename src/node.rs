//! Invocation records.
//!
//! A `Node` is created for every call made in graph-assembly mode (and for
//! every source tensor). It holds strong references to the tensors it
//! consumed, and through their histories to the upstream nodes and units,
//! so a set of output tensors keeps alive exactly the graph that produced
//! them. Units index their nodes through weak handles only.

use crate::args::CallArgs;
use crate::error::{Result, UnitError};
use crate::nest::Nest;
use crate::shape::Shape;
use crate::tensor::{History, Tensor, TensorId, TensorSpec};
use crate::unit::Unit;
use crate::value::Value;
use log::trace;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Where one input of a recorded invocation comes from.
#[derive(Clone)]
pub enum InputRef {
    Upstream { node: Arc<Node>, slot: usize },
    Constant(Value),
}

pub struct Node {
    id: NodeId,
    unit: Arc<dyn Unit>,
    index: usize,
    inputs: Nest<Tensor>,
    args: CallArgs,
    outputs: Nest<TensorSpec>,
    output_ids: Vec<TensorId>,
}

impl Node {
    /// Records one graph-mode invocation of `unit` and returns the outputs
    /// stamped with their history.
    pub(crate) fn record(
        unit: &Arc<dyn Unit>,
        inputs: &Nest<Tensor>,
        args: &CallArgs,
        traced: &Nest<Tensor>,
    ) -> Result<(Arc<Node>, Nest<Tensor>)> {
        let specs = traced.map(Tensor::spec);
        let output_ids: Vec<TensorId> = (0..traced.len()).map(|_| TensorId::fresh()).collect();
        let node = unit.core().register_invocation(|index| {
            Arc::new(Node {
                id: NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)),
                unit: unit.clone(),
                index,
                inputs: inputs.clone(),
                args: args.clone(),
                outputs: specs,
                output_ids: output_ids.clone(),
            })
        });
        for (upstream, _) in node.upstream() {
            upstream.unit.core().register_downstream(&node);
        }

        let structure = traced.structure();
        let stamped: Vec<Tensor> = traced
            .flatten()
            .into_iter()
            .zip(output_ids)
            .enumerate()
            .map(|(slot, (t, id))| {
                Tensor::recorded(
                    id,
                    t.spec(),
                    History {
                        node: node.clone(),
                        slot,
                    },
                    t.mask().cloned(),
                )
            })
            .collect();
        trace!(
            "recorded {} of unit '{}' with {} outputs",
            node.id,
            node.unit.core().name(),
            stamped.len()
        );
        let outputs = structure.pack(stamped).ok_or_else(|| {
            UnitError::state(node.unit.core().name(), "output structure changed while recording")
        })?;
        Ok((node, outputs))
    }

    /// Records the source invocation of a unit that emits a tensor without
    /// consuming any (see [`Unit::source_spec`]).
    pub fn source(unit: Arc<dyn Unit>) -> Result<Tensor> {
        let spec = unit.source_spec().ok_or_else(|| {
            UnitError::usage(unit.core().name(), "unit is not a source unit")
        })?;
        let placeholder = Nest::Leaf(Tensor::placeholder(spec));
        let (_, outputs) =
            Node::record(&unit, &Nest::List(Vec::new()), &CallArgs::new(), &placeholder)?;
        match outputs {
            Nest::Leaf(t) => Ok(t),
            _ => Err(UnitError::state(unit.core().name(), "source produced no tensor")),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn unit(&self) -> &Arc<dyn Unit> {
        &self.unit
    }

    /// Position of this record among the producing unit's invocations.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn inputs(&self) -> &Nest<Tensor> {
        &self.inputs
    }

    pub fn args(&self) -> &CallArgs {
        &self.args
    }

    pub fn output_specs(&self) -> &Nest<TensorSpec> {
        &self.outputs
    }

    pub fn output_ids(&self) -> &[TensorId] {
        &self.output_ids
    }

    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Where each flattened input comes from. A symbolic input without a
    /// producing record has no reference and is a usage error.
    pub fn input_refs(&self) -> Result<Vec<InputRef>> {
        self.inputs
            .flatten()
            .into_iter()
            .map(|t| match (t.history(), t.value()) {
                (Some(h), _) => Ok(InputRef::Upstream {
                    node: h.node.clone(),
                    slot: h.slot,
                }),
                (None, Some(v)) => Ok(InputRef::Constant(v.clone())),
                (None, None) => Err(UnitError::usage(
                    self.unit.core().name(),
                    format!("symbolic input {:?} has no producing record", t),
                )),
            })
            .collect()
    }

    /// Upstream records feeding this one, through inputs and tensor
    /// arguments, in order, with the slot each tensor came from.
    pub fn upstream(&self) -> Vec<(Arc<Node>, usize)> {
        self.inputs
            .flatten()
            .into_iter()
            .chain(self.args.tensors())
            .filter_map(|t| t.history().map(|h| (h.node.clone(), h.slot)))
            .collect()
    }

    /// Symbolic tensors this record depends on: inputs then tensor arguments.
    pub fn dependencies(&self) -> Vec<&Tensor> {
        self.inputs
            .flatten()
            .into_iter()
            .chain(self.args.tensors())
            .filter(|t| t.is_symbolic())
            .collect()
    }

    pub fn input_shapes(&self) -> Nest<Shape> {
        self.inputs.map(Tensor::shape)
    }

    pub fn output_shapes(&self) -> Nest<Shape> {
        self.outputs.map(|s| s.shape.clone())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("unit", &self.unit.core().name())
            .field("index", &self.index)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.output_ids.len())
            .finish()
    }
}
