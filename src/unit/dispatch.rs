//! The call dispatch algorithm.
//!
//! Every invocation runs through [`dispatch`]:
//!
//! 1. validate keywords and input structure before touching any state;
//! 2. classify the mode from the inputs ([`Mode`]);
//! 3. immediate mode (or a nested call inside a trace) runs the call now;
//!    graph-assembly mode traces the call once on the symbolic inputs and
//!    records a [`Node`] for it.
//!
//! Running a call resolves masks and call-context arguments, checks the
//! input spec, builds the unit if needed, autocasts inputs, calls the unit,
//! adds activity penalties and attaches output masks.

use super::input_spec::assert_input_compatibility;
use super::{MaskMismatch, Unit};
use crate::args::{Arg, CallArgs, Presence};
use crate::context::CallContext;
use crate::error::{Result, UnitError};
use crate::nest::Nest;
use crate::node::Node;
use crate::ops;
use crate::shape::Shape;
use crate::tensor::Tensor;
use log::{debug, trace, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;

pub const MASK: &str = "mask";

/// Execution mode of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every input leaf is concrete.
    Immediate,
    /// At least one input leaf or tensor argument is symbolic.
    GraphAssembly,
}

impl Mode {
    pub fn classify(inputs: &Nest<Tensor>, args: &CallArgs) -> Mode {
        let symbolic = inputs
            .flatten()
            .into_iter()
            .chain(args.tensors())
            .any(Tensor::is_symbolic);
        if symbolic {
            Mode::GraphAssembly
        } else {
            Mode::Immediate
        }
    }
}

pub fn dispatch(
    unit: &Arc<dyn Unit>,
    ctx: &mut CallContext,
    inputs: &Nest<Tensor>,
    args: &CallArgs,
) -> Result<Nest<Tensor>> {
    validate_keywords(unit.as_ref(), ctx, args)?;
    validate_structure(unit.as_ref(), inputs)?;

    let mode = Mode::classify(inputs, args);
    trace!(
        "dispatch '{}' mode={:?} depth={}",
        unit.core().name(),
        mode,
        ctx.depth()
    );
    match mode {
        Mode::Immediate => run_call(unit, ctx, inputs, args, false),
        Mode::GraphAssembly if ctx.in_trace() => run_call(unit, ctx, inputs, args, true),
        Mode::GraphAssembly => record_call(unit, ctx, inputs, args),
    }
}

fn validate_keywords(unit: &dyn Unit, ctx: &CallContext, args: &CallArgs) -> Result<()> {
    let core = unit.core();
    for name in args.keyword.keys() {
        let known = name == MASK
            || core.accepts_keyword(name)
            || core.context_default(name).is_some()
            || ctx.defaults().is_known(name);
        if !known {
            return Err(UnitError::usage(
                core.name(),
                format!("unknown keyword argument '{}'", name),
            ));
        }
    }
    Ok(())
}

fn validate_structure(unit: &dyn Unit, inputs: &Nest<Tensor>) -> Result<()> {
    let core = unit.core();
    if inputs.is_empty() {
        return Err(UnitError::usage(core.name(), "a unit must be called with at least one input"));
    }
    if let Some(expected) = core.input_structure() {
        if !inputs.same_structure(&expected) {
            return Err(UnitError::usage(
                core.name(),
                format!(
                    "input structure {:?} does not match the structure {:?} the unit was built with",
                    inputs.structure(),
                    expected
                ),
            ));
        }
    }
    Ok(())
}

/// Graph-assembly mode outside a trace: trace once, then record.
fn record_call(
    unit: &Arc<dyn Unit>,
    ctx: &mut CallContext,
    inputs: &Nest<Tensor>,
    args: &CallArgs,
) -> Result<Nest<Tensor>> {
    let core = unit.core();
    for t in inputs.flatten().into_iter().chain(args.tensors()) {
        if t.is_symbolic() && t.history().is_none() {
            return Err(UnitError::usage(
                core.name(),
                format!(
                    "symbolic input {:?} was not produced by a recorded invocation; \
                     start graphs from `input()`",
                    t
                ),
            ));
        }
    }

    let traced = run_call(unit, ctx, inputs, args, true)?;
    let (node, outputs) = Node::record(unit, inputs, args, &traced)?;
    core.bind_traced_losses(node.id());
    Ok(outputs)
}

/// Runs `call` in a new frame. `tracing` marks a run on symbolic values.
pub(crate) fn run_call(
    unit: &Arc<dyn Unit>,
    ctx: &mut CallContext,
    inputs: &Nest<Tensor>,
    args: &CallArgs,
    tracing: bool,
) -> Result<Nest<Tensor>> {
    let core = unit.core();
    let mut args = args.clone();

    let mut masks = collect_masks(unit.as_ref(), inputs, &args)?;
    let any_mask = masks.flatten().iter().any(|m| m.is_some());
    if any_mask && !core.supports_masking() {
        match core.mask_mismatch() {
            MaskMismatch::Error => {
                return Err(UnitError::masking(
                    core.name(),
                    "unit does not support masking, but was passed an input mask",
                ))
            }
            MaskMismatch::Warn => {
                warn!(
                    "unit '{}' does not support masking; dropping the input mask",
                    core.name()
                );
                masks = masks.map(|_| None);
            }
        }
    }
    if core.accepts_keyword(MASK) {
        if matches!(args.presence(MASK), Presence::Absent | Presence::Null)
            && masks.flatten().iter().any(|m| m.is_some())
        {
            args.set(MASK, mask_arg(&masks));
        }
    } else {
        args.remove(MASK);
    }

    let resolved = resolve_context(unit.as_ref(), ctx, &mut args);
    if !tracing && !ctx.in_call() {
        core.clear_immediate_losses();
    }

    let tracing = tracing || ctx.in_trace();
    ctx.enter(core.name(), resolved, tracing);
    let result = call_in_frame(unit, ctx, inputs, &args, &masks);
    ctx.exit();
    result
}

fn call_in_frame(
    unit: &Arc<dyn Unit>,
    ctx: &mut CallContext,
    inputs: &Nest<Tensor>,
    args: &CallArgs,
    masks: &Nest<Option<Tensor>>,
) -> Result<Nest<Tensor>> {
    let core = unit.core();
    let shapes = inputs.map(Tensor::shape);
    check_frozen_shapes(unit.as_ref(), &shapes)?;
    if let Some(specs) = core.input_spec() {
        assert_input_compatibility(&specs, inputs, core.name())?;
    }
    maybe_build(unit.as_ref(), &shapes, inputs.structure())?;

    let inputs = autocast(unit.as_ref(), inputs);
    let outputs = unit.call(&inputs, args, ctx)?;
    if outputs.is_empty() {
        return Err(UnitError::usage(core.name(), "a unit's call produced no output"));
    }
    core.freeze_structure(&shapes, inputs.structure());
    if let Some(regularizer) = &core.options().activity_regularizer {
        for out in outputs.flatten() {
            core.add_loss(ops::activity_penalty(out, regularizer));
        }
    }
    attach_output_masks(unit.as_ref(), &inputs, masks, outputs)
}

/// Input masks: an explicit `mask` argument wins over masks carried by the inputs.
fn collect_masks(
    unit: &dyn Unit,
    inputs: &Nest<Tensor>,
    args: &CallArgs,
) -> Result<Nest<Option<Tensor>>> {
    let explicit = match args.presence(MASK) {
        Presence::Value(arg) => arg,
        Presence::Absent | Presence::Null => return Ok(inputs.map(|t| t.mask().cloned())),
    };
    let flat: Vec<Option<Tensor>> = match explicit {
        Arg::Tensor(t) => vec![Some(t.clone())],
        Arg::List(items) => items.iter().map(|a| a.as_tensor().cloned()).collect(),
        _ => {
            return Err(UnitError::usage(
                unit.core().name(),
                "the 'mask' argument must be a tensor or a list of tensors",
            ))
        }
    };
    inputs.structure().pack(flat).ok_or_else(|| {
        UnitError::usage(
            unit.core().name(),
            format!("expected {} masks, one per input", inputs.len()),
        )
    })
}

fn mask_arg(masks: &Nest<Option<Tensor>>) -> Arg {
    match masks {
        Nest::Leaf(m) => m.clone().map_or(Arg::Null, Arg::Tensor),
        other => Arg::List(
            other
                .flatten()
                .into_iter()
                .map(|m| m.clone().map_or(Arg::Null, Arg::Tensor))
                .collect(),
        ),
    }
}

/// Resolves call-context arguments and returns what this frame propagates.
///
/// Declared arguments resolve as: explicit value > enclosing call > sticky
/// default > declared default, and are written into `args`. Undeclared
/// context arguments are removed from `args` but still propagated, so a
/// nested unit that declares them sees the value. Explicit null counts as
/// not provided.
fn resolve_context(
    unit: &dyn Unit,
    ctx: &CallContext,
    args: &mut CallArgs,
) -> BTreeMap<String, Arg> {
    let core = unit.core();
    let mut names: BTreeSet<String> = ctx.propagated_names().into_iter().collect();
    names.extend(core.context_args().iter().map(|(n, _)| n.clone()));
    names.extend(
        args.keyword
            .keys()
            .filter(|k| ctx.defaults().is_known(k) && !core.accepts_keyword(k))
            .cloned(),
    );

    let mut resolved = BTreeMap::new();
    for name in names {
        let explicit = match args.presence(&name) {
            Presence::Value(a) => Some(a.clone()),
            Presence::Absent | Presence::Null => None,
        };
        let inherited = explicit.or_else(|| ctx.lookup(&name).cloned());
        match core.context_default(&name) {
            Some(default) => {
                let value = inherited
                    .or_else(|| ctx.defaults().get(&name).filter(|a| !a.is_null()))
                    .unwrap_or_else(|| default.clone());
                args.set(&name, value.clone());
                resolved.insert(name, value);
            }
            None => {
                args.remove(&name);
                if let Some(value) = inherited {
                    resolved.insert(name, value);
                }
            }
        }
    }
    resolved
}

/// Builds the unit on first use. Concurrent callers wait on the build lock
/// and re-check; a unit that calls itself from `build` is rejected.
pub(crate) fn maybe_build(unit: &dyn Unit, shapes: &Nest<Shape>, structure: Nest<()>) -> Result<()> {
    let core = unit.core();
    if core.is_built() {
        return Ok(());
    }
    let me = thread::current().id();
    if *core.building_on.lock() == Some(me) {
        return Err(UnitError::state(
            core.name(),
            "recursive build: the unit was invoked from its own build step",
        ));
    }
    let _guard = core.build_lock.lock();
    if core.is_built() {
        return Ok(());
    }

    *core.building_on.lock() = Some(me);
    let snapshot = core.tracker_snapshot();
    let result = unit.build(shapes);
    *core.building_on.lock() = None;

    match result {
        Ok(()) => {
            debug!("built unit '{}' for input shape {:?}", core.name(), shapes);
            core.mark_built(shapes.clone(), structure);
            Ok(())
        }
        Err(e) => {
            core.restore_tracker(snapshot);
            Err(e)
        }
    }
}

/// A built unit that owns parameters only accepts inputs compatible with
/// the shapes it was built for. The batch axis is not checked.
fn check_frozen_shapes(unit: &dyn Unit, shapes: &Nest<Shape>) -> Result<()> {
    let core = unit.core();
    if core.own_parameters().is_empty() {
        return Ok(());
    }
    let built = match core.build_shape() {
        Some(b) => b,
        None => return Ok(()),
    };
    for (given, expected) in shapes.flatten().into_iter().zip(built.flatten()) {
        if !given
            .with_batch_unknown()
            .is_compatible_with(&expected.with_batch_unknown())
        {
            return Err(UnitError::state(
                core.name(),
                format!(
                    "input shape {} is incompatible with the shape {} the unit was built for",
                    given, expected
                ),
            ));
        }
    }
    Ok(())
}

fn autocast(unit: &dyn Unit, inputs: &Nest<Tensor>) -> Nest<Tensor> {
    let core = unit.core();
    let compute = core.policy().compute_dtype();
    if !core.autocast() {
        return inputs.clone();
    }
    inputs.map(|t| {
        if t.dtype().is_floating() && t.dtype() != compute {
            ops::cast(t, compute).with_mask(t.mask().cloned())
        } else {
            t.clone()
        }
    })
}

/// Outputs that all carry masks keep them; otherwise masking units get
/// their masks from `compute_mask`.
fn attach_output_masks(
    unit: &dyn Unit,
    inputs: &Nest<Tensor>,
    masks: &Nest<Option<Tensor>>,
    outputs: Nest<Tensor>,
) -> Result<Nest<Tensor>> {
    let core = unit.core();
    if outputs.flatten().iter().all(|t| t.mask().is_some()) || !core.supports_masking() {
        return Ok(outputs);
    }
    let out_masks = match unit.compute_mask(inputs, masks)? {
        Some(m) => m,
        None => return Ok(outputs),
    };
    let flat_masks = out_masks.into_flat();
    let n = outputs.len();
    let per_output: Vec<Option<Tensor>> = if flat_masks.len() == n {
        flat_masks
    } else if flat_masks.len() == 1 {
        vec![flat_masks[0].clone(); n]
    } else {
        return Err(UnitError::usage(
            core.name(),
            format!("compute_mask returned {} masks for {} outputs", flat_masks.len(), n),
        ));
    };
    let structure = outputs.structure();
    let masked: Vec<Tensor> = outputs
        .into_flat()
        .into_iter()
        .zip(per_output)
        .map(|(t, m)| match m {
            Some(mask) => t.with_mask(Some(mask)),
            None => t,
        })
        .collect();
    structure
        .pack(masked)
        .ok_or_else(|| UnitError::state(core.name(), "output structure changed while masking"))
}
