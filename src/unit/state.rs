//! Framework-owned state of a unit.

use super::{Config, InputSpec, MaskMismatch, Unit, UnitId, UnitOptions};
use crate::args::Arg;
use crate::dtype::DTypePolicy;
use crate::error::{Result, UnitError};
use crate::metrics::{Aggregation, MetricRegistry, SharedMetric};
use crate::naming::{to_snake_case, unique_name};
use crate::nest::Nest;
use crate::node::{Node, NodeId};
use crate::ops;
use crate::param::{Parameter, ParameterSpec};
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::tracking::{Tracked, Tracker};
use crate::value::Value;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Where a recorded loss came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossOrigin {
    /// Added while running on concrete values; cleared by the next outermost call.
    Immediate,
    /// Added while tracing; bound to the invocation that traced it.
    Traced(Option<NodeId>),
}

pub(crate) struct LossSnapshot {
    own: Vec<LossRecord>,
    below: Vec<(Arc<dyn Unit>, Vec<LossRecord>)>,
}

#[derive(Clone)]
struct LossRecord {
    value: Tensor,
    origin: LossOrigin,
}

#[derive(Default)]
struct CoreState {
    built: bool,
    build_shape: Option<Nest<Shape>>,
    input_structure: Option<Nest<()>>,
    tracker: Tracker,
}

pub struct UnitCore {
    id: UnitId,
    name: String,
    options: UnitOptions,
    policy: DTypePolicy,
    supports_masking: bool,
    context_args: Vec<(String, Arg)>,
    keywords: BTreeSet<String>,
    trainable: AtomicBool,
    state: RwLock<CoreState>,
    input_spec: RwLock<Option<Vec<InputSpec>>>,
    pub(crate) build_lock: Mutex<()>,
    pub(crate) building_on: Mutex<Option<ThreadId>>,
    losses: Mutex<Vec<LossRecord>>,
    metrics: MetricRegistry,
    invocations: Mutex<Vec<Weak<Node>>>,
    downstream: Mutex<Vec<Weak<Node>>>,
}

impl UnitCore {
    /// Core for a unit of `class_name`. Without an explicit name the unit is
    /// named after its class, uniquified per process.
    pub fn new(class_name: &str, options: UnitOptions) -> Result<Self> {
        let name = match &options.name {
            Some(n) => n.clone(),
            None => unique_name(&to_snake_case(class_name)),
        };
        let policy = options.policy().ok_or_else(|| {
            UnitError::usage(&name, format!("unknown dtype policy '{}'", options.dtype))
        })?;
        let mut options = options;
        options.name = Some(name.clone());
        Ok(Self {
            id: UnitId(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed)),
            trainable: AtomicBool::new(options.trainable),
            name,
            options,
            policy,
            supports_masking: false,
            context_args: Vec::new(),
            keywords: BTreeSet::new(),
            state: RwLock::new(CoreState::default()),
            input_spec: RwLock::new(None),
            build_lock: Mutex::new(()),
            building_on: Mutex::new(None),
            losses: Mutex::new(Vec::new()),
            metrics: MetricRegistry::new(),
            invocations: Mutex::new(Vec::new()),
            downstream: Mutex::new(Vec::new()),
        })
    }

    /// Declares a call-context argument and the value used when nothing
    /// else provides one.
    pub fn with_context_arg(mut self, name: &str, default: Arg) -> Self {
        self.context_args.retain(|(n, _)| n != name);
        self.context_args.push((name.to_string(), default));
        self
    }

    /// Declares a plain keyword argument that `call` understands.
    pub fn accept_keyword(mut self, name: &str) -> Self {
        self.keywords.insert(name.to_string());
        self
    }

    /// Publishes the constraints checked on every call, one per input.
    pub fn with_input_spec(mut self, spec: Vec<InputSpec>) -> Self {
        *self.input_spec.get_mut() = Some(spec);
        self
    }

    pub fn with_masking(mut self, supports_masking: bool) -> Self {
        self.supports_masking = supports_masking;
        self
    }

    /// Marks a unit that needs no build step.
    pub fn prebuilt(mut self) -> Self {
        self.state.get_mut().built = true;
        self
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &UnitOptions {
        &self.options
    }

    pub fn policy(&self) -> &DTypePolicy {
        &self.policy
    }

    pub fn autocast(&self) -> bool {
        self.options.autocast
    }

    pub fn mask_mismatch(&self) -> MaskMismatch {
        self.options.mask_mismatch
    }

    pub fn supports_masking(&self) -> bool {
        self.supports_masking
    }

    pub fn context_args(&self) -> &[(String, Arg)] {
        &self.context_args
    }

    pub fn context_default(&self, name: &str) -> Option<&Arg> {
        self.context_args
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }

    pub fn accepts_keyword(&self, name: &str) -> bool {
        self.keywords.contains(name)
    }

    pub fn input_spec(&self) -> Option<Vec<InputSpec>> {
        self.input_spec.read().clone()
    }

    /// Replaces the input constraints, typically from `build` once the
    /// input size is known.
    pub fn set_input_spec(&self, spec: Option<Vec<InputSpec>>) {
        *self.input_spec.write() = spec;
    }

    pub fn base_config(&self) -> Result<Config> {
        let mut options = self.options.clone();
        options.trainable = self.trainable();
        options.to_config()
    }

    // --- build state ---

    pub fn is_built(&self) -> bool {
        self.state.read().built
    }

    pub fn build_shape(&self) -> Option<Nest<Shape>> {
        self.state.read().build_shape.clone()
    }

    pub fn input_structure(&self) -> Option<Nest<()>> {
        self.state.read().input_structure.clone()
    }

    pub(crate) fn mark_built(&self, shape: Nest<Shape>, structure: Nest<()>) {
        let mut state = self.state.write();
        state.built = true;
        state.build_shape = Some(shape);
        state.input_structure = Some(structure);
    }

    /// Freezes the input structure of a unit that was built without seeing
    /// an input (see [`UnitCore::prebuilt`]).
    pub(crate) fn freeze_structure(&self, shape: &Nest<Shape>, structure: Nest<()>) {
        let mut state = self.state.write();
        if state.input_structure.is_none() {
            state.input_structure = Some(structure);
            if state.build_shape.is_none() {
                state.build_shape = Some(shape.clone());
            }
        }
    }

    pub(crate) fn tracker_snapshot(&self) -> Tracker {
        self.state.read().tracker.clone()
    }

    pub(crate) fn restore_tracker(&self, tracker: Tracker) {
        self.state.write().tracker = tracker;
    }

    // --- parameters and children ---

    /// Allocates a parameter and registers it under `attr`.
    pub fn add_weight(&self, attr: &str, spec: ParameterSpec) -> Result<Parameter> {
        let dtype = spec.dtype.unwrap_or(self.policy.variable_dtype());
        if spec.trainable && !dtype.is_floating() {
            return Err(UnitError::usage(
                &self.name,
                format!(
                    "weight '{}' has dtype {}; only floating-point weights can be trainable",
                    spec.name, dtype
                ),
            ));
        }
        let param = Parameter::allocate(spec, dtype);
        debug!(
            "unit '{}' created weight '{}' {} {}",
            self.name,
            param.name(),
            param.shape(),
            param.dtype()
        );
        self.state
            .write()
            .tracker
            .assign(attr, Tracked::Parameter(param.clone()));
        Ok(param)
    }

    /// Registers a child unit under `attr`.
    pub fn track_unit(&self, attr: &str, unit: Arc<dyn Unit>) {
        self.state.write().tracker.assign(attr, Tracked::Unit(unit));
    }

    pub fn track_parameter(&self, attr: &str, param: Parameter) {
        self.state.write().tracker.assign(attr, Tracked::Parameter(param));
    }

    pub fn untrack(&self, attr: &str) -> Option<Tracked> {
        self.state.write().tracker.remove(attr)
    }

    pub fn tracked(&self, attr: &str) -> Option<Tracked> {
        self.state.read().tracker.get(attr).cloned()
    }

    /// Parameters registered directly on this unit, trainable ones first.
    pub fn own_parameters(&self) -> Vec<Parameter> {
        self.state.read().tracker.parameters()
    }

    pub fn children(&self) -> Vec<Arc<dyn Unit>> {
        self.state.read().tracker.units().to_vec()
    }

    /// Every unit below this one, depth first, each once.
    pub fn descendants(&self) -> Vec<Arc<dyn Unit>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack: Vec<Arc<dyn Unit>> = self.children().into_iter().rev().collect();
        while let Some(unit) = stack.pop() {
            if !seen.insert(unit.core().id()) {
                continue;
            }
            stack.extend(unit.core().children().into_iter().rev());
            out.push(unit);
        }
        out
    }

    pub fn trainable(&self) -> bool {
        self.trainable.load(Ordering::SeqCst)
    }

    /// Sets the trainable flag on this unit and every unit below it.
    pub fn set_trainable(&self, trainable: bool) {
        self.trainable.store(trainable, Ordering::SeqCst);
        for child in self.descendants() {
            child.core().trainable.store(trainable, Ordering::SeqCst);
        }
    }

    pub fn trainable_weights(&self) -> Vec<Parameter> {
        if !self.trainable() {
            return Vec::new();
        }
        let state = self.state.read();
        let mut out: Vec<Parameter> = state.tracker.trainable().to_vec();
        drop(state);
        for child in self.children() {
            out.extend(child.core().trainable_weights());
        }
        dedup(out)
    }

    pub fn non_trainable_weights(&self) -> Vec<Parameter> {
        let state = self.state.read();
        let mut out: Vec<Parameter> = if self.trainable() {
            state.tracker.non_trainable().to_vec()
        } else {
            state.tracker.parameters()
        };
        drop(state);
        for child in self.children() {
            if self.trainable() {
                out.extend(child.core().non_trainable_weights());
            } else {
                out.extend(child.core().weights());
            }
        }
        dedup(out)
    }

    /// Trainable weights, then non-trainable weights.
    pub fn weights(&self) -> Vec<Parameter> {
        let mut out = self.trainable_weights();
        out.extend(self.non_trainable_weights());
        dedup(out)
    }

    pub fn count_params(&self) -> usize {
        self.weights().iter().map(Parameter::len).sum()
    }

    /// Current values of [`UnitCore::weights`], in the same order.
    pub fn get_weights(&self) -> Vec<Value> {
        self.weights().iter().map(Parameter::read).collect()
    }

    /// Assigns `values` to [`UnitCore::weights`] in order. The count and every
    /// shape are checked before anything is written.
    pub fn set_weights(&self, values: &[Value]) -> Result<()> {
        let params = self.weights();
        if params.len() != values.len() {
            return Err(UnitError::usage(
                &self.name,
                format!(
                    "set_weights was given {} values, but the unit has {} weights",
                    values.len(),
                    params.len()
                ),
            ));
        }
        for (param, value) in params.iter().zip(values) {
            param.check_assignable(value).map_err(|_| {
                UnitError::usage(
                    &self.name,
                    format!(
                        "weight '{}' has shape {}, which is not compatible with the provided shape {}",
                        param.name(),
                        param.shape(),
                        value.shape()
                    ),
                )
            })?;
        }
        for (param, value) in params.iter().zip(values) {
            param.assign(value)?;
        }
        Ok(())
    }

    // --- losses ---

    /// Records a loss. Symbolic losses are bound to the invocation being
    /// traced; concrete ones live until the next outermost call.
    pub fn add_loss(&self, loss: Tensor) {
        let origin = if loss.is_symbolic() {
            LossOrigin::Traced(None)
        } else {
            LossOrigin::Immediate
        };
        self.losses.lock().push(LossRecord {
            value: loss,
            origin,
        });
    }

    /// Own and descendant losses, followed by weight regularization penalties.
    pub fn losses(&self) -> Vec<Tensor> {
        let mut out: Vec<Tensor> = self.losses.lock().iter().map(|r| r.value.clone()).collect();
        out.extend(self.regularization_losses());
        for child in self.descendants() {
            out.extend(child.core().losses.lock().iter().map(|r| r.value.clone()));
            out.extend(child.core().regularization_losses());
        }
        out
    }

    pub fn loss_origins(&self) -> Vec<LossOrigin> {
        self.losses.lock().iter().map(|r| r.origin).collect()
    }

    fn regularization_losses(&self) -> Vec<Tensor> {
        self.own_parameters()
            .iter()
            .filter_map(Parameter::regularization_loss)
            .map(|penalty| {
                Tensor::new(Value::filled(&[], penalty, self.policy.variable_dtype()))
            })
            .collect()
    }

    /// Loss lists of this unit and every unit below it.
    pub(crate) fn loss_snapshot(&self) -> LossSnapshot {
        LossSnapshot {
            own: self.losses.lock().clone(),
            below: self
                .descendants()
                .into_iter()
                .map(|u| {
                    let records = u.core().losses.lock().clone();
                    (u, records)
                })
                .collect(),
        }
    }

    /// Drops every loss added since `snapshot` was taken.
    pub(crate) fn restore_losses(&self, snapshot: LossSnapshot) {
        *self.losses.lock() = snapshot.own;
        for (unit, records) in snapshot.below {
            *unit.core().losses.lock() = records;
        }
    }

    pub(crate) fn clear_immediate_losses(&self) {
        let clear = |core: &UnitCore| {
            core.losses
                .lock()
                .retain(|r| r.origin != LossOrigin::Immediate);
        };
        clear(self);
        for child in self.descendants() {
            clear(child.core());
        }
    }

    pub(crate) fn bind_traced_losses(&self, node: NodeId) {
        let bind = |core: &UnitCore| {
            for record in core.losses.lock().iter_mut() {
                if record.origin == LossOrigin::Traced(None) {
                    record.origin = LossOrigin::Traced(Some(node));
                }
            }
        };
        bind(self);
        for child in self.descendants() {
            bind(child.core());
        }
    }

    // --- metrics ---

    /// Folds `value` into the metric called `name`. Symbolic values only
    /// register the metric.
    pub fn add_metric(&self, name: &str, value: &Tensor, aggregation: Aggregation) -> Result<()> {
        let metric = self.metrics.get_or_create(&self.name, name, aggregation)?;
        if let Some(v) = ops::mean_all(value).value() {
            let scalar = v.to_f64().iter().next().copied().unwrap_or(0.0);
            metric.lock().update(scalar);
        }
        Ok(())
    }

    /// Metrics of this unit and every unit below it. Two units reporting
    /// the same metric name is a state error.
    pub fn metrics(&self) -> Result<Vec<SharedMetric>> {
        let mut names: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        let mut collect = |core: &UnitCore| -> Result<()> {
            for metric in core.metrics.all() {
                let name = metric.lock().name().to_string();
                if !names.insert(name.clone()) {
                    return Err(UnitError::state(
                        core.name(),
                        format!("metric name '{}' is reported by more than one unit", name),
                    ));
                }
                out.push(metric);
            }
            Ok(())
        };
        collect(self)?;
        for child in self.descendants() {
            collect(child.core())?;
        }
        Ok(out)
    }

    pub fn metric_registry(&self) -> &MetricRegistry {
        &self.metrics
    }

    // --- invocation records ---

    /// Records this unit produced, indexed by invocation. Records are owned
    /// by the tensors and graphs that use them; an entry is `None` once
    /// nothing refers to that record any more.
    pub fn invocations(&self) -> Vec<Option<Arc<Node>>> {
        self.invocations.lock().iter().map(Weak::upgrade).collect()
    }

    /// Number of recorded invocations so far, released ones included.
    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }

    pub fn invocation(&self, index: usize) -> Option<Arc<Node>> {
        self.invocations.lock().get(index).and_then(Weak::upgrade)
    }

    /// Records that consumed an output of this unit.
    pub fn downstream(&self) -> Vec<Arc<Node>> {
        self.downstream
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Creates the next record under the invocation lock, so indices are
    /// handed out in order.
    pub(crate) fn register_invocation(&self, make: impl FnOnce(usize) -> Arc<Node>) -> Arc<Node> {
        let mut invocations = self.invocations.lock();
        let node = make(invocations.len());
        invocations.push(Arc::downgrade(&node));
        node
    }

    pub(crate) fn register_downstream(&self, node: &Arc<Node>) {
        let mut downstream = self.downstream.lock();
        let known = downstream
            .iter()
            .filter_map(Weak::upgrade)
            .any(|n| n.id() == node.id());
        if !known {
            downstream.push(Arc::downgrade(node));
        }
    }
}

fn dedup(params: Vec<Parameter>) -> Vec<Parameter> {
    let mut seen = HashSet::new();
    params.into_iter().filter(|p| seen.insert(p.id())).collect()
}
