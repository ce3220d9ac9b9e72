//! Units: stateful, callable building blocks.
//!
//! A unit implements [`Unit`] (what it computes) and owns a [`UnitCore`]
//! (everything the framework tracks for it). Callers never invoke
//! `Unit::call` directly; they go through [`Invoke`], which runs the
//! dispatch algorithm in [`dispatch`]: mode classification, context
//! resolution, lazy build, autocast, the call itself, invocation recording
//! and mask propagation.

pub mod state;
pub mod dispatch;
pub mod input_spec;

pub use self::input_spec::InputSpec;
pub use self::state::{LossOrigin, UnitCore};

use crate::args::CallArgs;
use crate::context::CallContext;
use crate::dtype::DTypePolicy;
use crate::error::{Result, UnitError};
use crate::nest::Nest;
use crate::param::L1L2;
use crate::shape::Shape;
use crate::tensor::{Tensor, TensorSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Plain key/value description of a unit's constructor arguments.
pub type Config = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub(crate) u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// What happens when a unit without mask support receives a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskMismatch {
    /// Fail with a masking error.
    #[default]
    Error,
    /// Log a warning and drop the mask.
    Warn,
}

/// Options shared by every unit, stored in the unit's base config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitOptions {
    pub name: Option<String>,
    pub trainable: bool,
    pub dtype: String,
    pub autocast: bool,
    pub mask_mismatch: MaskMismatch,
    /// Penalty on the unit's outputs, added as a loss on every call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_regularizer: Option<L1L2>,
}

impl Default for UnitOptions {
    fn default() -> Self {
        Self {
            name: None,
            trainable: true,
            dtype: "float32".to_string(),
            autocast: true,
            mask_mismatch: MaskMismatch::Error,
            activity_regularizer: None,
        }
    }
}

impl UnitOptions {
    /// Default options: trainable, `float32` policy, autocast on.
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit unit name; without one the class name is used, uniquified.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Initial trainable flag; see [`UnitCore::set_trainable`].
    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    /// Dtype policy by name, e.g. `"mixed_float16"`. Checked when the core is created.
    pub fn with_dtype_policy(mut self, policy: &str) -> Self {
        self.dtype = policy.to_string();
        self
    }

    /// Whether floating inputs are cast to the compute dtype before `call`.
    pub fn with_autocast(mut self, autocast: bool) -> Self {
        self.autocast = autocast;
        self
    }

    /// How a unit without mask support treats an incoming mask.
    pub fn with_mask_mismatch(mut self, mode: MaskMismatch) -> Self {
        self.mask_mismatch = mode;
        self
    }

    pub fn with_activity_regularizer(mut self, regularizer: L1L2) -> Self {
        self.activity_regularizer = Some(regularizer);
        self
    }

    /// The policy named by `dtype`, if it is a known one.
    pub fn policy(&self) -> Option<DTypePolicy> {
        DTypePolicy::from_name(&self.dtype)
    }

    /// Reads the base options out of a unit config; unknown keys are ignored.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            config.clone(),
        ))?)
    }

    /// The options as a JSON object, merged into every unit's config.
    pub fn to_config(&self) -> Result<Config> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Ok(Config::new()),
        }
    }
}

/// A stateful, callable building block.
pub trait Unit: Send + Sync + 'static {
    fn core(&self) -> &UnitCore;

    fn class_name(&self) -> &str;

    /// Creates parameters once input shapes are known. Runs at most once.
    fn build(&self, _input_shape: &Nest<Shape>) -> Result<()> {
        Ok(())
    }

    fn call(
        &self,
        inputs: &Nest<Tensor>,
        args: &CallArgs,
        ctx: &mut CallContext,
    ) -> Result<Nest<Tensor>>;

    /// Output masks for the given input masks. The default passes input
    /// masks through unchanged; it is only consulted for masking units.
    fn compute_mask(
        &self,
        _inputs: &Nest<Tensor>,
        masks: &Nest<Option<Tensor>>,
    ) -> Result<Option<Nest<Option<Tensor>>>> {
        if masks.flatten().iter().all(|m| m.is_none()) {
            return Ok(None);
        }
        Ok(Some(masks.clone()))
    }

    /// Output shapes without running the computation. `None` means the
    /// shapes are found by tracing `call` on placeholders.
    fn compute_output_shape(&self, _input_shape: &Nest<Shape>) -> Result<Option<Nest<Shape>>> {
        Ok(None)
    }

    /// Spec of the tensor a source unit emits. Only source units return one.
    fn source_spec(&self) -> Option<TensorSpec> {
        None
    }

    /// Constructor arguments as a plain key/value map.
    fn config(&self) -> Result<Config> {
        self.core().base_config()
    }
}

/// Entry points that run the full dispatch algorithm.
pub trait Invoke {
    fn unit_handle(&self) -> Arc<dyn Unit>;

    /// Invokes with a fresh call context.
    fn invoke(&self, inputs: impl Into<Nest<Tensor>>) -> Result<Nest<Tensor>> {
        let mut ctx = CallContext::new();
        self.invoke_in(&mut ctx, &inputs.into(), &CallArgs::new())
    }

    fn invoke_with(&self, inputs: impl Into<Nest<Tensor>>, args: &CallArgs) -> Result<Nest<Tensor>> {
        let mut ctx = CallContext::new();
        self.invoke_in(&mut ctx, &inputs.into(), args)
    }

    fn invoke_in(
        &self,
        ctx: &mut CallContext,
        inputs: &Nest<Tensor>,
        args: &CallArgs,
    ) -> Result<Nest<Tensor>> {
        dispatch::dispatch(&self.unit_handle(), ctx, inputs, args)
    }

    /// Single tensor in, single tensor out.
    fn apply(&self, input: &Tensor) -> Result<Tensor> {
        let mut ctx = CallContext::new();
        self.apply_in(&mut ctx, input, &CallArgs::new())
    }

    fn apply_in(&self, ctx: &mut CallContext, input: &Tensor, args: &CallArgs) -> Result<Tensor> {
        let unit = self.unit_handle();
        match self.invoke_in(ctx, &Nest::Leaf(input.clone()), args)? {
            Nest::Leaf(t) => Ok(t),
            other => Err(UnitError::usage(
                unit.core().name(),
                format!("expected a single output tensor, got {} outputs", other.len()),
            )),
        }
    }
}

impl<U: Unit> Invoke for Arc<U> {
    fn unit_handle(&self) -> Arc<dyn Unit> {
        self.clone()
    }
}

impl Invoke for Arc<dyn Unit> {
    fn unit_handle(&self) -> Arc<dyn Unit> {
        self.clone()
    }
}
