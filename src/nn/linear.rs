//! Fully connected unit: `y = activation(x · kernel + bias)`.
//!
//! The kernel is created on first use from the last input dimension, so
//! the same `Dense` can be declared before its input size is known.

use super::{config_map, parse_config};
use crate::args::CallArgs;
use crate::context::CallContext;
use crate::error::{Result, UnitError};
use crate::nest::Nest;
use crate::ops;
use crate::param::{GlorotUniform, Parameter, ParameterSpec, Regularizer, Zeros, L1L2};
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::unit::{Config, InputSpec, Unit, UnitCore, UnitOptions};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

pub const CLASS_NAME: &str = "Dense";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseConfig {
    pub units: usize,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default = "default_use_bias")]
    pub use_bias: bool,
    #[serde(default)]
    pub kernel_regularizer: Option<L1L2>,
    /// Seed for the kernel initializer; random when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(flatten)]
    pub options: UnitOptions,
}

fn default_use_bias() -> bool {
    true
}

impl DenseConfig {
    pub fn new(units: usize) -> Self {
        Self {
            units,
            activation: Activation::Linear,
            use_bias: true,
            kernel_regularizer: None,
            seed: None,
            options: UnitOptions::new(),
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    pub fn with_kernel_regularizer(mut self, reg: L1L2) -> Self {
        self.kernel_regularizer = Some(reg);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_options(mut self, options: UnitOptions) -> Self {
        self.options = options;
        self
    }
}

pub struct Dense {
    core: UnitCore,
    config: DenseConfig,
    kernel: OnceLock<Parameter>,
    bias: OnceLock<Parameter>,
}

impl Dense {
    pub fn new(config: DenseConfig) -> Result<Arc<Self>> {
        let core = UnitCore::new(CLASS_NAME, config.options.clone())?
            .with_masking(true)
            .with_input_spec(vec![InputSpec::new().with_min_ndim(2)]);
        if config.units == 0 {
            return Err(UnitError::usage(core.name(), "Dense needs at least one output unit"));
        }
        Ok(Arc::new(Self {
            core,
            config,
            kernel: OnceLock::new(),
            bias: OnceLock::new(),
        }))
    }

    /// `Dense` with `units` outputs and default options.
    pub fn with_units(units: usize) -> Result<Arc<Self>> {
        Self::new(DenseConfig::new(units))
    }

    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        Self::new(parse_config(config)?)
    }

    pub fn units(&self) -> usize {
        self.config.units
    }

    pub fn kernel(&self) -> Option<&Parameter> {
        self.kernel.get()
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.get()
    }

    fn input_dim(&self, shape: &Shape) -> Result<usize> {
        match shape.dim(-1) {
            Some(Some(d)) => Ok(d),
            _ => Err(UnitError::state(
                self.core.name(),
                format!("the last dimension of the input must be defined, got {}", shape),
            )),
        }
    }
}

impl Unit for Dense {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn class_name(&self) -> &str {
        CLASS_NAME
    }

    fn build(&self, input_shape: &Nest<Shape>) -> Result<()> {
        let shape = input_shape.as_leaf().ok_or_else(|| {
            UnitError::usage(self.core.name(), "Dense takes a single input tensor")
        })?;
        let input_dim = self.input_dim(shape)?;

        let regularizer = self
            .config
            .kernel_regularizer
            .map(|r| Arc::new(r) as Arc<dyn Regularizer>);
        let kernel = self.core.add_weight(
            "kernel",
            ParameterSpec::new("kernel", &[input_dim, self.config.units])
                .with_initializer(GlorotUniform {
                    seed: self.config.seed,
                })
                .with_regularizer(regularizer),
        )?;
        let bias = if self.config.use_bias {
            Some(self.core.add_weight(
                "bias",
                ParameterSpec::new("bias", &[self.config.units]).with_initializer(Zeros),
            )?)
        } else {
            None
        };

        // A concurrent build waits on the build lock, so these are unset here.
        let _ = self.kernel.set(kernel);
        if let Some(b) = bias {
            let _ = self.bias.set(b);
        }
        self.core.set_input_spec(Some(vec![InputSpec::new()
            .with_min_ndim(2)
            .with_axis(-1, input_dim)]));
        Ok(())
    }

    fn call(&self, inputs: &Nest<Tensor>, _args: &CallArgs, _ctx: &mut CallContext) -> Result<Nest<Tensor>> {
        let x = inputs.as_leaf().ok_or_else(|| {
            UnitError::usage(self.core.name(), "Dense takes a single input tensor")
        })?;
        let kernel = self
            .kernel
            .get()
            .ok_or_else(|| UnitError::state(self.core.name(), "kernel read before build"))?;
        let compute = x.dtype();

        let mut y = ops::matmul(x, &Tensor::new(kernel.value_as(compute)))?;
        if let Some(bias) = self.bias.get() {
            y = ops::add(&y, &Tensor::new(bias.value_as(compute)))?;
        }
        if self.config.activation == Activation::Relu {
            y = ops::relu(&y);
        }
        Ok(Nest::Leaf(y))
    }

    fn compute_output_shape(&self, input_shape: &Nest<Shape>) -> Result<Option<Nest<Shape>>> {
        let shape = input_shape.as_leaf().ok_or_else(|| {
            UnitError::usage(self.core.name(), "Dense takes a single input tensor")
        })?;
        self.input_dim(shape)?;
        let out = shape
            .with_dim(-1, Some(self.config.units))
            .ok_or_else(|| UnitError::usage(self.core.name(), "Dense needs an input of rank >= 1"))?;
        Ok(Some(Nest::Leaf(out)))
    }

    fn config(&self) -> Result<Config> {
        let mut config = self.config.clone();
        config.options = UnitOptions::from_config(&self.core.base_config()?)?;
        config_map(&config)
    }
}
