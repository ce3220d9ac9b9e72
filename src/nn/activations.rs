//! Stateless activation units.

use super::parse_config;
use crate::args::CallArgs;
use crate::context::CallContext;
use crate::error::Result;
use crate::nest::Nest;
use crate::ops;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::unit::{Config, Unit, UnitCore, UnitOptions};
use std::sync::Arc;

pub const RELU: &str = "Relu";

/// Element-wise `max(x, 0)`. Masks pass through.
pub struct Relu {
    core: UnitCore,
}

impl Relu {
    pub fn new(options: UnitOptions) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            core: UnitCore::new(RELU, options)?.with_masking(true).prebuilt(),
        }))
    }

    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        Self::new(parse_config(config)?)
    }
}

impl Unit for Relu {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn class_name(&self) -> &str {
        RELU
    }

    fn call(&self, inputs: &Nest<Tensor>, _args: &CallArgs, _ctx: &mut CallContext) -> Result<Nest<Tensor>> {
        Ok(inputs.map(ops::relu))
    }

    fn compute_output_shape(&self, input_shape: &Nest<Shape>) -> Result<Option<Nest<Shape>>> {
        Ok(Some(input_shape.clone()))
    }
}
