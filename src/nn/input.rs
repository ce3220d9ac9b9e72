//! Graph entry points.

use super::{config_map, parse_config};
use crate::args::CallArgs;
use crate::context::CallContext;
use crate::dtype::DType;
use crate::error::Result;
use crate::nest::Nest;
use crate::node::Node;
use crate::shape::Shape;
use crate::tensor::{Tensor, TensorSpec};
use crate::unit::{Config, Unit, UnitCore, UnitOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const CLASS_NAME: &str = "Input";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Full shape including the batch axis.
    pub shape: Shape,
    pub input_dtype: DType,
    #[serde(flatten)]
    pub options: UnitOptions,
}

/// Source unit: emits one symbolic tensor and consumes nothing.
pub struct Input {
    core: UnitCore,
    spec: TensorSpec,
}

impl Input {
    pub fn new(shape: Shape, dtype: DType, options: UnitOptions) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            core: UnitCore::new(CLASS_NAME, options)?.prebuilt(),
            spec: TensorSpec::new(shape, dtype),
        }))
    }

    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let cfg: InputConfig = parse_config(config)?;
        Self::new(cfg.shape, cfg.input_dtype, cfg.options)
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }
}

impl Unit for Input {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn class_name(&self) -> &str {
        CLASS_NAME
    }

    fn call(&self, inputs: &Nest<Tensor>, _args: &CallArgs, _ctx: &mut CallContext) -> Result<Nest<Tensor>> {
        Ok(inputs.clone())
    }

    fn source_spec(&self) -> Option<TensorSpec> {
        Some(self.spec.clone())
    }

    fn config(&self) -> Result<Config> {
        config_map(&InputConfig {
            shape: self.spec.shape.clone(),
            input_dtype: self.spec.dtype,
            options: self.core.options().clone(),
        })
    }
}

/// Symbolic `float32` tensor of shape `(None, dims...)`.
pub fn input(dims: &[usize]) -> Result<Tensor> {
    input_with(Shape::batched(dims), DType::F32, UnitOptions::new())
}

pub fn input_with(shape: Shape, dtype: DType, options: UnitOptions) -> Result<Tensor> {
    Node::source(Input::new(shape, dtype, options)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_emits_recorded_source() {
        let x = input(&[4]).unwrap();
        assert!(x.is_symbolic());
        assert_eq!(x.shape(), Shape::batched(&[4]));
        let history = x.history().unwrap();
        assert!(history.node.is_source());
        assert_eq!(history.node.unit().class_name(), CLASS_NAME);
    }

    #[test]
    fn test_config_keeps_shape_and_dtype() {
        let unit = Input::new(Shape::batched(&[3, 2]), DType::F64, UnitOptions::new().with_name("x_in"))
            .unwrap();
        let config = unit.config().unwrap();
        let copy = Input::from_config(&config).unwrap();
        assert_eq!(copy.spec(), unit.spec());
        assert_eq!(copy.core().name(), "x_in");
    }
}
