//! Marks timesteps to skip.

use super::{config_map, parse_config};
use crate::args::CallArgs;
use crate::context::CallContext;
use crate::error::{Result, UnitError};
use crate::nest::Nest;
use crate::ops;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::unit::{Config, Unit, UnitCore, UnitOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const CLASS_NAME: &str = "Masking";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskingConfig {
    #[serde(default)]
    pub mask_value: f64,
    #[serde(flatten)]
    pub options: UnitOptions,
}

/// A timestep (everything but the last axis) is masked out when all of its
/// features equal `mask_value`; masked timesteps are zeroed.
pub struct Masking {
    core: UnitCore,
    mask_value: f64,
}

impl Masking {
    pub fn new(mask_value: f64, options: UnitOptions) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            core: UnitCore::new(CLASS_NAME, options)?.with_masking(true).prebuilt(),
            mask_value,
        }))
    }

    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let cfg: MaskingConfig = parse_config(config)?;
        Self::new(cfg.mask_value, cfg.options)
    }

    pub fn mask_value(&self) -> f64 {
        self.mask_value
    }

    fn single<'a>(&self, inputs: &'a Nest<Tensor>) -> Result<&'a Tensor> {
        inputs
            .as_leaf()
            .ok_or_else(|| UnitError::usage(self.core.name(), "Masking takes a single input tensor"))
    }
}

impl Unit for Masking {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn class_name(&self) -> &str {
        CLASS_NAME
    }

    fn call(&self, inputs: &Nest<Tensor>, _args: &CallArgs, _ctx: &mut CallContext) -> Result<Nest<Tensor>> {
        let x = self.single(inputs)?;
        let mask = ops::not_equal_any(x, self.mask_value)?;
        let y = ops::apply_mask(x, &mask)?;
        Ok(Nest::Leaf(y.with_mask(Some(mask))))
    }

    fn compute_mask(
        &self,
        inputs: &Nest<Tensor>,
        _masks: &Nest<Option<Tensor>>,
    ) -> Result<Option<Nest<Option<Tensor>>>> {
        let x = self.single(inputs)?;
        Ok(Some(Nest::Leaf(Some(ops::not_equal_any(x, self.mask_value)?))))
    }

    fn compute_output_shape(&self, input_shape: &Nest<Shape>) -> Result<Option<Nest<Shape>>> {
        Ok(Some(input_shape.clone()))
    }

    fn config(&self) -> Result<Config> {
        config_map(&MaskingConfig {
            mask_value: self.mask_value,
            options: UnitOptions::from_config(&self.core.base_config()?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Invoke;
    use ndarray::{arr3, ArrayD};

    #[test]
    fn test_masks_all_zero_timesteps() {
        let masking = Masking::new(0.0, UnitOptions::new()).unwrap();
        let x: ArrayD<f32> = arr3(&[[[1.0, 2.0], [0.0, 0.0], [0.0, 3.0]]]).into_dyn();
        let y = masking.apply(&Tensor::from(x)).unwrap();
        let mask = y.mask().unwrap().value().unwrap().clone();
        assert_eq!(mask.dims(), vec![1, 3]);
        assert_eq!(
            mask.as_bool().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![true, false, true]
        );
    }

    #[test]
    fn test_symbolic_input_gets_symbolic_mask() {
        let masking = Masking::new(0.0, UnitOptions::new()).unwrap();
        let x = crate::nn::input(&[5, 2]).unwrap();
        let y = masking.apply(&x).unwrap();
        let mask = y.mask().unwrap();
        assert!(mask.is_symbolic());
        assert_eq!(mask.shape(), Shape::batched(&[5]));
    }
}
