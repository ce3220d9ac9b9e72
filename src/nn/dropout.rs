//! Dropout for regularization.
//!
//! Randomly zeroes entries with probability `rate` while training and
//! scales the rest by `1 / (1 - rate)`. Outside training it is the identity.
//! Whether it is training comes from the `training` call-context argument,
//! so a `Dropout` nested anywhere inside a graph follows the outer call.

use super::{config_map, parse_config};
use crate::args::{Arg, CallArgs};
use crate::context::{CallContext, TRAINING};
use crate::error::{Result, UnitError};
use crate::nest::Nest;
use crate::ops;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::unit::{Config, Unit, UnitCore, UnitOptions};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const CLASS_NAME: &str = "Dropout";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropoutConfig {
    pub rate: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(flatten)]
    pub options: UnitOptions,
}

impl DropoutConfig {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            seed: None,
            options: UnitOptions::new(),
        }
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

pub struct Dropout {
    core: UnitCore,
    config: DropoutConfig,
    rng: Mutex<StdRng>,
}

impl Dropout {
    pub fn new(config: DropoutConfig) -> Result<Arc<Self>> {
        let core = UnitCore::new(CLASS_NAME, config.options.clone())?
            .with_context_arg(TRAINING, Arg::Bool(false))
            .with_masking(true)
            .prebuilt();
        if !(0.0..1.0).contains(&config.rate) {
            return Err(UnitError::usage(
                core.name(),
                format!("dropout rate must be in [0, 1), got {}", config.rate),
            ));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::rng().random()),
        };
        Ok(Arc::new(Self {
            core,
            config,
            rng: Mutex::new(rng),
        }))
    }

    pub fn with_rate(rate: f64) -> Result<Arc<Self>> {
        Self::new(DropoutConfig::new(rate))
    }

    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        Self::new(parse_config(config)?)
    }

    pub fn rate(&self) -> f64 {
        self.config.rate
    }
}

impl Unit for Dropout {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn class_name(&self) -> &str {
        CLASS_NAME
    }

    fn call(&self, inputs: &Nest<Tensor>, args: &CallArgs, _ctx: &mut CallContext) -> Result<Nest<Tensor>> {
        let training = args.get(TRAINING).and_then(Arg::as_bool).unwrap_or(false);
        if !training {
            return Ok(inputs.clone());
        }
        let mut rng = self.rng.lock();
        inputs.try_map(|t| ops::dropout(t, self.config.rate, &mut rng).map_err(UnitError::from))
    }

    fn compute_output_shape(&self, input_shape: &Nest<Shape>) -> Result<Option<Nest<Shape>>> {
        Ok(Some(input_shape.clone()))
    }

    fn config(&self) -> Result<Config> {
        let mut config = self.config.clone();
        config.options = UnitOptions::from_config(&self.core.base_config()?)?;
        config_map(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Invoke;
    use ndarray::{ArrayD, IxDyn};

    fn ones() -> Tensor {
        Tensor::from(ArrayD::<f32>::ones(IxDyn(&[4, 8])))
    }

    #[test]
    fn test_identity_outside_training() {
        let dropout = Dropout::with_rate(0.5).unwrap();
        let y = dropout.apply(&ones()).unwrap();
        assert!(y.value().unwrap().to_f64().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_drops_and_rescales_when_training() {
        let dropout = Dropout::new(DropoutConfig::new(0.5).with_seed(3)).unwrap();
        let args = CallArgs::new().with_keyword(TRAINING, true);
        let out = dropout.invoke_with(ones(), &args).unwrap();
        let values = out.as_leaf().unwrap().value().unwrap().to_f64();
        assert!(values.iter().all(|&v| v == 0.0 || v == 2.0));
        assert!(values.iter().any(|&v| v == 0.0));
    }

    #[test]
    fn test_rejects_out_of_range_rate() {
        assert!(Dropout::with_rate(1.0).err().unwrap().is_usage());
    }
}
