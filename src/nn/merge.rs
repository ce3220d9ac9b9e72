//! Units that merge several inputs into one output.

use super::{config_map, parse_config};
use crate::args::CallArgs;
use crate::context::CallContext;
use crate::dtype::DType;
use crate::error::{Result, UnitError};
use crate::nest::Nest;
use crate::ops::{self, infer};
use crate::shape::{normalize_axis, Shape};
use crate::tensor::{Tensor, TensorSpec};
use crate::unit::{Config, Unit, UnitCore, UnitOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const CONCATENATE: &str = "Concatenate";
pub const ADD: &str = "Add";

fn operands<'a>(unit: &str, inputs: &'a Nest<Tensor>) -> Result<Vec<&'a Tensor>> {
    let flat = inputs.flatten();
    if inputs.is_leaf() || flat.len() < 2 {
        return Err(UnitError::usage(
            unit,
            format!("a merge unit needs a list of at least 2 inputs, got {}", flat.len()),
        ));
    }
    Ok(flat)
}

/// AND of the masks that are present; `None` when there are none.
fn merge_masks(masks: &Nest<Option<Tensor>>) -> Result<Option<Nest<Option<Tensor>>>> {
    let mut merged: Option<Tensor> = None;
    for mask in masks.flatten().into_iter().flatten() {
        merged = Some(match merged {
            Some(acc) => ops::logical_and(&acc, mask)?,
            None => mask.clone(),
        });
    }
    Ok(merged.map(|m| Nest::Leaf(Some(m))))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcatenateConfig {
    #[serde(default = "last_axis")]
    pub axis: isize,
    #[serde(flatten)]
    pub options: UnitOptions,
}

fn last_axis() -> isize {
    -1
}

pub struct Concatenate {
    core: UnitCore,
    axis: isize,
}

impl Concatenate {
    pub fn new(axis: isize, options: UnitOptions) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            core: UnitCore::new(CONCATENATE, options)?.with_masking(true).prebuilt(),
            axis,
        }))
    }

    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let cfg: ConcatenateConfig = parse_config(config)?;
        Self::new(cfg.axis, cfg.options)
    }

    pub fn axis(&self) -> isize {
        self.axis
    }
}

impl Unit for Concatenate {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn class_name(&self) -> &str {
        CONCATENATE
    }

    fn call(&self, inputs: &Nest<Tensor>, _args: &CallArgs, _ctx: &mut CallContext) -> Result<Nest<Tensor>> {
        let xs = operands(self.core.name(), inputs)?;
        Ok(Nest::Leaf(ops::concat(&xs, self.axis)?))
    }

    /// Feature-axis concatenation keeps timestep masks, merged with AND.
    fn compute_mask(
        &self,
        inputs: &Nest<Tensor>,
        masks: &Nest<Option<Tensor>>,
    ) -> Result<Option<Nest<Option<Tensor>>>> {
        if masks.flatten().iter().all(|m| m.is_none()) {
            return Ok(None);
        }
        let rank = inputs.flatten().first().map_or(0, |t| t.shape().rank());
        if normalize_axis(self.axis, rank) != Some(rank.saturating_sub(1)) {
            return Err(UnitError::masking(
                self.core.name(),
                "masks can only be merged when concatenating along the last axis",
            ));
        }
        merge_masks(masks)
    }

    fn compute_output_shape(&self, input_shape: &Nest<Shape>) -> Result<Option<Nest<Shape>>> {
        let specs: Vec<TensorSpec> = input_shape
            .flatten()
            .into_iter()
            .map(|s| TensorSpec::new(s.clone(), DType::F32))
            .collect();
        let refs: Vec<&TensorSpec> = specs.iter().collect();
        let (spec, _) = infer::concat(&refs, self.axis)?;
        Ok(Some(Nest::Leaf(spec.shape)))
    }

    fn config(&self) -> Result<Config> {
        config_map(&ConcatenateConfig {
            axis: self.axis,
            options: UnitOptions::from_config(&self.core.base_config()?)?,
        })
    }
}

/// Element-wise sum of its inputs, with broadcasting.
pub struct Add {
    core: UnitCore,
}

impl Add {
    pub fn new(options: UnitOptions) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            core: UnitCore::new(ADD, options)?.with_masking(true).prebuilt(),
        }))
    }

    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        Self::new(parse_config(config)?)
    }
}

impl Unit for Add {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn class_name(&self) -> &str {
        ADD
    }

    fn call(&self, inputs: &Nest<Tensor>, _args: &CallArgs, _ctx: &mut CallContext) -> Result<Nest<Tensor>> {
        let xs = operands(self.core.name(), inputs)?;
        let mut acc = xs[0].clone();
        for x in &xs[1..] {
            acc = ops::add(&acc, x)?;
        }
        Ok(Nest::Leaf(acc))
    }

    fn compute_mask(
        &self,
        _inputs: &Nest<Tensor>,
        masks: &Nest<Option<Tensor>>,
    ) -> Result<Option<Nest<Option<Tensor>>>> {
        merge_masks(masks)
    }

    fn compute_output_shape(&self, input_shape: &Nest<Shape>) -> Result<Option<Nest<Shape>>> {
        let shapes = input_shape.flatten();
        let mut acc = match shapes.first() {
            Some(s) => (*s).clone(),
            None => return Ok(None),
        };
        for s in &shapes[1..] {
            acc = infer::broadcast("add", &acc, s)?;
        }
        Ok(Some(Nest::Leaf(acc)))
    }
}
