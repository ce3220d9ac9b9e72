//! Declarative constraints on the inputs a unit accepts.
//!
//! A unit may publish one [`InputSpec`] per flattened input through
//! [`UnitCore::set_input_spec`](super::UnitCore::set_input_spec). Dispatch
//! checks every call against it before the unit is built.

use crate::dtype::DType;
use crate::error::{Result, UnitError};
use crate::nest::Nest;
use crate::shape::{normalize_axis, Shape};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rank, dtype and per-axis requirements for one input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub dtype: Option<DType>,
    pub shape: Option<Shape>,
    pub ndim: Option<usize>,
    pub min_ndim: Option<usize>,
    pub max_ndim: Option<usize>,
    /// Required sizes for individual axes; negative axes count from the end.
    pub axes: BTreeMap<isize, usize>,
}

impl InputSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Full shape requirement; unknown dimensions accept any size. Also fixes the rank.
    pub fn with_shape(mut self, shape: Shape) -> Self {
        self.ndim = Some(shape.rank());
        self.shape = Some(shape);
        self
    }

    pub fn with_ndim(mut self, ndim: usize) -> Self {
        self.ndim = Some(ndim);
        self
    }

    pub fn with_min_ndim(mut self, min_ndim: usize) -> Self {
        self.min_ndim = Some(min_ndim);
        self
    }

    pub fn with_max_ndim(mut self, max_ndim: usize) -> Self {
        self.max_ndim = Some(max_ndim);
        self
    }

    pub fn with_axis(mut self, axis: isize, size: usize) -> Self {
        self.axes.insert(axis, size);
        self
    }

    /// Checks one input (the `index`-th flattened input of `unit`).
    pub fn check(&self, unit: &str, index: usize, input: &Tensor) -> Result<()> {
        let shape = input.shape();
        let rank = shape.rank();
        let fail = |message: String| {
            Err(UnitError::usage(
                unit,
                format!("input {} is incompatible with the unit: {}", index, message),
            ))
        };

        if let Some(ndim) = self.ndim {
            if rank != ndim {
                return fail(format!("expected ndim={}, found ndim={} (shape {})", ndim, rank, shape));
            }
        }
        if let Some(max) = self.max_ndim {
            if rank > max {
                return fail(format!("expected max_ndim={}, found ndim={}", max, rank));
            }
        }
        if let Some(min) = self.min_ndim {
            if rank < min {
                return fail(format!("expected min_ndim={}, found ndim={}", min, rank));
            }
        }
        if let Some(dtype) = self.dtype {
            if input.dtype() != dtype {
                return fail(format!("expected dtype={}, found dtype={}", dtype, input.dtype()));
            }
        }
        for (&axis, &size) in &self.axes {
            let actual = normalize_axis(axis, rank).and_then(|ax| shape.dims()[ax]);
            match actual {
                Some(found) if found != size => {
                    return fail(format!(
                        "expected axis {} to have size {}, found shape {}",
                        axis, size, shape
                    ))
                }
                None if normalize_axis(axis, rank).is_none() => {
                    return fail(format!("axis {} does not exist for shape {}", axis, shape))
                }
                _ => {}
            }
        }
        if let Some(expected) = &self.shape {
            if !shape.is_compatible_with(expected) {
                return fail(format!("expected shape {}, found shape {}", expected, shape));
            }
        }
        Ok(())
    }
}

/// Checks `inputs` against `specs`, one spec per flattened input.
pub fn assert_input_compatibility(
    specs: &[InputSpec],
    inputs: &Nest<Tensor>,
    unit: &str,
) -> Result<()> {
    let flat = inputs.flatten();
    if flat.len() != specs.len() {
        return Err(UnitError::usage(
            unit,
            format!(
                "unit expects {} input(s), but it received {} input tensors",
                specs.len(),
                flat.len()
            ),
        ));
    }
    for (index, (spec, input)) in specs.iter().zip(flat).enumerate() {
        spec.check(unit, index, input)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorSpec;

    fn symbolic(dims: &[Option<usize>]) -> Tensor {
        Tensor::placeholder(TensorSpec::new(Shape::new(dims.to_vec()), DType::F32))
    }

    #[test]
    fn test_rank_bounds() {
        let spec = InputSpec::new().with_min_ndim(2).with_max_ndim(3);
        assert!(spec.check("u", 0, &symbolic(&[None, Some(4)])).is_ok());
        assert!(spec.check("u", 0, &symbolic(&[Some(4)])).unwrap_err().is_usage());
        assert!(spec
            .check("u", 0, &symbolic(&[None, Some(1), Some(2), Some(3)]))
            .is_err());
    }

    #[test]
    fn test_axes_and_dtype() {
        let spec = InputSpec::new().with_axis(-1, 4).with_dtype(DType::F32);
        assert!(spec.check("u", 0, &symbolic(&[None, Some(4)])).is_ok());
        assert!(spec.check("u", 0, &symbolic(&[None, None])).is_ok());
        let err = spec.check("dense", 0, &symbolic(&[None, Some(5)])).unwrap_err();
        assert!(err.to_string().contains("dense"));
        let wide = Tensor::placeholder(TensorSpec::new(Shape::batched(&[4]), DType::F64));
        assert!(spec.check("u", 0, &wide).is_err());
    }

    #[test]
    fn test_count_must_match() {
        let specs = vec![InputSpec::new(), InputSpec::new()];
        let one = Nest::Leaf(symbolic(&[None, Some(2)]));
        assert!(assert_input_compatibility(&specs, &one, "merge")
            .unwrap_err()
            .is_usage());
    }
}
