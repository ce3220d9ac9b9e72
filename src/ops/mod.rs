//! Tensor operations usable in both execution modes.
//!
//! Every operation checks its operands with the rules in [`infer`]. If any
//! operand is symbolic the result is a placeholder carrying the inferred
//! spec; otherwise the ndarray kernel runs and produces a concrete tensor.

pub mod infer;

use crate::dtype::DType;
use crate::param::Regularizer;
use crate::shape::Shape;
use crate::tensor::{Tensor, TensorSpec};
use crate::value::Value;
use ndarray::{Array2, ArrayD, Axis, IxDyn, Zip};
use rand::rngs::StdRng;
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpError {
    #[error("incompatible shapes for '{op}': {left} and {right}")]
    IncompatibleShapes { op: String, left: Shape, right: Shape },

    #[error("invalid rank for '{op}': expected {expected}D, got {actual}D")]
    InvalidRank {
        op: String,
        expected: usize,
        actual: usize,
    },

    #[error("axis {axis} is out of range for '{op}' on a rank-{rank} tensor")]
    InvalidAxis { op: String, axis: isize, rank: usize },

    #[error("dtype mismatch for '{op}': {left} and {right}")]
    DTypeMismatch { op: String, left: DType, right: DType },

    #[error("'{0}' needs at least one operand")]
    EmptyInput(String),

    #[error("'{op}' does not accept dtype {dtype}")]
    UnsupportedDType { op: String, dtype: DType },

    #[error("kernel shape error: {0}")]
    Kernel(#[from] ndarray::ShapeError),
}

type Result<T> = std::result::Result<T, OpError>;

fn binary(
    op: &str,
    a: &Tensor,
    b: &Tensor,
    kernel: impl Fn(&ArrayD<f64>, &ArrayD<f64>) -> ArrayD<f64>,
) -> Result<Tensor> {
    let spec = infer::elementwise(op, &a.spec(), &b.spec())?;
    match (a.value(), b.value()) {
        (Some(x), Some(y)) => Ok(Tensor::new(Value::from_f64(
            kernel(&x.to_f64(), &y.to_f64()),
            spec.dtype,
        ))),
        _ => Ok(Tensor::placeholder(spec)),
    }
}

fn unary(t: &Tensor, kernel: impl Fn(f64) -> f64) -> Tensor {
    match t.value() {
        Some(v) => Tensor::new(Value::from_f64(v.to_f64().mapv(kernel), v.dtype())),
        None => Tensor::placeholder(t.spec()),
    }
}

pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary("add", a, b, |x, y| x + y)
}

pub fn subtract(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary("subtract", a, b, |x, y| x - y)
}

pub fn multiply(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary("multiply", a, b, |x, y| x * y)
}

pub fn relu(t: &Tensor) -> Tensor {
    unary(t, |x| x.max(0.0))
}

pub fn scale(t: &Tensor, factor: f64) -> Tensor {
    unary(t, |x| x * factor)
}

pub fn cast(t: &Tensor, dtype: DType) -> Tensor {
    if t.dtype() == dtype {
        return t.clone();
    }
    match t.value() {
        Some(v) => Tensor::new(v.cast(dtype)),
        None => Tensor::placeholder(TensorSpec::new(t.shape(), dtype)),
    }
}

/// `[..., k] x [k, n]`; the leading axes of `a` are flattened for the product.
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let spec = infer::matmul(&a.spec(), &b.spec())?;
    let (x, y) = match (a.value(), b.value()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Ok(Tensor::placeholder(spec)),
    };
    let x_dims = x.dims();
    let y_dims = y.dims();
    let k = x_dims[x_dims.len() - 1];
    let rows: usize = x_dims[..x_dims.len() - 1].iter().product();
    let lhs = Array2::from_shape_vec((rows, k), x.to_f64().iter().copied().collect())?;
    let rhs = Array2::from_shape_vec((y_dims[0], y_dims[1]), y.to_f64().iter().copied().collect())?;
    let product = lhs.dot(&rhs);

    let mut out_dims = x_dims[..x_dims.len() - 1].to_vec();
    out_dims.push(y_dims[1]);
    let out = ArrayD::from_shape_vec(IxDyn(&out_dims), product.iter().copied().collect())?;
    Ok(Tensor::new(Value::from_f64(out, spec.dtype)))
}

pub fn concat(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
    let specs: Vec<TensorSpec> = tensors.iter().map(|t| t.spec()).collect();
    let spec_refs: Vec<&TensorSpec> = specs.iter().collect();
    let (spec, ax) = infer::concat(&spec_refs, axis)?;
    let values: Option<Vec<&Value>> = tensors.iter().map(|t| t.value()).collect();
    match values {
        Some(values) => {
            let wide: Vec<ArrayD<f64>> = values.iter().map(|v| v.to_f64()).collect();
            let views: Vec<_> = wide.iter().map(|a| a.view()).collect();
            let joined = ndarray::concatenate(Axis(ax), &views)?;
            Ok(Tensor::new(Value::from_f64(joined, spec.dtype)))
        }
        None => Ok(Tensor::placeholder(spec)),
    }
}

pub fn mean(t: &Tensor, axis: isize, keepdims: bool) -> Result<Tensor> {
    reduce("mean", t, axis, keepdims, |a, ax| {
        let n = a.len_of(ax).max(1) as f64;
        a.sum_axis(ax) / n
    })
}

pub fn sum(t: &Tensor, axis: isize, keepdims: bool) -> Result<Tensor> {
    reduce("sum", t, axis, keepdims, |a, ax| a.sum_axis(ax))
}

fn reduce(
    op: &str,
    t: &Tensor,
    axis: isize,
    keepdims: bool,
    kernel: impl Fn(&ArrayD<f64>, Axis) -> ArrayD<f64>,
) -> Result<Tensor> {
    let spec = t.spec();
    let (shape, ax) = infer::reduce(op, &spec, axis, keepdims)?;
    match t.value() {
        Some(v) => {
            let mut out = kernel(&v.to_f64(), Axis(ax));
            if keepdims {
                out = out.insert_axis(Axis(ax));
            }
            Ok(Tensor::new(Value::from_f64(out, v.dtype())))
        }
        None => Ok(Tensor::placeholder(TensorSpec::new(shape, spec.dtype))),
    }
}

/// Mean over every element, as a rank-0 tensor.
pub fn mean_all(t: &Tensor) -> Tensor {
    match t.value() {
        Some(v) => {
            let wide = v.to_f64();
            let m = wide.mean().unwrap_or(0.0);
            Tensor::new(Value::from_f64(ArrayD::from_elem(IxDyn(&[]), m), v.dtype()))
        }
        None => Tensor::placeholder(TensorSpec::new(Shape::scalar(), t.dtype())),
    }
}

/// Regularization penalty of `t` divided by its batch size, as a rank-0
/// tensor. An empty batch gives zero.
pub fn activity_penalty(t: &Tensor, regularizer: &dyn Regularizer) -> Tensor {
    let dtype = if t.dtype().is_floating() { t.dtype() } else { DType::F32 };
    match t.value() {
        Some(v) => {
            let batch = v.dims().first().copied().unwrap_or(1);
            let penalty = if batch == 0 {
                0.0
            } else {
                regularizer.penalty(v) / batch as f64
            };
            Tensor::new(Value::filled(&[], penalty, dtype))
        }
        None => Tensor::placeholder(TensorSpec::new(Shape::scalar(), dtype)),
    }
}

pub fn expand_dims(t: &Tensor, axis: isize) -> Result<Tensor> {
    let spec = t.spec();
    let (shape, ax) = infer::expand_dims(&spec, axis)?;
    match t.value() {
        Some(v) => Ok(Tensor::new(Value::from_f64(
            v.to_f64().insert_axis(Axis(ax)),
            v.dtype(),
        ))),
        None => Ok(Tensor::placeholder(TensorSpec::new(shape, spec.dtype))),
    }
}

/// Boolean tensor, `true` where any entry along the last axis differs from `value`.
pub fn not_equal_any(t: &Tensor, value: f64) -> Result<Tensor> {
    let spec = t.spec();
    let (shape, ax) = infer::reduce("not_equal_any", &spec, -1, false)?;
    match t.value() {
        Some(v) => {
            let out = v
                .to_f64()
                .map_axis(Axis(ax), |lane| lane.iter().any(|&x| x != value));
            Ok(Tensor::new(Value::Bool(out)))
        }
        None => Ok(Tensor::placeholder(TensorSpec::new(shape, DType::Bool))),
    }
}

pub fn logical_and(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let shape = infer::broadcast("logical_and", &a.shape(), &b.shape())?;
    match (a.value(), b.value()) {
        (Some(x), Some(y)) => {
            let (x, y) = (x.to_bool(), y.to_bool());
            let dims = shape.to_concrete().unwrap_or_default();
            let xb = x.broadcast(IxDyn(&dims)).ok_or_else(|| OpError::IncompatibleShapes {
                op: "logical_and".to_string(),
                left: a.shape(),
                right: b.shape(),
            })?;
            let yb = y.broadcast(IxDyn(&dims)).ok_or_else(|| OpError::IncompatibleShapes {
                op: "logical_and".to_string(),
                left: a.shape(),
                right: b.shape(),
            })?;
            let out = Zip::from(&xb).and(&yb).map_collect(|&p, &q| p && q);
            Ok(Tensor::new(Value::Bool(out)))
        }
        _ => Ok(Tensor::placeholder(TensorSpec::new(shape, DType::Bool))),
    }
}

/// Zeroes the timesteps a `[..]` mask marks invalid in a `[.., features]` tensor.
pub fn apply_mask(t: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let expanded = cast(&expand_dims(mask, -1)?, t.dtype());
    multiply(t, &expanded)
}

/// Inverted dropout: kept entries are scaled by `1 / (1 - rate)`.
pub fn dropout(t: &Tensor, rate: f64, rng: &mut StdRng) -> Result<Tensor> {
    if !t.dtype().is_floating() {
        return Err(OpError::UnsupportedDType {
            op: "dropout".to_string(),
            dtype: t.dtype(),
        });
    }
    let v = match t.value() {
        Some(v) => v,
        None => return Ok(Tensor::placeholder(t.spec())),
    };
    if rate <= 0.0 {
        return Ok(t.clone());
    }
    let keep = 1.0 - rate;
    let out = v.to_f64().mapv(|x| {
        if rng.random::<f64>() < keep {
            x / keep
        } else {
            0.0
        }
    });
    Ok(Tensor::new(Value::from_f64(out, v.dtype())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn tensor(dims: &[usize], data: Vec<f64>) -> Tensor {
        Tensor::new(Value::from_vec(dims, data, DType::F32).unwrap())
    }

    #[test]
    fn test_matmul_flattens_leading_axes() {
        let a = tensor(&[2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let b = tensor(&[2, 1], vec![10.0, 1.0]);
        let out = matmul(&a, &b).unwrap();
        assert_eq!(out.shape(), Shape::known(&[2, 1, 1]));
        let v = out.value().unwrap().as_f32().unwrap();
        assert_abs_diff_eq!(v[[0, 0, 0]], 12.0);
        assert_abs_diff_eq!(v[[1, 0, 0]], 34.0);
    }

    #[test]
    fn test_symbolic_operand_yields_placeholder() {
        let x = Tensor::placeholder(TensorSpec::new(Shape::batched(&[3]), DType::F32));
        let w = tensor(&[3, 2], vec![0.0; 6]);
        let out = matmul(&x, &w).unwrap();
        assert!(out.is_symbolic());
        assert_eq!(out.shape(), Shape::batched(&[2]));
        assert!(out.history().is_none());
    }

    #[test]
    fn test_broadcast_add_and_mismatch() {
        let a = tensor(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let b = tensor(&[2], vec![10.0, 20.0]);
        let out = add(&a, &b).unwrap();
        let v = out.value().unwrap().as_f32().unwrap();
        assert_abs_diff_eq!(v[[1, 1]], 24.0);
        assert!(add(&a, &tensor(&[3], vec![0.0; 3])).is_err());
        let wide = Tensor::new(Value::zeros(&[2], DType::F64));
        assert!(matches!(add(&b, &wide), Err(OpError::DTypeMismatch { .. })));
    }

    #[test]
    fn test_mask_helpers() {
        let x = tensor(&[1, 3, 2], vec![1.0, 2.0, 0.0, 0.0, 3.0, 0.0]);
        let mask = not_equal_any(&x, 0.0).unwrap();
        assert_eq!(mask.dtype(), DType::Bool);
        assert_eq!(
            mask.value().unwrap().as_bool().unwrap().as_slice().unwrap(),
            &[true, false, true]
        );
        let masked = apply_mask(&x, &mask).unwrap();
        assert_eq!(masked.shape(), Shape::known(&[1, 3, 2]));

        let other = Tensor::new(Value::Bool(
            ArrayD::from_shape_vec(IxDyn(&[1, 3]), vec![true, true, false]).unwrap(),
        ));
        let both = logical_and(&mask, &other).unwrap();
        assert_eq!(
            both.value().unwrap().as_bool().unwrap().as_slice().unwrap(),
            &[true, false, false]
        );
    }

    #[test]
    fn test_reductions() {
        let x = tensor(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let m = mean(&x, -1, false).unwrap();
        assert_eq!(m.shape(), Shape::known(&[2]));
        let v = m.value().unwrap().as_f32().unwrap();
        assert_abs_diff_eq!(v[[1]], 5.0);
        let s = sum(&x, 0, true).unwrap();
        assert_eq!(s.shape(), Shape::known(&[1, 3]));
        assert!(mean(&x, 2, false).is_err());
    }

    #[test]
    fn test_dropout_keeps_expectation_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let x = tensor(&[4, 4], vec![1.0; 16]);
        let out = dropout(&x, 0.5, &mut rng).unwrap();
        let v = out.value().unwrap().as_f32().unwrap();
        assert!(v.iter().all(|&e| e == 0.0 || (e - 2.0).abs() < 1e-6));
        let same = dropout(&x, 0.0, &mut rng).unwrap();
        assert!(same.same_as(&x));
    }
}
