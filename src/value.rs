//! Dense, typed n-dimensional values.
//!
//! Every variant wraps an `ndarray::ArrayD` of its element type. Kernels in
//! `ops` widen to `f64`, compute, and narrow back to the operand dtype, so a
//! single implementation serves all numeric element types.

use crate::dtype::DType;
use crate::shape::Shape;
use half::f16;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    F16(ArrayD<f16>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    Bool(ArrayD<bool>),
}

impl Value {
    pub fn dtype(&self) -> DType {
        match self {
            Value::F16(_) => DType::F16,
            Value::F32(_) => DType::F32,
            Value::F64(_) => DType::F64,
            Value::I32(_) => DType::I32,
            Value::I64(_) => DType::I64,
            Value::Bool(_) => DType::Bool,
        }
    }

    pub fn dims(&self) -> Vec<usize> {
        match self {
            Value::F16(a) => a.shape().to_vec(),
            Value::F32(a) => a.shape().to_vec(),
            Value::F64(a) => a.shape().to_vec(),
            Value::I32(a) => a.shape().to_vec(),
            Value::I64(a) => a.shape().to_vec(),
            Value::Bool(a) => a.shape().to_vec(),
        }
    }

    pub fn shape(&self) -> Shape {
        Shape::known(&self.dims())
    }

    pub fn len(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widened copy used by the compute kernels.
    pub fn to_f64(&self) -> ArrayD<f64> {
        match self {
            Value::F16(a) => a.mapv(f64::from),
            Value::F32(a) => a.mapv(f64::from),
            Value::F64(a) => a.clone(),
            Value::I32(a) => a.mapv(f64::from),
            Value::I64(a) => a.mapv(|x| x as f64),
            Value::Bool(a) => a.mapv(|x| if x { 1.0 } else { 0.0 }),
        }
    }

    /// Truthiness of every element (non-zero is `true`).
    pub fn to_bool(&self) -> ArrayD<bool> {
        match self {
            Value::Bool(a) => a.clone(),
            other => other.to_f64().mapv(|x| x != 0.0),
        }
    }

    /// Narrows a widened array to `dtype`.
    pub fn from_f64(array: ArrayD<f64>, dtype: DType) -> Value {
        match dtype {
            DType::F16 => Value::F16(array.mapv(f16::from_f64)),
            DType::F32 => Value::F32(array.mapv(|x| x as f32)),
            DType::F64 => Value::F64(array),
            DType::I32 => Value::I32(array.mapv(|x| x as i32)),
            DType::I64 => Value::I64(array.mapv(|x| x as i64)),
            DType::Bool => Value::Bool(array.mapv(|x| x != 0.0)),
        }
    }

    pub fn cast(&self, dtype: DType) -> Value {
        if self.dtype() == dtype {
            return self.clone();
        }
        match dtype {
            DType::Bool => Value::Bool(self.to_bool()),
            _ => Value::from_f64(self.to_f64(), dtype),
        }
    }

    pub fn zeros(dims: &[usize], dtype: DType) -> Value {
        Value::from_f64(ArrayD::zeros(IxDyn(dims)), dtype)
    }

    pub fn filled(dims: &[usize], fill: f64, dtype: DType) -> Value {
        Value::from_f64(ArrayD::from_elem(IxDyn(dims), fill), dtype)
    }

    /// Builds a value from row-major data, returning `None` on a size mismatch.
    pub fn from_vec(dims: &[usize], data: Vec<f64>, dtype: DType) -> Option<Value> {
        ArrayD::from_shape_vec(IxDyn(dims), data)
            .ok()
            .map(|a| Value::from_f64(a, dtype))
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Value::F32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&ArrayD<bool>> {
        match self {
            Value::Bool(a) => Some(a),
            _ => None,
        }
    }
}

impl From<ArrayD<f32>> for Value {
    fn from(a: ArrayD<f32>) -> Self {
        Value::F32(a)
    }
}

impl From<ArrayD<f64>> for Value {
    fn from(a: ArrayD<f64>) -> Self {
        Value::F64(a)
    }
}

impl From<ArrayD<f16>> for Value {
    fn from(a: ArrayD<f16>) -> Self {
        Value::F16(a)
    }
}

impl From<ArrayD<i64>> for Value {
    fn from(a: ArrayD<i64>) -> Self {
        Value::I64(a)
    }
}

impl From<ArrayD<bool>> for Value {
    fn from(a: ArrayD<bool>) -> Self {
        Value::Bool(a)
    }
}
