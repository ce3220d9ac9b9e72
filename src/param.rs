//! Learnable parameters.
//!
//! A `Parameter` is a shared handle: clones refer to the same storage, and
//! identity (not value equality) is what tracking and deduplication use.
//! Values are always stored in the parameter's own dtype; readers that
//! compute in another dtype ask for a cast copy.

use crate::dtype::DType;
use crate::error::{Result, UnitError};
use crate::shape::Shape;
use crate::value::Value;
use ndarray::{ArrayD, IxDyn};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterId(u64);

/// Produces the initial value of a parameter.
pub trait Initializer: Send + Sync {
    fn initialize(&self, dims: &[usize], dtype: DType) -> Value;
}

/// Penalty contributed to the owning unit's losses.
pub trait Regularizer: Send + Sync {
    fn penalty(&self, value: &Value) -> f64;
}

/// Projection applied to a parameter value on demand.
pub trait Constraint: Send + Sync {
    fn apply(&self, value: &Value) -> Value;
}

pub struct Zeros;

impl Initializer for Zeros {
    fn initialize(&self, dims: &[usize], dtype: DType) -> Value {
        Value::zeros(dims, dtype)
    }
}

pub struct Ones;

impl Initializer for Ones {
    fn initialize(&self, dims: &[usize], dtype: DType) -> Value {
        Value::filled(dims, 1.0, dtype)
    }
}

pub struct Constant(pub f64);

impl Initializer for Constant {
    fn initialize(&self, dims: &[usize], dtype: DType) -> Value {
        Value::filled(dims, self.0, dtype)
    }
}

/// Uniform in `[-limit, limit]` with `limit = sqrt(6 / (fan_in + fan_out))`.
pub struct GlorotUniform {
    pub seed: Option<u64>,
}

impl Initializer for GlorotUniform {
    fn initialize(&self, dims: &[usize], dtype: DType) -> Value {
        let (fan_in, fan_out) = match dims {
            [] => (1, 1),
            [n] => (*n, *n),
            [.., i, o] => {
                let receptive: usize = dims[..dims.len() - 2].iter().product();
                (i * receptive, o * receptive)
            }
        };
        let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
        let seed = self.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);
        let values = ArrayD::from_shape_simple_fn(IxDyn(dims), || {
            rng.random_range(-limit..=limit)
        });
        Value::from_f64(values, dtype)
    }
}

/// `l1 * sum(|w|) + l2 * sum(w^2)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct L1L2 {
    pub l1: f64,
    pub l2: f64,
}

impl Regularizer for L1L2 {
    fn penalty(&self, value: &Value) -> f64 {
        let w = value.to_f64();
        self.l1 * w.iter().map(|x| x.abs()).sum::<f64>()
            + self.l2 * w.iter().map(|x| x * x).sum::<f64>()
    }
}

/// Clamps negative entries to zero.
pub struct NonNeg;

impl Constraint for NonNeg {
    fn apply(&self, value: &Value) -> Value {
        Value::from_f64(value.to_f64().mapv(|x| x.max(0.0)), value.dtype())
    }
}

/// Everything needed to allocate a parameter.
pub struct ParameterSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: Option<DType>,
    pub trainable: bool,
    pub initializer: Arc<dyn Initializer>,
    pub regularizer: Option<Arc<dyn Regularizer>>,
    pub constraint: Option<Arc<dyn Constraint>>,
}

impl ParameterSpec {
    pub fn new(name: &str, shape: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            dtype: None,
            trainable: true,
            initializer: Arc::new(GlorotUniform { seed: None }),
            regularizer: None,
            constraint: None,
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    pub fn with_initializer(mut self, init: impl Initializer + 'static) -> Self {
        self.initializer = Arc::new(init);
        self
    }

    pub fn with_regularizer(mut self, reg: Option<Arc<dyn Regularizer>>) -> Self {
        self.regularizer = reg;
        self
    }

    pub fn with_constraint(mut self, constraint: Option<Arc<dyn Constraint>>) -> Self {
        self.constraint = constraint;
        self
    }
}

struct ParamInner {
    id: ParameterId,
    name: String,
    dims: Vec<usize>,
    dtype: DType,
    trainable: bool,
    value: RwLock<Value>,
    regularizer: Option<Arc<dyn Regularizer>>,
    constraint: Option<Arc<dyn Constraint>>,
}

#[derive(Clone)]
pub struct Parameter(Arc<ParamInner>);

impl Parameter {
    /// Allocates storage and runs the initializer. `default_dtype` applies
    /// when the `ParameterSpec` does not name one.
    pub fn allocate(spec: ParameterSpec, default_dtype: DType) -> Self {
        let dtype = spec.dtype.unwrap_or(default_dtype);
        let value = spec.initializer.initialize(&spec.shape, dtype);
        Parameter(Arc::new(ParamInner {
            id: ParameterId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed)),
            name: spec.name,
            dims: spec.shape,
            dtype,
            trainable: spec.trainable,
            value: RwLock::new(value),
            regularizer: spec.regularizer,
            constraint: spec.constraint,
        }))
    }

    pub fn id(&self) -> ParameterId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn dims(&self) -> &[usize] {
        &self.0.dims
    }

    pub fn shape(&self) -> Shape {
        Shape::known(&self.0.dims)
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn trainable(&self) -> bool {
        self.0.trainable
    }

    pub fn len(&self) -> usize {
        self.0.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> Value {
        self.0.value.read().clone()
    }

    /// Current value cast to `dtype` (the stored value is untouched).
    pub fn value_as(&self, dtype: DType) -> Value {
        self.0.value.read().cast(dtype)
    }

    /// Fails unless `value` has exactly this parameter's shape.
    pub fn check_assignable(&self, value: &Value) -> Result<()> {
        if value.dims() != self.0.dims {
            return Err(UnitError::state(
                self.name(),
                format!(
                    "cannot assign a value of shape {} to a parameter of shape {}",
                    value.shape(),
                    self.shape()
                ),
            ));
        }
        Ok(())
    }

    /// Replaces the value; the shape must match and the dtype is cast to storage.
    pub fn assign(&self, value: &Value) -> Result<()> {
        self.check_assignable(value)?;
        *self.0.value.write() = value.cast(self.0.dtype);
        Ok(())
    }

    pub fn regularization_loss(&self) -> Option<f64> {
        self.0
            .regularizer
            .as_ref()
            .map(|r| r.penalty(&self.0.value.read()))
    }

    /// Applies the constraint, if any, to the stored value.
    pub fn apply_constraint(&self) {
        if let Some(c) = &self.0.constraint {
            let mut guard = self.0.value.write();
            let projected = c.apply(&guard).cast(self.0.dtype);
            *guard = projected;
        }
    }

    pub fn ptr_eq(&self, other: &Parameter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.0.name)
            .field("shape", &self.shape().to_string())
            .field("dtype", &self.0.dtype)
            .field("trainable", &self.0.trainable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_glorot_is_seeded_and_bounded() {
        let init = GlorotUniform { seed: Some(42) };
        let a = init.initialize(&[4, 6], DType::F64);
        let b = init.initialize(&[4, 6], DType::F64);
        assert_eq!(a, b);
        let limit = (6.0f64 / 10.0).sqrt();
        assert!(a.to_f64().iter().all(|x| x.abs() <= limit));
    }

    #[test]
    fn test_assign_checks_shape_and_casts() {
        let p = Parameter::allocate(
            ParameterSpec::new("kernel", &[2]).with_initializer(Zeros),
            DType::F32,
        );
        let wrong = Value::zeros(&[3], DType::F32);
        assert!(p.assign(&wrong).unwrap_err().is_state());

        let wide = Value::from_vec(&[2], vec![1.5, -2.0], DType::F64).unwrap();
        p.assign(&wide).unwrap();
        assert_eq!(p.read().dtype(), DType::F32);
        assert_eq!(p.value_as(DType::F16).dtype(), DType::F16);
    }

    #[test]
    fn test_regularizer_and_constraint() {
        let p = Parameter::allocate(
            ParameterSpec::new("w", &[2])
                .with_initializer(Constant(-1.0))
                .with_regularizer(Some(Arc::new(L1L2 { l1: 0.5, l2: 1.0 })))
                .with_constraint(Some(Arc::new(NonNeg))),
            DType::F32,
        );
        assert_abs_diff_eq!(p.regularization_loss().unwrap(), 3.0);
        p.apply_constraint();
        assert_abs_diff_eq!(p.regularization_loss().unwrap(), 0.0);
    }

    #[test]
    fn test_clones_share_identity() {
        let p = Parameter::allocate(ParameterSpec::new("b", &[1]), DType::F32);
        let q = p.clone();
        assert!(p.ptr_eq(&q));
        assert_eq!(p.id(), q.id());
    }
}
