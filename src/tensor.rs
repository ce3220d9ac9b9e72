//! Concrete and symbolic tensors.
//!
//! A concrete tensor carries data. A symbolic tensor only carries a spec
//! (shape + dtype) and, when it was produced by a recorded invocation, the
//! history naming that invocation and the output slot it came from. Either
//! kind may carry a mask: a boolean tensor marking valid timesteps.

use crate::dtype::DType;
use crate::nest::Nest;
use crate::node::Node;
use crate::shape::Shape;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a symbolic tensor. Fresh for every placeholder and every
/// recorded output, so two symbolic tensors with the same id are the same edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    pub fn fresh() -> Self {
        TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorSpec {
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }
}

/// Back-reference from a symbolic tensor to the invocation that produced it.
#[derive(Clone)]
pub struct History {
    pub node: Arc<Node>,
    pub slot: usize,
}

#[derive(Clone)]
pub struct ConcreteTensor {
    value: Arc<Value>,
    mask: Option<Arc<Tensor>>,
}

#[derive(Clone)]
pub struct SymbolicTensor {
    id: TensorId,
    spec: TensorSpec,
    history: Option<History>,
    mask: Option<Arc<Tensor>>,
}

#[derive(Clone)]
pub enum Tensor {
    Concrete(ConcreteTensor),
    Symbolic(SymbolicTensor),
}

impl Tensor {
    pub fn new(value: Value) -> Self {
        Tensor::Concrete(ConcreteTensor {
            value: Arc::new(value),
            mask: None,
        })
    }

    /// A symbolic tensor with no producing invocation.
    pub fn placeholder(spec: TensorSpec) -> Self {
        Tensor::Symbolic(SymbolicTensor {
            id: TensorId::fresh(),
            spec,
            history: None,
            mask: None,
        })
    }

    /// A symbolic output of a recorded invocation.
    pub(crate) fn recorded(
        id: TensorId,
        spec: TensorSpec,
        history: History,
        mask: Option<Tensor>,
    ) -> Self {
        Tensor::Symbolic(SymbolicTensor {
            id,
            spec,
            history: Some(history),
            mask: mask.map(Arc::new),
        })
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Tensor::Symbolic(_))
    }

    pub fn id(&self) -> Option<TensorId> {
        match self {
            Tensor::Symbolic(s) => Some(s.id),
            Tensor::Concrete(_) => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Tensor::Concrete(c) => Some(&c.value),
            Tensor::Symbolic(_) => None,
        }
    }

    pub fn history(&self) -> Option<&History> {
        match self {
            Tensor::Symbolic(s) => s.history.as_ref(),
            Tensor::Concrete(_) => None,
        }
    }

    pub fn spec(&self) -> TensorSpec {
        match self {
            Tensor::Concrete(c) => TensorSpec::new(c.value.shape(), c.value.dtype()),
            Tensor::Symbolic(s) => s.spec.clone(),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Tensor::Concrete(c) => c.value.shape(),
            Tensor::Symbolic(s) => s.spec.shape.clone(),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Tensor::Concrete(c) => c.value.dtype(),
            Tensor::Symbolic(s) => s.spec.dtype,
        }
    }

    pub fn mask(&self) -> Option<&Tensor> {
        match self {
            Tensor::Concrete(c) => c.mask.as_deref(),
            Tensor::Symbolic(s) => s.mask.as_deref(),
        }
    }

    /// Same tensor (and same id) with its mask replaced.
    pub fn with_mask(&self, mask: Option<Tensor>) -> Tensor {
        let mask = mask.map(Arc::new);
        match self {
            Tensor::Concrete(c) => Tensor::Concrete(ConcreteTensor {
                value: c.value.clone(),
                mask,
            }),
            Tensor::Symbolic(s) => Tensor::Symbolic(SymbolicTensor {
                id: s.id,
                spec: s.spec.clone(),
                history: s.history.clone(),
                mask,
            }),
        }
    }

    /// Identity check: same symbolic edge, or same shared value buffer.
    pub fn same_as(&self, other: &Tensor) -> bool {
        match (self, other) {
            (Tensor::Symbolic(a), Tensor::Symbolic(b)) => a.id == b.id,
            (Tensor::Concrete(a), Tensor::Concrete(b)) => Arc::ptr_eq(&a.value, &b.value),
            _ => false,
        }
    }
}

impl From<Value> for Tensor {
    fn from(value: Value) -> Self {
        Tensor::new(value)
    }
}

impl From<ndarray::ArrayD<f32>> for Tensor {
    fn from(a: ndarray::ArrayD<f32>) -> Self {
        Tensor::new(Value::F32(a))
    }
}

impl From<Tensor> for Nest<Tensor> {
    fn from(t: Tensor) -> Self {
        Nest::Leaf(t)
    }
}

impl From<&Tensor> for Nest<Tensor> {
    fn from(t: &Tensor) -> Self {
        Nest::Leaf(t.clone())
    }
}

impl From<Vec<Tensor>> for Nest<Tensor> {
    fn from(items: Vec<Tensor>) -> Self {
        Nest::list(items)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tensor::Concrete(c) => f
                .debug_struct("Tensor")
                .field("shape", &c.value.shape().to_string())
                .field("dtype", &c.value.dtype())
                .field("masked", &c.mask.is_some())
                .finish(),
            Tensor::Symbolic(s) => f
                .debug_struct("SymbolicTensor")
                .field("id", &s.id)
                .field("shape", &s.spec.shape.to_string())
                .field("dtype", &s.spec.dtype)
                .field(
                    "history",
                    &s.history
                        .as_ref()
                        .map(|h| format!("{}[{}]", h.node.unit().core().name(), h.slot)),
                )
                .field("masked", &s.mask.is_some())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_ids_are_unique() {
        let spec = TensorSpec::new(Shape::batched(&[4]), DType::F32);
        let a = Tensor::placeholder(spec.clone());
        let b = Tensor::placeholder(spec);
        assert_ne!(a.id(), b.id());
        assert!(a.same_as(&a.with_mask(None)));
        assert!(!a.same_as(&b));
        assert!(a.history().is_none());
    }

    #[test]
    fn test_concrete_spec() {
        let t = Tensor::new(Value::zeros(&[2, 3], DType::F64));
        assert_eq!(t.shape(), Shape::known(&[2, 3]));
        assert_eq!(t.dtype(), DType::F64);
        assert!(t.id().is_none());
        assert!(t.mask().is_none());
    }
}
