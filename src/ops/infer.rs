//! Shape and dtype rules for the tensor operations.
//!
//! The same rules run for symbolic operands (to produce a placeholder spec)
//! and for concrete operands (to reject bad inputs before a kernel would
//! panic), so both execution modes agree on every output shape.

use super::OpError;
use crate::dtype::DType;
use crate::shape::{normalize_axis, Shape};
use crate::tensor::TensorSpec;

type Result<T> = std::result::Result<T, OpError>;

/// Numpy-style broadcasting with unknown dimensions.
pub fn broadcast(op: &str, left: &Shape, right: &Shape) -> Result<Shape> {
    let rank = left.rank().max(right.rank());
    let mut dims = vec![Some(1); rank];
    let pad = |s: &Shape, i: usize| -> Option<usize> {
        let offset = rank - s.rank();
        if i < offset {
            Some(1)
        } else {
            s.dims()[i - offset]
        }
    };
    for (i, slot) in dims.iter_mut().enumerate() {
        let (a, b) = (pad(left, i), pad(right, i));
        *slot = match (a, b) {
            (Some(1), other) | (other, Some(1)) => other,
            (Some(x), Some(y)) if x == y => Some(x),
            (Some(_), Some(_)) => {
                return Err(OpError::IncompatibleShapes {
                    op: op.to_string(),
                    left: left.clone(),
                    right: right.clone(),
                })
            }
            (None, known) | (known, None) => known,
        };
    }
    Ok(Shape::new(dims))
}

pub fn same_dtype(op: &str, left: DType, right: DType) -> Result<DType> {
    if left == right {
        Ok(left)
    } else {
        Err(OpError::DTypeMismatch {
            op: op.to_string(),
            left,
            right,
        })
    }
}

pub fn elementwise(op: &str, left: &TensorSpec, right: &TensorSpec) -> Result<TensorSpec> {
    let dtype = same_dtype(op, left.dtype, right.dtype)?;
    let shape = broadcast(op, &left.shape, &right.shape)?;
    Ok(TensorSpec { shape, dtype })
}

/// `[..., m, k] x [k, n] -> [..., m, n]`.
pub fn matmul(left: &TensorSpec, right: &TensorSpec) -> Result<TensorSpec> {
    let dtype = same_dtype("matmul", left.dtype, right.dtype)?;
    let (ls, rs) = (&left.shape, &right.shape);
    if ls.rank() < 2 {
        return Err(OpError::InvalidRank {
            op: "matmul".to_string(),
            expected: 2,
            actual: ls.rank(),
        });
    }
    if rs.rank() != 2 {
        return Err(OpError::InvalidRank {
            op: "matmul".to_string(),
            expected: 2,
            actual: rs.rank(),
        });
    }
    let k1 = ls.dims()[ls.rank() - 1];
    let k2 = rs.dims()[0];
    if let (Some(a), Some(b)) = (k1, k2) {
        if a != b {
            return Err(OpError::IncompatibleShapes {
                op: "matmul".to_string(),
                left: ls.clone(),
                right: rs.clone(),
            });
        }
    }
    let mut dims = ls.dims()[..ls.rank() - 1].to_vec();
    dims.push(rs.dims()[1]);
    Ok(TensorSpec {
        shape: Shape::new(dims),
        dtype,
    })
}

pub fn concat(specs: &[&TensorSpec], axis: isize) -> Result<(TensorSpec, usize)> {
    let first = specs.first().ok_or_else(|| OpError::EmptyInput("concat".to_string()))?;
    let rank = first.shape.rank();
    let ax = normalize_axis(axis, rank).ok_or(OpError::InvalidAxis {
        op: "concat".to_string(),
        axis,
        rank,
    })?;
    let mut dims = first.shape.dims().to_vec();
    for spec in &specs[1..] {
        same_dtype("concat", first.dtype, spec.dtype)?;
        let other = spec.shape.dims();
        if other.len() != rank {
            return Err(OpError::IncompatibleShapes {
                op: "concat".to_string(),
                left: first.shape.clone(),
                right: spec.shape.clone(),
            });
        }
        for (i, (d, o)) in dims.iter_mut().zip(other).enumerate() {
            if i == ax {
                *d = match (*d, *o) {
                    (Some(a), Some(b)) => Some(a + b),
                    _ => None,
                };
            } else {
                *d = match (*d, *o) {
                    (Some(a), Some(b)) if a != b => {
                        return Err(OpError::IncompatibleShapes {
                            op: "concat".to_string(),
                            left: first.shape.clone(),
                            right: spec.shape.clone(),
                        })
                    }
                    (a, b) => a.or(b),
                };
            }
        }
    }
    Ok((
        TensorSpec {
            shape: Shape::new(dims),
            dtype: first.dtype,
        },
        ax,
    ))
}

/// Shape after reducing `axis` away (or keeping it as size 1).
pub fn reduce(op: &str, spec: &TensorSpec, axis: isize, keepdims: bool) -> Result<(Shape, usize)> {
    let rank = spec.shape.rank();
    let ax = normalize_axis(axis, rank).ok_or(OpError::InvalidAxis {
        op: op.to_string(),
        axis,
        rank,
    })?;
    let mut dims = spec.shape.dims().to_vec();
    if keepdims {
        dims[ax] = Some(1);
    } else {
        dims.remove(ax);
    }
    Ok((Shape::new(dims), ax))
}

pub fn expand_dims(spec: &TensorSpec, axis: isize) -> Result<(Shape, usize)> {
    let rank = spec.shape.rank() + 1;
    let ax = normalize_axis(axis, rank).ok_or(OpError::InvalidAxis {
        op: "expand_dims".to_string(),
        axis,
        rank,
    })?;
    let mut dims = spec.shape.dims().to_vec();
    dims.insert(ax, Some(1));
    Ok((Shape::new(dims), ax))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dims: Vec<Option<usize>>) -> TensorSpec {
        TensorSpec::new(Shape::new(dims), DType::F32)
    }

    #[test]
    fn test_broadcast_with_unknown_batch() {
        let out = broadcast("add", &Shape::batched(&[4]), &Shape::known(&[4])).unwrap();
        assert_eq!(out, Shape::batched(&[4]));
        let out = broadcast("add", &Shape::batched(&[1]), &Shape::known(&[3, 5])).unwrap();
        assert_eq!(out, Shape::known(&[3, 5]));
        assert!(broadcast("add", &Shape::known(&[3]), &Shape::known(&[4])).is_err());
    }

    #[test]
    fn test_matmul_rules() {
        let out = matmul(&spec(vec![None, Some(3)]), &spec(vec![Some(3), Some(5)])).unwrap();
        assert_eq!(out.shape, Shape::batched(&[5]));
        let out = matmul(
            &spec(vec![None, Some(7), Some(3)]),
            &spec(vec![Some(3), Some(2)]),
        )
        .unwrap();
        assert_eq!(out.shape, Shape::new(vec![None, Some(7), Some(2)]));
        assert!(matmul(&spec(vec![None, Some(4)]), &spec(vec![Some(3), Some(5)])).is_err());
        assert!(matmul(&spec(vec![Some(4)]), &spec(vec![Some(4), Some(5)])).is_err());
    }

    #[test]
    fn test_concat_rules() {
        let a = spec(vec![None, Some(3)]);
        let b = spec(vec![None, Some(5)]);
        let (out, ax) = concat(&[&a, &b], -1).unwrap();
        assert_eq!(ax, 1);
        assert_eq!(out.shape, Shape::batched(&[8]));
        let c = spec(vec![Some(2), Some(5)]);
        let d = spec(vec![Some(3), Some(5)]);
        assert!(concat(&[&c, &d], 1).is_err());
        assert!(concat(&[], 0).is_err());
    }
}
