//! Tensor shapes with possibly-unknown dimensions.
//!
//! Symbolic placeholders usually leave the batch dimension unknown, so every
//! dimension is an `Option<usize>`: `None` matches any size.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(Vec<Option<usize>>);

impl Shape {
    pub fn new(dims: Vec<Option<usize>>) -> Self {
        Shape(dims)
    }

    /// A shape whose every dimension is known.
    pub fn known(dims: &[usize]) -> Self {
        Shape(dims.iter().map(|&d| Some(d)).collect())
    }

    /// `dims` prefixed with an unknown batch dimension.
    pub fn batched(dims: &[usize]) -> Self {
        let mut all = Vec::with_capacity(dims.len() + 1);
        all.push(None);
        all.extend(dims.iter().map(|&d| Some(d)));
        Shape(all)
    }

    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Option<usize>] {
        &self.0
    }

    /// Dimension at `axis`; negative axes count from the end.
    pub fn dim(&self, axis: isize) -> Option<Option<usize>> {
        let idx = normalize_axis(axis, self.rank())?;
        self.0.get(idx).copied()
    }

    pub fn is_fully_defined(&self) -> bool {
        self.0.iter().all(Option::is_some)
    }

    pub fn to_concrete(&self) -> Option<Vec<usize>> {
        self.0.iter().copied().collect()
    }

    /// Same rank and every pair of known dimensions agrees.
    pub fn is_compatible_with(&self, other: &Shape) -> bool {
        self.rank() == other.rank()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| match (a, b) {
                    (Some(x), Some(y)) => x == y,
                    _ => true,
                })
    }

    /// Most specific shape compatible with both, if any.
    pub fn merge(&self, other: &Shape) -> Option<Shape> {
        if !self.is_compatible_with(other) {
            return None;
        }
        Some(Shape(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| a.or(*b))
                .collect(),
        ))
    }

    /// Copy of this shape with the leading (batch) dimension unknown.
    pub fn with_batch_unknown(&self) -> Shape {
        let mut dims = self.0.clone();
        if let Some(first) = dims.first_mut() {
            *first = None;
        }
        Shape(dims)
    }

    pub fn with_dim(&self, axis: isize, value: Option<usize>) -> Option<Shape> {
        let idx = normalize_axis(axis, self.rank())?;
        let mut dims = self.0.clone();
        dims[idx] = value;
        Some(Shape(dims))
    }
}

/// Resolves a possibly-negative axis against `rank`.
pub fn normalize_axis(axis: isize, rank: usize) -> Option<usize> {
    let rank = rank as isize;
    let idx = if axis < 0 { axis + rank } else { axis };
    if idx < 0 || idx >= rank {
        None
    } else {
        Some(idx as usize)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::known(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::known(&dims)
    }
}

impl From<Vec<Option<usize>>> for Shape {
    fn from(dims: Vec<Option<usize>>) -> Self {
        Shape(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match d {
                Some(v) => write!(f, "{}", v)?,
                None => write!(f, "None")?,
            }
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility() {
        let a = Shape::batched(&[32]);
        let b = Shape::known(&[4, 32]);
        let c = Shape::known(&[4, 16]);
        assert!(a.is_compatible_with(&b));
        assert!(!a.is_compatible_with(&c));
        assert!(!a.is_compatible_with(&Shape::known(&[32])));
        assert_eq!(a.merge(&b), Some(Shape::known(&[4, 32])));
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::batched(&[32]).to_string(), "(None, 32)");
        assert_eq!(Shape::known(&[3]).to_string(), "(3,)");
        assert_eq!(Shape::scalar().to_string(), "()");
    }

    #[test]
    fn test_negative_axis() {
        let s = Shape::known(&[2, 3, 4]);
        assert_eq!(s.dim(-1), Some(Some(4)));
        assert_eq!(s.dim(3), None);
        assert_eq!(normalize_axis(-4, 3), None);
    }
}
