//! Nested structures of leaves.
//!
//! Inputs and outputs of a unit are not always a single tensor: they may be
//! a sequence or a mapping of tensors, possibly nested. `Nest` keeps that
//! structure while letting the rest of the crate work on the flat leaf list.
//! Map entries are ordered by key so flattening is deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Nest<T> {
    Leaf(T),
    List(Vec<Nest<T>>),
    Map(BTreeMap<String, Nest<T>>),
}

impl<T> Nest<T> {
    /// A flat list of leaves.
    pub fn list(items: Vec<T>) -> Self {
        Nest::List(items.into_iter().map(Nest::Leaf).collect())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Nest::Leaf(_))
    }

    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Nest::Leaf(v) => Some(v),
            _ => None,
        }
    }

    /// Leaves in depth-first order.
    pub fn flatten(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Nest::Leaf(v) => out.push(v),
            Nest::List(items) => items.iter().for_each(|n| n.collect_refs(out)),
            Nest::Map(items) => items.values().for_each(|n| n.collect_refs(out)),
        }
    }

    pub fn into_flat(self) -> Vec<T> {
        let mut out = Vec::new();
        self.collect_owned(&mut out);
        out
    }

    fn collect_owned(self, out: &mut Vec<T>) {
        match self {
            Nest::Leaf(v) => out.push(v),
            Nest::List(items) => items.into_iter().for_each(|n| n.collect_owned(out)),
            Nest::Map(items) => items.into_values().for_each(|n| n.collect_owned(out)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Nest::Leaf(_) => 1,
            Nest::List(items) => items.iter().map(Nest::len).sum(),
            Nest::Map(items) => items.values().map(Nest::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> Nest<U> {
        self.map_inner(&mut f)
    }

    fn map_inner<U>(&self, f: &mut impl FnMut(&T) -> U) -> Nest<U> {
        match self {
            Nest::Leaf(v) => Nest::Leaf(f(v)),
            Nest::List(items) => Nest::List(items.iter().map(|n| n.map_inner(f)).collect()),
            Nest::Map(items) => Nest::Map(
                items
                    .iter()
                    .map(|(k, n)| (k.clone(), n.map_inner(f)))
                    .collect(),
            ),
        }
    }

    pub fn try_map<U, E>(&self, mut f: impl FnMut(&T) -> Result<U, E>) -> Result<Nest<U>, E> {
        self.try_map_inner(&mut f)
    }

    fn try_map_inner<U, E>(&self, f: &mut impl FnMut(&T) -> Result<U, E>) -> Result<Nest<U>, E> {
        Ok(match self {
            Nest::Leaf(v) => Nest::Leaf(f(v)?),
            Nest::List(items) => Nest::List(
                items
                    .iter()
                    .map(|n| n.try_map_inner(f))
                    .collect::<Result<_, _>>()?,
            ),
            Nest::Map(items) => {
                let mut out = BTreeMap::new();
                for (k, n) in items {
                    out.insert(k.clone(), n.try_map_inner(f)?);
                }
                Nest::Map(out)
            }
        })
    }

    /// The shape of the nesting with the leaves erased.
    pub fn structure(&self) -> Nest<()> {
        self.map(|_| ())
    }

    pub fn same_structure<U>(&self, other: &Nest<U>) -> bool {
        match (self, other) {
            (Nest::Leaf(_), Nest::Leaf(_)) => true,
            (Nest::List(a), Nest::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_structure(y))
            }
            (Nest::Map(a), Nest::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, x), (kb, y))| ka == kb && x.same_structure(y))
            }
            _ => false,
        }
    }
}

impl Nest<()> {
    /// Rebuilds a nest of this structure from flat leaves.
    /// Returns `None` when the leaf count does not match.
    pub fn pack<T>(&self, flat: Vec<T>) -> Option<Nest<T>> {
        if flat.len() != self.len() {
            return None;
        }
        let mut iter = flat.into_iter();
        self.pack_inner(&mut iter)
    }

    fn pack_inner<T>(&self, iter: &mut impl Iterator<Item = T>) -> Option<Nest<T>> {
        Some(match self {
            Nest::Leaf(()) => Nest::Leaf(iter.next()?),
            Nest::List(items) => Nest::List(
                items
                    .iter()
                    .map(|n| n.pack_inner(iter))
                    .collect::<Option<_>>()?,
            ),
            Nest::Map(items) => {
                let mut out = BTreeMap::new();
                for (k, n) in items {
                    out.insert(k.clone(), n.pack_inner(iter)?);
                }
                Nest::Map(out)
            }
        })
    }
}

impl<T> FromIterator<(String, T)> for Nest<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        Nest::Map(iter.into_iter().map(|(k, v)| (k, Nest::Leaf(v))).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_and_pack() {
        let nest: Nest<i32> = Nest::List(vec![
            Nest::Leaf(1),
            [("b".to_string(), 3), ("a".to_string(), 2)]
                .into_iter()
                .collect(),
        ]);
        assert_eq!(nest.flatten(), vec![&1, &2, &3]);

        let structure = nest.structure();
        let packed = structure.pack(vec![10, 20, 30]).unwrap();
        assert!(packed.same_structure(&nest));
        assert_eq!(packed.into_flat(), vec![10, 20, 30]);
        assert!(structure.pack(vec![1]).is_none());
    }

    #[test]
    fn test_structure_mismatch() {
        let a = Nest::list(vec![1, 2]);
        let b = Nest::list(vec![1]);
        assert!(!a.same_structure(&b));
        assert!(!a.same_structure(&Nest::Leaf(1)));
    }
}
