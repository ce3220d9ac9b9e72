//! Explicit attribute registration for parameters and child units.
//!
//! A unit registers what it owns under attribute names. The same object may
//! sit under several names; it stays tracked until its last name is removed
//! or reassigned. Parameters land in exactly one of the trainable or
//! non-trainable buckets, in registration order.

use crate::param::{Parameter, ParameterId};
use crate::unit::{Unit, UnitId};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub enum Tracked {
    Parameter(Parameter),
    Unit(Arc<dyn Unit>),
}

impl Tracked {
    fn key(&self) -> Key {
        match self {
            Tracked::Parameter(p) => Key::Param(p.id()),
            Tracked::Unit(u) => Key::Unit(u.core().id()),
        }
    }
}

impl From<Parameter> for Tracked {
    fn from(p: Parameter) -> Self {
        Tracked::Parameter(p)
    }
}

impl From<Arc<dyn Unit>> for Tracked {
    fn from(u: Arc<dyn Unit>) -> Self {
        Tracked::Unit(u)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    Param(ParameterId),
    Unit(UnitId),
}

#[derive(Clone, Default)]
pub struct Tracker {
    attributes: Vec<(String, Tracked)>,
    counts: HashMap<Key, usize>,
    trainable: Vec<Parameter>,
    non_trainable: Vec<Parameter>,
    units: Vec<Arc<dyn Unit>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `value` to `attr`, releasing whatever the name held before.
    pub fn assign(&mut self, attr: &str, value: Tracked) {
        self.remove(attr);
        let key = value.key();
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        if *count == 1 {
            match &value {
                Tracked::Parameter(p) if p.trainable() => self.trainable.push(p.clone()),
                Tracked::Parameter(p) => self.non_trainable.push(p.clone()),
                Tracked::Unit(u) => self.units.push(u.clone()),
            }
        }
        self.attributes.push((attr.to_string(), value));
    }

    /// Unbinds `attr`; the object is untracked when no other name holds it.
    pub fn remove(&mut self, attr: &str) -> Option<Tracked> {
        let pos = self.attributes.iter().position(|(name, _)| name == attr)?;
        let (_, old) = self.attributes.remove(pos);
        let key = old.key();
        let remaining = match self.counts.get_mut(&key) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            self.counts.remove(&key);
            match &old {
                Tracked::Parameter(p) => {
                    self.trainable.retain(|q| !q.ptr_eq(p));
                    self.non_trainable.retain(|q| !q.ptr_eq(p));
                }
                Tracked::Unit(u) => {
                    let id = u.core().id();
                    self.units.retain(|v| v.core().id() != id);
                }
            }
        }
        Some(old)
    }

    pub fn get(&self, attr: &str) -> Option<&Tracked> {
        self.attributes
            .iter()
            .find(|(name, _)| name == attr)
            .map(|(_, v)| v)
    }

    pub fn attribute_names(&self) -> Vec<&str> {
        self.attributes.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn trainable(&self) -> &[Parameter] {
        &self.trainable
    }

    pub fn non_trainable(&self) -> &[Parameter] {
        &self.non_trainable
    }

    /// Trainable parameters first, then non-trainable ones.
    pub fn parameters(&self) -> Vec<Parameter> {
        self.trainable
            .iter()
            .chain(self.non_trainable.iter())
            .cloned()
            .collect()
    }

    pub fn units(&self) -> &[Arc<dyn Unit>] {
        &self.units
    }

    pub fn is_tracked(&self, value: &Tracked) -> bool {
        self.counts.contains_key(&value.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::param::{ParameterSpec, Zeros};

    fn param(name: &str, trainable: bool) -> Parameter {
        Parameter::allocate(
            ParameterSpec::new(name, &[1])
                .with_trainable(trainable)
                .with_initializer(Zeros),
            DType::F32,
        )
    }

    #[test]
    fn test_refcounted_untracking() {
        let mut tracker = Tracker::new();
        let w = param("w", true);
        tracker.assign("kernel", w.clone().into());
        tracker.assign("alias", w.clone().into());
        assert_eq!(tracker.trainable().len(), 1);

        tracker.remove("kernel");
        assert!(tracker.is_tracked(&w.clone().into()));
        assert_eq!(tracker.trainable().len(), 1);

        tracker.assign("alias", param("other", true).into());
        assert!(!tracker.is_tracked(&w.into()));
        assert_eq!(tracker.trainable().len(), 1);
        assert_eq!(tracker.trainable()[0].name(), "other");
    }

    #[test]
    fn test_buckets_are_exclusive_and_ordered() {
        let mut tracker = Tracker::new();
        tracker.assign("moving_mean", param("moving_mean", false).into());
        tracker.assign("gamma", param("gamma", true).into());
        tracker.assign("beta", param("beta", true).into());
        let names: Vec<String> = tracker
            .parameters()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["gamma", "beta", "moving_mean"]);
        assert_eq!(tracker.non_trainable().len(), 1);
        assert_eq!(tracker.attribute_names(), vec!["moving_mean", "gamma", "beta"]);
    }
}
