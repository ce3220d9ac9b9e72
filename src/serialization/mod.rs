//! Persisted weights.
//!
//! Weights are stored per unit, keyed by the unit's name and the position
//! of the parameter among the unit's own parameters (trainable ones
//! first, then non-trainable, each in creation order). Loading checks that
//! every unit finds exactly as many stored values as it has parameters.
//!
//! # Example
//!
//! ```rust,ignore
//! use rustyunit::serialization::{save_weights, load_weights, SafeTensorsStore};
//!
//! let mut store = SafeTensorsStore::new();
//! save_weights(model.as_ref(), &mut store)?;
//! store.save("model.safetensors")?;
//!
//! let store = SafeTensorsStore::open("model.safetensors")?;
//! load_weights(copy.as_ref(), &store)?;
//! ```

pub mod safetensors_io;

pub use safetensors_io::SafeTensorsStore;

use crate::error::{Result, UnitError};
use crate::param::Parameter;
use crate::unit::Unit;
use crate::value::Value;
use log::debug;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeightKey {
    pub unit: String,
    pub position: usize,
}

impl WeightKey {
    pub fn new(unit: &str, position: usize) -> Self {
        Self {
            unit: unit.to_string(),
            position,
        }
    }

    /// Inverse of the `Display` form, `unit/position`.
    pub fn parse(name: &str) -> Option<Self> {
        let (unit, position) = name.rsplit_once('/')?;
        Some(Self::new(unit, position.parse().ok()?))
    }
}

impl fmt::Display for WeightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.unit, self.position)
    }
}

/// Somewhere weights can be written to and read back from.
pub trait WeightStore {
    fn put(&mut self, key: WeightKey, value: Value) -> Result<()>;

    fn get(&self, key: &WeightKey) -> Result<Option<Value>>;

    /// Number of stored values for `unit`.
    fn count_for(&self, unit: &str) -> usize;
}

/// In-memory store, mostly for tests and for copying weights between units.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: BTreeMap<WeightKey, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &WeightKey> {
        self.values.keys()
    }
}

impl WeightStore for MemoryStore {
    fn put(&mut self, key: WeightKey, value: Value) -> Result<()> {
        self.values.insert(key, value);
        Ok(())
    }

    fn get(&self, key: &WeightKey) -> Result<Option<Value>> {
        Ok(self.values.get(key).cloned())
    }

    fn count_for(&self, unit: &str) -> usize {
        self.values.keys().filter(|k| k.unit == unit).count()
    }
}

/// `unit` followed by everything below it, each once.
fn unit_tree(unit: &dyn Unit) -> Vec<(String, Vec<Parameter>)> {
    let mut out = vec![(unit.core().name().to_string(), unit.core().own_parameters())];
    out.extend(
        unit.core()
            .descendants()
            .into_iter()
            .map(|u| (u.core().name().to_string(), u.core().own_parameters())),
    );
    out
}

/// Writes the weights of `unit` and its descendants into `store`.
pub fn save_weights(unit: &dyn Unit, store: &mut dyn WeightStore) -> Result<usize> {
    let mut written = 0;
    for (name, params) in unit_tree(unit) {
        for (position, param) in params.iter().enumerate() {
            store.put(WeightKey::new(&name, position), param.read())?;
            written += 1;
        }
    }
    debug!("saved {} weights of unit '{}'", written, unit.core().name());
    Ok(written)
}

/// Assigns stored weights to `unit` and its descendants.
///
/// Every unit must be built already, and the stored count for each unit
/// must equal its parameter count. Nothing is assigned unless every stored
/// value fits its parameter.
pub fn load_weights(unit: &dyn Unit, store: &dyn WeightStore) -> Result<usize> {
    let tree = unit_tree(unit);
    for (name, params) in &tree {
        let stored = store.count_for(name);
        if stored != params.len() {
            return Err(UnitError::state(
                name,
                format!(
                    "weight count mismatch: the store holds {} values, the unit has {} parameters",
                    stored,
                    params.len()
                ),
            ));
        }
    }

    let mut staged = Vec::new();
    for (name, params) in &tree {
        for (position, param) in params.iter().enumerate() {
            let key = WeightKey::new(name, position);
            let value = store.get(&key)?.ok_or_else(|| {
                UnitError::state(name, format!("no stored value for weight {}", key))
            })?;
            param.check_assignable(&value).map_err(|_| {
                UnitError::state(
                    name,
                    format!(
                        "stored value {} has shape {}, the parameter has shape {}",
                        key,
                        value.shape(),
                        param.shape()
                    ),
                )
            })?;
            staged.push((param, value));
        }
    }

    for (param, value) in &staged {
        param.assign(value)?;
    }
    debug!("loaded {} weights into unit '{}'", staged.len(), unit.core().name());
    Ok(staged.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Dense;
    use crate::tensor::Tensor;
    use crate::unit::Invoke;
    use ndarray::{ArrayD, IxDyn};
    use std::sync::Arc;

    fn built_dense(units: usize) -> Arc<Dense> {
        let dense = Dense::with_units(units).unwrap();
        dense
            .apply(&Tensor::from(ArrayD::<f32>::ones(IxDyn(&[1, 3]))))
            .unwrap();
        dense
    }

    #[test]
    fn test_key_display_round_trip() {
        let key = WeightKey::new("block/dense", 2);
        assert_eq!(key.to_string(), "block/dense/2");
        assert_eq!(WeightKey::parse("block/dense/2"), Some(key));
        assert_eq!(WeightKey::parse("dense"), None);
    }

    #[test]
    fn test_copies_weights_between_units() {
        let a = built_dense(2);
        let b = built_dense(2);
        let mut store = MemoryStore::new();
        assert_eq!(save_weights(a.as_ref(), &mut store).unwrap(), 2);

        // Stored under `a`'s name, so rename the keys for `b`.
        let mut renamed = MemoryStore::new();
        for key in store.keys() {
            let value = store.get(key).unwrap().unwrap();
            renamed
                .put(WeightKey::new(b.core().name(), key.position), value)
                .unwrap();
        }
        load_weights(b.as_ref(), &renamed).unwrap();
        assert_eq!(a.kernel().unwrap().read(), b.kernel().unwrap().read());
    }

    #[test]
    fn test_count_mismatch_is_state_error() {
        let dense = built_dense(2);
        let mut store = MemoryStore::new();
        store
            .put(WeightKey::new(dense.core().name(), 0), dense.kernel().unwrap().read())
            .unwrap();
        let err = load_weights(dense.as_ref(), &store).unwrap_err();
        assert!(err.is_state());
    }
}
