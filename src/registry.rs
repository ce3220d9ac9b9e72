//! Class name -> constructor lookup used when rebuilding units from configs.

use crate::error::{Result, UnitError};
use crate::graph::{self, Graph};
use crate::nn::{activations, dropout, input, linear, masking, merge};
use crate::nn::{Add, Concatenate, Dense, Dropout, Input, Masking, Relu};
use crate::unit::{Config, Unit};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Builds a unit from its config. The registry is passed along so container
/// units can build their children.
pub type Constructor = Arc<dyn Fn(&Config, &UnitRegistry) -> Result<Arc<dyn Unit>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct UnitRegistry {
    constructors: HashMap<String, Constructor>,
}

impl UnitRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that knows every unit shipped with the crate, plus `Graph`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(input::CLASS_NAME, |c, _| Ok(Input::from_config(c)? as Arc<dyn Unit>));
        registry.register(linear::CLASS_NAME, |c, _| Ok(Dense::from_config(c)? as Arc<dyn Unit>));
        registry.register(activations::RELU, |c, _| Ok(Relu::from_config(c)? as Arc<dyn Unit>));
        registry.register(merge::CONCATENATE, |c, _| {
            Ok(Concatenate::from_config(c)? as Arc<dyn Unit>)
        });
        registry.register(merge::ADD, |c, _| Ok(Add::from_config(c)? as Arc<dyn Unit>));
        registry.register(dropout::CLASS_NAME, |c, _| {
            Ok(Dropout::from_config(c)? as Arc<dyn Unit>)
        });
        registry.register(masking::CLASS_NAME, |c, _| {
            Ok(Masking::from_config(c)? as Arc<dyn Unit>)
        });
        registry.register(graph::CLASS_NAME, |c, r| Ok(Graph::from_config(c, r)? as Arc<dyn Unit>));
        registry
    }

    /// Registers (or replaces) the constructor for `class_name`.
    pub fn register<F>(&mut self, class_name: &str, constructor: F)
    where
        F: Fn(&Config, &UnitRegistry) -> Result<Arc<dyn Unit>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(class_name.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.constructors.contains_key(class_name)
    }

    pub fn create(&self, class_name: &str, config: &Config) -> Result<Arc<dyn Unit>> {
        let constructor = self.constructors.get(class_name).ok_or_else(|| {
            let unit = config
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or(class_name);
            UnitError::usage(unit, format!("unknown unit class '{}'", class_name))
        })?;
        constructor(config, self)
    }
}

impl fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("UnitRegistry").field("classes", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::DenseConfig;
    use crate::unit::UnitOptions;

    #[test]
    fn test_creates_builtin_from_config() {
        let registry = UnitRegistry::with_builtins();
        let dense = Dense::new(DenseConfig::new(4).with_options(UnitOptions::new().with_name("fc")))
            .unwrap();
        let unit = registry.create("Dense", &dense.config().unwrap()).unwrap();
        assert_eq!(unit.class_name(), "Dense");
        assert_eq!(unit.core().name(), "fc");
    }

    #[test]
    fn test_unknown_class_is_usage_error() {
        let registry = UnitRegistry::with_builtins();
        let err = registry.create("Conv9D", &Config::new()).err().unwrap();
        assert!(err.is_usage());
        assert!(err.to_string().contains("Conv9D"));
    }

    #[test]
    fn test_custom_constructor_replaces_builtin() {
        let mut registry = UnitRegistry::with_builtins();
        registry.register("Relu", |_, _| Err(UnitError::usage("relu", "disabled")));
        assert!(registry.contains("Relu"));
        assert!(registry.create("Relu", &Config::new()).is_err());
    }
}
