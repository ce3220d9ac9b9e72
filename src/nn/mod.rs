//! # Reference units
//!
//! Small, complete units built on the core. Each one has a serde config
//! struct and a `from_config` constructor, and is registered in
//! [`UnitRegistry::with_builtins`](crate::registry::UnitRegistry::with_builtins).
//!
//! - [`Input`]: graph entry point, see [`input`]
//! - [`Dense`]: fully connected, lazily built from the last input dimension
//! - [`Relu`]: activation
//! - [`Concatenate`], [`Add`]: merge several inputs, merging masks
//! - [`Dropout`]: reads the `training` call-context argument
//! - [`Masking`]: produces masks
//!
//! ## Example
//!
//! ```ignore
//! use rustyunit::nn::{input, Dense, Relu};
//! use rustyunit::{Graph, Invoke};
//!
//! let x = input(&[784])?;
//! let h = Dense::with_units(128)?.apply(&x)?;
//! let y = Relu::new(Default::default())?.apply(&h)?;
//! let model = Graph::assemble(x, y, Some("mlp"))?;
//! ```

pub mod activations;
pub mod dropout;
pub mod input;
pub mod linear;
pub mod masking;
pub mod merge;

pub use activations::Relu;
pub use dropout::{Dropout, DropoutConfig};
pub use input::{input, input_with, Input, InputConfig};
pub use linear::{Activation, Dense, DenseConfig};
pub use masking::{Masking, MaskingConfig};
pub use merge::{Add, Concatenate, ConcatenateConfig};

use crate::error::Result;
use crate::unit::Config;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) fn config_map<T: Serialize>(config: &T) -> Result<Config> {
    match serde_json::to_value(config)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Ok(Config::new()),
    }
}

pub(crate) fn parse_config<T: DeserializeOwned>(config: &Config) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::Object(config.clone()))?)
}
