//! # RustyUnit: unit invocation and graph assembly
//!
//! **RustyUnit** is the core of a layered neural-network library. Models are
//! built from *units*: stateful, callable blocks that create their
//! parameters lazily on first use. The same unit can be called on concrete
//! values, which computes immediately, or on symbolic tensors, which
//! records an invocation so that a [`Graph`] can later be assembled from
//! the records and replayed, nested, described and rebuilt.
//!
//! ## Usage Example
//!
//! ```no_run
//! use rustyunit::nn::{input, Dense, DenseConfig, Activation};
//! use rustyunit::{Graph, Invoke, Tensor};
//! use ndarray::{ArrayD, IxDyn};
//!
//! # fn main() -> rustyunit::Result<()> {
//! // 1. Declare a symbolic input with an unknown batch dimension.
//! let x = input(&[4])?;
//!
//! // 2. Call units on it; every call is recorded.
//! let hidden = Dense::new(DenseConfig::new(8).with_activation(Activation::Relu))?;
//! let head = Dense::with_units(2)?;
//! let y = head.apply(&hidden.apply(&x)?)?;
//!
//! // 3. Assemble the graph and run it on concrete data.
//! let model = Graph::assemble(x, y, Some("mlp"))?;
//! let batch = Tensor::from(ArrayD::<f32>::zeros(IxDyn(&[3, 4])));
//! let out = model.apply(&batch)?;
//! assert_eq!(out.shape().dims(), &[Some(3), Some(2)]);
//! # Ok(())
//! # }
//! ```

pub mod args;
pub mod context;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod naming;
pub mod nest;
pub mod nn;
pub mod node;
pub mod ops;
pub mod param;
pub mod registry;
pub mod serialization;
pub mod shape;
pub mod tensor;
pub mod tracking;
pub mod unit;
pub mod value;

pub use args::{Arg, CallArgs, Presence};
pub use context::{CallContext, ContextDefaults, TRAINING};
pub use dtype::{DType, DTypePolicy};
pub use error::{Result, UnitError};
pub use graph::{Graph, GraphDescription};
pub use nest::Nest;
pub use node::{InputRef, Node, NodeId};
pub use param::{Parameter, ParameterSpec};
pub use registry::UnitRegistry;
pub use shape::Shape;
pub use tensor::{Tensor, TensorSpec};
pub use unit::{Config, Invoke, MaskMismatch, Unit, UnitCore, UnitOptions};
pub use value::Value;
