//! Element types and the dtype policy of a unit.
//!
//! A policy pairs the dtype parameters are stored in (`variable_dtype`) with
//! the dtype computations run in (`compute_dtype`). For `mixed_float16`
//! parameters stay in `float32` while inputs are autocast to `float16`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F16,
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    pub fn is_floating(self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// Canonical name used in configs (`"float32"`, `"int64"`, ...).
    pub fn name(self) -> &'static str {
        match self {
            DType::F16 => "float16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::Bool => "bool",
        }
    }

    pub fn parse(name: &str) -> Option<DType> {
        match name {
            "float16" | "f16" => Some(DType::F16),
            "float32" | "f32" => Some(DType::F32),
            "float64" | "f64" => Some(DType::F64),
            "int32" | "i32" => Some(DType::I32),
            "int64" | "i64" => Some(DType::I64),
            "bool" => Some(DType::Bool),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Storage dtype + compute dtype of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DTypePolicy {
    name: String,
    variable_dtype: DType,
    compute_dtype: DType,
}

impl DTypePolicy {
    /// A policy that stores and computes in the same dtype.
    pub fn new(dtype: DType) -> Self {
        Self {
            name: dtype.name().to_string(),
            variable_dtype: dtype,
            compute_dtype: dtype,
        }
    }

    pub fn mixed_float16() -> Self {
        Self {
            name: "mixed_float16".to_string(),
            variable_dtype: DType::F32,
            compute_dtype: DType::F16,
        }
    }

    /// Parses either a plain dtype name or a mixed policy name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mixed_float16" => Some(Self::mixed_float16()),
            other => DType::parse(other).map(Self::new),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variable_dtype(&self) -> DType {
        self.variable_dtype
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }
}

impl Default for DTypePolicy {
    fn default() -> Self {
        Self::new(DType::F32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_names() {
        let mixed = DTypePolicy::from_name("mixed_float16").unwrap();
        assert_eq!(mixed.variable_dtype(), DType::F32);
        assert_eq!(mixed.compute_dtype(), DType::F16);

        let plain = DTypePolicy::from_name("float64").unwrap();
        assert_eq!(plain.variable_dtype(), DType::F64);
        assert_eq!(plain.compute_dtype(), DType::F64);

        assert!(DTypePolicy::from_name("complex128").is_none());
    }

    #[test]
    fn test_floating() {
        assert!(DType::F16.is_floating());
        assert!(!DType::I32.is_floating());
        assert!(!DType::Bool.is_floating());
    }
}
