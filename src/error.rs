//! Error taxonomy shared by every part of the crate.
//!
//! Usage errors describe malformed calls, state errors describe requests that
//! conflict with what a unit has already become, and masking errors describe
//! masks that would otherwise be silently dropped. None of them is retried.

use crate::ops::OpError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UnitError {
    #[error("usage error in unit '{unit}': {message}")]
    Usage { unit: String, message: String },

    #[error("state error in unit '{unit}': {message}")]
    State { unit: String, message: String },

    #[error("masking error in unit '{unit}': {message}")]
    Masking { unit: String, message: String },

    #[error("cannot reconstruct unit '{unit}' of class '{class_name}': {source}")]
    Serialization {
        class_name: String,
        unit: String,
        #[source]
        source: Box<UnitError>,
    },

    #[error("compute error: {0}")]
    Op(#[from] OpError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

impl UnitError {
    pub fn usage(unit: impl Into<String>, message: impl Into<String>) -> Self {
        UnitError::Usage {
            unit: unit.into(),
            message: message.into(),
        }
    }

    pub fn state(unit: impl Into<String>, message: impl Into<String>) -> Self {
        UnitError::State {
            unit: unit.into(),
            message: message.into(),
        }
    }

    pub fn masking(unit: impl Into<String>, message: impl Into<String>) -> Self {
        UnitError::Masking {
            unit: unit.into(),
            message: message.into(),
        }
    }

    /// Wraps a reconstruction failure, keeping the original cause.
    pub fn serialization(
        class_name: impl Into<String>,
        unit: impl Into<String>,
        source: UnitError,
    ) -> Self {
        UnitError::Serialization {
            class_name: class_name.into(),
            unit: unit.into(),
            source: Box::new(source),
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, UnitError::Usage { .. })
    }

    pub fn is_state(&self) -> bool {
        matches!(self, UnitError::State { .. })
    }

    pub fn is_masking(&self) -> bool {
        matches!(self, UnitError::Masking { .. })
    }
}

pub type Result<T> = std::result::Result<T, UnitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_unit_name() {
        let err = UnitError::usage("dense_3", "unknown keyword argument 'foo'");
        assert_eq!(
            err.to_string(),
            "usage error in unit 'dense_3': unknown keyword argument 'foo'"
        );
        assert!(err.is_usage());
    }

    #[test]
    fn test_serialization_keeps_cause() {
        let cause = UnitError::state("dense", "bad units");
        let err = UnitError::serialization("Dense", "dense", cause);
        let source = std::error::Error::source(&err).expect("cause is preserved");
        assert!(source.to_string().contains("bad units"));
        assert!(err.to_string().contains("'Dense'"));
    }
}
