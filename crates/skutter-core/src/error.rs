// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for Skutter
#[derive(Error, Debug, Diagnostic)]
pub enum CoreError {
    /// A required metadata field is missing
    #[error("Missing field {field} on {kind}")]
    #[diagnostic(
        code(skutter::missing_field),
        help("Pods must carry metadata.name; namespace defaults to 'default'")
    )]
    MissingField {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        field: String,
    },

    /// A resource quantity could not be parsed
    #[error("Invalid quantity '{value}': {reason}")]
    #[diagnostic(
        code(skutter::invalid_quantity),
        help("Use Kubernetes quantity notation, e.g. '500m', '2', '128Mi', '1Gi'")
    )]
    InvalidQuantity {
        #[allow(unused)]
        value: String,
        #[allow(unused)]
        reason: String,
    },

    /// A unit key string was malformed
    #[error("Invalid unit key: {key}")]
    #[diagnostic(
        code(skutter::invalid_unit_key),
        help("Unit keys have the form <namespace>/<name>")
    )]
    InvalidUnitKey {
        #[allow(unused)]
        key: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create a MissingField error
    pub fn missing_field(kind: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            kind: kind.into(),
            field: field.into(),
        }
    }

    /// Create an InvalidQuantity error
    pub fn invalid_quantity(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidUnitKey error
    pub fn invalid_unit_key(key: impl Into<String>) -> Self {
        Self::InvalidUnitKey { key: key.into() }
    }
}
