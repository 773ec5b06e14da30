//! Model validation errors.

use thiserror::Error;

/// Errors raised while validating or interpreting job data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A resource quantity could not be parsed.
    #[error("invalid {field} quantity '{value}'")]
    InvalidResource { field: &'static str, value: String },

    /// The job specification is malformed.
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    /// A lifecycle transition is not allowed from the current state.
    #[error("cannot transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}
