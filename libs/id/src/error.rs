use thiserror::Error;

/// Why a string could not be read back as a typed identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    /// Well-formed, but minted for a different kind of entity.
    #[error("wrong identifier kind: wanted '{expected}_', found '{actual}_'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("identifier has no '_' between kind and ulid")]
    MissingSeparator,

    #[error("malformed ulid in identifier: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// A node ID handed in where a job ID was expected, and the like.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
