use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A field holds a value outside its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// An algorithm property could not be parsed.
    #[error("invalid property `{key}` for algorithm `{algorithm}`: {reason}")]
    InvalidAlgorithmProperty {
        algorithm: String,
        key: String,
        reason: String,
    },
}
