//! Error types for SQL marking.

use thiserror::Error;

/// Errors raised while configuring or rendering SQL markings.
///
/// None of these ever reach the caller of a marked query: the interceptor
/// logs them and runs the original statement instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarkingError {
    /// A configuration value violates its constraints.
    #[error("invalid config `{field}`: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: String,
    },

    /// A configuration property could not be parsed.
    #[error("invalid property `{key}` = `{value}`: {reason}")]
    InvalidProperty {
        key: String,
        value: String,
        reason: String,
    },

    /// The statement text is empty or whitespace only.
    #[error("statement text is empty")]
    EmptyStatement,

    /// A codec failed while building or rendering marking info.
    #[error("codec failure: {0}")]
    Codec(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MarkingError>;
