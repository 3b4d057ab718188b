//! # Error Types
//!
//! Errors raised while building bus values.

use thiserror::Error;

/// Errors from parsing a scope string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    /// The empty string is not a scope.
    #[error("Empty scope string")]
    Empty,

    /// Scopes are restricted to ASCII.
    #[error("Scope contains non-ASCII characters: {0:?}")]
    NonAscii(String),

    /// Every scope starts at the root.
    #[error("Scope must start with '/': {0:?}")]
    MissingLeadingSlash(String),

    /// A component was empty or contained characters outside `[-_a-zA-Z0-9]`.
    #[error("Invalid component {component:?} in scope {scope:?}")]
    InvalidComponent { component: String, scope: String },
}
