//! # Scopes
//!
//! Hierarchical channel addresses of the bus, written as `/a/deep/scope/`.
//!
//! A scope is an ordered list of components. `/` is the root scope and
//! contains every other scope. Scopes are immutable once parsed; two scopes
//! are interchangeable if their component lists are equal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ScopeError;

/// Separator between scope components.
pub const COMPONENT_SEPARATOR: char = '/';

/// A hierarchical bus address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Scope {
    components: Vec<String>,
}

impl Scope {
    /// Parse a scope from its string representation.
    ///
    /// The trailing slash is optional: `/a/b` and `/a/b/` designate the same
    /// scope.
    pub fn new(repr: &str) -> Result<Self, ScopeError> {
        if repr.is_empty() {
            return Err(ScopeError::Empty);
        }
        if !repr.is_ascii() {
            return Err(ScopeError::NonAscii(repr.to_string()));
        }
        let Some(rest) = repr.strip_prefix(COMPONENT_SEPARATOR) else {
            return Err(ScopeError::MissingLeadingSlash(repr.to_string()));
        };
        if rest.is_empty() {
            return Ok(Self::root());
        }
        let rest = rest.strip_suffix(COMPONENT_SEPARATOR).unwrap_or(rest);

        let mut components = Vec::new();
        for component in rest.split(COMPONENT_SEPARATOR) {
            if !is_valid_component(component) {
                return Err(ScopeError::InvalidComponent {
                    component: component.to_string(),
                    scope: repr.to_string(),
                });
            }
            components.push(component.to_string());
        }
        Ok(Self { components })
    }

    /// The root scope `/`.
    #[must_use]
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Components ordered from the highest level of the hierarchy down.
    #[must_use]
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Whether this is the root scope.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Create a sub-scope by appending the components of `child`.
    ///
    /// `/this/is/` concatenated with `/a/test/` yields `/this/is/a/test/`.
    #[must_use]
    pub fn concat(&self, child: &Scope) -> Scope {
        let mut components = self.components.clone();
        components.extend(child.components.iter().cloned());
        Scope { components }
    }

    /// Strict sub-scope test: `/a/b/` is a sub-scope of `/a/`, but `/a/` is
    /// not a sub-scope of itself.
    #[must_use]
    pub fn is_sub_scope_of(&self, other: &Scope) -> bool {
        self.components.len() > other.components.len()
            && self.components.starts_with(&other.components)
    }

    /// Strict super-scope test, the inverse of [`Scope::is_sub_scope_of`].
    #[must_use]
    pub fn is_super_scope_of(&self, other: &Scope) -> bool {
        other.is_sub_scope_of(self)
    }

    /// Containment: true if `other` equals this scope or is one of its
    /// descendants.
    #[must_use]
    pub fn contains(&self, other: &Scope) -> bool {
        other.components.starts_with(&self.components)
    }

    /// All super-scopes ordered by hierarchy, root first.
    ///
    /// With `include_self` the scope itself is the last element.
    #[must_use]
    pub fn super_scopes(&self, include_self: bool) -> Vec<Scope> {
        let max = if include_self {
            self.components.len()
        } else {
            self.components.len().saturating_sub(1)
        };
        if !include_self && self.is_root() {
            return Vec::new();
        }
        (0..=max)
            .map(|i| Scope {
                components: self.components[..i].to_vec(),
            })
            .collect()
    }

    /// ASCII bytes of the string representation.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

fn is_valid_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{COMPONENT_SEPARATOR}")?;
        for component in &self.components {
            write!(f, "{component}{COMPONENT_SEPARATOR}")?;
        }
        Ok(())
    }
}

impl FromStr for Scope {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::new(s)
    }
}

impl TryFrom<String> for Scope {
    type Error = ScopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Scope::new(&value)
    }
}

impl TryFrom<&str> for Scope {
    type Error = ScopeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Scope::new(value)
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

impl PartialOrd for Scope {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scope {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}
