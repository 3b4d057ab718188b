//! # Predicate Converter List
//!
//! Chain-of-responsibility converter selection. Each entry pairs a converter
//! with a wire schema predicate and a data type predicate.
//!
//! Lookup walks the entries from the most recently added to the oldest and
//! returns the first whose predicate accepts the probe. Broad fallbacks
//! therefore have to be registered *before* the specific entries they should
//! yield to: a catch-all added last shadows everything added earlier.

use std::fmt;
use std::sync::Arc;

use bus_types::DataType;
use parking_lot::RwLock;

use crate::converter::{Converter, ConverterSelection, WireType};
use crate::error::ConverterError;

/// Test applied to a wire schema or data type name.
#[derive(Clone)]
pub enum Predicate {
    /// Accepts every value.
    Always,
    /// Accepts exactly one value.
    Equals(String),
    /// Accepts whatever the closure accepts.
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl Predicate {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    #[must_use]
    pub fn test(&self, value: &str) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Equals(expected) => expected == value,
            Predicate::Custom(f) => f(value),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Always => write!(f, "Always"),
            Predicate::Equals(value) => f.debug_tuple("Equals").field(value).finish(),
            Predicate::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
struct PredicateEntry {
    wire_schema: Predicate,
    data_type: Predicate,
    converter: Arc<dyn Converter>,
}

/// Ordered list of (converter, wire schema predicate, data type predicate).
pub struct PredicateConverterList {
    wire_type: WireType,
    entries: RwLock<Vec<PredicateEntry>>,
}

impl PredicateConverterList {
    #[must_use]
    pub fn new(wire_type: WireType) -> Self {
        Self {
            wire_type,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Append an entry.
    ///
    /// Omitted predicates default to equality with the converter's own wire
    /// schema or data type.
    pub fn add_converter(
        &self,
        converter: Arc<dyn Converter>,
        wire_schema: Option<Predicate>,
        data_type: Option<Predicate>,
    ) -> Result<(), ConverterError> {
        if converter.wire_type() != self.wire_type {
            return Err(ConverterError::WireTypeMismatch {
                expected: self.wire_type,
                actual: converter.wire_type(),
            });
        }
        let wire_schema = wire_schema
            .unwrap_or_else(|| Predicate::Equals(converter.wire_schema().to_string()));
        let data_type =
            data_type.unwrap_or_else(|| Predicate::Equals(converter.data_type().to_string()));
        self.entries.write().push(PredicateEntry {
            wire_schema,
            data_type,
            converter,
        });
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Clone for PredicateConverterList {
    fn clone(&self) -> Self {
        Self {
            wire_type: self.wire_type,
            entries: RwLock::new(self.entries.read().clone()),
        }
    }
}

impl fmt::Debug for PredicateConverterList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateConverterList")
            .field("wire_type", &self.wire_type)
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl ConverterSelection for PredicateConverterList {
    fn wire_type(&self) -> WireType {
        self.wire_type
    }

    fn converter_for_wire_schema(
        &self,
        wire_schema: &str,
    ) -> Result<Arc<dyn Converter>, ConverterError> {
        self.entries
            .read()
            .iter()
            .rev()
            .find(|e| e.wire_schema.test(wire_schema))
            .map(|e| Arc::clone(&e.converter))
            .ok_or_else(|| ConverterError::NoConverterForWireSchema(wire_schema.to_string()))
    }

    fn converter_for_data_type(
        &self,
        data_type: &DataType,
    ) -> Result<Arc<dyn Converter>, ConverterError> {
        self.entries
            .read()
            .iter()
            .rev()
            .find(|e| e.data_type.test(data_type.name()))
            .map(|e| Arc::clone(&e.converter))
            .ok_or_else(|| ConverterError::NoConverterForDataType(data_type.to_string()))
    }
}
