//! # Converter Errors

use thiserror::Error;

use crate::converter::WireType;

/// Errors from converter registration, lookup and conversion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConverterError {
    /// A different converter already holds this key and replacement was not
    /// requested.
    #[error("Converter already registered for wire schema {wire_schema:?} and data type {data_type}")]
    RegistrationConflict {
        wire_schema: String,
        data_type: String,
    },

    /// The wire schema is already claimed by another data type.
    #[error("Ambiguous converter for wire schema {wire_schema:?}: data type {data_type} conflicts with registered data type {existing}")]
    AmbiguousWireSchema {
        wire_schema: String,
        data_type: String,
        existing: String,
    },

    /// The converter produces a different wire type than the map holds.
    #[error("Wire type mismatch: map holds {expected:?}, converter produces {actual:?}")]
    WireTypeMismatch { expected: WireType, actual: WireType },

    #[error("No converter for wire schema {0:?}")]
    NoConverterForWireSchema(String),

    #[error("No converter for data type {0}")]
    NoConverterForDataType(String),

    /// The payload is not of the converter's data type.
    #[error("Payload of type {actual} cannot be handled by converter for {expected}")]
    PayloadType { expected: String, actual: String },

    /// The converter was asked to decode a foreign wire schema.
    #[error("Converter for wire schema {expected:?} cannot decode wire schema {actual:?}")]
    WireSchemaMismatch { expected: String, actual: String },

    /// The value cannot be represented in the wire encoding.
    #[error("Cannot encode value for wire schema {wire_schema:?}: {reason}")]
    Encode { wire_schema: String, reason: String },

    /// The wire data is malformed.
    #[error("Cannot decode wire data with schema {wire_schema:?}: {reason}")]
    Decode { wire_schema: String, reason: String },
}

impl ConverterError {
    /// Whether this is a failed lookup.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NoConverterForWireSchema(_) | Self::NoConverterForDataType(_)
        )
    }

    /// Whether this is an encode or decode failure.
    #[must_use]
    pub fn is_encoding(&self) -> bool {
        matches!(self, Self::Encode { .. } | Self::Decode { .. })
    }
}
