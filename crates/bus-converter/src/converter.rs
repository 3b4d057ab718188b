//! # Converter Contract
//!
//! A converter is a stateless, bidirectional mapping between one in-memory
//! data type and one wire representation identified by a wire schema.
//! Selection strategies decide which converter applies to a given payload
//! (outbound) or wire schema (inbound).

use std::fmt;
use std::sync::Arc;

use bus_types::{DataType, Payload};

use crate::error::ConverterError;

/// Representation a converter produces on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    /// An opaque byte sequence. Used by every networked transport.
    Bytes,
    /// The in-memory payload itself. Used by process-local transports, which
    /// never serialise.
    Native,
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireType::Bytes => write!(f, "bytes"),
            WireType::Native => write!(f, "native"),
        }
    }
}

/// Bidirectional codec between a data type and a wire schema.
///
/// Identity for registration purposes is the triple
/// (`data_type`, `wire_schema`, `wire_type`).
pub trait Converter: Send + Sync + fmt::Debug {
    /// Data type accepted by [`Converter::serialize`] and produced by
    /// [`Converter::deserialize`].
    fn data_type(&self) -> DataType;

    /// Wire schema written by this converter.
    fn wire_schema(&self) -> &str;

    fn wire_type(&self) -> WireType {
        WireType::Bytes
    }

    /// Encode a payload.
    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, ConverterError>;

    /// Decode wire data that was tagged with `wire_schema`.
    fn deserialize(&self, wire: &[u8], wire_schema: &str) -> Result<Payload, ConverterError>;
}

/// Strategy selecting converters for outbound and inbound traffic.
pub trait ConverterSelection: Send + Sync + fmt::Debug {
    /// Wire type of every converter this strategy hands out.
    fn wire_type(&self) -> WireType;

    /// Converter able to decode `wire_schema`.
    fn converter_for_wire_schema(
        &self,
        wire_schema: &str,
    ) -> Result<Arc<dyn Converter>, ConverterError>;

    /// Converter able to encode payloads of `data_type`.
    fn converter_for_data_type(
        &self,
        data_type: &DataType,
    ) -> Result<Arc<dyn Converter>, ConverterError>;

    fn has_converter_for_wire_schema(&self, wire_schema: &str) -> bool {
        self.converter_for_wire_schema(wire_schema).is_ok()
    }

    fn has_converter_for_data_type(&self, data_type: &DataType) -> bool {
        self.converter_for_data_type(data_type).is_ok()
    }
}

/// Fail unless `actual` is the schema `converter` writes.
pub(crate) fn ensure_wire_schema(
    converter: &dyn Converter,
    actual: &str,
) -> Result<(), ConverterError> {
    if converter.wire_schema() == actual {
        Ok(())
    } else {
        Err(ConverterError::WireSchemaMismatch {
            expected: converter.wire_schema().to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Borrow the payload as `T` or report a type mismatch.
pub(crate) fn payload_as<'a, T: 'static>(
    converter: &dyn Converter,
    payload: &'a Payload,
) -> Result<&'a T, ConverterError> {
    payload
        .downcast_ref::<T>()
        .ok_or_else(|| ConverterError::PayloadType {
            expected: converter.data_type().to_string(),
            actual: payload.data_type().to_string(),
        })
}
