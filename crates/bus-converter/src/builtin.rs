//! # Built-in Converters
//!
//! Byte converters for unit, booleans, fixed-width numbers, raw bytes, text
//! and scopes. Numbers are encoded little-endian at their natural width.

use std::fmt;
use std::sync::Arc;

use bus_types::{DataType, Payload, Scope};

use crate::converter::{ensure_wire_schema, payload_as, Converter, WireType};
use crate::error::ConverterError;
use crate::map::ConverterMap;

/// Converter for payloads without data (`()`), wire schema `void`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneConverter;

impl Converter for NoneConverter {
    fn data_type(&self) -> DataType {
        DataType::of::<()>()
    }

    fn wire_schema(&self) -> &str {
        "void"
    }

    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, ConverterError> {
        payload_as::<()>(self, payload)?;
        Ok(Vec::new())
    }

    fn deserialize(&self, _wire: &[u8], wire_schema: &str) -> Result<Payload, ConverterError> {
        ensure_wire_schema(self, wire_schema)?;
        Ok(Payload::empty())
    }
}

macro_rules! fixed_width_converter {
    ($(#[$meta:meta])* $name:ident, $ty:ty, $schema:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Converter for $name {
            fn data_type(&self) -> DataType {
                DataType::of::<$ty>()
            }

            fn wire_schema(&self) -> &str {
                $schema
            }

            fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, ConverterError> {
                let value = payload_as::<$ty>(self, payload)?;
                Ok(value.to_le_bytes().to_vec())
            }

            fn deserialize(
                &self,
                wire: &[u8],
                wire_schema: &str,
            ) -> Result<Payload, ConverterError> {
                ensure_wire_schema(self, wire_schema)?;
                let bytes: [u8; std::mem::size_of::<$ty>()] =
                    wire.try_into().map_err(|_| ConverterError::Decode {
                        wire_schema: $schema.to_string(),
                        reason: format!(
                            "expected {} bytes, got {}",
                            std::mem::size_of::<$ty>(),
                            wire.len()
                        ),
                    })?;
                Ok(Payload::new(<$ty>::from_le_bytes(bytes)))
            }
        }
    };
}

fixed_width_converter!(
    /// `f64` as 8 bytes, wire schema `double`.
    DoubleConverter, f64, "double"
);
fixed_width_converter!(
    /// `f32` as 4 bytes, wire schema `float`.
    FloatConverter, f32, "float"
);
fixed_width_converter!(Int32Converter, i32, "int32");
fixed_width_converter!(Int64Converter, i64, "int64");
fixed_width_converter!(Uint32Converter, u32, "uint32");
fixed_width_converter!(Uint64Converter, u64, "uint64");

/// `bool` as a single byte, wire schema `bool`. Any non-zero byte decodes as
/// `true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoolConverter;

impl Converter for BoolConverter {
    fn data_type(&self) -> DataType {
        DataType::of::<bool>()
    }

    fn wire_schema(&self) -> &str {
        "bool"
    }

    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, ConverterError> {
        let value = payload_as::<bool>(self, payload)?;
        Ok(vec![u8::from(*value)])
    }

    fn deserialize(&self, wire: &[u8], wire_schema: &str) -> Result<Payload, ConverterError> {
        ensure_wire_schema(self, wire_schema)?;
        match wire {
            [byte] => Ok(Payload::new(*byte != 0)),
            _ => Err(ConverterError::Decode {
                wire_schema: wire_schema.to_string(),
                reason: format!("expected 1 byte, got {}", wire.len()),
            }),
        }
    }
}

/// Passes `Vec<u8>` payloads through unchanged.
///
/// The wire schema and data type label are configurable so that opaque
/// message types can be carried without a dedicated converter.
#[derive(Debug, Clone)]
pub struct BytesConverter {
    wire_schema: String,
    data_type: DataType,
}

impl BytesConverter {
    #[must_use]
    pub fn new(wire_schema: impl Into<String>, data_type: DataType) -> Self {
        Self {
            wire_schema: wire_schema.into(),
            data_type,
        }
    }
}

impl Default for BytesConverter {
    fn default() -> Self {
        Self::new("bytes", DataType::of::<Vec<u8>>())
    }
}

impl Converter for BytesConverter {
    fn data_type(&self) -> DataType {
        self.data_type.clone()
    }

    fn wire_schema(&self) -> &str {
        &self.wire_schema
    }

    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, ConverterError> {
        payload_as::<Vec<u8>>(self, payload).cloned()
    }

    fn deserialize(&self, wire: &[u8], wire_schema: &str) -> Result<Payload, ConverterError> {
        ensure_wire_schema(self, wire_schema)?;
        Ok(Payload::with_data_type(self.data_type.clone(), wire.to_vec()))
    }
}

/// Text encodings supported by [`StringConverter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Utf8,
    Ascii,
    /// ISO-8859-1: every code point below U+0100 as one byte.
    Latin1,
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextEncoding::Utf8 => write!(f, "utf-8"),
            TextEncoding::Ascii => write!(f, "ascii"),
            TextEncoding::Latin1 => write!(f, "iso-8859-1"),
        }
    }
}

/// Converts `String` payloads to bytes in a fixed text encoding.
///
/// Encoding never substitutes replacement characters: text the encoding
/// cannot represent, and bytes that are not valid in it, are errors.
#[derive(Debug, Clone)]
pub struct StringConverter {
    wire_schema: String,
    encoding: TextEncoding,
}

impl StringConverter {
    #[must_use]
    pub fn new(wire_schema: impl Into<String>, encoding: TextEncoding) -> Self {
        Self {
            wire_schema: wire_schema.into(),
            encoding,
        }
    }

    /// The `ascii-string` converter.
    #[must_use]
    pub fn ascii() -> Self {
        Self::new("ascii-string", TextEncoding::Ascii)
    }

    #[must_use]
    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    fn encode_error(&self, reason: String) -> ConverterError {
        ConverterError::Encode {
            wire_schema: self.wire_schema.clone(),
            reason,
        }
    }

    fn decode_error(&self, reason: String) -> ConverterError {
        ConverterError::Decode {
            wire_schema: self.wire_schema.clone(),
            reason,
        }
    }

    fn encode_narrow(&self, text: &str, limit: u32) -> Result<Vec<u8>, ConverterError> {
        text.chars()
            .enumerate()
            .map(|(position, c)| {
                u8::try_from(u32::from(c))
                    .ok()
                    .filter(|b| u32::from(*b) < limit)
                    .ok_or_else(|| {
                        self.encode_error(format!(
                            "{} codec cannot encode character {:?} at position {}",
                            self.encoding, c, position
                        ))
                    })
            })
            .collect()
    }
}

impl Default for StringConverter {
    fn default() -> Self {
        Self::new("utf-8-string", TextEncoding::Utf8)
    }
}

impl Converter for StringConverter {
    fn data_type(&self) -> DataType {
        DataType::of::<String>()
    }

    fn wire_schema(&self) -> &str {
        &self.wire_schema
    }

    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, ConverterError> {
        let text = payload_as::<String>(self, payload)?;
        match self.encoding {
            TextEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            TextEncoding::Ascii => self.encode_narrow(text, 0x80),
            TextEncoding::Latin1 => self.encode_narrow(text, 0x100),
        }
    }

    fn deserialize(&self, wire: &[u8], wire_schema: &str) -> Result<Payload, ConverterError> {
        ensure_wire_schema(self, wire_schema)?;
        let text = match self.encoding {
            TextEncoding::Utf8 => String::from_utf8(wire.to_vec())
                .map_err(|e| self.decode_error(format!("invalid utf-8: {e}")))?,
            TextEncoding::Ascii => {
                if let Some(position) = wire.iter().position(|b| !b.is_ascii()) {
                    return Err(self.decode_error(format!(
                        "ascii codec cannot decode byte 0x{:02x} at position {}",
                        wire[position], position
                    )));
                }
                wire.iter().map(|b| char::from(*b)).collect()
            }
            TextEncoding::Latin1 => wire.iter().map(|b| char::from(*b)).collect(),
        };
        Ok(Payload::new(text))
    }
}

/// Converts [`Scope`] payloads to their ASCII string form, wire schema
/// `scope`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeConverter;

impl Converter for ScopeConverter {
    fn data_type(&self) -> DataType {
        DataType::of::<Scope>()
    }

    fn wire_schema(&self) -> &str {
        "scope"
    }

    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, ConverterError> {
        Ok(payload_as::<Scope>(self, payload)?.to_bytes())
    }

    fn deserialize(&self, wire: &[u8], wire_schema: &str) -> Result<Payload, ConverterError> {
        ensure_wire_schema(self, wire_schema)?;
        let decode_error = |reason: String| ConverterError::Decode {
            wire_schema: wire_schema.to_string(),
            reason,
        };
        let text = std::str::from_utf8(wire).map_err(|e| decode_error(e.to_string()))?;
        let scope = Scope::new(text).map_err(|e| decode_error(e.to_string()))?;
        Ok(Payload::new(scope))
    }
}

/// A fresh byte converter map holding the default converter set: `void`,
/// `double`, `int64`, `bool`, `bytes`, `utf-8-string` and `scope`.
///
/// `float`, the 32-bit integers and `uint64` are left out so that the
/// default numeric types stay unambiguous; register them explicitly when
/// needed.
pub fn default_converter_map() -> Result<ConverterMap, ConverterError> {
    let map = ConverterMap::new(WireType::Bytes);
    let defaults: [Arc<dyn Converter>; 7] = [
        Arc::new(NoneConverter),
        Arc::new(DoubleConverter),
        Arc::new(Int64Converter),
        Arc::new(BoolConverter),
        Arc::new(BytesConverter::default()),
        Arc::new(StringConverter::default()),
        Arc::new(ScopeConverter),
    ];
    for converter in defaults {
        map.add_converter(converter, false)?;
    }
    Ok(map)
}
