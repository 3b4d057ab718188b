//! # Converter Maps
//!
//! Registries keyed by (wire schema, data type). [`ConverterMap`] tolerates
//! several data types sharing one wire schema; [`UnambiguousConverterMap`]
//! does not, which makes inbound wire schema resolution unique.
//!
//! Both are safe to share between threads: lookups take a read lock, and a
//! registration (including its conflict checks) happens under a single write
//! lock, so readers never observe a partial update.

use std::fmt;
use std::sync::Arc;

use bus_types::DataType;
use parking_lot::RwLock;
use tracing::debug;

use crate::converter::{Converter, ConverterSelection, WireType};
use crate::error::ConverterError;

#[derive(Debug, Clone)]
struct Entry {
    wire_schema: String,
    data_type: DataType,
    converter: Arc<dyn Converter>,
}

fn same_converter(a: &Arc<dyn Converter>, b: &Arc<dyn Converter>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

/// Converters for one wire type, keyed by (wire schema, data type).
///
/// Lookups scan in registration order, so when several entries match the
/// earliest registration wins.
pub struct ConverterMap {
    wire_type: WireType,
    entries: RwLock<Vec<Entry>>,
}

impl ConverterMap {
    #[must_use]
    pub fn new(wire_type: WireType) -> Self {
        Self {
            wire_type,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register `converter`.
    ///
    /// Fails with [`ConverterError::RegistrationConflict`] if a different
    /// converter already holds the same (wire schema, data type) key and
    /// `replace_existing` is false. Registering the same converter instance
    /// twice is a no-op.
    pub fn add_converter(
        &self,
        converter: Arc<dyn Converter>,
        replace_existing: bool,
    ) -> Result<(), ConverterError> {
        self.insert(converter, replace_existing, |_| Ok(()))
    }

    fn insert<F>(
        &self,
        converter: Arc<dyn Converter>,
        replace_existing: bool,
        check: F,
    ) -> Result<(), ConverterError>
    where
        F: FnOnce(&[Entry]) -> Result<(), ConverterError>,
    {
        if converter.wire_type() != self.wire_type {
            return Err(ConverterError::WireTypeMismatch {
                expected: self.wire_type,
                actual: converter.wire_type(),
            });
        }
        let wire_schema = converter.wire_schema().to_string();
        let data_type = converter.data_type();

        let mut entries = self.entries.write();
        check(&entries)?;

        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.wire_schema == wire_schema && e.data_type == data_type)
        {
            if same_converter(&existing.converter, &converter) {
                return Ok(());
            }
            if !replace_existing {
                return Err(ConverterError::RegistrationConflict {
                    wire_schema,
                    data_type: data_type.to_string(),
                });
            }
            debug!(wire_schema = %wire_schema, data_type = %data_type, "Replacing converter");
            existing.converter = converter;
            return Ok(());
        }

        debug!(wire_schema = %wire_schema, data_type = %data_type, "Registering converter");
        entries.push(Entry {
            wire_schema,
            data_type,
            converter,
        });
        Ok(())
    }

    /// Snapshot of all registered converters in registration order.
    #[must_use]
    pub fn converters(&self) -> Vec<Arc<dyn Converter>> {
        self.entries
            .read()
            .iter()
            .map(|e| Arc::clone(&e.converter))
            .collect()
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

impl Clone for ConverterMap {
    fn clone(&self) -> Self {
        Self {
            wire_type: self.wire_type,
            entries: RwLock::new(self.entries.read().clone()),
        }
    }
}

impl fmt::Debug for ConverterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        let mut list = f.debug_list();
        for entry in entries.iter() {
            list.entry(&format_args!("{} <-> {}", entry.wire_schema, entry.data_type));
        }
        list.finish()
    }
}

impl ConverterSelection for ConverterMap {
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
            .find(|e| e.wire_schema == wire_schema)
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
            .find(|e| &e.data_type == data_type)
            .map(|e| Arc::clone(&e.converter))
            .ok_or_else(|| ConverterError::NoConverterForDataType(data_type.to_string()))
    }
}

/// A [`ConverterMap`] in which every wire schema maps to exactly one data
/// type.
///
/// A registration that would let a second data type claim an already used
/// wire schema fails with [`ConverterError::AmbiguousWireSchema`], whether or
/// not replacement is requested. Replacement only swaps the converter of an
/// identical key.
#[derive(Clone)]
pub struct UnambiguousConverterMap {
    inner: ConverterMap,
}

impl UnambiguousConverterMap {
    #[must_use]
    pub fn new(wire_type: WireType) -> Self {
        Self {
            inner: ConverterMap::new(wire_type),
        }
    }

    pub fn add_converter(
        &self,
        converter: Arc<dyn Converter>,
        replace_existing: bool,
    ) -> Result<(), ConverterError> {
        let wire_schema = converter.wire_schema().to_string();
        let data_type = converter.data_type();
        self.inner.insert(converter, replace_existing, |entries| {
            match entries
                .iter()
                .find(|e| e.wire_schema == wire_schema && e.data_type != data_type)
            {
                Some(clash) => Err(ConverterError::AmbiguousWireSchema {
                    wire_schema: wire_schema.clone(),
                    data_type: data_type.to_string(),
                    existing: clash.data_type.to_string(),
                }),
                None => Ok(()),
            }
        })
    }

    #[must_use]
    pub fn converters(&self) -> Vec<Arc<dyn Converter>> {
        self.inner.converters()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for UnambiguousConverterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UnambiguousConverterMap")
            .field(&self.inner)
            .finish()
    }
}

impl ConverterSelection for UnambiguousConverterMap {
    fn wire_type(&self) -> WireType {
        self.inner.wire_type
    }

    fn converter_for_wire_schema(
        &self,
        wire_schema: &str,
    ) -> Result<Arc<dyn Converter>, ConverterError> {
        self.inner.converter_for_wire_schema(wire_schema)
    }

    fn converter_for_data_type(
        &self,
        data_type: &DataType,
    ) -> Result<Arc<dyn Converter>, ConverterError> {
        self.inner.converter_for_data_type(data_type)
    }
}
