//! # Payloads
//!
//! Opaque event data together with its declared data type tag.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Declared data type of a payload.
///
/// Converters are selected by this tag. For Rust values it defaults to the
/// fully qualified type name, but any label may be used (e.g. to mark a
/// byte buffer as a specific message type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataType(Cow<'static, str>);

impl DataType {
    /// Tag for values of type `T`.
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self(Cow::Borrowed(std::any::type_name::<T>()))
    }

    /// Tag with an explicit name.
    #[must_use]
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    /// Name of the tag.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable, cheaply clonable event data.
///
/// The value is shared behind an `Arc`, so concurrent listeners read the
/// same payload without synchronization.
#[derive(Clone)]
pub struct Payload {
    data_type: DataType,
    value: Arc<dyn Any + Send + Sync>,
}

impl Payload {
    /// Wrap `value`, tagging it with its Rust type.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            data_type: DataType::of::<T>(),
            value: Arc::new(value),
        }
    }

    /// Wrap `value` under an explicit data type tag.
    pub fn with_data_type<T: Any + Send + Sync>(data_type: DataType, value: T) -> Self {
        Self {
            data_type,
            value: Arc::new(value),
        }
    }

    /// The unit payload used by events without data.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(())
    }

    /// Declared data type.
    #[must_use]
    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    /// Borrow the value as `T` if it has that concrete type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Whether the value has concrete type `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Whether both payloads share the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Payload) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("data_type", &self.data_type)
            .finish_non_exhaustive()
    }
}
