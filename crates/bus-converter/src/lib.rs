//! # Bus Converter - Converter Registry
//!
//! Resolves which codec turns an in-memory payload into its wire
//! representation and back.
//!
//! ## Selection Strategies
//!
//! | Strategy | Key | Duplicate wire schema | Lookup order |
//! |----------|-----|-----------------------|--------------|
//! | [`ConverterMap`] | (wire schema, data type) | allowed | first registered |
//! | [`UnambiguousConverterMap`] | (wire schema, data type) | rejected | first registered |
//! | [`PredicateConverterList`] | predicates | allowed | last registered |
//!
//! Every lookup failure is an error; there is no implicit default converter.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod builtin;
pub mod converter;
pub mod error;
pub mod map;
pub mod predicate;

pub use builtin::{
    default_converter_map, BoolConverter, BytesConverter, DoubleConverter, FloatConverter,
    Int32Converter, Int64Converter, NoneConverter, ScopeConverter, StringConverter, TextEncoding,
    Uint32Converter, Uint64Converter,
};
pub use converter::{Converter, ConverterSelection, WireType};
pub use error::ConverterError;
pub use map::{ConverterMap, UnambiguousConverterMap};
pub use predicate::{Predicate, PredicateConverterList};
