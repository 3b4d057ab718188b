//! # Bus Types - Core Values of the Scope Bus
//!
//! Scopes, events and filters shared by every other crate of the bus.
//!
//! ## Overview
//!
//! ```text
//!   Scope ──┐
//!   Payload ├──► Event ──► FilterChain::matches(&Event)
//!   EventId ┘
//! ```
//!
//! Nothing in this crate performs I/O or locking; every value is either
//! immutable or owned by a single caller.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod errors;
pub mod event;
pub mod filter;
pub mod payload;
pub mod scope;

pub use errors::ScopeError;
pub use event::{current_timestamp, Event, EventId, MetaData, Timestamp};
pub use filter::{
    CauseFilter, EventFilter, FalseFilter, FilterAction, FilterChain, MethodFilter, OriginFilter,
    PredicateFilter, ScopeFilter, TrueFilter,
};
pub use payload::{DataType, Payload};
pub use scope::Scope;
