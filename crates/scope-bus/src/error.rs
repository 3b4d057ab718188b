//! # Error Types
//!
//! Errors surfaced by participants, the bus facade and request/reply.
//!
//! Registry, conversion and send-side transport failures are returned
//! synchronously to the caller that triggered them. Handler failures never
//! reach the publisher; they are reported as
//! [`HandlerErrorReport`](crate::HandlerErrorReport)s instead.

use std::time::Duration;

use bus_converter::ConverterError;
use bus_transport::TransportError;
use bus_types::{DataType, Scope, ScopeError};
use thiserror::Error;

/// Errors from participants and the bus facade.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Invalid scope: {0}")]
    Scope(#[from] ScopeError),

    #[error("Conversion failed: {0}")]
    Converter(#[from] ConverterError),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Remote call failed: {0}")]
    Future(#[from] FutureError),

    /// The event is not on the participant's scope or one of its sub-scopes.
    #[error("Event scope {event} is outside participant scope {participant}")]
    ScopeMismatch { event: Scope, participant: Scope },

    /// The payload type does not match the informer's declared data type.
    #[error("Event data type {actual} does not match informer data type {expected}")]
    DataTypeMismatch { expected: DataType, actual: DataType },

    /// The reply payload could not be read as the requested type.
    #[error("Reply has data type {actual}, expected {expected}")]
    ReplyType { expected: DataType, actual: DataType },

    #[error("No transport is enabled")]
    NoTransports,

    #[error("Method {0:?} is already registered")]
    DuplicateMethod(String),

    /// The participant was deactivated.
    #[error("Participant closed")]
    Closed,
}

/// Terminal failure states of an [`RpcFuture`](crate::RpcFuture).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FutureError {
    /// No reply arrived in time.
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// The caller gave up on the request.
    #[error("Future cancelled")]
    Cancelled,

    /// The remote method failed; carries its error text.
    #[error("Remote method failed: {0}")]
    Remote(String),
}

/// Errors from building a participant configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Empty value for option {0:?}")]
    EmptyValue(String),

    #[error("Invalid value {value:?} for option {key:?}")]
    InvalidValue { key: String, value: String },

    /// The key lacks a transport name or option name.
    #[error("Malformed option key {0:?}")]
    MalformedKey(String),
}
