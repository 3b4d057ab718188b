//! # Transport Errors

use bus_converter::ConverterError;
use bus_types::EventId;
use thiserror::Error;

/// Errors from connectors, wire encoding and the transport registry.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConverterError),

    #[error("Failed to encode notification: {0}")]
    Encode(String),

    #[error("Failed to decode notification: {0}")]
    Decode(String),

    /// Only events with an assigned id can be sent.
    #[error("Event has no id")]
    MissingEventId,

    #[error("Event meta data needs {needed} bytes but fragments hold at most {max}")]
    MetaDataTooLarge { needed: usize, max: usize },

    #[error("Fragment {part} of event {event_id} is out of range (event has {total} parts)")]
    FragmentOutOfRange {
        event_id: EventId,
        part: u32,
        total: u32,
    },

    #[error("Duplicate fragment {part} of event {event_id}")]
    DuplicateFragment { event_id: EventId, part: u32 },

    #[error("First fragment of event {0} carries no meta data")]
    MissingHeader(EventId),

    #[error("Frame of {size} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Connector is not active")]
    NotActive,

    #[error("Connector has no scope")]
    NoScope,

    #[error("Connector scope cannot change while active")]
    ScopeLocked,

    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    #[error("Transport already registered: {0}")]
    DuplicateTransport(String),

    #[error("Invalid value {value:?} for transport option {key:?}: {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Group communication failure: {0}")]
    Group(String),

    #[error("Transport closed")]
    Closed,
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        TransportError::Decode(e.to_string())
    }
}
