//! # Events
//!
//! The envelope for one published message: scope, payload, identity, method
//! and causal metadata.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::payload::{DataType, Payload};
use crate::scope::Scope;

/// Microseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time in microseconds.
#[must_use]
pub fn current_timestamp() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Unique identity of an event: the sending participant plus a sequence
/// number local to that participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    /// Id of the participant that published the event.
    pub participant_id: Uuid,
    /// Sequence number within that participant.
    pub sequence_number: u64,
}

impl EventId {
    /// Create a new event id.
    #[must_use]
    pub fn new(participant_id: Uuid, sequence_number: u64) -> Self {
        Self {
            participant_id,
            sequence_number,
        }
    }

    /// Project the id onto a single UUID (name-based, v5).
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        let name = format!("{:08x}", self.sequence_number);
        Uuid::new_v5(&self.participant_id, name.as_bytes())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}", self.participant_id, self.sequence_number)
    }
}

/// Framework timestamps and user supplied metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetaData {
    /// When the event was created.
    pub create_time: Timestamp,
    /// When the event was handed to a connector.
    pub send_time: Option<Timestamp>,
    /// When a connector received the event.
    pub receive_time: Option<Timestamp>,
    /// When the event was delivered to user handlers.
    pub deliver_time: Option<Timestamp>,
    /// User supplied timestamps.
    pub user_times: BTreeMap<String, Timestamp>,
    /// User supplied key/value pairs.
    pub user_infos: BTreeMap<String, String>,
}

impl MetaData {
    /// Metadata with the create time set to now.
    #[must_use]
    pub fn now() -> Self {
        Self {
            create_time: current_timestamp(),
            ..Self::default()
        }
    }

    pub fn set_send_time(&mut self) {
        self.send_time = Some(current_timestamp().max(self.create_time));
    }

    pub fn set_receive_time(&mut self) {
        let floor = self.send_time.unwrap_or(self.create_time);
        self.receive_time = Some(current_timestamp().max(floor));
    }

    pub fn set_deliver_time(&mut self) {
        let floor = self
            .receive_time
            .or(self.send_time)
            .unwrap_or(self.create_time);
        self.deliver_time = Some(current_timestamp().max(floor));
    }

    pub fn set_user_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.user_infos.insert(key.into(), value.into());
    }

    pub fn set_user_time(&mut self, key: impl Into<String>, timestamp: Timestamp) {
        self.user_times.insert(key.into(), timestamp);
    }
}

/// A message on the bus.
#[derive(Debug, Clone)]
pub struct Event {
    /// Identity; assigned by the publishing participant.
    pub id: Option<EventId>,
    /// Channel the event is published on.
    pub scope: Scope,
    /// Role of the event in a communication pattern, e.g. `REQUEST`.
    pub method: Option<String>,
    /// The data carried by the event.
    pub payload: Payload,
    /// Timestamps and user metadata.
    pub meta_data: MetaData,
    /// Ids of the events that directly caused this one.
    pub causes: Vec<EventId>,
}

impl Event {
    /// Create an event without id on `scope` carrying `payload`.
    #[must_use]
    pub fn new(scope: Scope, payload: Payload) -> Self {
        Self {
            id: None,
            scope,
            method: None,
            payload,
            meta_data: MetaData::now(),
            causes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: EventId) -> Self {
        self.add_cause(cause);
        self
    }

    #[must_use]
    pub fn with_user_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta_data.set_user_info(key, value);
        self
    }

    /// Declared data type of the payload.
    #[must_use]
    pub fn data_type(&self) -> &DataType {
        self.payload.data_type()
    }

    /// Sequence number of the event id, if assigned.
    #[must_use]
    pub fn sequence_number(&self) -> Option<u64> {
        self.id.map(|id| id.sequence_number)
    }

    /// Id of the sending participant, if assigned.
    #[must_use]
    pub fn sender_id(&self) -> Option<Uuid> {
        self.id.map(|id| id.participant_id)
    }

    /// The primary cause, used for reply correlation.
    #[must_use]
    pub fn cause_id(&self) -> Option<EventId> {
        self.causes.first().copied()
    }

    /// Add a cause; returns false if it was already present.
    pub fn add_cause(&mut self, cause: EventId) -> bool {
        if self.causes.contains(&cause) {
            return false;
        }
        self.causes.push(cause);
        true
    }

    /// Remove a cause; returns false if it was not present.
    pub fn remove_cause(&mut self, cause: &EventId) -> bool {
        let before = self.causes.len();
        self.causes.retain(|c| c != cause);
        before != self.causes.len()
    }

    #[must_use]
    pub fn is_caused_by(&self, cause: &EventId) -> bool {
        self.causes.contains(cause)
    }

    /// Whether the event's method equals `method`.
    #[must_use]
    pub fn has_method(&self, method: &str) -> bool {
        self.method.as_deref() == Some(method)
    }
}
