//! # Wire Notifications
//!
//! The serialized form of an event on networked transports. A payload that
//! does not fit into one transport message is split into several
//! [`FragmentedNotification`]s; only the first fragment carries the event
//! meta data. Receivers put fragments back together with an
//! [`AssemblyPool`].

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bus_converter::ConverterSelection;
use bus_types::{Event, EventId, MetaData, Scope};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Most fragments one event may be split into. Receivers reject fragments
/// announcing more.
pub const MAX_FRAGMENTS: u32 = 65_536;

/// Everything about an event except its id and payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationHeader {
    pub scope: Scope,
    pub method: Option<String>,
    pub wire_schema: String,
    pub meta_data: MetaData,
    pub causes: Vec<EventId>,
}

/// An event (or a slice of its payload) as transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub event_id: EventId,
    /// Present on the first fragment only.
    pub header: Option<NotificationHeader>,
    pub data: Vec<u8>,
}

/// One transport message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentedNotification {
    pub notification: Notification,
    pub data_part: u32,
    pub num_data_parts: u32,
}

impl FragmentedNotification {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serialize(self).map_err(|e| TransportError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

fn encoded_size(fragment: &FragmentedNotification) -> Result<usize, TransportError> {
    bincode::serialized_size(fragment)
        .map(|size| size as usize)
        .map_err(|e| TransportError::Encode(e.to_string()))
}

/// Split an event with already serialized payload `wire` into fragments of
/// at most `max_fragment_size` encoded bytes.
///
/// Fails with [`TransportError::MetaDataTooLarge`] if the meta data alone
/// leaves no room for payload in the first fragment.
pub fn event_to_fragments(
    event: &Event,
    wire: &[u8],
    wire_schema: &str,
    max_fragment_size: usize,
) -> Result<Vec<FragmentedNotification>, TransportError> {
    let event_id = event.id.ok_or(TransportError::MissingEventId)?;
    let header = NotificationHeader {
        scope: event.scope.clone(),
        method: event.method.clone(),
        wire_schema: wire_schema.to_string(),
        meta_data: event.meta_data.clone(),
        causes: event.causes.clone(),
    };

    let mut first = FragmentedNotification {
        notification: Notification {
            event_id,
            header: Some(header),
            data: Vec::new(),
        },
        data_part: 0,
        num_data_parts: 1,
    };
    let first_overhead = encoded_size(&first)?;
    if first_overhead >= max_fragment_size {
        return Err(TransportError::MetaDataTooLarge {
            needed: first_overhead + 1,
            max: max_fragment_size,
        });
    }
    let first_room = max_fragment_size - first_overhead;

    let rest_template = FragmentedNotification {
        notification: Notification {
            event_id,
            header: None,
            data: Vec::new(),
        },
        data_part: 0,
        num_data_parts: 1,
    };
    let rest_room = max_fragment_size - encoded_size(&rest_template)?;

    let split = first_room.min(wire.len());
    first.notification.data = wire[..split].to_vec();
    let mut fragments = vec![first];
    for (index, chunk) in wire[split..].chunks(rest_room).enumerate() {
        let mut fragment = rest_template.clone();
        fragment.notification.data = chunk.to_vec();
        fragment.data_part = (index + 1) as u32;
        fragments.push(fragment);
    }

    let total = u32::try_from(fragments.len())
        .ok()
        .filter(|total| *total <= MAX_FRAGMENTS)
        .ok_or_else(|| {
            TransportError::Encode(format!(
                "event needs {} fragments, at most {MAX_FRAGMENTS} are allowed",
                fragments.len()
            ))
        })?;
    for fragment in &mut fragments {
        fragment.num_data_parts = total;
    }
    Ok(fragments)
}

/// Serialize the payload of `event` with the converter `converters` select
/// for its data type, then fragment it.
pub fn encode_event(
    event: &Event,
    converters: &dyn ConverterSelection,
    max_fragment_size: usize,
) -> Result<Vec<FragmentedNotification>, TransportError> {
    let converter = converters.converter_for_data_type(event.data_type())?;
    let wire = converter.serialize(&event.payload)?;
    event_to_fragments(event, &wire, converter.wire_schema(), max_fragment_size)
}

/// Rebuild an event from a complete notification. Sets the receive time.
pub fn notification_to_event(
    notification: Notification,
    converters: &dyn ConverterSelection,
) -> Result<Event, TransportError> {
    let event_id = notification.event_id;
    let header = notification
        .header
        .ok_or(TransportError::MissingHeader(event_id))?;
    let converter = converters.converter_for_wire_schema(&header.wire_schema)?;
    let payload = converter.deserialize(&notification.data, &header.wire_schema)?;

    let mut event = Event::new(header.scope, payload);
    event.id = Some(event_id);
    event.method = header.method;
    event.meta_data = header.meta_data;
    event.causes = header.causes;
    event.meta_data.set_receive_time();
    Ok(event)
}

#[derive(Debug)]
struct Assembly {
    header: Option<NotificationHeader>,
    total: u32,
    parts: BTreeMap<u32, Vec<u8>>,
    started: Instant,
}

/// Reassembles fragments of interleaved events, keyed by event id.
#[derive(Debug, Default)]
pub struct AssemblyPool {
    assemblies: HashMap<EventId, Assembly>,
}

impl AssemblyPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment. Returns the complete notification once all parts of
    /// its event have arrived.
    pub fn add(
        &mut self,
        fragment: FragmentedNotification,
    ) -> Result<Option<Notification>, TransportError> {
        let event_id = fragment.notification.event_id;
        let total = fragment.num_data_parts.max(1);
        let part = fragment.data_part;
        if part >= total || total > MAX_FRAGMENTS {
            return Err(TransportError::FragmentOutOfRange {
                event_id,
                part,
                total,
            });
        }
        if total == 1 {
            return Ok(Some(fragment.notification));
        }

        let assembly = self.assemblies.entry(event_id).or_insert_with(|| Assembly {
            header: None,
            total,
            parts: BTreeMap::new(),
            started: Instant::now(),
        });
        if assembly.total != total {
            return Err(TransportError::FragmentOutOfRange {
                event_id,
                part,
                total: assembly.total,
            });
        }
        if assembly.parts.contains_key(&part) {
            return Err(TransportError::DuplicateFragment { event_id, part });
        }
        assembly.parts.insert(part, fragment.notification.data);
        if part == 0 {
            assembly.header = fragment.notification.header;
        }
        if assembly.parts.len() < total as usize {
            return Ok(None);
        }

        let Some(assembly) = self.assemblies.remove(&event_id) else {
            return Ok(None);
        };
        let header = assembly
            .header
            .ok_or(TransportError::MissingHeader(event_id))?;
        let data = assembly.parts.into_values().flatten().collect();
        Ok(Some(Notification {
            event_id,
            header: Some(header),
            data,
        }))
    }

    /// Number of incomplete events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assemblies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }

    /// Discard incomplete events older than `max_age`. Returns how many
    /// were discarded.
    pub fn prune(&mut self, max_age: Duration) -> usize {
        let before = self.assemblies.len();
        self.assemblies
            .retain(|_, assembly| assembly.started.elapsed() < max_age);
        before - self.assemblies.len()
    }
}
