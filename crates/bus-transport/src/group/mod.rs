//! # Group Communication Transport
//!
//! Carries events over a group communication system: processes join named
//! groups and multicast messages to sets of groups. The system itself is an
//! external collaborator behind the [`GroupCommunication`] trait;
//! [`InMemoryGroupHub`] is a process-local implementation.
//!
//! ## Group Names
//!
//! Each scope maps to one group, named by the first
//! [`GROUP_NAME_LENGTH`] hex digits of the SHA-256 of the scope string.
//! An in-connector joins the group of its scope. An out-connector sends each
//! event to the groups of the event scope and all of its super scopes, so
//! listeners on any enclosing scope receive it:
//!
//! ```text
//!   event on /a/b/  ──►  group(/), group(/a/), group(/a/b/)
//! ```
//!
//! Messages are at most [`MAX_MESSAGE_SIZE`] bytes; larger events are
//! fragmented.

mod bus;
mod connector;
mod hub;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bus_converter::{ConverterSelection, WireType};
use bus_types::Scope;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::connector::{
    DeliveryOrdering, InConnector, OutConnector, QualityOfServiceSpec, Reliability,
};
use crate::error::TransportError;
use crate::factory::{TransportFactory, TransportOptions};

pub use bus::GroupBus;
pub use connector::{GroupInConnector, GroupOutConnector};
pub use hub::InMemoryGroupHub;

pub const TRANSPORT_NAME: &str = "group";

/// Largest message handed to the group communication system.
pub const MAX_MESSAGE_SIZE: usize = 100_000;

/// Length of generated group names.
pub const GROUP_NAME_LENGTH: usize = 31;

/// Delivery guarantee requested for a multicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Unreliable,
    Reliable,
    /// Reliable, and messages of one sender arrive in send order.
    Fifo,
}

impl From<QualityOfServiceSpec> for ServiceType {
    fn from(qos: QualityOfServiceSpec) -> Self {
        match (qos.ordering, qos.reliability) {
            (DeliveryOrdering::Ordered, _) => ServiceType::Fifo,
            (DeliveryOrdering::Unordered, Reliability::Unreliable) => ServiceType::Unreliable,
            (DeliveryOrdering::Unordered, Reliability::Reliable) => ServiceType::Reliable,
        }
    }
}

/// A message received from the group communication system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    /// Groups the message was sent to.
    pub groups: Vec<String>,
    pub service: ServiceType,
    pub payload: Vec<u8>,
}

/// An open connection: the session plus its stream of received messages.
///
/// A message multicast to several groups is received once, even if the
/// session is a member of more than one of them. Sessions receive their
/// own messages.
#[derive(Debug)]
pub struct GroupConnection {
    pub session: Arc<dyn GroupSession>,
    pub messages: mpsc::UnboundedReceiver<GroupMessage>,
}

/// Connects to a group communication system.
#[async_trait]
pub trait GroupCommunication: Send + Sync + fmt::Debug {
    /// Short identifier used in transport URLs.
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<GroupConnection, TransportError>;
}

/// One member of the group communication system.
#[async_trait]
pub trait GroupSession: Send + Sync + fmt::Debug {
    async fn join(&self, group: &str) -> Result<(), TransportError>;

    async fn leave(&self, group: &str) -> Result<(), TransportError>;

    async fn multicast(
        &self,
        groups: &[String],
        service: ServiceType,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Leave all groups and end the message stream.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Group name for `scope`.
#[must_use]
pub fn group_name(scope: &Scope) -> String {
    let digest = Sha256::digest(scope.to_string().as_bytes());
    let mut name = hex::encode(digest);
    name.truncate(GROUP_NAME_LENGTH);
    name
}

/// Groups an event on `scope` is sent to, root first.
#[must_use]
pub fn groups_for(scope: &Scope) -> Vec<String> {
    scope.super_scopes(true).iter().map(group_name).collect()
}

/// Factory for the `group` transport.
///
/// All connectors of a factory share one [`GroupBus`], opened when the first
/// connector activates and closed when the last one deactivates.
#[derive(Debug)]
pub struct GroupFactory {
    bus: Arc<bus::SharedGroupBus>,
}

impl GroupFactory {
    #[must_use]
    pub fn new(backend: Arc<dyn GroupCommunication>) -> Self {
        Self {
            bus: Arc::new(bus::SharedGroupBus::new(backend)),
        }
    }

    /// Whether the shared bus is currently open.
    pub async fn is_connected(&self) -> bool {
        self.bus.is_open().await
    }
}

impl TransportFactory for GroupFactory {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn wire_type(&self) -> WireType {
        WireType::Bytes
    }

    fn create_in_connector(
        &self,
        converters: Arc<dyn ConverterSelection>,
        _options: &TransportOptions,
    ) -> Result<Arc<dyn InConnector>, TransportError> {
        Ok(Arc::new(GroupInConnector::new(
            Arc::clone(&self.bus),
            converters,
        )?))
    }

    fn create_out_connector(
        &self,
        converters: Arc<dyn ConverterSelection>,
        _options: &TransportOptions,
    ) -> Result<Arc<dyn OutConnector>, TransportError> {
        Ok(Arc::new(GroupOutConnector::new(
            Arc::clone(&self.bus),
            converters,
        )?))
    }
}
