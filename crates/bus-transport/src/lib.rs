//! # Bus Transport - Connectors
//!
//! Moves events between participants. Every transport provides the same
//! connector pair, so the event pipeline does not care which one carries
//! its events.
//!
//! ## Transports
//!
//! | Name | Remote | Wire type | Notes |
//! |------|--------|-----------|-------|
//! | `inprocess` | no | native | payloads are shared, never serialized |
//! | `socket` | yes | bytes | TCP bus server with relaying clients |
//! | `group` | yes | bytes | pluggable group communication backend |
//!
//! ## Wire Path
//!
//! ```text
//!   Event ──Converter──► bytes ──fragment──► FragmentedNotification ──► transport
//!   transport ──► AssemblyPool ──► Notification ──Converter──► Event ──► EventSink
//! ```

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod connector;
pub mod error;
pub mod factory;
pub mod group;
pub mod inprocess;
pub mod notification;
mod sinks;
pub mod socket;

pub use connector::{
    Connector, DeliveryOrdering, EventSink, InConnector, OutConnector, QualityOfServiceSpec,
    Reliability, ScopePruner,
};
pub use error::TransportError;
pub use factory::{TransportFactory, TransportOptions, TransportRegistry};
pub use group::{
    group_name, GroupCommunication, GroupConnection, GroupFactory, GroupMessage, GroupSession,
    InMemoryGroupHub, ServiceType,
};
pub use inprocess::{InProcessBus, InProcessFactory};
pub use notification::{
    encode_event, event_to_fragments, notification_to_event, AssemblyPool,
    FragmentedNotification, Notification, NotificationHeader, MAX_FRAGMENTS,
};
pub use socket::{ServerMode, SocketFactory, SocketOptions};
