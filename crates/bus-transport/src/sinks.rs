//! Local dispatch of received notifications for networked transports.
//!
//! Every in-connector attached to a socket or group bus registers a
//! [`ConvertingSink`]. A complete notification is decoded once per sink
//! whose scope contains the event scope, with that sink's own converters.

use std::collections::HashMap;
use std::sync::Arc;

use bus_converter::ConverterSelection;
use bus_types::Scope;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::connector::{Observer, ScopePruner};
use crate::notification::{notification_to_event, Notification};

#[derive(Debug, Clone)]
pub(crate) struct ConvertingSink {
    pub(crate) scope: Scope,
    pub(crate) observer: Arc<Observer>,
    pub(crate) pruner: Arc<ScopePruner>,
    pub(crate) converters: Arc<dyn ConverterSelection>,
}

#[derive(Debug, Default)]
pub(crate) struct SinkTable {
    sinks: RwLock<HashMap<u64, ConvertingSink>>,
}

impl SinkTable {
    pub(crate) fn insert(&self, id: u64, sink: ConvertingSink) {
        debug!(scope = %sink.scope, connector = id, "Adding sink");
        self.sinks.write().insert(id, sink);
    }

    pub(crate) fn remove(&self, id: u64) -> Option<ConvertingSink> {
        self.sinks.write().remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.sinks.read().len()
    }

    /// Convert and push `notification` to every matching sink. Returns the
    /// number of sinks that accepted the event.
    pub(crate) fn deliver(&self, notification: &Notification) -> usize {
        let Some(scope) = notification.header.as_ref().map(|h| h.scope.clone()) else {
            bus_telemetry::frame_dropped("assembly");
            return 0;
        };
        let targets: Vec<ConvertingSink> = self
            .sinks
            .read()
            .values()
            .filter(|sink| sink.scope.contains(&scope))
            .cloned()
            .collect();

        let mut delivered = 0;
        for sink in targets {
            if !sink.pruner.admits(&scope) {
                bus_telemetry::frame_dropped("filtered");
                continue;
            }
            match notification_to_event(notification.clone(), sink.converters.as_ref()) {
                Ok(event) => {
                    if sink.observer.push(event) {
                        delivered += 1;
                    }
                }
                Err(e) => {
                    warn!(scope = %scope, error = %e, "Cannot convert received event");
                    bus_telemetry::frame_dropped("conversion");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::event_to_fragments;
    use bus_converter::{default_converter_map, ConverterMap, WireType};
    use bus_types::{Event, EventId, Payload};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn scope(s: &str) -> Scope {
        Scope::new(s).unwrap()
    }

    fn notification(on: &str, wire_schema: &str, data: &[u8]) -> Notification {
        let mut event = Event::new(scope(on), Payload::empty());
        event.id = Some(EventId::new(Uuid::nil(), 1));
        event_to_fragments(&event, data, wire_schema, 10_000)
            .unwrap()
            .remove(0)
            .notification
    }

    fn sink(
        on: &str,
        converters: Arc<dyn ConverterSelection>,
    ) -> (ConvertingSink, mpsc::UnboundedReceiver<bus_types::Event>) {
        let observer = Arc::new(Observer::default());
        let (tx, rx) = mpsc::unbounded_channel();
        observer.set(Some(tx));
        let sink = ConvertingSink {
            scope: scope(on),
            observer,
            pruner: Arc::new(ScopePruner::new()),
            converters,
        };
        (sink, rx)
    }

    #[test]
    fn test_each_sink_uses_its_own_converters() {
        let table = SinkTable::default();
        let (with, mut rx_with) = sink("/a", Arc::new(default_converter_map().unwrap()));
        let (without, mut rx_without) = sink("/a", Arc::new(ConverterMap::new(WireType::Bytes)));
        table.insert(1, with);
        table.insert(2, without);

        assert_eq!(table.deliver(&notification("/a/b", "utf-8-string", b"hi")), 1);
        let event = rx_with.try_recv().unwrap();
        assert_eq!(event.payload.downcast_ref::<String>().unwrap(), "hi");
        assert!(rx_without.try_recv().is_err());
    }

    #[test]
    fn test_scope_matching_and_removal() {
        let table = SinkTable::default();
        let (other, mut rx) = sink("/other", Arc::new(default_converter_map().unwrap()));
        table.insert(7, other);
        assert_eq!(table.deliver(&notification("/a", "void", b"")), 0);
        assert!(rx.try_recv().is_err());

        assert!(table.remove(7).is_some());
        assert_eq!(table.len(), 0);
    }
}
