//! # Transport Factories
//!
//! A [`TransportFactory`] creates the connectors of one transport. The
//! [`TransportRegistry`] maps transport names to factories and is owned by
//! whoever builds participants; there is no process-wide registry.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bus_converter::{ConverterSelection, WireType};
use parking_lot::RwLock;
use tracing::debug;

use crate::connector::{InConnector, OutConnector};
use crate::error::TransportError;
use crate::inprocess::InProcessFactory;
use crate::socket::SocketFactory;

/// Transport specific options, e.g. `host`, `port`, `server`.
pub type TransportOptions = BTreeMap<String, String>;

/// Creates connectors for one transport.
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Name used in configuration, e.g. `socket`.
    fn name(&self) -> &str;

    /// Whether the transport crosses process boundaries.
    fn is_remote(&self) -> bool;

    /// Wire type of the converters connectors of this transport need.
    fn wire_type(&self) -> WireType;

    fn create_in_connector(
        &self,
        converters: Arc<dyn ConverterSelection>,
        options: &TransportOptions,
    ) -> Result<Arc<dyn InConnector>, TransportError>;

    fn create_out_connector(
        &self,
        converters: Arc<dyn ConverterSelection>,
        options: &TransportOptions,
    ) -> Result<Arc<dyn OutConnector>, TransportError>;
}

/// Name to factory mapping.
#[derive(Debug, Default)]
pub struct TransportRegistry {
    factories: RwLock<BTreeMap<String, Arc<dyn TransportFactory>>>,
}

impl TransportRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the `inprocess` and `socket` transports.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        {
            let mut factories = registry.factories.write();
            let inprocess: Arc<dyn TransportFactory> = Arc::new(InProcessFactory::new());
            let socket: Arc<dyn TransportFactory> = Arc::new(SocketFactory::new());
            factories.insert(inprocess.name().to_string(), inprocess);
            factories.insert(socket.name().to_string(), socket);
        }
        registry
    }

    /// Add a factory. Fails if the name is taken.
    pub fn register(&self, factory: Arc<dyn TransportFactory>) -> Result<(), TransportError> {
        let mut factories = self.factories.write();
        let name = factory.name().to_string();
        if factories.contains_key(&name) {
            return Err(TransportError::DuplicateTransport(name));
        }
        debug!(transport = %name, remote = factory.is_remote(), "Registering transport");
        factories.insert(name, factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn TransportFactory>, TransportError> {
        self.factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::UnknownTransport(name.to_string()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}

/// Parse option `key`, falling back to `default` when absent.
pub(crate) fn parse_option<T>(
    options: &TransportOptions,
    key: &str,
    default: T,
) -> Result<T, TransportError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match options.get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| TransportError::InvalidOption {
            key: key.to_string(),
            value: value.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Parse a boolean option; accepts `1`/`0`, `true`/`false`, `yes`/`no`.
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_defaults() {
        let registry = TransportRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["inprocess", "socket"]);
        assert!(!registry.get("inprocess").unwrap().is_remote());
        assert!(registry.get("socket").unwrap().is_remote());
    }

    #[test]
    fn test_unknown_and_duplicate() {
        let registry = TransportRegistry::with_defaults();
        assert!(matches!(
            registry.get("carrier-pigeon"),
            Err(TransportError::UnknownTransport(_))
        ));
        assert!(matches!(
            registry.register(Arc::new(InProcessFactory::new())),
            Err(TransportError::DuplicateTransport(_))
        ));
    }

    #[test]
    fn test_parse_option() {
        let mut options = TransportOptions::new();
        assert_eq!(parse_option(&options, "port", 55555u16).unwrap(), 55555);

        options.insert("port".into(), "4444".into());
        assert_eq!(parse_option(&options, "port", 55555u16).unwrap(), 4444);

        options.insert("port".into(), "many".into());
        assert!(matches!(
            parse_option(&options, "port", 55555u16),
            Err(TransportError::InvalidOption { .. })
        ));
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
