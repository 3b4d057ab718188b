//! # Participant Configuration
//!
//! Selects the transports a participant uses, their options and converters,
//! and the requested quality of service.
//!
//! ## Option Keys
//!
//! | Key | Example | Meaning |
//! |-----|---------|---------|
//! | `qualityofservice.ordering` | `ordered` | `ordered` or `unordered` |
//! | `qualityofservice.reliability` | `reliable` | `reliable` or `unreliable` |
//! | `transport.<name>.enabled` | `1` | enable or disable a transport |
//! | `transport.<name>.converter.<wire-schema>` | `alloc::string::String` | data type that wins for an ambiguous wire schema |
//! | `transport.<name>.<option>` | `port=4444` | transport specific option |
//!
//! Keys outside these sections are ignored. Environment variables use the
//! `BUS_` prefix with `_` in place of `.`, e.g. `BUS_TRANSPORT_SOCKET_PORT`.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::sync::Arc;

use bus_converter::{ConverterError, ConverterMap, ConverterSelection, UnambiguousConverterMap};
use bus_transport::{DeliveryOrdering, QualityOfServiceSpec, Reliability, TransportOptions};
use tracing::debug;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "BUS_";
const INPROCESS: &str = "inprocess";

/// Configuration of one transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub name: String,
    pub enabled: bool,
    /// Passed to the transport factory, e.g. `host`, `port`, `server`.
    pub options: TransportOptions,
    /// Wire schema to data type name; resolves wire schemas claimed by
    /// several converters of the base map.
    pub converter_rules: BTreeMap<String, String>,
    /// Explicit converter strategy; replaces the one derived from the base map.
    pub converters: Option<Arc<dyn ConverterSelection>>,
}

impl TransportConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: false,
            options: TransportOptions::new(),
            converter_rules: BTreeMap::new(),
            converters: None,
        }
    }

    #[must_use]
    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_converters(mut self, converters: Arc<dyn ConverterSelection>) -> Self {
        self.converters = Some(converters);
        self
    }
}

/// Transports and quality of service used when creating participants.
#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    pub qos: QualityOfServiceSpec,
    transports: BTreeMap<String, TransportConfig>,
}

impl Default for ParticipantConfig {
    /// Only the in-process transport, unordered and reliable.
    fn default() -> Self {
        let mut transports = BTreeMap::new();
        transports.insert(INPROCESS.to_string(), TransportConfig::new(INPROCESS).enabled());
        Self {
            qos: QualityOfServiceSpec::default(),
            transports,
        }
    }
}

impl ParticipantConfig {
    /// A configuration without any transport.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            qos: QualityOfServiceSpec::default(),
            transports: BTreeMap::new(),
        }
    }

    /// Add or replace a transport configuration.
    #[must_use]
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.set_transport(transport);
        self
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QualityOfServiceSpec) -> Self {
        self.qos = qos;
        self
    }

    pub fn set_transport(&mut self, transport: TransportConfig) {
        self.transports.insert(transport.name.clone(), transport);
    }

    /// Configuration of `name`, created disabled if absent.
    pub fn transport_mut(&mut self, name: &str) -> &mut TransportConfig {
        self.transports
            .entry(name.to_string())
            .or_insert_with(|| TransportConfig::new(name))
    }

    #[must_use]
    pub fn transport(&self, name: &str) -> Option<&TransportConfig> {
        self.transports.get(name)
    }

    /// Enabled transports in name order.
    pub fn enabled_transports(&self) -> impl Iterator<Item = &TransportConfig> {
        self.transports.values().filter(|t| t.enabled)
    }

    /// Build a configuration from dotted option keys, starting from
    /// [`ParticipantConfig::default`].
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in options {
            config.apply(key, value)?;
        }
        Ok(config)
    }

    /// Build a configuration from `BUS_` prefixed environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(env::vars())
    }

    fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let options = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let rest = key.strip_prefix(ENV_PREFIX)?;
                Some((rest.to_ascii_lowercase().replace('_', "."), value))
            })
            .collect();
        Self::from_options(&options)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        let mut parts = key.splitn(2, '.');
        let section = parts.next().unwrap_or_default();
        let rest = parts.next();

        match (section, rest) {
            ("qualityofservice", Some(field)) => {
                check_value(key, value)?;
                self.apply_qos(key, field, value)
            }
            ("transport", Some(rest)) => {
                let (name, option) = rest
                    .split_once('.')
                    .filter(|(name, option)| !name.is_empty() && !option.is_empty())
                    .ok_or_else(|| ConfigError::MalformedKey(key.to_string()))?;
                check_value(key, value)?;
                let transport = self.transport_mut(name);
                if option == "enabled" {
                    transport.enabled = parse_bool(value).ok_or_else(|| invalid(key, value))?;
                } else if let Some(wire_schema) = option.strip_prefix("converter.") {
                    transport
                        .converter_rules
                        .insert(wire_schema.to_string(), value.to_string());
                } else {
                    transport.options.insert(option.to_string(), value.to_string());
                }
                Ok(())
            }
            _ => {
                debug!(key, "Ignoring unrelated configuration option");
                Ok(())
            }
        }
    }

    fn apply_qos(&mut self, key: &str, field: &str, value: &str) -> Result<(), ConfigError> {
        match field {
            "ordering" => {
                self.qos.ordering = match value.to_ascii_lowercase().as_str() {
                    "ordered" => DeliveryOrdering::Ordered,
                    "unordered" => DeliveryOrdering::Unordered,
                    _ => return Err(invalid(key, value)),
                };
            }
            "reliability" => {
                self.qos.reliability = match value.to_ascii_lowercase().as_str() {
                    "reliable" => Reliability::Reliable,
                    "unreliable" => Reliability::Unreliable,
                    _ => return Err(invalid(key, value)),
                };
            }
            _ => debug!(key, "Ignoring unknown quality of service option"),
        }
        Ok(())
    }
}

fn check_value(key: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(())
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Converter strategy for a byte-oriented transport.
///
/// Uses the transport's explicit strategy when configured. Otherwise builds an
/// [`UnambiguousConverterMap`] from `base`, leaving out converters whose wire
/// schema has a rule naming a different data type. A wire schema claimed by
/// several data types without a rule fails with
/// [`ConverterError::AmbiguousWireSchema`].
pub fn converters_for_transport(
    transport: &TransportConfig,
    base: &ConverterMap,
) -> Result<Arc<dyn ConverterSelection>, ConverterError> {
    if let Some(converters) = &transport.converters {
        return Ok(Arc::clone(converters));
    }

    let selected = UnambiguousConverterMap::new(base.wire_type());
    for converter in base.converters() {
        if let Some(data_type) = transport.converter_rules.get(converter.wire_schema()) {
            if data_type != converter.data_type().name() {
                debug!(
                    transport = %transport.name,
                    wire_schema = converter.wire_schema(),
                    skipped = %converter.data_type(),
                    "Converter excluded by rule"
                );
                continue;
            }
        }
        selected.add_converter(converter, false)?;
    }
    Ok(Arc::new(selected))
}
