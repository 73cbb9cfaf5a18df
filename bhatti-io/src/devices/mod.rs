//! Device channel implementations

pub mod duplex;
pub mod framed;
pub mod hid;
pub mod modbus;
pub mod serial_line;

pub use duplex::{DuplexChannel, LineProtocol};
pub use framed::FramedChannel;
pub use hid::HidChannel;
pub use modbus::ModbusChannel;
pub use serial_line::SerialLineChannel;

use crate::config::DeviceConfig;
use crate::core::{Channel, NullChannel};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Builds a channel from its configuration
pub type ChannelConstructor = fn(&DeviceConfig) -> Result<Box<dyn Channel>>;

/// Device-type name to channel constructor
///
/// Built once at startup and passed to whoever applies configuration.
pub struct ChannelRegistry {
    constructors: BTreeMap<String, ChannelConstructor>,
}

impl ChannelRegistry {
    /// Registry without any device types
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with every built-in channel
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("serial", |config| match config {
            DeviceConfig::Serial(c) => Ok(Box::new(SerialLineChannel::new(c))),
            other => Err(mismatch("serial", other)),
        });
        registry.register("modbus", |config| match config {
            DeviceConfig::Modbus(c) => Ok(Box::new(ModbusChannel::new(c))),
            other => Err(mismatch("modbus", other)),
        });
        registry.register("roaster", |config| match config {
            DeviceConfig::Modbus(c) => Ok(Box::new(ModbusChannel::roaster(c))),
            other => Err(mismatch("roaster", other)),
        });
        registry.register("framed", |config| match config {
            DeviceConfig::Framed(c) => Ok(Box::new(FramedChannel::new(c))),
            other => Err(mismatch("framed", other)),
        });
        registry.register("hid", |config| match config {
            DeviceConfig::Hid(c) => Ok(Box::new(HidChannel::new(c))),
            other => Err(mismatch("hid", other)),
        });
        registry.register("duplex", |config| match config {
            DeviceConfig::Duplex(c) => Ok(Box::new(DuplexChannel::new(c))),
            other => Err(mismatch("duplex", other)),
        });
        registry.register("null", |_| Ok(Box::new(NullChannel::new())));
        registry
    }

    /// Add or replace a device type
    pub fn register(&mut self, device_type: &str, constructor: ChannelConstructor) {
        if self
            .constructors
            .insert(device_type.to_string(), constructor)
            .is_some()
        {
            log::debug!("Replaced channel constructor for '{}'", device_type);
        }
    }

    /// Build the channel for `config` under its own device type
    pub fn create(&self, config: &DeviceConfig) -> Result<Box<dyn Channel>> {
        self.create_as(config.device_type(), config)
    }

    /// Build the channel registered as `device_type`
    pub fn create_as(&self, device_type: &str, config: &DeviceConfig) -> Result<Box<dyn Channel>> {
        let constructor = self
            .constructors
            .get(device_type)
            .ok_or_else(|| Error::UnknownDevice(device_type.to_string()))?;
        let channel = constructor(config)?;
        log::info!("Created channel: {}", channel.description());
        Ok(channel)
    }

    /// Registered device types, sorted
    pub fn device_types(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn mismatch(device_type: &str, config: &DeviceConfig) -> Error {
    Error::Config(format!(
        "device type '{}' needs a {} section, got '{}'",
        device_type,
        device_type,
        config.device_type()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FramedConfig;

    #[test]
    fn test_default_types() {
        let registry = ChannelRegistry::with_defaults();
        assert_eq!(
            registry.device_types(),
            vec!["duplex", "framed", "hid", "modbus", "null", "roaster", "serial"]
        );
    }

    #[test]
    fn test_create_null() {
        let registry = ChannelRegistry::with_defaults();
        let mut channel = registry.create(&DeviceConfig::Null).unwrap();

        assert!(!channel.is_open());
        channel.open().unwrap();
        assert!(channel.read().unwrap().unwrap().bt.is_nan());
    }

    #[test]
    fn test_create_does_not_open() {
        let registry = ChannelRegistry::with_defaults();
        let config = DeviceConfig::Framed(FramedConfig {
            port: "/dev/does-not-exist".to_string(),
        });
        let channel = registry.create(&config).unwrap();
        assert!(!channel.is_open());
        assert!(channel.description().contains("/dev/does-not-exist"));
    }

    #[test]
    fn test_unknown_and_mismatched() {
        let mut registry = ChannelRegistry::empty();
        assert!(matches!(
            registry.create(&DeviceConfig::Null),
            Err(Error::UnknownDevice(_))
        ));

        registry = ChannelRegistry::with_defaults();
        assert!(matches!(
            registry.create_as("hid", &DeviceConfig::Null),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_register_custom_type() {
        let mut registry = ChannelRegistry::empty();
        registry.register("bench", |_| Ok(Box::new(NullChannel::new())));
        assert_eq!(registry.device_types(), vec!["bench"]);
        assert!(registry.create_as("bench", &DeviceConfig::Null).is_ok());
    }
}
