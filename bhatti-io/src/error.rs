//! Error types for BhattiIO
//!
//! Two kinds leave the core: [`DeviceError`] for anything a channel does
//! (open, read, parse) and [`TransportError`] for the register-transport
//! primitive underneath the Modbus channel. [`Error`] is the crate-level
//! type used by configuration loading and the daemon.

/// Boxed cause carried by open/read failures
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for configuration and daemon plumbing
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for channel operations
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Result type alias for register-transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Channel open/read/parse failure
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Operation requires an open channel
    #[error("Channel not open: {0}")]
    NotOpen(String),

    /// Hardware unreachable or misconfigured
    #[error("Open failed: {message}")]
    Open {
        /// Human-readable description
        message: String,
        /// Underlying failure, if any
        #[source]
        source: Option<Cause>,
    },

    /// Read attempt failed
    #[error("Read failed: {message}")]
    Read {
        /// Human-readable description
        message: String,
        /// Underlying failure, if any
        #[source]
        source: Option<Cause>,
    },

    /// Malformed frame, line or report
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Fewer bytes than the protocol requires
    #[error("Short response: expected {expected} bytes, got {actual}")]
    ShortResponse {
        /// Bytes required
        expected: usize,
        /// Bytes received
        actual: usize,
    },

    /// Nothing arrived within the transport timeout
    #[error("Read timed out")]
    Timeout,

    /// No sample has been produced yet (or the latest one is stale)
    #[error("No data available: {0}")]
    NoData(String),

    /// Register-transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HID error
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),

    /// Invalid channel configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl DeviceError {
    /// Open failure without an underlying cause
    pub fn open(message: impl Into<String>) -> Self {
        DeviceError::Open {
            message: message.into(),
            source: None,
        }
    }

    /// Open failure wrapping its cause
    pub fn open_with<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DeviceError::Open {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Read failure without an underlying cause
    pub fn read(message: impl Into<String>) -> Self {
        DeviceError::Read {
            message: message.into(),
            source: None,
        }
    }
}

/// Lower-level connection failure from the register transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        /// Host:port or serial port path
        target: String,
        /// Original cause (socket or serial port error)
        #[source]
        source: Cause,
    },

    /// Request issued without a live connection
    #[error("Not connected")]
    NotConnected,

    /// Slave answered with a Modbus exception
    #[error("Modbus exception on function {function:#04x}: {code}")]
    Exception {
        /// Function code of the request
        function: u8,
        /// Exception description
        code: String,
    },

    /// Transport-level I/O failure
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Request parameters outside what the protocol allows
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Response did not match the request
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Crate-level error for configuration and the daemon
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Device error
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Unknown device type
    #[error("Unknown device type: {0}")]
    UnknownDevice(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_open_with_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such port");
        let err = DeviceError::open_with("cannot open /dev/ttyUSB0", io);

        assert_eq!(err.to_string(), "Open failed: cannot open /dev/ttyUSB0");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_transport_error_converts_to_device_error() {
        let err: DeviceError = TransportError::NotConnected.into();
        assert!(matches!(err, DeviceError::Transport(TransportError::NotConnected)));
        assert_eq!(err.to_string(), "Not connected");
    }
}
