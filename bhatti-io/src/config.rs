//! Configuration for BhattiIO
//!
//! Per-transport settings are plain read-only snapshots handed to channel
//! constructors. Only the daemon reads them from disk (TOML); the channels
//! themselves never load or persist anything.
//!
//! ```toml
//! [device]
//! type = "modbus"
//! unit_id = 1
//! bt_register = 3
//! et_register = 4
//! scale = 0.1
//!
//! [device.connection]
//! transport = "tcp"
//! host = "192.168.1.50"
//! port = 502
//!
//! [sampling]
//! interval_secs = 1.0
//!
//! [logging]
//! level = "info"
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device selection and its transport settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceConfig {
    /// Line-oriented text protocol over a serial port
    Serial(SerialLineConfig),
    /// Modbus register device (TCP, RTU, ASCII or UDP)
    Modbus(ModbusConfig),
    /// Fixed-header binary frames over a serial port
    Framed(FramedConfig),
    /// USB HID report/response device
    Hid(HidConfig),
    /// Reconnecting byte stream (TCP or serial)
    Duplex(DuplexConfig),
    /// No device
    Null,
}

impl DeviceConfig {
    /// Registry key for this device type
    pub fn device_type(&self) -> &'static str {
        match self {
            DeviceConfig::Serial(_) => "serial",
            DeviceConfig::Modbus(_) => "modbus",
            DeviceConfig::Framed(_) => "framed",
            DeviceConfig::Hid(_) => "hid",
            DeviceConfig::Duplex(_) => "duplex",
            DeviceConfig::Null => "null",
        }
    }
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SerialConfig {
    /// Port path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// 5, 6, 7 or 8
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// 1 or 2
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    /// Read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl SerialConfig {
    /// 8N1 at the given baud rate with a one second timeout
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            timeout_ms: default_timeout_ms(),
        }
    }

    /// Read timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Text-line serial device settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SerialLineConfig {
    pub serial: SerialConfig,
    /// Command written before each read (e.g. "READ\n"); `None` for devices
    /// that report unprompted
    #[serde(default)]
    pub command: Option<String>,
    /// Zero-based field index holding BT
    #[serde(default = "default_bt_field")]
    pub bt_field: usize,
    /// Zero-based field index holding ET
    #[serde(default = "default_et_field")]
    pub et_field: usize,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

/// How to reach a Modbus slave
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum RegisterConnection {
    /// Modbus TCP
    Tcp { host: String, port: u16 },
    /// Modbus RTU over a serial line
    Rtu(SerialConfig),
    /// Modbus ASCII over a serial line
    Ascii(SerialConfig),
    /// Modbus TCP framing over UDP datagrams
    Udp { host: String, port: u16 },
}

/// Which register table holds the readings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    #[default]
    Holding,
    Input,
}

/// Modbus register device settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ModbusConfig {
    pub connection: RegisterConnection,
    /// Slave/unit id
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    pub bt_register: u16,
    pub et_register: u16,
    #[serde(default)]
    pub register_kind: RegisterKind,
    /// Multiplier from raw register value to °C
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Plausible `[min, max]` °C; values outside are replaced by the last
    /// good reading
    #[serde(default)]
    pub plausible_range: Option<[f64; 2]>,
    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Framed-binary roaster settings (line parameters are fixed by the protocol)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FramedConfig {
    pub port: String,
}

/// HID report device settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HidConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// 4-byte command report; the protocol default when absent
    #[serde(default)]
    pub command: Option<[u8; 4]>,
    #[serde(default = "default_hid_timeout_ms")]
    pub read_timeout_ms: u64,
}

/// Byte-stream endpoint for the reconnecting transport
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum DuplexEndpoint {
    Tcp { host: String, port: u16 },
    Serial(SerialConfig),
}

/// Stream protocol spoken over a duplex endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplexProtocolKind {
    /// Discard incoming bytes
    Noop,
    /// `bt,et` text lines
    #[default]
    Line,
}

/// Reconnecting duplex device settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DuplexConfig {
    pub endpoint: DuplexEndpoint,
    #[serde(default)]
    pub protocol: DuplexProtocolKind,
    /// Frame sent on every read (e.g. "READ\n")
    #[serde(default)]
    pub poll_command: Option<String>,
    /// Delay between reconnect attempts in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Capacity of the outbound frame queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Samples older than this are not returned by `read()`
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

/// Sampling schedule
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SamplingConfig {
    /// Poll interval in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,
}

impl SamplingConfig {
    /// Poll interval; fails unless `interval_secs` is finite and positive
    pub fn interval(&self) -> Result<Duration> {
        let secs = self.interval_secs;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(Error::Config(format!(
                "sampling.interval_secs must be a positive number, got {}",
                secs
            )));
        }
        match Duration::try_from_secs_f64(secs) {
            Ok(interval) if !interval.is_zero() => Ok(interval),
            Ok(_) => Err(Error::Config(format!(
                "sampling.interval_secs {} is below one nanosecond",
                secs
            ))),
            Err(e) => Err(Error::Config(format!(
                "sampling.interval_secs {} out of range: {}",
                secs, e
            ))),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_timeout_ms() -> u64 {
    1000
}
fn default_bt_field() -> usize {
    0
}
fn default_et_field() -> usize {
    1
}
fn default_delimiter() -> char {
    ','
}
fn default_unit_id() -> u8 {
    1
}
fn default_scale() -> f64 {
    0.1
}
fn default_hid_timeout_ms() -> u64 {
    500
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_queue_capacity() -> usize {
    64
}
fn default_stale_after_ms() -> u64 {
    5000
}
fn default_interval_secs() -> f64 {
    1.0
}
fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from TOML file
    ///
    /// # Example
    /// ```no_run
    /// use bhatti_io::config::AppConfig;
    ///
    /// let config = AppConfig::load("bhatti-io.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.sampling.interval()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modbus_deserialization() {
        let toml_content = r#"
[device]
type = "modbus"
unit_id = 2
bt_register = 4
et_register = 3
register_kind = "input"
plausible_range = [-50.0, 500.0]

[device.connection]
transport = "rtu"
port = "/dev/ttyUSB0"
baud_rate = 19200
parity = "even"

[sampling]
interval_secs = 0.5
"#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        let DeviceConfig::Modbus(modbus) = &config.device else {
            panic!("expected modbus device, got {:?}", config.device);
        };
        assert_eq!(modbus.unit_id, 2);
        assert_eq!(modbus.register_kind, RegisterKind::Input);
        assert_eq!(modbus.scale, 0.1);
        assert_eq!(modbus.plausible_range, Some([-50.0, 500.0]));

        let RegisterConnection::Rtu(serial) = &modbus.connection else {
            panic!("expected rtu connection");
        };
        assert_eq!(serial.baud_rate, 19200);
        assert_eq!(serial.parity, Parity::Even);
        assert_eq!(serial.data_bits, 8);

        assert_eq!(config.sampling.interval().unwrap(), Duration::from_millis(500));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_null_device_and_defaults() {
        let config: AppConfig = toml::from_str("[device]\ntype = \"null\"\n").unwrap();
        assert_eq!(config.device.device_type(), "null");
        assert_eq!(config.sampling.interval_secs, 1.0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bhatti-io.toml");

        let config = AppConfig {
            device: DeviceConfig::Serial(SerialLineConfig {
                serial: SerialConfig::new("/dev/ttyACM0", 115200),
                command: Some("READ\n".to_string()),
                bt_field: 2,
                et_field: 1,
                delimiter: ',',
            }),
            sampling: SamplingConfig { interval_secs: 2.0 },
            logging: LoggingConfig::default(),
        };
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        let DeviceConfig::Serial(line) = loaded.device else {
            panic!("expected serial device");
        };
        assert_eq!(line.serial.port, "/dev/ttyACM0");
        assert_eq!(line.command.as_deref(), Some("READ\n"));
        assert_eq!(line.bt_field, 2);
        assert_eq!(loaded.sampling.interval_secs, 2.0);
    }

    #[test]
    fn test_interval_validation() {
        for bad in ["inf", "-inf", "nan", "0.0", "-1.0", "1e300"] {
            let sampling: SamplingConfig =
                toml::from_str(&format!("interval_secs = {}", bad)).unwrap();
            assert!(
                matches!(sampling.interval(), Err(Error::Config(_))),
                "accepted interval_secs = {}",
                bad
            );
        }

        let sampling: SamplingConfig = toml::from_str("interval_secs = 0.05").unwrap();
        assert_eq!(sampling.interval().unwrap(), Duration::from_millis(50));
    }

    #[test]
    fn test_load_rejects_bad_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bhatti-io.toml");
        fs::write(&path, "[device]\ntype = \"null\"\n\n[sampling]\ninterval_secs = inf\n").unwrap();

        assert!(matches!(AppConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(AppConfig::load("/nonexistent/bhatti-io.toml").is_err());
    }
}
