//! Serial transport implementation

use super::Transport;
use crate::config::{Parity, SerialConfig};
use crate::error::{DeviceError, DeviceResult};
use serialport::{ClearBuffer, DataBits, FlowControl, SerialPort, StopBits};
use std::io::{Read, Write};

/// Serial transport for UART communication
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open a serial port with the given line settings
    pub fn open(config: &SerialConfig) -> DeviceResult<Self> {
        Ok(SerialTransport {
            port: open_port(config)?,
        })
    }
}

/// Open and configure a raw serial port handle
pub(crate) fn open_port(config: &SerialConfig) -> DeviceResult<Box<dyn SerialPort>> {
    let port = serialport::new(&config.port, config.baud_rate)
        .data_bits(data_bits(config.data_bits)?)
        .parity(parity(config.parity))
        .stop_bits(stop_bits(config.stop_bits)?)
        .flow_control(FlowControl::None)
        .timeout(config.timeout())
        .open()
        .map_err(|e| DeviceError::open_with(format!("cannot open {}", config.port), e))?;

    log::info!(
        "Opened serial port: {} at {} baud ({}{}{})",
        config.port,
        config.baud_rate,
        config.data_bits,
        parity_letter(config.parity),
        config.stop_bits
    );
    Ok(port)
}

impl Transport for SerialTransport {
    fn read(&mut self, buffer: &mut [u8]) -> DeviceResult<usize> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> DeviceResult<usize> {
        Ok(self.port.write(data)?)
    }

    fn flush(&mut self) -> DeviceResult<()> {
        self.port.flush()?;
        Ok(())
    }

    fn available(&mut self) -> DeviceResult<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn clear_input(&mut self) -> DeviceResult<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

pub(crate) fn data_bits(bits: u8) -> DeviceResult<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(DeviceError::Config(format!("unsupported data bits: {}", other))),
    }
}

pub(crate) fn stop_bits(bits: u8) -> DeviceResult<StopBits> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(DeviceError::Config(format!("unsupported stop bits: {}", other))),
    }
}

pub(crate) fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn parity_letter(parity: Parity) -> char {
    match parity {
        Parity::None => 'N',
        Parity::Odd => 'O',
        Parity::Even => 'E',
    }
}

/// Opens a transport for a serial configuration
pub type SerialOpener = Box<dyn Fn(&SerialConfig) -> DeviceResult<Box<dyn Transport>> + Send>;

/// Serial port session shared by the serial-backed channels
///
/// Owns the line settings and, while open, the transport. Channels hold one
/// of these instead of inheriting port setup from a common base.
pub struct SerialSession {
    config: SerialConfig,
    opener: SerialOpener,
    transport: Option<Box<dyn Transport>>,
}

impl SerialSession {
    /// Session that opens a real serial port
    pub fn new(config: SerialConfig) -> Self {
        Self::with_opener(
            config,
            Box::new(|config: &SerialConfig| {
                Ok(Box::new(SerialTransport::open(config)?) as Box<dyn Transport>)
            }),
        )
    }

    /// Session with a custom opener (tests, alternative backends)
    pub fn with_opener(config: SerialConfig, opener: SerialOpener) -> Self {
        Self {
            config,
            opener,
            transport: None,
        }
    }

    /// Line settings
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Open the port; no-op when already open
    pub fn open(&mut self) -> DeviceResult<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let transport = (self.opener)(&self.config)?;
        self.transport = Some(transport);
        Ok(())
    }

    /// Drop the port handle; safe to call repeatedly
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            log::info!("Closed serial port: {}", self.config.port);
        }
    }

    /// Whether the port is open
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Open transport, or [`DeviceError::NotOpen`]
    pub fn transport(&mut self) -> DeviceResult<&mut dyn Transport> {
        match self.transport.as_mut() {
            Some(transport) => Ok(transport.as_mut()),
            None => Err(DeviceError::NotOpen(self.config.port.clone())),
        }
    }
}
