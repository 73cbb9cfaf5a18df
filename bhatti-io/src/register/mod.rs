//! Register transport: Modbus master over TCP, RTU, ASCII or UDP
//!
//! [`RegisterTransport`] is the primitive the Modbus channel reads through.
//! [`RegisterMaster`] is the production implementation. TCP and RTU go
//! through the `tokio-modbus` synchronous client; ASCII and UDP framing are
//! handled here on top of the shared PDU codec in [`pdu`].

mod ascii;
mod mock;
pub mod pdu;
mod udp;

pub use ascii::AsciiLink;
pub use mock::MockRegisters;
pub use udp::UdpLink;

use crate::config::{RegisterConnection, SerialConfig};
use crate::error::{DeviceError, TransportError, TransportResult};
use crate::transport::SerialTransport;
use std::time::Duration;
use tokio_modbus::client::sync::{self, Context};
use tokio_modbus::prelude::{SlaveContext, SyncReader, SyncWriter};
use tokio_modbus::Slave;

/// Synchronous register read/write primitive
pub trait RegisterTransport: Send {
    /// Establish the link; no-op when already connected
    fn connect(&mut self) -> TransportResult<()>;

    /// Drop the link; safe to call repeatedly
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Read `count` holding registers starting at `start`
    fn read_holding_registers(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>>;

    /// Read `count` input registers starting at `start`
    fn read_input_registers(&mut self, unit: u8, start: u16, count: u16)
    -> TransportResult<Vec<u16>>;

    fn write_single_register(&mut self, unit: u8, address: u16, value: u16)
    -> TransportResult<()>;

    /// Human-readable endpoint, e.g. `tcp://10.0.0.5:502`
    fn description(&self) -> String;
}

/// Wire variant of a register connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Tcp,
    Rtu,
    Ascii,
    Udp,
}

impl ConnectionKind {
    pub fn of(connection: &RegisterConnection) -> Self {
        match connection {
            RegisterConnection::Tcp { .. } => ConnectionKind::Tcp,
            RegisterConnection::Rtu(_) => ConnectionKind::Rtu,
            RegisterConnection::Ascii(_) => ConnectionKind::Ascii,
            RegisterConnection::Udp { .. } => ConnectionKind::Udp,
        }
    }
}

enum Link {
    Modbus(Context),
    Ascii(AsciiLink),
    Udp(UdpLink),
}

/// Modbus master for any supported connection kind
pub struct RegisterMaster {
    connection: RegisterConnection,
    timeout: Duration,
    link: Option<Link>,
}

impl RegisterMaster {
    pub fn new(connection: RegisterConnection, timeout: Duration) -> Self {
        Self {
            connection,
            timeout,
            link: None,
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        ConnectionKind::of(&self.connection)
    }

    fn open_link(&self) -> TransportResult<Link> {
        let target = self.description();
        let connect_err = |source: std::io::Error| TransportError::Connect {
            target: target.clone(),
            source: Box::new(source),
        };

        match &self.connection {
            RegisterConnection::Tcp { host, port } => {
                let addr = udp::resolve(host, *port).map_err(connect_err)?;
                let mut ctx = sync::tcp::connect_slave(addr, Slave(1)).map_err(connect_err)?;
                ctx.set_timeout(Some(self.timeout));
                Ok(Link::Modbus(ctx))
            }
            RegisterConnection::Rtu(serial) => {
                let builder = serial_builder(serial, self.timeout)?;
                let mut ctx = sync::rtu::connect_slave(&builder, Slave(1)).map_err(connect_err)?;
                ctx.set_timeout(Some(self.timeout));
                Ok(Link::Modbus(ctx))
            }
            RegisterConnection::Ascii(serial) => {
                let mut serial = serial.clone();
                serial.timeout_ms = self.timeout.as_millis() as u64;
                let transport = SerialTransport::open(&serial).map_err(|e| match e {
                    DeviceError::Open {
                        source: Some(source),
                        ..
                    } => TransportError::Connect {
                        target: target.clone(),
                        source,
                    },
                    DeviceError::Io(source) => connect_err(source),
                    other => TransportError::InvalidRequest(other.to_string()),
                })?;
                Ok(Link::Ascii(AsciiLink::new(Box::new(transport))))
            }
            RegisterConnection::Udp { host, port } => {
                Ok(Link::Udp(UdpLink::connect(host, *port, self.timeout)?))
            }
        }
    }

    fn link(&mut self) -> TransportResult<&mut Link> {
        self.link.as_mut().ok_or(TransportError::NotConnected)
    }

    fn read_registers(
        &mut self,
        function: u8,
        unit: u8,
        start: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        // Validates the count for every link kind
        let request = pdu::read_request(function, start, count)?;

        match self.link()? {
            Link::Modbus(ctx) => {
                ctx.set_slave(Slave(unit));
                let result = if function == pdu::READ_INPUT_REGISTERS {
                    ctx.read_input_registers(start, count)
                } else {
                    ctx.read_holding_registers(start, count)
                };
                map_modbus(function, result)
            }
            Link::Ascii(link) => {
                let reply = link.request(unit, &request)?;
                pdu::parse_read_response(function, count, &reply)
            }
            Link::Udp(link) => {
                let reply = link.request(unit, &request)?;
                pdu::parse_read_response(function, count, &reply)
            }
        }
    }
}

impl RegisterTransport for RegisterMaster {
    fn connect(&mut self) -> TransportResult<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let link = self.open_link()?;
        log::info!("Register master connected: {}", self.description());
        self.link = Some(link);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.link.take().is_some() {
            log::info!("Register master disconnected: {}", self.description());
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn read_holding_registers(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        self.read_registers(pdu::READ_HOLDING_REGISTERS, unit, start, count)
    }

    fn read_input_registers(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        self.read_registers(pdu::READ_INPUT_REGISTERS, unit, start, count)
    }

    fn write_single_register(
        &mut self,
        unit: u8,
        address: u16,
        value: u16,
    ) -> TransportResult<()> {
        let request = pdu::write_single_request(address, value);
        match self.link()? {
            Link::Modbus(ctx) => {
                ctx.set_slave(Slave(unit));
                map_modbus(
                    pdu::WRITE_SINGLE_REGISTER,
                    ctx.write_single_register(address, value),
                )
            }
            Link::Ascii(link) => {
                let reply = link.request(unit, &request)?;
                pdu::parse_write_single_response(address, value, &reply)
            }
            Link::Udp(link) => {
                let reply = link.request(unit, &request)?;
                pdu::parse_write_single_response(address, value, &reply)
            }
        }
    }

    fn description(&self) -> String {
        match &self.connection {
            RegisterConnection::Tcp { host, port } => format!("tcp://{}:{}", host, port),
            RegisterConnection::Udp { host, port } => format!("udp://{}:{}", host, port),
            RegisterConnection::Rtu(serial) => {
                format!("rtu://{} ({} baud)", serial.port, serial.baud_rate)
            }
            RegisterConnection::Ascii(serial) => {
                format!("ascii://{} ({} baud)", serial.port, serial.baud_rate)
            }
        }
    }
}

impl Drop for RegisterMaster {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Nested `tokio-modbus` result: outer is transport, inner is exception
fn map_modbus<T>(function: u8, result: tokio_modbus::Result<T>) -> TransportResult<T> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(code)) => Err(TransportError::Exception {
            function,
            code: format!("{:?}", code),
        }),
        Err(tokio_modbus::Error::Transport(err)) => Err(TransportError::Io(err)),
        Err(err) => Err(TransportError::InvalidResponse(err.to_string())),
    }
}

fn serial_builder(
    serial: &SerialConfig,
    timeout: Duration,
) -> TransportResult<tokio_serial::SerialPortBuilder> {
    let invalid = |e: crate::error::DeviceError| TransportError::InvalidRequest(e.to_string());
    Ok(tokio_serial::new(serial.port.as_str(), serial.baud_rate)
        .data_bits(crate::transport::serial_data_bits(serial.data_bits).map_err(invalid)?)
        .stop_bits(crate::transport::serial_stop_bits(serial.stop_bits).map_err(invalid)?)
        .parity(crate::transport::serial_parity(serial.parity))
        .timeout(timeout))
}
