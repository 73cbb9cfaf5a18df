//! Transport layer for I/O abstraction
//!
//! [`Transport`] is the byte-level seam under the serial channels: the real
//! implementation wraps a serial port, [`MockTransport`] feeds scripted bytes
//! in tests. [`duplex`] holds the reconnecting stream transport.

use crate::error::{DeviceError, DeviceResult};

pub mod duplex;
mod mock;
mod serial;

pub use mock::MockTransport;
pub use serial::{SerialOpener, SerialSession, SerialTransport};
pub(crate) use serial::{
    data_bits as serial_data_bits, parity as serial_parity, stop_bits as serial_stop_bits,
};

/// Transport trait for device communication
pub trait Transport: Send {
    /// Read data into buffer, returns number of bytes read
    ///
    /// `Ok(0)` means nothing arrived within the transport timeout.
    fn read(&mut self, buffer: &mut [u8]) -> DeviceResult<usize>;

    /// Write data from buffer, returns number of bytes written
    fn write(&mut self, data: &[u8]) -> DeviceResult<usize>;

    /// Flush any pending writes (blocking until complete)
    fn flush(&mut self) -> DeviceResult<()>;

    /// Number of bytes ready to read without blocking
    fn available(&mut self) -> DeviceResult<usize> {
        Ok(0)
    }

    /// Discard anything already buffered on the input side
    fn clear_input(&mut self) -> DeviceResult<()> {
        Ok(())
    }
}

/// Write the whole buffer and flush
pub fn write_all(transport: &mut dyn Transport, mut data: &[u8]) -> DeviceResult<()> {
    while !data.is_empty() {
        let n = transport.write(data)?;
        if n == 0 {
            return Err(DeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "transport accepted no bytes",
            )));
        }
        data = &data[n..];
    }
    transport.flush()
}

/// Read one byte, `None` if the transport timed out
pub fn read_byte(transport: &mut dyn Transport) -> DeviceResult<Option<u8>> {
    let mut byte = [0u8; 1];
    match transport.read(&mut byte)? {
        0 => Ok(None),
        _ => Ok(Some(byte[0])),
    }
}

/// Fill `buffer` completely
///
/// A timeout before the buffer is full is a short read.
pub fn read_full(transport: &mut dyn Transport, buffer: &mut [u8]) -> DeviceResult<()> {
    let mut filled = 0;
    while filled < buffer.len() {
        match transport.read(&mut buffer[filled..])? {
            0 => {
                return Err(DeviceError::ShortResponse {
                    expected: buffer.len(),
                    actual: filled,
                });
            }
            n => filled += n,
        }
    }
    Ok(())
}

/// Read bytes up to and including `\n`, returned without the line ending
///
/// Fails with [`DeviceError::Timeout`] if nothing arrives and with
/// [`DeviceError::InvalidFrame`] if the line outgrows `max_len`.
pub fn read_line(transport: &mut dyn Transport, max_len: usize) -> DeviceResult<String> {
    let mut line = Vec::with_capacity(64);
    loop {
        match read_byte(transport)? {
            Some(b'\n') => break,
            Some(byte) => {
                if line.len() >= max_len {
                    return Err(DeviceError::InvalidFrame(format!(
                        "line exceeds {} bytes",
                        max_len
                    )));
                }
                line.push(byte);
            }
            None if line.is_empty() => return Err(DeviceError::Timeout),
            None => {
                return Err(DeviceError::InvalidFrame(format!(
                    "unterminated line: {:?}",
                    String::from_utf8_lossy(&line)
                )));
            }
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
