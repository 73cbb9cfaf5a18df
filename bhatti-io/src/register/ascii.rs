//! Modbus ASCII master link

use super::pdu;
use crate::error::{DeviceError, TransportError, TransportResult};
use crate::transport::{self, Transport};

/// Longest ASCII frame line: ':' + 2 * (unit + 253 PDU bytes + LRC)
const MAX_LINE: usize = 1 + 2 * 255;

/// Request/response exchange over a serial transport using ASCII framing
pub struct AsciiLink {
    transport: Box<dyn Transport>,
}

impl AsciiLink {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Send one request PDU and return the reply PDU
    pub fn request(&mut self, unit: u8, request: &[u8]) -> TransportResult<Vec<u8>> {
        let frame = pdu::encode_ascii(unit, request);
        log::trace!("ASCII TX: {}", String::from_utf8_lossy(&frame).trim_end());

        self.transport.clear_input().map_err(device_to_transport)?;
        transport::write_all(self.transport.as_mut(), &frame).map_err(device_to_transport)?;

        let line = transport::read_line(self.transport.as_mut(), MAX_LINE)
            .map_err(device_to_transport)?;
        log::trace!("ASCII RX: {}", line);

        let (reply_unit, reply) = pdu::decode_ascii(&line)?;
        if reply_unit != unit {
            return Err(TransportError::InvalidResponse(format!(
                "reply from unit {} to request for unit {}",
                reply_unit, unit
            )));
        }
        Ok(reply)
    }
}

fn device_to_transport(err: DeviceError) -> TransportError {
    match err {
        DeviceError::Io(e) => TransportError::Io(e),
        DeviceError::Timeout => TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "no ASCII reply",
        )),
        other => TransportError::InvalidResponse(other.to_string()),
    }
}
