//! Fixed-header framed-binary roaster protocol
//!
//! Frame format (9600 8N1, device pushes frames continuously):
//!
//! ```text
//! ┌──────┬──────┬─────────┬─────────┬──────────┐
//! │ 0xA5 │ 0x96 │ ET (BE) │ BT (BE) │ reserved │
//! │  1B  │  1B  │   2B    │   2B    │    2B    │
//! └──────┴──────┴─────────┴─────────┴──────────┘
//! ```
//!
//! Temperatures are sent in the device's native units; no scaling applied.

use crate::config::{FramedConfig, Parity, SerialConfig};
use crate::core::{Channel, Sample};
use crate::error::{DeviceError, DeviceResult};
use crate::transport::{self, SerialSession, Transport};

/// First header byte
pub const HEADER_1: u8 = 0xA5;
/// Second header byte
pub const HEADER_2: u8 = 0x96;
/// Bytes after the header
pub const PAYLOAD_LEN: usize = 6;

const ET_OFFSET: usize = 0;
const BT_OFFSET: usize = 2;

/// Line settings the device is fixed at
pub const BAUD_RATE: u32 = 9600;
/// Read timeout matched to the device's report cadence
pub const READ_TIMEOUT_MS: u64 = 200;

/// Bytes scanned for a header before giving up on this read: what the line
/// delivers in one read timeout (10 bits per byte)
pub const MAX_SCAN: usize = BAUD_RATE as usize / 10 * READ_TIMEOUT_MS as usize / 1000;

/// Serial settings for a framed-binary device on `port`
pub fn serial_config(port: &str) -> SerialConfig {
    SerialConfig {
        port: port.to_string(),
        baud_rate: BAUD_RATE,
        data_bits: 8,
        stop_bits: 1,
        parity: Parity::None,
        timeout_ms: READ_TIMEOUT_MS,
    }
}

pub struct FramedChannel {
    session: SerialSession,
}

impl FramedChannel {
    pub fn new(config: &FramedConfig) -> Self {
        Self::with_session(SerialSession::new(serial_config(&config.port)))
    }

    pub fn with_session(session: SerialSession) -> Self {
        Self { session }
    }
}

/// Decode a payload into `(bt, et)`
pub fn decode_payload(payload: &[u8; PAYLOAD_LEN]) -> (f64, f64) {
    let field = |offset: usize| u16::from_be_bytes([payload[offset], payload[offset + 1]]) as f64;
    (field(BT_OFFSET), field(ET_OFFSET))
}

/// Read one frame
///
/// Returns `Ok(None)` when the byte after `0xA5` is not `0x96`: the frame is
/// abandoned without an error and the next read resynchronises.
pub fn read_frame(port: &mut dyn Transport) -> DeviceResult<Option<[u8; PAYLOAD_LEN]>> {
    let mut scanned = 0;
    loop {
        match transport::read_byte(port)? {
            Some(HEADER_1) => break,
            Some(_) => {
                scanned += 1;
                if scanned >= MAX_SCAN {
                    return Err(DeviceError::InvalidFrame(format!(
                        "no header in {} bytes",
                        scanned
                    )));
                }
            }
            None => return Err(DeviceError::Timeout),
        }
    }

    match transport::read_byte(port)? {
        Some(HEADER_2) => {}
        Some(other) => {
            log::trace!("Header mismatch: 0xA5 followed by {:#04x}", other);
            return Ok(None);
        }
        None => {
            return Err(DeviceError::ShortResponse {
                expected: PAYLOAD_LEN + 2,
                actual: 1,
            });
        }
    }

    let mut payload = [0u8; PAYLOAD_LEN];
    transport::read_full(port, &mut payload).map_err(|e| match e {
        DeviceError::ShortResponse { actual, .. } => DeviceError::ShortResponse {
            expected: PAYLOAD_LEN + 2,
            actual: actual + 2,
        },
        other => other,
    })?;
    Ok(Some(payload))
}

impl Channel for FramedChannel {
    fn open(&mut self) -> DeviceResult<()> {
        self.session.open()
    }

    fn close(&mut self) {
        self.session.close();
    }

    fn is_open(&self) -> bool {
        self.session.is_open()
    }

    fn read(&mut self) -> DeviceResult<Option<Sample>> {
        let port = self.session.transport()?;
        Ok(read_frame(port)?.map(|payload| {
            let (bt, et) = decode_payload(&payload);
            Sample::new(bt, et)
        }))
    }

    fn description(&self) -> String {
        format!(
            "Framed {} ({})",
            self.session.config().port,
            if self.is_open() { "open" } else { "closed" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn open_channel(mock: &MockTransport) -> FramedChannel {
        let mock = mock.clone();
        let mut ch = FramedChannel::with_session(SerialSession::with_opener(
            serial_config("/dev/mock"),
            Box::new(move |_: &SerialConfig| Ok(Box::new(mock.clone()) as Box<dyn Transport>)),
        ));
        ch.open().unwrap();
        ch
    }

    #[test]
    fn test_decode_payload() {
        // ET = 0x00C8 (200), BT = 0x00B4 (180)
        let (bt, et) = decode_payload(&[0x00, 0xC8, 0x00, 0xB4, 0x00, 0x00]);
        assert_eq!(bt, 180.0);
        assert_eq!(et, 200.0);
    }

    #[test]
    fn test_frame_after_noise() {
        let mock = MockTransport::new();
        mock.inject_read(&[0x00, 0x13, 0x96, 0xA5, 0x96, 0x01, 0x2C, 0x00, 0xF0, 0x00, 0x00]);
        let mut ch = open_channel(&mock);

        let sample = ch.read().unwrap().unwrap();
        assert_eq!(sample.et, 300.0);
        assert_eq!(sample.bt, 240.0);
        assert_eq!(mock.pending_read(), 0);
    }

    #[test]
    fn test_frame_after_long_noise() {
        let mock = MockTransport::new();
        mock.inject_read(&[0x00; 40]);
        mock.inject_read(&[0xA5, 0x96, 0x00, 0xC8, 0x00, 0xB4, 0x00, 0x00]);
        let mut ch = open_channel(&mock);

        let sample = ch.read().unwrap().unwrap();
        assert_eq!((sample.bt, sample.et), (180.0, 200.0));
    }

    #[test]
    fn test_noise_beyond_read_window() {
        let mock = MockTransport::new();
        mock.inject_read(&vec![0x00; MAX_SCAN + 10]);
        mock.inject_read(&[0xA5, 0x96, 0x00, 0xC8, 0x00, 0xB4, 0x00, 0x00]);
        let mut ch = open_channel(&mock);

        assert!(matches!(ch.read(), Err(DeviceError::InvalidFrame(_))));
        // The next read picks up where the scan stopped
        let sample = ch.read().unwrap().unwrap();
        assert_eq!((sample.bt, sample.et), (180.0, 200.0));
    }

    #[test]
    fn test_header_mismatch_aborts_frame() {
        let mock = MockTransport::new();
        mock.inject_read(&[0xA5, 0x00, 0xA5, 0x96, 0x00, 0x64, 0x00, 0x50, 0x00, 0x00]);
        let mut ch = open_channel(&mock);

        assert!(ch.read().unwrap().is_none());
        let sample = ch.read().unwrap().unwrap();
        assert_eq!((sample.bt, sample.et), (80.0, 100.0));
    }

    #[test]
    fn test_noise_never_yields_sample() {
        let mock = MockTransport::new();
        mock.inject_read(&[0x01, 0x96, 0x5A, 0x69, 0xFF, 0x00, 0x96, 0x96]);
        let mut ch = open_channel(&mock);

        for _ in 0..3 {
            assert!(!matches!(ch.read(), Ok(Some(_))));
        }
    }

    #[test]
    fn test_short_payload_fails() {
        let mock = MockTransport::new();
        mock.inject_read(&[0xA5, 0x96, 0x00, 0x64]);
        let mut ch = open_channel(&mock);

        match ch.read() {
            Err(DeviceError::ShortResponse { expected, actual }) => {
                assert_eq!(expected, 8);
                assert_eq!(actual, 4);
            }
            other => panic!("expected short response, got {:?}", other),
        }
    }

    #[test]
    fn test_read_requires_open() {
        let mut ch = FramedChannel::new(&FramedConfig {
            port: "/dev/ttyUSB9".to_string(),
        });
        assert!(!ch.is_open());
        assert!(matches!(ch.read(), Err(DeviceError::NotOpen(_))));
        ch.close();
        assert!(!ch.is_open());
    }
}
