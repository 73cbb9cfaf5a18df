//! Line-oriented serial thermometers
//!
//! Each reading is one text line, fields separated by a delimiter:
//!
//! ```text
//! 201.5,180.2\r\n
//! ```
//!
//! Devices that only answer on request get the configured poll command
//! written before every read.

use crate::config::SerialLineConfig;
use crate::core::{Channel, Sample};
use crate::error::{DeviceError, DeviceResult};
use crate::transport::{self, SerialSession};

/// Longest accepted line
const MAX_LINE_LEN: usize = 256;

/// Serial channel with text framing
pub struct SerialLineChannel {
    session: SerialSession,
    command: Option<Vec<u8>>,
    bt_field: usize,
    et_field: usize,
    delimiter: char,
}

impl SerialLineChannel {
    pub fn new(config: &SerialLineConfig) -> Self {
        Self::with_session(config, SerialSession::new(config.serial.clone()))
    }

    /// Channel over a caller-supplied session
    pub fn with_session(config: &SerialLineConfig, session: SerialSession) -> Self {
        Self {
            session,
            command: config.command.as_ref().map(|c| c.as_bytes().to_vec()),
            bt_field: config.bt_field,
            et_field: config.et_field,
            delimiter: config.delimiter,
        }
    }
}

impl Channel for SerialLineChannel {
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
        if let Some(command) = &self.command {
            port.clear_input()?;
            transport::write_all(port, command)?;
        }

        let line = transport::read_line(port, MAX_LINE_LEN)?;
        log::trace!("Serial line: {:?}", line);

        let (bt, et) = parse_fields(&line, self.delimiter, self.bt_field, self.et_field)?;
        Ok(Some(Sample::new(bt, et)))
    }

    fn description(&self) -> String {
        let config = self.session.config();
        format!(
            "Serial {} @ {} baud ({})",
            config.port,
            config.baud_rate,
            if self.is_open() { "open" } else { "closed" }
        )
    }
}

/// Extract BT and ET from a delimited line
///
/// Empty or non-numeric fields give NaN. Fails when the line is too short
/// for either index or when neither field parses.
pub fn parse_fields(
    line: &str,
    delimiter: char,
    bt_field: usize,
    et_field: usize,
) -> DeviceResult<(f64, f64)> {
    let fields: Vec<&str> = line.split(delimiter).map(str::trim).collect();
    let needed = bt_field.max(et_field) + 1;
    if fields.len() < needed {
        return Err(DeviceError::InvalidFrame(format!(
            "expected at least {} fields, got {} in {:?}",
            needed,
            fields.len(),
            line
        )));
    }

    let value = |index: usize| fields[index].parse::<f64>().unwrap_or(f64::NAN);
    let (bt, et) = (value(bt_field), value(et_field));
    if bt.is_nan() && et.is_nan() {
        return Err(DeviceError::InvalidFrame(format!(
            "no numeric field in {:?}",
            line
        )));
    }
    Ok((bt, et))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SerialConfig;
    use crate::transport::{MockTransport, Transport};

    fn config(command: Option<&str>) -> SerialLineConfig {
        SerialLineConfig {
            serial: SerialConfig::new("/dev/mock", 115200),
            command: command.map(str::to_string),
            bt_field: 0,
            et_field: 1,
            delimiter: ',',
        }
    }

    fn channel(mock: &MockTransport, command: Option<&str>) -> SerialLineChannel {
        let mock = mock.clone();
        let session = SerialSession::with_opener(
            SerialConfig::new("/dev/mock", 115200),
            Box::new(move |_: &SerialConfig| Ok(Box::new(mock.clone()) as Box<dyn Transport>)),
        );
        SerialLineChannel::with_session(&config(command), session)
    }

    #[test]
    fn test_parse_fields() {
        assert_eq!(parse_fields("201.5,180.2", ',', 0, 1).unwrap(), (201.5, 180.2));
        assert_eq!(parse_fields("x;95.0;120.5", ';', 2, 1).unwrap(), (120.5, 95.0));

        let (bt, et) = parse_fields("201.5,", ',', 0, 1).unwrap();
        assert_eq!(bt, 201.5);
        assert!(et.is_nan());
    }

    #[test]
    fn test_parse_fields_rejects_bad_lines() {
        assert!(matches!(
            parse_fields("201.5", ',', 0, 1),
            Err(DeviceError::InvalidFrame(_))
        ));
        assert!(matches!(
            parse_fields("abc,def", ',', 0, 1),
            Err(DeviceError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_lifecycle() {
        let mock = MockTransport::new();
        let mut ch = channel(&mock, None);

        assert!(!ch.is_open());
        assert!(matches!(ch.read(), Err(DeviceError::NotOpen(_))));
        ch.open().unwrap();
        ch.open().unwrap();
        assert!(ch.is_open());
        ch.close();
        ch.close();
        assert!(!ch.is_open());
    }

    #[test]
    fn test_read_streaming_line() {
        let mock = MockTransport::new();
        mock.inject_read(b"198.0,175.5\r\n");
        let mut ch = channel(&mock, None);
        ch.open().unwrap();

        let sample = ch.read().unwrap().unwrap();
        assert_eq!((sample.bt, sample.et), (198.0, 175.5));
        assert!(mock.get_written().is_empty());
    }

    #[test]
    fn test_read_polled_line() {
        let mock = MockTransport::new();
        mock.inject_read(b"stale,garbage\n");
        mock.queue_response(b"210.0,190.0\n");
        let mut ch = channel(&mock, Some("READ\n"));
        ch.open().unwrap();

        let sample = ch.read().unwrap().unwrap();
        assert_eq!((sample.bt, sample.et), (210.0, 190.0));
        assert_eq!(mock.get_written(), b"READ\n");
    }

    #[test]
    fn test_silence_is_timeout() {
        let mock = MockTransport::new();
        let mut ch = channel(&mock, None);
        ch.open().unwrap();
        assert!(matches!(ch.read(), Err(DeviceError::Timeout)));
    }
}
