//! Channel over the reconnecting duplex transport
//!
//! The transport's reader worker parses inbound frames and parks the newest
//! sample; `read()` hands that sample out. Connection drops are invisible to
//! the channel except as missing or stale data.

use super::serial_line::parse_fields;
use crate::config::{DuplexConfig, DuplexProtocolKind};
use crate::core::{Channel, Sample, now_ms};
use crate::error::{DeviceError, DeviceResult};
use crate::transport::duplex::{
    DuplexOptions, DuplexTransport, NoopProtocol, StreamProtocol, is_timeout,
};
use parking_lot::Mutex;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Newest sample produced by a protocol hook
pub type LatestSample = Arc<Mutex<Option<Sample>>>;

/// Longest accepted line before the buffer is discarded
const MAX_LINE_LEN: usize = 256;

/// Parses `bt,et` text lines into samples
pub struct LineProtocol {
    latest: LatestSample,
    delimiter: char,
    bt_field: usize,
    et_field: usize,
    line: Vec<u8>,
}

impl LineProtocol {
    /// Comma-separated, BT first
    pub fn new(latest: LatestSample) -> Self {
        Self::with_fields(latest, ',', 0, 1)
    }

    pub fn with_fields(
        latest: LatestSample,
        delimiter: char,
        bt_field: usize,
        et_field: usize,
    ) -> Self {
        Self {
            latest,
            delimiter,
            bt_field,
            et_field,
            line: Vec::with_capacity(MAX_LINE_LEN),
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match byte {
                b'\n' => {
                    let text = String::from_utf8_lossy(&self.line);
                    let text = text.trim_end_matches('\r');
                    match parse_fields(text, self.delimiter, self.bt_field, self.et_field) {
                        Ok((bt, et)) => *self.latest.lock() = Some(Sample::new(bt, et)),
                        Err(e) => log::debug!("Ignoring line {:?}: {}", text, e),
                    }
                    self.line.clear();
                }
                _ if self.line.len() >= MAX_LINE_LEN => {
                    log::debug!("Dropping {} bytes without line end", self.line.len());
                    self.line.clear();
                }
                _ => self.line.push(byte),
            }
        }
    }
}

impl StreamProtocol for LineProtocol {
    fn read_stream(&mut self, reader: &mut dyn Read, alive: &AtomicBool) -> io::Result<()> {
        // A partial line from a previous connection is meaningless
        self.line.clear();

        let mut buf = [0u8; 256];
        while alive.load(Ordering::Relaxed) {
            match reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => self.feed(&buf[..n]),
                Err(ref e) if is_timeout(e) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

pub struct DuplexChannel {
    transport: DuplexTransport,
    latest: LatestSample,
    poll_command: Option<Vec<u8>>,
    stale_after: Duration,
}

impl DuplexChannel {
    pub fn new(config: &DuplexConfig) -> Self {
        let latest = LatestSample::default();
        let protocol: Box<dyn StreamProtocol> = match config.protocol {
            DuplexProtocolKind::Noop => Box::new(NoopProtocol),
            DuplexProtocolKind::Line => Box::new(LineProtocol::new(Arc::clone(&latest))),
        };
        Self::with_protocol(config, protocol, latest)
    }

    /// Channel driven by a custom protocol hook writing into `latest`
    pub fn with_protocol(
        config: &DuplexConfig,
        protocol: Box<dyn StreamProtocol>,
        latest: LatestSample,
    ) -> Self {
        let options = DuplexOptions {
            backoff: Duration::from_millis(config.backoff_ms),
            queue_capacity: config.queue_capacity,
        };
        Self {
            transport: DuplexTransport::new(config.endpoint.clone(), protocol, options),
            latest,
            poll_command: config.poll_command.as_ref().map(|c| c.as_bytes().to_vec()),
            stale_after: Duration::from_millis(config.stale_after_ms),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}

impl Channel for DuplexChannel {
    /// Starts the reconnect loop; an unreachable peer is not an open failure
    fn open(&mut self) -> DeviceResult<()> {
        self.transport.start().map_err(|e| {
            let message = format!("cannot start transport for {}", self.transport.label());
            DeviceError::open_with(message, e)
        })
    }

    fn close(&mut self) {
        self.transport.stop();
        *self.latest.lock() = None;
    }

    fn is_open(&self) -> bool {
        self.transport.is_running()
    }

    fn read(&mut self) -> DeviceResult<Option<Sample>> {
        if !self.transport.is_running() {
            return Err(DeviceError::NotOpen(self.transport.label().to_string()));
        }

        if let Some(command) = &self.poll_command {
            if self.transport.is_connected() {
                self.transport.send(command.clone())?;
            }
        }

        let sample = (*self.latest.lock()).ok_or_else(|| {
            DeviceError::NoData(format!("nothing received from {}", self.transport.label()))
        })?;

        let age_ms = now_ms().saturating_sub(sample.timestamp_ms);
        if age_ms > self.stale_after.as_millis() as u64 {
            return Err(DeviceError::NoData(format!(
                "last sample from {} is {} ms old",
                self.transport.label(),
                age_ms
            )));
        }
        Ok(Some(sample))
    }

    fn description(&self) -> String {
        let state = if !self.transport.is_running() {
            "closed"
        } else if self.transport.is_connected() {
            "connected"
        } else {
            "reconnecting"
        };
        format!("Duplex {} ({})", self.transport.label(), state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplexEndpoint;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    fn config(listener: &TcpListener, poll: Option<&str>) -> DuplexConfig {
        DuplexConfig {
            endpoint: DuplexEndpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: listener.local_addr().unwrap().port(),
            },
            protocol: DuplexProtocolKind::Line,
            poll_command: poll.map(str::to_string),
            backoff_ms: 50,
            queue_capacity: 8,
            stale_after_ms: 5000,
        }
    }

    fn read_within(ch: &mut DuplexChannel, timeout: Duration) -> DeviceResult<Option<Sample>> {
        let deadline = Instant::now() + timeout;
        loop {
            match ch.read() {
                Err(DeviceError::NoData(_)) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(20));
                }
                other => return other,
            }
        }
    }

    #[test]
    fn test_line_protocol_parses_lines() {
        let latest = LatestSample::default();
        let mut protocol = LineProtocol::new(Arc::clone(&latest));

        protocol.feed(b"201.5,18");
        assert!(latest.lock().is_none());
        protocol.feed(b"0.0\r\nnoise\n");
        let sample = latest.lock().unwrap();
        assert_eq!((sample.bt, sample.et), (201.5, 180.0));
    }

    #[test]
    fn test_streamed_samples() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut ch = DuplexChannel::new(&config(&listener, None));

        assert!(!ch.is_open());
        assert!(matches!(ch.read(), Err(DeviceError::NotOpen(_))));
        ch.open().unwrap();
        ch.open().unwrap();
        assert!(ch.is_open());

        let (mut stream, _) = listener.accept().unwrap();
        assert!(matches!(ch.read(), Err(DeviceError::NoData(_))));

        stream.write_all(b"195.5,170.25\n").unwrap();
        let sample = read_within(&mut ch, Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!((sample.bt, sample.et), (195.5, 170.25));

        ch.close();
        ch.close();
        assert!(!ch.is_open());
    }

    #[test]
    fn test_poll_command_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut ch = DuplexChannel::new(&config(&listener, Some("READ\n")));
        ch.open().unwrap();

        let (stream, _) = listener.accept().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !ch.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        // No reply yet, but the poll goes out
        assert!(matches!(ch.read(), Err(DeviceError::NoData(_))));
        let mut lines = BufReader::new(stream.try_clone().unwrap()).lines();
        assert_eq!(lines.next().unwrap().unwrap(), "READ");

        (&stream).write_all(b"210.0,190.0\n").unwrap();
        let sample = read_within(&mut ch, Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!((sample.bt, sample.et), (210.0, 190.0));
        ch.close();
    }

    #[test]
    fn test_stale_sample_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut cfg = config(&listener, None);
        cfg.stale_after_ms = 1000;
        let latest = LatestSample::default();
        let mut ch =
            DuplexChannel::with_protocol(&cfg, Box::new(NoopProtocol), Arc::clone(&latest));
        ch.open().unwrap();

        *latest.lock() = Some(Sample::at(100.0, 80.0, now_ms() - 5000));
        assert!(matches!(ch.read(), Err(DeviceError::NoData(_))));

        *latest.lock() = Some(Sample::new(100.0, 80.0));
        assert!(ch.read().unwrap().is_some());
        ch.close();
        assert!(latest.lock().is_none());
    }
}
