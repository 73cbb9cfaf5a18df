//! In-memory register bank for testing

use super::RegisterTransport;
use crate::error::{TransportError, TransportResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Register map standing in for a Modbus slave
///
/// Clones share state, so a test keeps one handle while the channel owns
/// another. Holding and input registers are separate tables.
#[derive(Clone, Default)]
pub struct MockRegisters {
    inner: Arc<Mutex<MockRegistersInner>>,
}

#[derive(Default)]
struct MockRegistersInner {
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
    connected: bool,
    refuse_connect: bool,
    fail_reads: bool,
    reads: usize,
    /// (unit, start, count) of the last read
    last_read: Option<(u8, u16, u16)>,
}

impl MockRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_holding(&self, address: u16, value: u16) {
        self.inner.lock().holding.insert(address, value);
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.inner.lock().input.insert(address, value);
    }

    /// Make `connect` fail
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.inner.lock().refuse_connect = refuse;
    }

    /// Make every read fail with an I/O error
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    /// Number of read requests served
    pub fn read_count(&self) -> usize {
        self.inner.lock().reads
    }

    pub fn last_read(&self) -> Option<(u8, u16, u16)> {
        self.inner.lock().last_read
    }

    fn read(&self, input: bool, unit: u8, start: u16, count: u16) -> TransportResult<Vec<u16>> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        inner.reads += 1;
        inner.last_read = Some((unit, start, count));
        if inner.fail_reads {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "mock read failure",
            )));
        }

        let table = if input { &inner.input } else { &inner.holding };
        (start..start.saturating_add(count))
            .map(|address| {
                table.get(&address).copied().ok_or(TransportError::Exception {
                    function: if input { 0x04 } else { 0x03 },
                    code: format!("illegal data address {}", address),
                })
            })
            .collect()
    }
}

impl RegisterTransport for MockRegisters {
    fn connect(&mut self) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        if inner.refuse_connect {
            return Err(TransportError::Connect {
                target: "mock".to_string(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )),
            });
        }
        inner.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.inner.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    fn read_holding_registers(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        self.read(false, unit, start, count)
    }

    fn read_input_registers(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        self.read(true, unit, start, count)
    }

    fn write_single_register(
        &mut self,
        _unit: u8,
        address: u16,
        value: u16,
    ) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        inner.holding.insert(address, value);
        Ok(())
    }

    fn description(&self) -> String {
        "mock://registers".to_string()
    }
}
