//! Mock transport for testing

use super::Transport;
use crate::error::{DeviceError, DeviceResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Mock transport for unit testing
///
/// Clones share the same buffers, so a test can keep one handle while the
/// channel under test owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Default)]
struct MockTransportInner {
    read_buffer: VecDeque<u8>,
    write_buffer: Vec<u8>,
    /// Bytes queued for delivery once the next write happens
    responses: VecDeque<Vec<u8>>,
    fail_reads: bool,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject data to be read
    pub fn inject_read(&self, data: &[u8]) {
        self.inner.lock().read_buffer.extend(data);
    }

    /// Queue a response released by the next write (request/response devices)
    pub fn queue_response(&self, data: &[u8]) {
        self.inner.lock().responses.push_back(data.to_vec());
    }

    /// Make every subsequent read fail with an I/O error
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    /// Get all written data
    pub fn get_written(&self) -> Vec<u8> {
        self.inner.lock().write_buffer.clone()
    }

    /// Bytes still waiting to be read
    pub fn pending_read(&self) -> usize {
        self.inner.lock().read_buffer.len()
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buffer: &mut [u8]) -> DeviceResult<usize> {
        let mut inner = self.inner.lock();
        if inner.fail_reads {
            return Err(DeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock read failure",
            )));
        }

        let available = inner.read_buffer.len().min(buffer.len());
        for (slot, byte) in buffer
            .iter_mut()
            .zip(inner.read_buffer.drain(..available))
        {
            *slot = byte;
        }
        Ok(available)
    }

    fn write(&mut self, data: &[u8]) -> DeviceResult<usize> {
        let mut inner = self.inner.lock();
        inner.write_buffer.extend_from_slice(data);
        if let Some(response) = inner.responses.pop_front() {
            inner.read_buffer.extend(response);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn available(&mut self) -> DeviceResult<usize> {
        Ok(self.inner.lock().read_buffer.len())
    }

    fn clear_input(&mut self) -> DeviceResult<()> {
        self.inner.lock().read_buffer.clear();
        Ok(())
    }
}
