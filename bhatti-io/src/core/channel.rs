//! Channel trait definition

use crate::core::types::Sample;
use crate::error::{DeviceError, DeviceResult};
use parking_lot::Mutex;
use std::sync::Arc;

/// Device channel: one transport, one native handle
///
/// Implementations must uphold:
/// - `is_open()` is false after construction and after `close()`
/// - `open()` on an open channel is a no-op
/// - `close()` never fails, can be called repeatedly, and always drops the handle
/// - `read()` on a closed channel fails with [`DeviceError::NotOpen`]
pub trait Channel: Send {
    /// Acquire the native handle
    ///
    /// Fails if the hardware is unreachable or misconfigured. No retry happens here.
    fn open(&mut self) -> DeviceResult<()>;

    /// Release the native handle
    fn close(&mut self);

    /// Whether the native handle is held
    fn is_open(&self) -> bool;

    /// Take one reading
    ///
    /// Blocks for at most the transport's timeout. `Ok(None)` means the device
    /// produced nothing usable this call without anything being wrong (e.g. a
    /// frame aborted mid-header); it is neither a success nor a failure.
    fn read(&mut self) -> DeviceResult<Option<Sample>>;

    /// Human-readable status line
    fn description(&self) -> String;
}

/// Channel shared between its owner and the sampler thread
pub type SharedChannel = Arc<Mutex<Box<dyn Channel>>>;

/// Wrap a channel for sharing with a [`crate::sampler::Sampler`]
pub fn shared(channel: Box<dyn Channel>) -> SharedChannel {
    Arc::new(Mutex::new(channel))
}

/// No-op channel
///
/// Opens without hardware and reports NaN on both axes. Used when no device
/// is selected so the rest of the session can run.
#[derive(Debug, Default)]
pub struct NullChannel {
    open: bool,
}

impl NullChannel {
    /// Create a closed null channel
    pub fn new() -> Self {
        Self::default()
    }
}

impl Channel for NullChannel {
    fn open(&mut self) -> DeviceResult<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self) -> DeviceResult<Option<Sample>> {
        if !self.open {
            return Err(DeviceError::NotOpen("null channel".to_string()));
        }
        Ok(Some(Sample::unavailable()))
    }

    fn description(&self) -> String {
        format!("No device ({})", if self.open { "open" } else { "closed" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_channel_lifecycle() {
        let mut channel = NullChannel::new();
        assert!(!channel.is_open());
        assert!(matches!(channel.read(), Err(DeviceError::NotOpen(_))));

        channel.open().unwrap();
        channel.open().unwrap();
        assert!(channel.is_open());

        let sample = channel.read().unwrap().unwrap();
        assert!(!sample.has_bt());
        assert!(!sample.has_et());

        channel.close();
        channel.close();
        assert!(!channel.is_open());
    }
}
