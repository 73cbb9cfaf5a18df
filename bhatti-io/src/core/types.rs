//! Core data types shared by every channel.

use serde::{Deserialize, Serialize};

/// One temperature reading
///
/// Constructed fresh per read. `NaN` on either axis means the device did not
/// measure that axis this tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Bean temperature (°C)
    pub bt: f64,
    /// Environment temperature (°C)
    pub et: f64,
    /// Epoch milliseconds at read time
    pub timestamp_ms: u64,
}

impl Sample {
    /// Create a sample stamped with the current time
    pub fn new(bt: f64, et: f64) -> Self {
        Self::at(bt, et, now_ms())
    }

    /// Create a sample with an explicit timestamp
    pub const fn at(bt: f64, et: f64, timestamp_ms: u64) -> Self {
        Self { bt, et, timestamp_ms }
    }

    /// Sample with neither axis measured
    pub fn unavailable() -> Self {
        Self::new(f64::NAN, f64::NAN)
    }

    /// Whether BT was measured
    #[inline]
    pub fn has_bt(&self) -> bool {
        !self.bt.is_nan()
    }

    /// Whether ET was measured
    #[inline]
    pub fn has_et(&self) -> bool {
        !self.et.is_nan()
    }
}

/// Current wall-clock time in epoch milliseconds
#[inline]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
