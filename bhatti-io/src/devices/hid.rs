//! Report-response HID thermometer
//!
//! Each read writes a 4-byte command report and waits for a 64-byte answer:
//!
//! ```text
//! byte  0..9   vendor status (ignored)
//! byte  9..11  BT, little-endian, tenths of a degree
//! byte 11..13  ET, little-endian, tenths of a degree
//! byte 13..64  padding
//! ```

use crate::config::HidConfig;
use crate::core::{Channel, Sample};
use crate::error::{DeviceError, DeviceResult};
use hidapi::{HidApi, HidDevice};

/// Command report sent when the config does not override it
pub const DEFAULT_COMMAND: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Response buffer size
pub const REPORT_LEN: usize = 64;

/// Shortest response carrying both temperatures
pub const MIN_REPORT_LEN: usize = 13;

const BT_OFFSET: usize = 9;
const ET_OFFSET: usize = 11;

/// Report I/O on an opened device
pub trait ReportDevice: Send {
    /// Write one output report
    fn write_report(&mut self, data: &[u8]) -> DeviceResult<usize>;

    /// Read one input report, waiting at most `timeout_ms`; 0 bytes on timeout
    fn read_report(&mut self, buf: &mut [u8], timeout_ms: i32) -> DeviceResult<usize>;
}

impl ReportDevice for HidDevice {
    fn write_report(&mut self, data: &[u8]) -> DeviceResult<usize> {
        Ok(self.write(data)?)
    }

    fn read_report(&mut self, buf: &mut [u8], timeout_ms: i32) -> DeviceResult<usize> {
        Ok(self.read_timeout(buf, timeout_ms)?)
    }
}

/// Finds and opens the device for a vendor/product pair
pub type ReportOpener = Box<dyn Fn(u16, u16) -> DeviceResult<Box<dyn ReportDevice>> + Send>;

/// Open the first attached device matching `vendor_id`/`product_id`
pub fn open_first(vendor_id: u16, product_id: u16) -> DeviceResult<Box<dyn ReportDevice>> {
    let api = HidApi::new()?;
    let info = api
        .device_list()
        .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
        .ok_or_else(|| {
            DeviceError::open(format!(
                "no HID device {:04x}:{:04x} attached",
                vendor_id, product_id
            ))
        })?;

    let device = info.open_device(&api).map_err(|e| {
        DeviceError::open_with(
            format!("cannot open HID device {:04x}:{:04x}", vendor_id, product_id),
            e,
        )
    })?;
    log::info!(
        "Opened HID device {:04x}:{:04x} ({})",
        vendor_id,
        product_id,
        info.product_string().unwrap_or("unknown")
    );
    Ok(Box::new(device))
}

/// Decode `(bt, et)` from a response report
pub fn decode_report(report: &[u8]) -> DeviceResult<(f64, f64)> {
    if report.len() < MIN_REPORT_LEN {
        return Err(DeviceError::ShortResponse {
            expected: MIN_REPORT_LEN,
            actual: report.len(),
        });
    }
    let tenths =
        |offset: usize| u16::from_le_bytes([report[offset], report[offset + 1]]) as f64 / 10.0;
    Ok((tenths(BT_OFFSET), tenths(ET_OFFSET)))
}

pub struct HidChannel {
    vendor_id: u16,
    product_id: u16,
    command: [u8; 4],
    read_timeout_ms: i32,
    opener: ReportOpener,
    device: Option<Box<dyn ReportDevice>>,
}

impl HidChannel {
    pub fn new(config: &HidConfig) -> Self {
        Self::with_opener(config, Box::new(open_first))
    }

    /// Channel with a custom device opener (tests)
    pub fn with_opener(config: &HidConfig, opener: ReportOpener) -> Self {
        Self {
            vendor_id: config.vendor_id,
            product_id: config.product_id,
            command: config.command.unwrap_or(DEFAULT_COMMAND),
            read_timeout_ms: i32::try_from(config.read_timeout_ms).unwrap_or(i32::MAX),
            opener,
            device: None,
        }
    }
}

impl Channel for HidChannel {
    fn open(&mut self) -> DeviceResult<()> {
        if self.device.is_none() {
            self.device = Some((self.opener)(self.vendor_id, self.product_id)?);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            log::info!(
                "Closed HID device {:04x}:{:04x}",
                self.vendor_id,
                self.product_id
            );
        }
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn read(&mut self) -> DeviceResult<Option<Sample>> {
        let device = self.device.as_mut().ok_or_else(|| {
            DeviceError::NotOpen(format!("HID {:04x}:{:04x}", self.vendor_id, self.product_id))
        })?;

        device.write_report(&self.command)?;

        let mut report = [0u8; REPORT_LEN];
        let n = device.read_report(&mut report, self.read_timeout_ms)?;
        if n == 0 {
            return Err(DeviceError::Timeout);
        }
        log::trace!("HID report ({} bytes): {:02x?}", n, &report[..n]);

        let (bt, et) = decode_report(&report[..n])?;
        Ok(Some(Sample::new(bt, et)))
    }

    fn description(&self) -> String {
        format!(
            "HID {:04x}:{:04x} ({})",
            self.vendor_id,
            self.product_id,
            if self.is_open() { "open" } else { "closed" }
        )
    }
}
