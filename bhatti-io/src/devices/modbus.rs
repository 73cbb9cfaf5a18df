//! Modbus register channel
//!
//! BT and ET live in two registers of one slave. Both are fetched in a
//! single request spanning `min(bt, et)..=max(bt, et)`, whatever their order,
//! and scaled to engineering units.

use crate::config::{ModbusConfig, RegisterKind};
use crate::core::{Channel, Sample};
use crate::error::{DeviceError, DeviceResult};
use crate::register::{RegisterMaster, RegisterTransport, pdu};
use std::time::Duration;

/// Physically plausible roaster temperatures (°C)
pub const ROASTER_RANGE: [f64; 2] = [-50.0, 500.0];

/// Replaces implausible readings with the last plausible one per axis
#[derive(Debug, Clone)]
struct PlausibilityGuard {
    min: f64,
    max: f64,
    last_bt: f64,
    last_et: f64,
}

impl PlausibilityGuard {
    fn new([min, max]: [f64; 2]) -> Self {
        Self {
            min,
            max,
            last_bt: f64::NAN,
            last_et: f64::NAN,
        }
    }

    fn filter(&mut self, bt: f64, et: f64) -> (f64, f64) {
        let (min, max) = (self.min, self.max);
        let check = |axis: &str, value: f64, last: &mut f64| {
            if (min..=max).contains(&value) {
                *last = value;
                value
            } else {
                log::debug!(
                    "{} {} outside {}..{}, keeping last good {}",
                    axis,
                    value,
                    min,
                    max,
                    last
                );
                *last
            }
        };
        let bt = check("BT", bt, &mut self.last_bt);
        let et = check("ET", et, &mut self.last_et);
        (bt, et)
    }
}

/// Register span covering both addresses: `(start, count)`
pub fn register_span(bt_register: u16, et_register: u16) -> (u16, u16) {
    let start = bt_register.min(et_register);
    let count = bt_register.abs_diff(et_register).saturating_add(1);
    (start, count)
}

/// Channel reading BT/ET registers through a [`RegisterTransport`]
pub struct ModbusChannel {
    master: Box<dyn RegisterTransport>,
    unit_id: u8,
    bt_register: u16,
    et_register: u16,
    register_kind: RegisterKind,
    scale: f64,
    guard: Option<PlausibilityGuard>,
}

impl ModbusChannel {
    /// Channel over a [`RegisterMaster`] built from the config
    pub fn new(config: &ModbusConfig) -> Self {
        let master = RegisterMaster::new(
            config.connection.clone(),
            Duration::from_millis(config.timeout_ms),
        );
        Self::with_transport(config, Box::new(master))
    }

    /// Channel over any register transport
    pub fn with_transport(config: &ModbusConfig, master: Box<dyn RegisterTransport>) -> Self {
        Self {
            master,
            unit_id: config.unit_id,
            bt_register: config.bt_register,
            et_register: config.et_register,
            register_kind: config.register_kind,
            scale: config.scale,
            guard: config.plausible_range.map(PlausibilityGuard::new),
        }
    }

    /// Roaster preset: out-of-range readings are treated as register glitches
    /// and replaced by the last good value (NaN until one has been seen)
    pub fn roaster(config: &ModbusConfig) -> Self {
        let mut channel = Self::new(config);
        channel.guard = Some(PlausibilityGuard::new(
            config.plausible_range.unwrap_or(ROASTER_RANGE),
        ));
        channel
    }

    fn read_span(&mut self, start: u16, count: u16) -> DeviceResult<Vec<u16>> {
        let registers = match self.register_kind {
            RegisterKind::Holding => self.master.read_holding_registers(self.unit_id, start, count)?,
            RegisterKind::Input => self.master.read_input_registers(self.unit_id, start, count)?,
        };
        if registers.len() < count as usize {
            return Err(DeviceError::ShortResponse {
                expected: count as usize * 2,
                actual: registers.len() * 2,
            });
        }
        Ok(registers)
    }
}

impl Channel for ModbusChannel {
    fn open(&mut self) -> DeviceResult<()> {
        let (_, count) = register_span(self.bt_register, self.et_register);
        if count > pdu::MAX_READ_COUNT {
            return Err(DeviceError::Config(format!(
                "BT register {} and ET register {} are more than {} apart",
                self.bt_register,
                self.et_register,
                pdu::MAX_READ_COUNT - 1
            )));
        }
        self.master.connect().map_err(|e| {
            DeviceError::open_with(format!("cannot connect to {}", self.master.description()), e)
        })
    }

    fn close(&mut self) {
        self.master.disconnect();
    }

    fn is_open(&self) -> bool {
        self.master.is_connected()
    }

    fn read(&mut self) -> DeviceResult<Option<Sample>> {
        if !self.master.is_connected() {
            return Err(DeviceError::NotOpen(self.master.description()));
        }

        let (start, count) = register_span(self.bt_register, self.et_register);
        let registers = self.read_span(start, count)?;
        let raw_bt = registers[(self.bt_register - start) as usize];
        let raw_et = registers[(self.et_register - start) as usize];
        log::trace!("Registers BT={} ET={} (raw)", raw_bt, raw_et);

        let mut bt = raw_bt as f64 * self.scale;
        let mut et = raw_et as f64 * self.scale;
        if let Some(guard) = self.guard.as_mut() {
            (bt, et) = guard.filter(bt, et);
        }
        Ok(Some(Sample::new(bt, et)))
    }

    fn description(&self) -> String {
        format!(
            "Modbus {} unit {} ({})",
            self.master.description(),
            self.unit_id,
            if self.is_open() { "connected" } else { "disconnected" }
        )
    }
}
