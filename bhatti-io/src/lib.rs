//! BhattiIO - Device communication and sampling for roast logging
//!
//! This library reads bean (BT) and environment (ET) temperatures from
//! roaster hardware and polls them on a fixed schedule.
//!
//! ## Layout
//!
//! - [`core`]: the [`Channel`] contract and the [`Sample`] reading
//! - [`transport`]: byte transports, the serial session helper and the
//!   reconnecting duplex transport
//! - [`register`]: Modbus master over TCP, RTU, ASCII or UDP
//! - [`devices`]: channel implementations and the [`ChannelRegistry`]
//! - [`sampler`]: the polling scheduler with failure escalation

pub mod config;
pub mod core;
pub mod devices;
pub mod error;
pub mod register;
pub mod sampler;
pub mod transport;

// Re-export commonly used types
pub use config::AppConfig;
pub use core::{Channel, NullChannel, Sample, SharedChannel, shared};
pub use devices::ChannelRegistry;
pub use error::{DeviceError, Error, Result, TransportError};
pub use sampler::{Sampler, SamplerEvent};
