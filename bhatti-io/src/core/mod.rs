//! Core abstractions for device channels.
//!
//! - [`channel::Channel`]: Trait to implement for new hardware
//! - [`types`]: The [`types::Sample`] reading handed to consumers
//! - [`worker`]: Named background threads with a bounded join

pub mod channel;
pub mod types;
pub mod worker;

pub use channel::{Channel, NullChannel, SharedChannel, shared};
pub use types::{Sample, now_ms};
pub use worker::Worker;
