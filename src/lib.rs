//! Heart rate from Xiaomi Mi Band wearables over Bluetooth LE.
//!
//! A [`device::Device`] owns one band session: it authenticates, runs the
//! heart rate and battery monitors and publishes every change on a
//! [`signal::SignalBus`]. Sinks in [`output`] and the [`pulse`] synthesizer
//! subscribe to that bus.

pub mod auth;
pub mod battery;
pub mod ble;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod fake;
pub mod heartrate;
pub mod output;
pub mod protocol;
pub mod pulse;
pub mod signal;
pub mod transport;

pub use device::{Device, HeartrateDevice, Variant};
pub use error::{BandError, Result};
