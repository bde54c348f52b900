//! Control path for the Malahit SDR's STM front-end MCU.
//!
//! The front-end sits on a SPI bus with a reset output and a busy input.
//! This library contains the platform-independent layers, all testable on
//! the host against the simulated device in [`sim`]:
//!
//! - [`gpio`]: reset pulse and busy-line readiness
//! - [`frame`]: frame layouts and the CRC-16 trailer
//! - [`transport`]: serialized, checksummed exchanges
//! - [`controller`]: status, LEDs, radio parameters, firmware transfer
//! - [`radio`]: logical radio state kept in step with the device
//! - [`config`]: where the device is wired
//!
//! The Linux backends (`gpio-cdev`, `spidev`) are behind the `linux` feature.

pub mod config;
pub mod controller;
pub mod frame;
pub mod gpio;
#[cfg(feature = "linux")]
pub mod linux;
pub mod radio;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod transport;

pub use config::{ConfigError, DeviceConfig};
pub use controller::{
    find_latest_firmware, firmware_version_from_name, Controller, ControllerError, InstallOutcome,
};
pub use frame::{StatusFrame, Switches};
pub use gpio::{GpioController, GpioError};
pub use radio::{RadioControl, RadioParameters, RadioState, Tuner};
pub use transport::{CrcPolicy, Transport, TransportError};
