//! Front-end on a Linux host: `gpio-cdev` lines plus a spidev bus.

use crate::config::DeviceConfig;
use crate::controller::{Controller, ControllerError};
use crate::gpio::cdev::CdevBackend;
use crate::gpio::{GpioController, ThreadDelay};
use crate::transport::spidev::SpidevBus;
use crate::transport::TransportError;
use log::error;

/// Controller over the real hardware.
pub type LinuxController = Controller<CdevBackend, SpidevBus, ThreadDelay>;

/// Open the bus and acquire the GPIO lines named in `config`.
pub fn open(config: &DeviceConfig) -> Result<LinuxController, ControllerError> {
    let bus = SpidevBus::open(&config.spi_device, config.spi_speed_hz).map_err(|e| {
        error!("Failed opening {}: {}", config.spi_device, e);
        ControllerError::Transport(TransportError::Bus(e))
    })?;

    let gpio = GpioController::new(CdevBackend, ThreadDelay);
    let mut controller = Controller::with_parts(gpio, bus, config.crc_policy);
    controller.initialize(&config.gpio_chip)?;
    Ok(controller)
}
