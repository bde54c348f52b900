//! SPI bus on Linux `spidev`.

use super::SpiBus;
use log::info;
use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use std::io;

/// Clock rate the front-end runs at.
pub const DEFAULT_SPI_SPEED_HZ: u32 = 10_000_000;

/// An opened and configured spidev node.
pub struct SpidevBus {
    device: Spidev,
}

impl SpidevBus {
    /// Open `path` in mode 0, 8-bit words, at `speed_hz`.
    pub fn open(path: &str, speed_hz: u32) -> io::Result<Self> {
        let mut device = Spidev::open(path)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        device.configure(&options)?;
        info!("Opened {} at {} kHz", path, speed_hz / 1000);
        Ok(Self { device })
    }
}

impl SpiBus for SpidevBus {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        let mut transfer = SpidevTransfer::read_write(tx, rx);
        self.device.transfer(&mut transfer)
    }
}
