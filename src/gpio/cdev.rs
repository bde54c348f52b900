//! GPIO backend on the Linux character device (`/dev/gpiochipN`).

use super::{GpioBackend, GpioChip, GpioLine, InputLine, OutputLine};
use gpio_cdev::{Chip, Line, LineHandle, LineRequestFlags};
use std::io;
use std::path::PathBuf;

fn to_io(e: gpio_cdev::Error) -> io::Error {
    io::Error::other(e.to_string())
}

/// Resolve a chip name (`gpiochip0`) or path (`/dev/gpiochip0`).
pub fn chip_path(name: &str) -> PathBuf {
    if name.contains('/') {
        PathBuf::from(name)
    } else {
        PathBuf::from("/dev").join(name)
    }
}

/// Backend opening chips through `gpio-cdev`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CdevBackend;

impl GpioBackend for CdevBackend {
    type Chip = CdevChip;

    fn open_chip(&self, name: &str) -> io::Result<CdevChip> {
        Chip::new(chip_path(name)).map(CdevChip).map_err(to_io)
    }
}

pub struct CdevChip(Chip);

impl GpioChip for CdevChip {
    type Line = CdevLine;

    fn line(&mut self, offset: u32) -> io::Result<CdevLine> {
        self.0.get_line(offset).map(CdevLine).map_err(to_io)
    }
}

pub struct CdevLine(Line);

impl GpioLine for CdevLine {
    type Output = CdevHandle;
    type Input = CdevHandle;

    fn into_output(self, consumer: &str, default: bool) -> io::Result<CdevHandle> {
        self.0
            .request(LineRequestFlags::OUTPUT, default as u8, consumer)
            .map(CdevHandle)
            .map_err(to_io)
    }

    fn into_input(self, consumer: &str) -> io::Result<CdevHandle> {
        self.0
            .request(LineRequestFlags::INPUT, 0, consumer)
            .map(CdevHandle)
            .map_err(to_io)
    }
}

/// A requested line.
pub struct CdevHandle(LineHandle);

impl OutputLine for CdevHandle {
    fn set(&self, high: bool) -> io::Result<()> {
        self.0.set_value(high as u8).map_err(to_io)
    }
}

impl InputLine for CdevHandle {
    fn is_high(&self) -> io::Result<bool> {
        self.0.get_value().map(|v| v != 0).map_err(to_io)
    }
}
