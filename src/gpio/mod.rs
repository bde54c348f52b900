//! Reset and busy lines of the STM front-end.
//!
//! The controller holds one GPIO chip with two lines:
//!
//! | Line | Offset | Direction | Meaning |
//! |------|--------|-----------|---------|
//! | RESET | 25 | output, default low | active-high reset |
//! | BUSY | 5 | input | high while the device cannot take a command |
//!
//! Hardware access goes through the [`GpioBackend`] traits so the controller
//! is host-testable; the Linux character-device backend lives in [`cdev`]
//! (feature `linux`).

#[cfg(feature = "linux")]
pub mod cdev;

use log::{debug, error, info};
use std::fmt;
use std::io;
use std::time::Duration;

/// Line offset of the reset output.
pub const RESET_LINE: u32 = 25;

/// Line offset of the busy input.
pub const BUSY_LINE: u32 = 5;

/// Consumer label attached to requested lines.
pub const CONSUMER: &str = "malahit-frontend";

/// Reset held high before the pulse (ms).
pub const RESET_HIGH_MS: u64 = 50;
/// Reset pulse width, held low (ms).
pub const RESET_LOW_MS: u64 = 50;
/// Settle time after releasing reset (ms).
pub const RESET_SETTLE_MS: u64 = 15;

/// Interval between busy-line polls (ms).
pub const READY_POLL_INTERVAL_MS: u64 = 1;
/// Busy-line polls before giving up (about 10 s).
pub const READY_POLL_BUDGET: u32 = 10_000;

/// Blocking sleep used for protocol hold times.
///
/// Durations are minimums the device depends on, never hints.
pub trait Delay: Send + Sync {
    fn delay_ms(&self, ms: u64);
}

/// [`Delay`] backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Opens GPIO chips by name.
pub trait GpioBackend {
    type Chip: GpioChip;

    fn open_chip(&self, name: &str) -> io::Result<Self::Chip>;
}

/// An open GPIO chip.
pub trait GpioChip {
    type Line: GpioLine;

    /// Acquire the line at `offset` without configuring it.
    fn line(&mut self, offset: u32) -> io::Result<Self::Line>;
}

/// An acquired but unconfigured line.
pub trait GpioLine {
    type Output: OutputLine;
    type Input: InputLine;

    fn into_output(self, consumer: &str, default: bool) -> io::Result<Self::Output>;
    fn into_input(self, consumer: &str) -> io::Result<Self::Input>;
}

/// A line configured as output.
pub trait OutputLine: Send + Sync {
    fn set(&self, high: bool) -> io::Result<()>;
}

/// A line configured as input.
pub trait InputLine: Send + Sync {
    fn is_high(&self) -> io::Result<bool>;
}

type OutputOf<B> = <<<B as GpioBackend>::Chip as GpioChip>::Line as GpioLine>::Output;
type InputOf<B> = <<<B as GpioBackend>::Chip as GpioChip>::Line as GpioLine>::Input;

/// GPIO errors.
#[derive(Debug)]
pub enum GpioError {
    /// The chip could not be opened.
    ChipOpen { chip: String, source: io::Error },
    /// The reset line could not be acquired.
    ResetAcquire(io::Error),
    /// The reset line could not be configured as output.
    ResetDirection(io::Error),
    /// The busy line could not be acquired.
    BusyAcquire(io::Error),
    /// The busy line could not be configured as input.
    BusyDirection(io::Error),
    /// No chip is held.
    NotInitialized,
    /// Device stayed busy for the whole poll budget.
    ReadyTimeout { polls: u32 },
    /// Reading or driving a line failed.
    Line(io::Error),
}

impl fmt::Display for GpioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChipOpen { chip, source } => {
                write!(f, "failed opening GPIO chip '{}': {}", chip, source)
            }
            Self::ResetAcquire(e) => write!(f, "failed obtaining RST line: {}", e),
            Self::ResetDirection(e) => write!(f, "failed setting RST line as output: {}", e),
            Self::BusyAcquire(e) => write!(f, "failed obtaining BUSY line: {}", e),
            Self::BusyDirection(e) => write!(f, "failed setting BUSY line as input: {}", e),
            Self::NotInitialized => write!(f, "GPIO not initialized"),
            Self::ReadyTimeout { polls } => {
                write!(f, "device still busy after {} polls", polls)
            }
            Self::Line(e) => write!(f, "GPIO line error: {}", e),
        }
    }
}

impl std::error::Error for GpioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ChipOpen { source, .. } => Some(source),
            Self::ResetAcquire(e)
            | Self::ResetDirection(e)
            | Self::BusyAcquire(e)
            | Self::BusyDirection(e)
            | Self::Line(e) => Some(e),
            Self::NotInitialized | Self::ReadyTimeout { .. } => None,
        }
    }
}

/// Chip handle and its two configured lines.
struct Lines<B: GpioBackend> {
    // Held for the lifetime of the lines.
    _chip: B::Chip,
    reset: OutputOf<B>,
    busy: InputOf<B>,
}

/// Owner of the reset and busy lines.
pub struct GpioController<B: GpioBackend, D: Delay = ThreadDelay> {
    backend: B,
    delay: D,
    lines: Option<Lines<B>>,
}

impl<B: GpioBackend, D: Delay> GpioController<B, D> {
    /// Create a controller holding no lines yet.
    pub fn new(backend: B, delay: D) -> Self {
        Self {
            backend,
            delay,
            lines: None,
        }
    }

    /// Open `chip` and request the reset and busy lines.
    ///
    /// Any previously held lines are released first. On failure nothing is
    /// held.
    pub fn initialize(&mut self, chip: &str) -> Result<(), GpioError> {
        self.teardown();

        info!("Opening GPIO chip '{}'", chip);
        let result = self.acquire(chip);
        match result {
            Ok(lines) => {
                self.lines = Some(lines);
                info!("GPIO lines ready (RST={}, BUSY={})", RESET_LINE, BUSY_LINE);
                Ok(())
            }
            Err(e) => {
                error!("GPIO initialization failed: {}", e);
                Err(e)
            }
        }
    }

    fn acquire(&self, chip_name: &str) -> Result<Lines<B>, GpioError> {
        let mut chip = self
            .backend
            .open_chip(chip_name)
            .map_err(|source| GpioError::ChipOpen {
                chip: chip_name.to_string(),
                source,
            })?;

        debug!("Requesting GPIO lines");
        let reset = chip
            .line(RESET_LINE)
            .map_err(GpioError::ResetAcquire)?
            .into_output(CONSUMER, false)
            .map_err(GpioError::ResetDirection)?;
        let busy = chip
            .line(BUSY_LINE)
            .map_err(GpioError::BusyAcquire)?
            .into_input(CONSUMER)
            .map_err(GpioError::BusyDirection)?;

        Ok(Lines {
            _chip: chip,
            reset,
            busy,
        })
    }

    /// Release the chip and lines. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        if self.lines.take().is_some() {
            debug!("GPIO chip released");
        }
    }

    /// Whether both lines are held.
    pub fn is_initialized(&self) -> bool {
        self.lines.is_some()
    }

    /// Pulse the reset line: high 50 ms, low 50 ms, then high with 15 ms settle.
    pub fn reset(&self) -> Result<(), GpioError> {
        let Some(lines) = &self.lines else {
            error!("Reset requested but GPIO has not been initialized");
            return Err(GpioError::NotInitialized);
        };

        info!("Resetting front-end");
        lines.reset.set(true).map_err(GpioError::Line)?;
        self.delay.delay_ms(RESET_HIGH_MS);
        lines.reset.set(false).map_err(GpioError::Line)?;
        self.delay.delay_ms(RESET_LOW_MS);
        lines.reset.set(true).map_err(GpioError::Line)?;
        self.delay.delay_ms(RESET_SETTLE_MS);
        Ok(())
    }

    /// Spin until the busy line reads low, polling every millisecond.
    pub fn wait_for_ready(&self) -> Result<(), GpioError> {
        let Some(lines) = &self.lines else {
            return Err(GpioError::NotInitialized);
        };

        for _ in 0..READY_POLL_BUDGET {
            if !lines.busy.is_high().map_err(GpioError::Line)? {
                return Ok(());
            }
            self.delay.delay_ms(READY_POLL_INTERVAL_MS);
        }

        Err(GpioError::ReadyTimeout {
            polls: READY_POLL_BUDGET,
        })
    }

    /// The delay used for hold times.
    pub fn delay(&self) -> &D {
        &self.delay
    }
}

impl<B: GpioBackend, D: Delay> Drop for GpioController<B, D> {
    fn drop(&mut self) {
        self.teardown();
    }
}
