//! Command layer of the STM front-end.
//!
//! [`Controller`] is the whole surface the SDR glue and the flash tool use:
//! reset and bring-up, status queries, LEDs, radio parameters and firmware
//! transfer. Each call blocks until it completes or fails; nothing retries.
//!
//! ```text
//! Uninitialized --initialize--> Ready --exchange--> Ready
//!                                 |
//!                                 +--install_firmware--> Flashing --reset--> Ready
//! ```

mod firmware;

pub use firmware::{
    find_latest_firmware, firmware_version_from_name, InstallOutcome, FIRMWARE_NAME_PREFIX,
    FIRMWARE_SIZE, FIRMWARE_STEP,
};

use crate::frame::{
    boot_frame, firmware_read_request, firmware_write_frame, led_frame, ControlFrame,
    StatusError, StatusFrame, FIRMWARE_HEADER_LEN, STATUS_FRAME_LEN, TRAILER_LEN,
};
use crate::gpio::{Delay, GpioBackend, GpioController, GpioError, ThreadDelay};
use crate::radio::{RadioControl, RadioParameters, SUPPORTED_SAMPLE_RATES_HZ};
use crate::transport::{CrcPolicy, SpiBus, Transport, TransportError};
use log::{debug, error, info, warn};
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Time the device firmware needs after the boot command (ms).
pub const BOOT_SETTLE_MS: u64 = 1000;

/// Time the device needs to apply new radio parameters (ms).
pub const PARAMETER_SETTLE_MS: u64 = 1;

/// Controller errors.
#[derive(Debug)]
pub enum ControllerError {
    /// GPIO lines unavailable or misbehaving.
    Gpio(GpioError),
    /// Bus exchange failed.
    Transport(TransportError),
    /// Device answered with something that is not a status frame.
    BadStatus(StatusError),
    /// Sample rate is not one the front-end supports.
    InvalidSampleRate { rate_hz: u32 },
    /// Frequency correction is NaN or infinite.
    InvalidCorrection { ppm: f64 },
    /// Firmware chunk outside the flash or larger than one step.
    ChunkOutOfRange { address: u32, length: usize },
    /// Firmware image file could not be opened or created.
    Image { path: PathBuf, source: io::Error },
    /// Transfer stopped before covering the whole image.
    IncompleteTransfer {
        stage: &'static str,
        done: usize,
        expected: usize,
    },
    /// Device reports a different version after flashing.
    FirmwareMismatch {
        expected: u32,
        actual: u16,
        written: usize,
    },
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpio(e) => write!(f, "GPIO: {}", e),
            Self::Transport(e) => write!(f, "transport: {}", e),
            Self::BadStatus(e) => write!(f, "invalid status: {}", e),
            Self::InvalidSampleRate { rate_hz } => {
                write!(f, "invalid sampling rate of {}kHz", rate_hz / 1000)
            }
            Self::InvalidCorrection { ppm } => write!(f, "invalid frequency correction {} ppm", ppm),
            Self::ChunkOutOfRange { address, length } => write!(
                f,
                "firmware chunk 0x{:X}+0x{:X} out of range",
                address, length
            ),
            Self::Image { path, source } => {
                write!(f, "firmware image {}: {}", path.display(), source)
            }
            Self::IncompleteTransfer {
                stage,
                done,
                expected,
            } => write!(
                f,
                "{} stopped at {}kB of {}kB",
                stage,
                done >> 10,
                expected >> 10
            ),
            Self::FirmwareMismatch {
                expected,
                actual,
                written,
            } => write!(
                f,
                "firmware update failed: expected version {:03}, device reports {:03} ({}kB written)",
                expected,
                actual,
                written >> 10
            ),
        }
    }
}

impl std::error::Error for ControllerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Gpio(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::BadStatus(e) => Some(e),
            Self::Image { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<GpioError> for ControllerError {
    fn from(e: GpioError) -> Self {
        Self::Gpio(e)
    }
}

impl From<TransportError> for ControllerError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<StatusError> for ControllerError {
    fn from(e: StatusError) -> Self {
        Self::BadStatus(e)
    }
}

/// Reject chunks longer than one step or reaching past the flash.
fn check_chunk(address: u32, length: usize) -> Result<(), ControllerError> {
    let end = address as u64 + length as u64;
    if length > FIRMWARE_STEP || end > FIRMWARE_SIZE as u64 {
        return Err(ControllerError::ChunkOutOfRange { address, length });
    }
    Ok(())
}

/// Handle on one STM front-end.
pub struct Controller<G: GpioBackend, B: SpiBus, D: Delay = ThreadDelay> {
    transport: Transport<G, B, D>,
}

impl<G: GpioBackend, B: SpiBus, D: Delay> Controller<G, B, D> {
    pub fn new(transport: Transport<G, B, D>) -> Self {
        Self { transport }
    }

    /// Build a controller from its parts without touching hardware.
    pub fn with_parts(gpio: GpioController<G, D>, bus: B, crc_policy: CrcPolicy) -> Self {
        Self::new(Transport::new(gpio, bus, crc_policy))
    }

    /// Acquire the reset and busy lines on `chip`.
    pub fn initialize(&mut self, chip: &str) -> Result<(), ControllerError> {
        Ok(self.transport.gpio_mut().initialize(chip)?)
    }

    /// Release the GPIO lines.
    pub fn teardown(&mut self) {
        self.transport.gpio_mut().teardown();
    }

    pub fn transport(&self) -> &Transport<G, B, D> {
        &self.transport
    }

    pub fn set_crc_policy(&mut self, policy: CrcPolicy) {
        self.transport.set_crc_policy(policy);
    }

    /// Pulse reset and wait for the device to come back.
    ///
    /// The only way out of a wedged device. Holds the bus for the whole
    /// sequence.
    pub fn hard_reset(&self) -> Result<(), ControllerError> {
        let link = self.transport.lock();
        link.gpio().reset()?;
        link.gpio().wait_for_ready().map_err(|e| {
            error!("Device not ready after reset: {}", e);
            e
        })?;
        Ok(())
    }

    /// Start the radio firmware and confirm it answers.
    ///
    /// A failed boot command is logged but does not stop the status check:
    /// the device sometimes misses the command and comes up anyway.
    pub fn bring_up(&self) -> Result<StatusFrame, ControllerError> {
        let mut frame = boot_frame();
        if let Err(e) = self.transport.send(&mut frame) {
            error!("Failed starting up the front-end: {}", e);
        }

        self.transport.gpio().delay().delay_ms(BOOT_SETTLE_MS);

        let status = self.query_status().map_err(|e| {
            error!("Failed to get front-end status: {}", e);
            e
        })?;
        info!(
            "Front-end up: id {}, firmware {:03}",
            status.device_id(),
            status.firmware_version
        );
        Ok(status)
    }

    /// Read one status frame.
    pub fn query_status(&self) -> Result<StatusFrame, ControllerError> {
        let mut frame = [0u8; STATUS_FRAME_LEN];
        self.transport.receive(&mut frame)?;
        let status = StatusFrame::parse(&frame).map_err(|e| {
            debug!("Status rejected: {}", e);
            e
        })?;
        Ok(status)
    }

    /// Battery voltage in volts.
    pub fn battery_voltage(&self) -> Result<f32, ControllerError> {
        Ok(self.query_status()?.battery_voltage())
    }

    pub fn is_charging(&self) -> Result<bool, ControllerError> {
        Ok(self.query_status()?.charging)
    }

    /// Device id, `XXXX-XXXX-XXXX-XXXX-XXXX-XXXX`.
    pub fn device_id(&self) -> Result<String, ControllerError> {
        Ok(self.query_status()?.device_id())
    }

    /// Installed firmware version, 0 if none.
    pub fn firmware_version(&self) -> Result<u16, ControllerError> {
        Ok(self.query_status()?.firmware_version)
    }

    /// Set the LED state mask ([`LED_1`](crate::frame::LED_1), ...).
    pub fn set_leds(&self, state: u8) -> Result<(), ControllerError> {
        let mut frame = led_frame(state);
        self.transport.send(&mut frame).map_err(|e| {
            error!("Failed setting LEDs to 0x{:02X}: {}", state, e);
            ControllerError::from(e)
        })
    }

    /// Send new radio parameters and give the device time to apply them.
    pub fn update_radio_parameters(&self, params: &RadioParameters) -> Result<(), ControllerError> {
        let rate_khz = params.sample_rate_hz / 1000;
        let supported = SUPPORTED_SAMPLE_RATES_HZ
            .iter()
            .any(|&rate| rate / 1000 == rate_khz);
        if !supported {
            error!("Invalid sampling rate of {}kHz", rate_khz);
            return Err(ControllerError::InvalidSampleRate {
                rate_hz: params.sample_rate_hz,
            });
        }

        debug!(
            "Radio update: rate={}Hz freq={}Hz sw={} att={} gain={}",
            params.sample_rate_hz,
            params.frequency_hz,
            params.switches,
            params.attenuator,
            params.gain
        );
        let mut frame = ControlFrame {
            frequency_hz: params.frequency_hz,
            switches: params.switches,
            attenuator: params.attenuator,
            gain: params.gain,
            rate_khz: rate_khz as u16,
        }
        .encode();
        let result = self.transport.send(&mut frame);
        if let Err(e) = &result {
            error!("Failed sending radio parameters: {}", e);
        }

        self.transport.gpio().delay().delay_ms(PARAMETER_SETTLE_MS);
        Ok(result?)
    }

    /// Read `buf.len()` bytes of device flash at `address`.
    ///
    /// The device takes any address; keeping transfers on [`FIRMWARE_STEP`]
    /// boundaries is up to the caller, as the image transfers do.
    pub fn read_firmware_chunk(&self, buf: &mut [u8], address: u32) -> Result<(), ControllerError> {
        check_chunk(address, buf.len())?;

        let mut request = firmware_read_request(address, buf.len() as u16);
        let mut response = vec![0u8; FIRMWARE_HEADER_LEN + buf.len() + TRAILER_LEN];

        // Request and response must not be split by another caller.
        let mut link = self.transport.lock();
        link.send(&mut request)?;
        link.receive(&mut response)?;

        buf.copy_from_slice(&response[FIRMWARE_HEADER_LEN..FIRMWARE_HEADER_LEN + buf.len()]);
        Ok(())
    }

    /// Write `data` to device flash at `address`.
    ///
    /// Alignment is the caller's business, as for
    /// [`read_firmware_chunk`](Self::read_firmware_chunk).
    pub fn write_firmware_chunk(&self, data: &[u8], address: u32) -> Result<(), ControllerError> {
        check_chunk(address, data.len())?;

        let mut frame = firmware_write_frame(address, data);
        self.transport.send(&mut frame)?;
        Ok(())
    }

    /// Version query that treats any failure as "unknown" (0).
    fn version_or_unknown(&self, context: &str) -> u16 {
        match self.firmware_version() {
            Ok(version) => version,
            Err(e) => {
                warn!("{}: failed obtaining firmware version: {}", context, e);
                0
            }
        }
    }
}

impl<G: GpioBackend, B: SpiBus, D: Delay> RadioControl for Controller<G, B, D> {
    fn update_radio_parameters(&self, params: &RadioParameters) -> Result<(), ControllerError> {
        Controller::update_radio_parameters(self, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Switches, LED_1, LED_2};
    use crate::sim::{SimDevice, SimGpioFault};

    fn params(rate: u32) -> RadioParameters {
        RadioParameters {
            sample_rate_hz: rate,
            frequency_hz: 14_200_000,
            switches: Switches::PREAMP,
            attenuator: 0,
            gain: 20,
        }
    }

    #[test]
    fn test_hard_reset_pulses_and_waits() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);

        device.set_busy_polls(2);
        controller.hard_reset().unwrap();
        assert_eq!(device.resets(), 1);
        assert_eq!(device.delays(), vec![50, 50, 15, 1, 1]);
    }

    #[test]
    fn test_hard_reset_uninitialized() {
        let device = SimDevice::new();
        device.set_gpio_fault(Some(SimGpioFault::ChipOpen));
        let mut controller = device.uninitialized_controller(CrcPolicy::Lenient);
        assert!(controller.initialize("gpiochip0").is_err());

        assert!(matches!(
            controller.hard_reset(),
            Err(ControllerError::Gpio(GpioError::NotInitialized))
        ));
        controller.teardown();
    }

    #[test]
    fn test_bring_up() {
        let device = SimDevice::new();
        device.set_firmware_version(107);
        let controller = device.controller(CrcPolicy::Lenient);

        let status = controller.bring_up().unwrap();
        assert!(device.booted());
        assert_eq!(status.firmware_version, 107);
        assert_eq!(device.delays(), vec![BOOT_SETTLE_MS]);
        assert_eq!(&device.sent_frames()[0][..3], b"GO!");
    }

    #[test]
    fn test_bring_up_survives_failed_boot_command() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);

        // Busy for the whole boot command wait, clear for the status read.
        device.set_busy_polls(10_000);
        let status = controller.bring_up();
        assert!(status.is_ok());
        assert!(!device.booted());
    }

    #[test]
    fn test_query_status_rejects_bad_magic() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);

        device.set_broken_magic(true);
        assert!(matches!(
            controller.query_status(),
            Err(ControllerError::BadStatus(StatusError::BadMagic { .. }))
        ));
    }

    #[test]
    fn test_accessors_use_status() {
        let device = SimDevice::new();
        device.set_firmware_version(0);
        let controller = device.controller(CrcPolicy::Lenient);

        assert!((controller.battery_voltage().unwrap() - 3.9).abs() < 1e-6);
        assert!(!controller.is_charging().unwrap());
        assert_eq!(
            controller.device_id().unwrap(),
            "0001-0203-0405-0607-0809-0A0B"
        );
        assert_eq!(controller.firmware_version().unwrap(), 0);
        assert_eq!(device.sent_frames().len(), 4);
    }

    #[test]
    fn test_set_leds() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);

        controller.set_leds(LED_1 | LED_2).unwrap();
        assert_eq!(device.leds(), Some(0x03));
        assert_eq!(device.bad_crc_frames(), 0);
    }

    #[test]
    fn test_sample_rate_validation() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);

        for rate in [650_000, 744_192, 912_000, 744_999] {
            controller.update_radio_parameters(&params(rate)).unwrap();
        }
        for rate in [700_000, 0, 649_999, 912_000_000] {
            assert!(matches!(
                controller.update_radio_parameters(&params(rate)),
                Err(ControllerError::InvalidSampleRate { .. })
            ));
        }

        let controls = device.controls();
        assert_eq!(controls.len(), 4);
        assert_eq!(controls[1].rate_khz, 744);
        assert_eq!(controls[1].frequency_hz, 14_200_000);
        assert_eq!(controls[1].switches, Switches::PREAMP);
    }

    #[test]
    fn test_radio_update_settles() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);

        controller.update_radio_parameters(&params(912_000)).unwrap();
        assert_eq!(device.delays(), vec![PARAMETER_SETTLE_MS]);
    }

    #[test]
    fn test_rejected_rate_sends_nothing() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);

        let _ = controller.update_radio_parameters(&params(700_000));
        assert!(device.sent_frames().is_empty());
        assert!(device.delays().is_empty());
    }

    #[test]
    fn test_chunk_bounds() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);

        let ok = vec![0x5Au8; 0x800];
        controller.write_firmware_chunk(&ok, 0).unwrap();
        controller.write_firmware_chunk(&ok, 0x1F_F800).unwrap();

        let too_long = vec![0u8; 0x801];
        assert!(matches!(
            controller.write_firmware_chunk(&too_long, 0),
            Err(ControllerError::ChunkOutOfRange { length: 0x801, .. })
        ));
        assert!(matches!(
            controller.write_firmware_chunk(&ok, 0x1F_FC00),
            Err(ControllerError::ChunkOutOfRange { address: 0x1F_FC00, .. })
        ));

        let mut buf = vec![0u8; 0x801];
        assert!(controller.read_firmware_chunk(&mut buf, 0).is_err());
        let mut buf = vec![0u8; 0x800];
        assert!(controller.read_firmware_chunk(&mut buf, 0x1F_FC00).is_err());
        assert!(controller.read_firmware_chunk(&mut buf, u32::MAX).is_err());

        // Only the two valid writes reached the bus
        assert_eq!(device.chunk_writes(), vec![0, 0x1F_F800]);
        assert_eq!(device.sent_frames().len(), 2);
    }

    #[test]
    fn test_chunk_write_then_read() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Strict);

        let data: Vec<u8> = (0..0x800).map(|i| (i % 251) as u8).collect();
        controller.write_firmware_chunk(&data, 0x1000).unwrap();

        let mut back = vec![0u8; 0x800];
        controller.read_firmware_chunk(&mut back, 0x1000).unwrap();
        assert_eq!(back, data);
        assert_eq!(device.chunk_reads(), vec![0x1000]);
    }

    #[test]
    fn test_partial_chunk_read() {
        let device = SimDevice::new();
        let mut flash = vec![0u8; FIRMWARE_SIZE];
        flash[0x20..0x24].copy_from_slice(&[1, 2, 3, 4]);
        device.load_flash(&flash);
        let controller = device.controller(CrcPolicy::Strict);

        let mut buf = [0u8; 4];
        controller.read_firmware_chunk(&mut buf, 0x20).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_unaligned_chunk_straddles_step() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Strict);

        let data: Vec<u8> = (0..0x800).map(|i| (i % 13) as u8).collect();
        controller.write_firmware_chunk(&data, 0x1234).unwrap();

        let mut back = vec![0u8; 0x800];
        controller.read_firmware_chunk(&mut back, 0x1234).unwrap();
        assert_eq!(back, data);
        assert_eq!(device.chunk_writes(), vec![0x1234]);
        assert_eq!(device.chunk_reads(), vec![0x1234]);
    }

    #[test]
    fn test_chunk_read_not_split_by_status_queries() {
        let device = SimDevice::new();
        let flash: Vec<u8> = (0..FIRMWARE_SIZE).map(|i| (i / 7) as u8).collect();
        device.load_flash(&flash);
        let controller = device.controller(CrcPolicy::Strict);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut chunk = vec![0u8; FIRMWARE_STEP];
                for i in 0..40 {
                    let address = i * FIRMWARE_STEP;
                    controller
                        .read_firmware_chunk(&mut chunk, address as u32)
                        .unwrap();
                    assert_eq!(&chunk[..], &flash[address..address + FIRMWARE_STEP]);
                }
            });
            scope.spawn(|| {
                for _ in 0..40 {
                    let status = controller.query_status().unwrap();
                    assert_eq!(status.firmware_version, 100);
                }
            });
        });

        assert_eq!(device.chunk_reads().len(), 40);
        assert_eq!(device.max_concurrent_transfers(), 1);
    }

    #[test]
    fn test_hard_reset_holds_bus_until_ready() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Strict);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..20 {
                    controller.hard_reset().unwrap();
                }
            });
            scope.spawn(|| {
                for _ in 0..20 {
                    controller.query_status().unwrap();
                }
            });
        });

        assert_eq!(device.resets(), 20);
        assert_eq!(device.sent_frames().len(), 20);
    }
}
