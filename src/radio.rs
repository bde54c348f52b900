//! Logical radio state and the tuner that keeps the device in step with it.
//!
//! The SDR glue owns a [`Tuner`]; every setter that changes a value sends a
//! complete control frame straight away, so the device never lags the state
//! by more than one exchange.
//!
//! # Example
//!
//! ```
//! use malahit_frontend::radio::{RadioControl, RadioParameters, RadioState, Tuner};
//! use malahit_frontend::ControllerError;
//! use std::cell::RefCell;
//!
//! struct Log(RefCell<Vec<RadioParameters>>);
//!
//! impl RadioControl for Log {
//!     fn update_radio_parameters(&self, params: &RadioParameters) -> Result<(), ControllerError> {
//!         self.0.borrow_mut().push(*params);
//!         Ok(())
//!     }
//! }
//!
//! let log = Log(RefCell::new(Vec::new()));
//! let mut tuner = Tuner::new(&log, RadioState::default());
//! tuner.set_frequency(7_100_000).unwrap();
//! tuner.set_frequency(7_100_000).unwrap(); // unchanged, nothing sent
//! assert_eq!(log.0.borrow().len(), 1);
//! ```

use crate::controller::ControllerError;
use crate::frame::{Switches, MAX_ATTENUATOR, MAX_GAIN};
use log::debug;

/// Sample rates the front-end can run at, in Hz.
pub const SUPPORTED_SAMPLE_RATES_HZ: [u32; 3] = [650_000, 744_192, 912_000];

/// Everything one control frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioParameters {
    pub sample_rate_hz: u32,
    /// Frequency sent to the device, correction already applied.
    pub frequency_hz: u32,
    pub switches: Switches,
    pub attenuator: u8,
    pub gain: u8,
}

/// Something that can push radio parameters to the device.
pub trait RadioControl {
    fn update_radio_parameters(&self, params: &RadioParameters) -> Result<(), ControllerError>;
}

/// Logical radio configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioState {
    pub sample_rate_hz: u32,
    /// Center frequency before correction.
    pub frequency_hz: u32,
    /// Reference oscillator correction in ppm.
    pub correction_ppm: f64,
    pub switches: Switches,
    pub attenuator: u8,
    pub gain: u8,
}

impl Default for RadioState {
    fn default() -> Self {
        Self {
            sample_rate_hz: SUPPORTED_SAMPLE_RATES_HZ[0],
            frequency_hz: 100_000_000,
            correction_ppm: 0.0,
            switches: Switches::empty(),
            attenuator: 0,
            gain: 32,
        }
    }
}

impl RadioState {
    /// Frequency with the ppm correction applied, truncated to whole Hz.
    pub fn corrected_frequency(&self) -> u32 {
        (self.frequency_hz as f64 * (1.0 + self.correction_ppm / 1_000_000.0)) as u32
    }

    pub fn parameters(&self) -> RadioParameters {
        RadioParameters {
            sample_rate_hz: self.sample_rate_hz,
            frequency_hz: self.corrected_frequency(),
            switches: self.switches,
            attenuator: self.attenuator,
            gain: self.gain,
        }
    }
}

/// Radio state bound to the device that must mirror it.
pub struct Tuner<'a, C: RadioControl> {
    control: &'a C,
    state: RadioState,
}

impl<'a, C: RadioControl> Tuner<'a, C> {
    /// Wrap `state`; nothing is sent until [`apply`](Self::apply) or a change.
    pub fn new(control: &'a C, state: RadioState) -> Self {
        Self { control, state }
    }

    pub fn state(&self) -> &RadioState {
        &self.state
    }

    /// Send the full current state.
    pub fn apply(&self) -> Result<(), ControllerError> {
        let params = self.state.parameters();
        debug!(
            "Rate={}Hz, Freq={}Hz, SW={}, ATT={}",
            params.sample_rate_hz, params.frequency_hz, params.switches, params.attenuator
        );
        self.control.update_radio_parameters(&params)
    }

    /// Apply `change` and resend if it altered the state.
    ///
    /// The new value is kept even if sending fails; the next change resends
    /// everything.
    fn update(&mut self, change: impl FnOnce(&mut RadioState)) -> Result<(), ControllerError> {
        let before = self.state.clone();
        change(&mut self.state);
        if self.state == before {
            return Ok(());
        }
        self.apply()
    }

    /// Switch sample rate; only [`SUPPORTED_SAMPLE_RATES_HZ`] are accepted.
    pub fn set_sample_rate(&mut self, rate_hz: u32) -> Result<(), ControllerError> {
        if !SUPPORTED_SAMPLE_RATES_HZ.contains(&rate_hz) {
            return Err(ControllerError::InvalidSampleRate { rate_hz });
        }
        self.update(|s| s.sample_rate_hz = rate_hz)
    }

    pub fn set_frequency(&mut self, frequency_hz: u32) -> Result<(), ControllerError> {
        self.update(|s| s.frequency_hz = frequency_hz)
    }

    /// Oscillator correction in ppm; must be finite.
    pub fn set_correction_ppm(&mut self, ppm: f64) -> Result<(), ControllerError> {
        if !ppm.is_finite() {
            return Err(ControllerError::InvalidCorrection { ppm });
        }
        self.update(|s| s.correction_ppm = ppm)
    }

    pub fn set_switch(&mut self, switch: Switches, on: bool) -> Result<(), ControllerError> {
        self.update(|s| s.switches.set(switch, on))
    }

    /// Attenuator in dB, clamped to 0..=30.
    pub fn set_attenuator(&mut self, db: u8) -> Result<(), ControllerError> {
        self.update(|s| s.attenuator = db.min(MAX_ATTENUATOR))
    }

    /// Gain code, clamped to 0..=63.
    pub fn set_gain(&mut self, gain: u8) -> Result<(), ControllerError> {
        self.update(|s| s.gain = gain.min(MAX_GAIN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;
    use crate::transport::CrcPolicy;

    #[test]
    fn test_corrected_frequency_truncates() {
        // 100_001_000.5 Hz
        let state = RadioState {
            frequency_hz: 100_000_000,
            correction_ppm: 10.005,
            ..Default::default()
        };
        assert_eq!(state.corrected_frequency(), 100_001_000);

        // 999_999.5 Hz
        let state = RadioState {
            frequency_hz: 1_000_000,
            correction_ppm: -0.5,
            ..state
        };
        assert_eq!(state.corrected_frequency(), 999_999);

        let state = RadioState {
            correction_ppm: 0.0,
            ..state
        };
        assert_eq!(state.corrected_frequency(), 1_000_000);
    }

    #[test]
    fn test_non_finite_correction_rejected() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);
        let mut tuner = Tuner::new(&controller, RadioState::default());

        for ppm in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                tuner.set_correction_ppm(ppm),
                Err(ControllerError::InvalidCorrection { .. })
            ));
        }
        assert_eq!(tuner.state().correction_ppm, 0.0);
        assert!(device.controls().is_empty());

        // Later setters still see an unchanged state as unchanged
        tuner.set_gain(32).unwrap();
        assert!(device.controls().is_empty());
    }

    #[test]
    fn test_every_change_reaches_device() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Strict);
        let mut tuner = Tuner::new(&controller, RadioState::default());

        tuner.set_frequency(14_074_000).unwrap();
        tuner.set_switch(Switches::BIAS_TEE, true).unwrap();
        tuner.set_attenuator(12).unwrap();
        tuner.set_gain(50).unwrap();
        tuner.set_sample_rate(912_000).unwrap();

        let controls = device.controls();
        assert_eq!(controls.len(), 5);
        let last = controls.last().unwrap();
        assert_eq!(last.frequency_hz, 14_074_000);
        assert_eq!(last.switches, Switches::BIAS_TEE);
        assert_eq!(last.attenuator, 12);
        assert_eq!(last.gain, 50);
        assert_eq!(last.rate_khz, 912);
    }

    #[test]
    fn test_unchanged_values_send_nothing() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);
        let mut tuner = Tuner::new(&controller, RadioState::default());

        tuner.set_frequency(100_000_000).unwrap();
        tuner.set_switch(Switches::LOOP, false).unwrap();
        tuner.set_gain(32).unwrap();
        assert!(device.controls().is_empty());
    }

    #[test]
    fn test_clamping() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);
        let mut tuner = Tuner::new(&controller, RadioState::default());

        tuner.set_attenuator(45).unwrap();
        tuner.set_gain(200).unwrap();
        assert_eq!(tuner.state().attenuator, 30);
        assert_eq!(tuner.state().gain, 63);

        // Already at the clamp limit
        tuner.set_gain(100).unwrap();
        assert_eq!(device.controls().len(), 2);
    }

    #[test]
    fn test_unsupported_rate_keeps_state() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);
        let mut tuner = Tuner::new(&controller, RadioState::default());

        assert!(tuner.set_sample_rate(700_000).is_err());
        assert_eq!(tuner.state().sample_rate_hz, 650_000);
        assert!(device.controls().is_empty());
    }

    #[test]
    fn test_correction_applied_on_wire() {
        let device = SimDevice::new();
        let controller = device.controller(CrcPolicy::Lenient);
        let mut tuner = Tuner::new(&controller, RadioState::default());

        // 99_999_749.5 Hz on a 100 MHz carrier
        tuner.set_correction_ppm(-2.505).unwrap();
        assert_eq!(device.controls()[0].frequency_hz, 99_999_749);
    }
}
