//! Outbound command frames.
//!
//! Fixed commands are [`COMMAND_FRAME_LEN`] bytes, zero-padded, with the CRC
//! stamped by the transport just before transmission.
//!
//! | Command | Bytes 0.. |
//! |---------|-----------|
//! | boot | `G O !` |
//! | LEDs | `L`, state |
//! | radio control | `S`, freq (4), switches, attenuator, gain, rate kHz (2) |
//! | firmware read | `F R`, address (4), length (2) |
//! | firmware write | `F W`, address (4), length (2), data (length) |

use std::fmt;

/// Size of every fixed command frame, trailer included.
pub const COMMAND_FRAME_LEN: usize = 32;

/// Size of the firmware command header (tag, address, length).
pub const FIRMWARE_HEADER_LEN: usize = 8;

/// First front-panel LED.
pub const LED_1: u8 = 0x01;
/// Second front-panel LED (low battery indicator).
pub const LED_2: u8 = 0x02;

const BOOT_TAG: &[u8; 3] = b"GO!";
const LED_TAG: u8 = b'L';
const CONTROL_TAG: u8 = b'S';
const FIRMWARE_READ_TAG: &[u8; 2] = b"FR";
const FIRMWARE_WRITE_TAG: &[u8; 2] = b"FW";

/// Maximum attenuator setting in dB.
pub const MAX_ATTENUATOR: u8 = 30;
/// Maximum gain code.
pub const MAX_GAIN: u8 = 63;

/// RF front-end switch bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Switches(u8);

impl Switches {
    /// Loop antenna input.
    pub const LOOP: Self = Self(0x01);
    /// Bias-tee power on the antenna port.
    pub const BIAS_TEE: Self = Self(0x02);
    /// High-impedance input.
    pub const HIGH_Z: Self = Self(0x04);
    /// Low-noise preamplifier.
    pub const PREAMP: Self = Self(0x08);

    /// No switches on.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from a raw mask; unknown bits are kept.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Turn `other` on or off.
    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl std::ops::BitOr for Switches {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Switches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Radio control frame (`S` command).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame {
    /// Tuned frequency in Hz.
    pub frequency_hz: u32,
    pub switches: Switches,
    /// Attenuator in dB, clamped to 0..=30 on encode.
    pub attenuator: u8,
    /// Gain code, clamped to 0..=63 on encode.
    pub gain: u8,
    /// Sample rate in kHz.
    pub rate_khz: u16,
}

impl ControlFrame {
    pub fn encode(&self) -> [u8; COMMAND_FRAME_LEN] {
        let mut frame = [0u8; COMMAND_FRAME_LEN];
        frame[0] = CONTROL_TAG;
        frame[1..5].copy_from_slice(&self.frequency_hz.to_be_bytes());
        frame[5] = self.switches.bits();
        frame[6] = self.attenuator.min(MAX_ATTENUATOR);
        frame[7] = self.gain.min(MAX_GAIN);
        frame[8..10].copy_from_slice(&self.rate_khz.to_be_bytes());
        frame
    }

    /// Decode an `S` frame; `None` for any other command.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < 10 || frame[0] != CONTROL_TAG {
            return None;
        }
        Some(Self {
            frequency_hz: u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]),
            switches: Switches::from_bits(frame[5]),
            attenuator: frame[6],
            gain: frame[7],
            rate_khz: u16::from_be_bytes([frame[8], frame[9]]),
        })
    }
}

/// Boot command that starts the device's radio firmware.
pub fn boot_frame() -> [u8; COMMAND_FRAME_LEN] {
    let mut frame = [0u8; COMMAND_FRAME_LEN];
    frame[..BOOT_TAG.len()].copy_from_slice(BOOT_TAG);
    frame
}

/// LED state command.
pub fn led_frame(state: u8) -> [u8; COMMAND_FRAME_LEN] {
    let mut frame = [0u8; COMMAND_FRAME_LEN];
    frame[0] = LED_TAG;
    frame[1] = state;
    frame
}

fn firmware_header(tag: &[u8; 2], address: u32, length: u16) -> [u8; FIRMWARE_HEADER_LEN] {
    let mut header = [0u8; FIRMWARE_HEADER_LEN];
    header[..2].copy_from_slice(tag);
    header[2..6].copy_from_slice(&address.to_be_bytes());
    header[6..8].copy_from_slice(&length.to_be_bytes());
    header
}

/// Request `length` bytes of flash starting at `address`.
pub fn firmware_read_request(address: u32, length: u16) -> [u8; COMMAND_FRAME_LEN] {
    let mut frame = [0u8; COMMAND_FRAME_LEN];
    frame[..FIRMWARE_HEADER_LEN].copy_from_slice(&firmware_header(
        FIRMWARE_READ_TAG,
        address,
        length,
    ));
    frame
}

/// Flash write frame: header, `data`, room for the trailer.
pub fn firmware_write_frame(address: u32, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FIRMWARE_HEADER_LEN + data.len() + super::TRAILER_LEN);
    frame.extend_from_slice(&firmware_header(
        FIRMWARE_WRITE_TAG,
        address,
        data.len() as u16,
    ));
    frame.extend_from_slice(data);
    frame.extend_from_slice(&[0, 0]);
    frame
}

/// Parsed firmware command header.
#[cfg(any(test, feature = "sim"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FirmwareHeader {
    pub write: bool,
    pub address: u32,
    pub length: u16,
}

#[cfg(any(test, feature = "sim"))]
impl FirmwareHeader {
    pub(crate) fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < FIRMWARE_HEADER_LEN {
            return None;
        }
        let write = match &frame[..2] {
            tag if tag == FIRMWARE_WRITE_TAG => true,
            tag if tag == FIRMWARE_READ_TAG => false,
            _ => return None,
        };
        Some(Self {
            write,
            address: u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]),
            length: u16::from_be_bytes([frame[6], frame[7]]),
        })
    }

    pub(crate) fn encode(&self) -> [u8; FIRMWARE_HEADER_LEN] {
        let tag = if self.write {
            FIRMWARE_WRITE_TAG
        } else {
            FIRMWARE_READ_TAG
        };
        firmware_header(tag, self.address, self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_layout() {
        let frame = ControlFrame {
            frequency_hz: 100_000_000,
            switches: Switches::BIAS_TEE | Switches::PREAMP,
            attenuator: 10,
            gain: 32,
            rate_khz: 744,
        }
        .encode();

        assert_eq!(frame[0], b'S');
        assert_eq!(&frame[1..5], &[0x05, 0xF5, 0xE1, 0x00]);
        assert_eq!(frame[5], 0x0A);
        assert_eq!(frame[6], 10);
        assert_eq!(frame[7], 32);
        assert_eq!(&frame[8..10], &[0x02, 0xE8]);
        assert!(frame[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_control_frame_clamps() {
        let frame = ControlFrame {
            frequency_hz: 0,
            switches: Switches::empty(),
            attenuator: 200,
            gain: 255,
            rate_khz: 650,
        }
        .encode();
        assert_eq!(frame[6], MAX_ATTENUATOR);
        assert_eq!(frame[7], MAX_GAIN);
    }

    #[test]
    fn test_control_frame_decode() {
        let original = ControlFrame {
            frequency_hz: 7_100_000,
            switches: Switches::LOOP,
            attenuator: 6,
            gain: 40,
            rate_khz: 912,
        };
        assert_eq!(ControlFrame::decode(&original.encode()), Some(original));
        assert_eq!(ControlFrame::decode(&boot_frame()), None);
    }

    #[test]
    fn test_switches() {
        let mut switches = Switches::empty();
        switches.set(Switches::HIGH_Z, true);
        switches.insert(Switches::LOOP);
        assert!(switches.contains(Switches::HIGH_Z));
        assert!(switches.contains(Switches::LOOP));
        assert!(!switches.contains(Switches::PREAMP));

        switches.set(Switches::HIGH_Z, false);
        assert_eq!(switches, Switches::LOOP);
        assert_eq!(switches.to_string(), "0x1");
    }

    #[test]
    fn test_fixed_commands() {
        let boot = boot_frame();
        assert_eq!(&boot[..4], b"GO!\0");
        assert_eq!(boot.len(), 32);

        let leds = led_frame(LED_1 | LED_2);
        assert_eq!(&leds[..3], &[b'L', 0x03, 0x00]);
    }

    #[test]
    fn test_firmware_frames() {
        let request = firmware_read_request(0x1F_F800, 0x800);
        assert_eq!(
            &request[..8],
            &[b'F', b'R', 0x00, 0x1F, 0xF8, 0x00, 0x08, 0x00]
        );

        let write = firmware_write_frame(0x800, &[0xAB; 4]);
        assert_eq!(write.len(), 8 + 4 + 2);
        assert_eq!(&write[..8], &[b'F', b'W', 0, 0, 0x08, 0x00, 0x00, 0x04]);

        let header = FirmwareHeader::decode(&write).unwrap();
        assert!(header.write);
        assert_eq!(header.address, 0x800);
        assert_eq!(header.length, 4);
        assert_eq!(&header.encode(), &write[..8]);
        assert!(FirmwareHeader::decode(b"GO!\0\0\0\0\0").is_none());
    }
}
