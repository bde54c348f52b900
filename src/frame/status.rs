//! Status report frame.
//!
//! # Layout (32 bytes, big-endian)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 6 | magic, literal `Status` |
//! | 6 | 2 | battery voltage, mV |
//! | 8 | 2 | battery current, mA |
//! | 10 | 1 | charger indicator, `'C'` while charging |
//! | 11 | 1 | charge, percent |
//! | 12 | 12 | unique device id |
//! | 24 | 2 | firmware version, `0xFFFF` = none |
//! | 26 | 2 | production batch |
//! | 28 | 1 | device-side CRC check result |
//! | 30 | 2 | frame CRC |

use std::fmt;

/// Size of the status frame on the wire.
pub const STATUS_FRAME_LEN: usize = 32;

/// Tag that must open every trusted status frame.
pub const STATUS_MAGIC: &[u8; 6] = b"Status";

const VOLTAGE: usize = 6;
const CURRENT: usize = 8;
const CHARGING: usize = 10;
const CHARGE: usize = 11;
const UID: usize = 12;
const UID_LEN: usize = 12;
const VERSION: usize = 24;
const BATCH: usize = 26;
const CRC_OK: usize = 28;

/// Raw firmware version reported by a device without firmware.
const NO_FIRMWARE: u16 = 0xFFFF;

/// Decoded status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFrame {
    /// Battery voltage in millivolts.
    pub voltage_mv: u16,
    /// Battery current in milliamps.
    pub current_ma: u16,
    /// Charger connected and charging.
    pub charging: bool,
    /// Battery charge in percent.
    pub charge_percent: u8,
    /// Unique device identifier.
    pub uid: [u8; UID_LEN],
    /// Firmware version, 0 when the device has none.
    pub firmware_version: u16,
    /// Production batch number.
    pub batch: u16,
    /// The device's own verdict on the last frame it received.
    pub device_crc_ok: bool,
}

/// Reasons a status frame is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    /// Buffer does not have the status frame size.
    WrongLength { len: usize },
    /// Frame does not start with `Status`.
    BadMagic { found: [u8; 6] },
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongLength { len } => write!(
                f,
                "status frame is {} bytes (expected {})",
                len, STATUS_FRAME_LEN
            ),
            Self::BadMagic { found } => {
                write!(f, "bad status magic {:?}", String::from_utf8_lossy(found))
            }
        }
    }
}

impl std::error::Error for StatusError {}

fn be16(frame: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([frame[offset], frame[offset + 1]])
}

impl StatusFrame {
    /// Decode a received status frame.
    ///
    /// The checksum is the transport's business; only size and magic are
    /// checked here.
    pub fn parse(frame: &[u8]) -> Result<Self, StatusError> {
        if frame.len() != STATUS_FRAME_LEN {
            return Err(StatusError::WrongLength { len: frame.len() });
        }
        if &frame[..6] != STATUS_MAGIC {
            let mut found = [0u8; 6];
            found.copy_from_slice(&frame[..6]);
            return Err(StatusError::BadMagic { found });
        }

        let mut uid = [0u8; UID_LEN];
        uid.copy_from_slice(&frame[UID..UID + UID_LEN]);

        let version = be16(frame, VERSION);

        Ok(Self {
            voltage_mv: be16(frame, VOLTAGE),
            current_ma: be16(frame, CURRENT),
            charging: frame[CHARGING] == b'C',
            charge_percent: frame[CHARGE],
            uid,
            firmware_version: if version == NO_FIRMWARE { 0 } else { version },
            batch: be16(frame, BATCH),
            device_crc_ok: frame[CRC_OK] != 0,
        })
    }

    /// Encode the frame body (trailer left zero).
    ///
    /// Used by the simulated device; a real device produces these.
    pub fn encode(&self) -> [u8; STATUS_FRAME_LEN] {
        let mut frame = [0u8; STATUS_FRAME_LEN];
        frame[..6].copy_from_slice(STATUS_MAGIC);
        frame[VOLTAGE..VOLTAGE + 2].copy_from_slice(&self.voltage_mv.to_be_bytes());
        frame[CURRENT..CURRENT + 2].copy_from_slice(&self.current_ma.to_be_bytes());
        frame[CHARGING] = if self.charging { b'C' } else { 0 };
        frame[CHARGE] = self.charge_percent;
        frame[UID..UID + UID_LEN].copy_from_slice(&self.uid);
        let version = if self.firmware_version == 0 {
            NO_FIRMWARE
        } else {
            self.firmware_version
        };
        frame[VERSION..VERSION + 2].copy_from_slice(&version.to_be_bytes());
        frame[BATCH..BATCH + 2].copy_from_slice(&self.batch.to_be_bytes());
        frame[CRC_OK] = self.device_crc_ok as u8;
        frame
    }

    /// Battery voltage in volts.
    pub fn battery_voltage(&self) -> f32 {
        self.voltage_mv as f32 / 1000.0
    }

    /// Battery current in amps.
    pub fn current(&self) -> f32 {
        self.current_ma as f32 / 1000.0
    }

    /// Device id as six dash-separated 16-bit hex groups.
    pub fn device_id(&self) -> String {
        self.uid
            .chunks(2)
            .map(|pair| format!("{:02X}{:02X}", pair[0], pair[1]))
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Id and version line, e.g. `0123-...-CDEF 1.05`.
    pub fn id_line(&self) -> String {
        format!(
            "{} {:.2}",
            self.device_id(),
            self.firmware_version as f32 / 100.0
        )
    }
}

impl fmt::Display for StatusFrame {
    /// Battery line: `4.10V! 0.25A 87%`, with `!` while charging.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}V{} {:.2}A {}%",
            self.battery_voltage(),
            if self.charging { "!" } else { "" },
            self.current(),
            self.charge_percent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StatusFrame {
        StatusFrame {
            voltage_mv: 4100,
            current_ma: 250,
            charging: true,
            charge_percent: 87,
            uid: [
                0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E, 0x6F, 0x70, 0x81, 0x92, 0xA3, 0xB4,
            ],
            firmware_version: 105,
            batch: 3,
            device_crc_ok: true,
        }
    }

    #[test]
    fn test_parse_fields() {
        let mut raw = [0u8; STATUS_FRAME_LEN];
        raw[..6].copy_from_slice(b"Status");
        raw[6..8].copy_from_slice(&[0x10, 0x04]); // 4100 mV
        raw[8..10].copy_from_slice(&[0x00, 0xFA]); // 250 mA
        raw[10] = b'C';
        raw[11] = 87;
        raw[24..26].copy_from_slice(&[0x00, 0x69]);

        let status = StatusFrame::parse(&raw).unwrap();
        assert_eq!(status.voltage_mv, 4100);
        assert_eq!(status.current_ma, 250);
        assert!(status.charging);
        assert_eq!(status.charge_percent, 87);
        assert_eq!(status.firmware_version, 105);
        assert!((status.battery_voltage() - 4.1).abs() < 1e-6);
    }

    #[test]
    fn test_bad_magic_rejected_regardless_of_content() {
        let mut raw = sample().encode();
        raw[0] = b's';
        assert!(matches!(
            StatusFrame::parse(&raw),
            Err(StatusError::BadMagic { .. })
        ));

        let zeros = [0u8; STATUS_FRAME_LEN];
        assert!(matches!(
            StatusFrame::parse(&zeros),
            Err(StatusError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert_eq!(
            StatusFrame::parse(&[0u8; 31]),
            Err(StatusError::WrongLength { len: 31 })
        );
    }

    #[test]
    fn test_no_firmware_reports_zero() {
        let mut raw = sample().encode();
        raw[24] = 0xFF;
        raw[25] = 0xFF;
        assert_eq!(StatusFrame::parse(&raw).unwrap().firmware_version, 0);
    }

    #[test]
    fn test_not_charging_unless_c() {
        let mut raw = sample().encode();
        raw[10] = b'N';
        assert!(!StatusFrame::parse(&raw).unwrap().charging);
    }

    #[test]
    fn test_device_id_format() {
        assert_eq!(sample().device_id(), "001A-2B3C-4D5E-6F70-8192-A3B4");
    }

    #[test]
    fn test_report_lines() {
        let status = sample();
        assert_eq!(status.to_string(), "4.10V! 0.25A 87%");
        assert_eq!(status.id_line(), "001A-2B3C-4D5E-6F70-8192-A3B4 1.05");

        let idle = StatusFrame {
            charging: false,
            ..sample()
        };
        assert_eq!(idle.to_string(), "4.10V 0.25A 87%");
    }

    #[test]
    fn test_encode_parse_preserves_fields() {
        let status = sample();
        assert_eq!(StatusFrame::parse(&status.encode()).unwrap(), status);
    }
}
