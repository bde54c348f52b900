//! Wire frames exchanged with the STM front-end.
//!
//! Every frame is a fixed-size byte buffer whose last two bytes carry a
//! big-endian CRC-16 of everything before them. Layouts are explicit byte
//! offsets, never struct overlays.
//!
//! - [`status`]: the 32-byte status report read from the device
//! - [`command`]: outbound command frames (boot, LEDs, radio control, firmware)

mod command;
mod status;

pub use command::{
    boot_frame, firmware_read_request, firmware_write_frame, led_frame, ControlFrame, Switches,
    COMMAND_FRAME_LEN, FIRMWARE_HEADER_LEN, LED_1, LED_2, MAX_ATTENUATOR, MAX_GAIN,
};
#[cfg(any(test, feature = "sim"))]
pub(crate) use command::FirmwareHeader;
pub use status::{StatusError, StatusFrame, STATUS_FRAME_LEN, STATUS_MAGIC};

use crc::{Crc, CRC_16_MODBUS};

/// Length of the trailing checksum on every frame.
pub const TRAILER_LEN: usize = 2;

// The device firmware calls this CRC-16/ARC; the parameter set it actually
// runs (poly 0xA001 reflected, init 0xFFFF, no final XOR) is MODBUS.
const FRAME_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the frame checksum over `data`.
///
/// An empty input yields the initial value `0xFFFF`.
pub fn crc16(data: &[u8]) -> u16 {
    FRAME_CRC.checksum(data)
}

/// Write the checksum of all but the last two bytes into the last two bytes.
///
/// Buffers shorter than the trailer are left untouched.
pub fn stamp_trailer(frame: &mut [u8]) {
    let Some(body_len) = frame.len().checked_sub(TRAILER_LEN) else {
        return;
    };
    let crc = crc16(&frame[..body_len]);
    frame[body_len..].copy_from_slice(&crc.to_be_bytes());
}

/// Stored and recomputed checksum of a frame.
///
/// Returns `(stored, computed)`, or `None` if the buffer cannot hold a trailer.
pub fn trailer_checksums(frame: &[u8]) -> Option<(u16, u16)> {
    let body_len = frame.len().checked_sub(TRAILER_LEN)?;
    let stored = u16::from_be_bytes([frame[body_len], frame[body_len + 1]]);
    Some((stored, crc16(&frame[..body_len])))
}

/// Check that the trailing checksum matches the frame body.
pub fn verify_trailer(frame: &[u8]) -> bool {
    matches!(trailer_checksums(frame), Some((stored, computed)) if stored == computed)
}

/// Render a buffer as hex + ASCII rows of 16 bytes, for trace logging.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4 + 16);
    for row in data.chunks(16) {
        for byte in row {
            out.push_str(&format!("{:02X} ", byte));
        }
        for _ in row.len()..16 {
            out.push_str("   ");
        }
        for &byte in row {
            out.push(if (b' '..0x7F).contains(&byte) {
                byte as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }
    out
}
