//! Firmware image download and install.
//!
//! Images are flat 2 MiB binaries moved in 2 KiB chunks. The version of an
//! image comes from its file name, `malahit-r1-fw-<version>.bin`.

use super::{Controller, ControllerError};
use crate::gpio::{Delay, GpioBackend};
use crate::transport::SpiBus;
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Size of a complete firmware image.
pub const FIRMWARE_SIZE: usize = 0x20_0000;

/// Transfer unit for firmware reads and writes.
pub const FIRMWARE_STEP: usize = 0x800;

/// File name prefix of firmware images; the version digits follow it.
pub const FIRMWARE_NAME_PREFIX: &str = "malahit-r1-fw-";

/// Outcome of the version check that opens every install.
enum InstallPlan {
    Skip(InstallOutcome),
    Write { current: u16, target: u32 },
}

/// Result of an install request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The device already runs this version or newer; nothing was written.
    UpToDate { current: u16, candidate: u32 },
    /// The image was written and the device now reports its version.
    Installed { previous: u16, version: u32, bytes: usize },
}

/// Parse the version out of an image path's base name.
///
/// `malahit-r1-fw-107.bin` gives 107. Anything that does not start with the
/// prefix followed by digits gives 0.
pub fn firmware_version_from_name(name: &str) -> u32 {
    let Some(base) = Path::new(name).file_name().and_then(|base| base.to_str()) else {
        return 0;
    };
    let Some(rest) = base.strip_prefix(FIRMWARE_NAME_PREFIX) else {
        return 0;
    };
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Newest `malahit-r1-fw-*.bin` image in `dir`, by parsed version.
pub fn find_latest_firmware(dir: &Path) -> Option<PathBuf> {
    let pattern = dir.join(format!("{}*.bin", FIRMWARE_NAME_PREFIX));
    let paths = glob::glob(&pattern.to_string_lossy()).ok()?;

    paths
        .flatten()
        .filter_map(|path| {
            let version = firmware_version_from_name(&path.to_string_lossy());
            (version > 0).then_some((version, path))
        })
        .max_by_key(|(version, _)| *version)
        .map(|(_, path)| path)
}

/// Fill `buf` from `reader`, stopping early only at end of input.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl<G: GpioBackend, B: SpiBus, D: Delay> Controller<G, B, D> {
    /// Read the whole device flash into `out`.
    ///
    /// Stops at the first chunk that cannot be read or stored.
    pub fn download_firmware<W: Write>(&self, mut out: W) -> Result<(), ControllerError> {
        let mut chunk = [0u8; FIRMWARE_STEP];
        let mut hasher = Sha256::new();
        let mut done = 0;

        while done < FIRMWARE_SIZE {
            debug!("Reading {}kB from 0x{:X}", FIRMWARE_STEP >> 10, done);
            if let Err(e) = self.read_firmware_chunk(&mut chunk, done as u32) {
                error!("Firmware read at 0x{:X} failed: {}", done, e);
                break;
            }
            if let Err(e) = out.write_all(&chunk) {
                error!("Storing firmware chunk 0x{:X} failed: {}", done, e);
                break;
            }
            hasher.update(chunk);
            done += FIRMWARE_STEP;
        }

        if done != FIRMWARE_SIZE {
            return Err(ControllerError::IncompleteTransfer {
                stage: "download",
                done,
                expected: FIRMWARE_SIZE,
            });
        }
        if let Err(e) = out.flush() {
            error!("Flushing downloaded firmware failed: {}", e);
            return Err(ControllerError::IncompleteTransfer {
                stage: "download flush",
                done,
                expected: FIRMWARE_SIZE,
            });
        }

        info!(
            "Downloaded {}kB, sha256 {}",
            done >> 10,
            hex_digest(hasher)
        );
        Ok(())
    }

    /// Read the whole device flash into the file at `path`.
    pub fn download_firmware_image(&self, path: &Path) -> Result<(), ControllerError> {
        let file = File::create(path).map_err(|source| {
            error!("Failed creating {}: {}", path.display(), source);
            ControllerError::Image {
                path: path.to_path_buf(),
                source,
            }
        })?;
        info!("Downloading firmware to {}", path.display());
        self.download_firmware(BufWriter::new(file))
    }

    /// Install the image read from `source`, named `name`, if it is newer.
    ///
    /// The version comes from `name`. Unless `force` is set, nothing is
    /// written when the device already reports that version or a newer one.
    /// After writing (even partially) the device is reset, and the install
    /// only counts as done if it then reports the image's version.
    pub fn install_firmware<R: Read>(
        &self,
        name: &str,
        mut source: R,
        force: bool,
    ) -> Result<InstallOutcome, ControllerError> {
        match self.plan_install(name, force) {
            InstallPlan::Skip(outcome) => Ok(outcome),
            InstallPlan::Write { current, target } => {
                self.flash_and_confirm(name, &mut source, current, target)
            }
        }
    }

    /// Version query and comparison; decides whether anything gets written.
    fn plan_install(&self, name: &str, force: bool) -> InstallPlan {
        let current = self.version_or_unknown(name);
        if current == 0 {
            warn!("{}: current firmware version unknown", name);
        }

        let target = firmware_version_from_name(name);
        if target <= current as u32 && !force {
            info!(
                "{}: device has {:03}, image is {:03}, no update needed",
                name, current, target
            );
            return InstallPlan::Skip(InstallOutcome::UpToDate {
                current,
                candidate: target,
            });
        }

        info!("{}: updating firmware {:03} => {:03}", name, current, target);
        InstallPlan::Write { current, target }
    }

    /// Write, reset and check the reported version.
    fn flash_and_confirm<R: Read>(
        &self,
        name: &str,
        source: &mut R,
        current: u16,
        target: u32,
    ) -> Result<InstallOutcome, ControllerError> {
        let written = self.write_image(name, source);
        if written != FIRMWARE_SIZE {
            error!(
                "{}: failed writing firmware ({}kB/{}kB)",
                name,
                written >> 10,
                FIRMWARE_SIZE >> 10
            );
        }

        if let Err(e) = self.transport.gpio().wait_for_ready() {
            error!("{}: not ready after update: {}", name, e);
        }
        if let Err(e) = self.hard_reset() {
            error!("{}: failed to reset after update: {}", name, e);
        }

        let installed = self.version_or_unknown(name);
        if installed as u32 != target {
            error!(
                "{}: failed updating firmware, still at version {:03} (wanted {:03})",
                name, installed, target
            );
            return Err(ControllerError::FirmwareMismatch {
                expected: target,
                actual: installed,
                written,
            });
        }

        info!(
            "{}: updated {}kB, version is {:03}",
            name,
            written >> 10,
            installed
        );
        Ok(InstallOutcome::Installed {
            previous: current,
            version: target,
            bytes: written,
        })
    }

    /// Stream the image in chunks; returns how many bytes reached the device.
    fn write_image<R: Read>(&self, name: &str, source: &mut R) -> usize {
        let mut chunk = [0u8; FIRMWARE_STEP];
        let mut hasher = Sha256::new();
        let mut written = 0;

        while written < FIRMWARE_SIZE {
            match read_full(source, &mut chunk) {
                Ok(FIRMWARE_STEP) => {}
                Ok(n) => {
                    warn!("{}: short read of {} bytes at 0x{:X}", name, n, written);
                    break;
                }
                Err(e) => {
                    error!("{}: read failed at 0x{:X}: {}", name, written, e);
                    break;
                }
            }

            debug!("{}: writing {}kB to 0x{:X}", name, FIRMWARE_STEP >> 10, written);
            if let Err(e) = self.write_firmware_chunk(&chunk, written as u32) {
                error!("{}: write at 0x{:X} failed: {}", name, written, e);
                break;
            }
            hasher.update(chunk);
            written += FIRMWARE_STEP;
        }

        info!("{}: wrote {} bytes, sha256 {}", name, written, hex_digest(hasher));
        written
    }

    /// Install the image file at `path` if it is newer than the device's.
    ///
    /// The file is opened only once an update is due, so a missing image is
    /// not an error while the device is current.
    pub fn install_firmware_image(
        &self,
        path: &Path,
        force: bool,
    ) -> Result<InstallOutcome, ControllerError> {
        let name = path.to_string_lossy();
        let (current, target) = match self.plan_install(&name, force) {
            InstallPlan::Skip(outcome) => return Ok(outcome),
            InstallPlan::Write { current, target } => (current, target),
        };

        let file = File::open(path).map_err(|source| {
            error!("Failed opening {}: {}", path.display(), source);
            ControllerError::Image {
                path: path.to_path_buf(),
                source,
            }
        })?;
        self.flash_and_confirm(&name, &mut BufReader::new(file), current, target)
    }
}
