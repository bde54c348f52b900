//! STM front-end flash utility.
//!
//! Hard-resets the front-end, optionally moves firmware, then prints the
//! device id. Scripts read the last line of stdout:
//!
//! | Output | Exit | Meaning |
//! |--------|------|---------|
//! | `STM-ID: <id>` | 0 | success |
//! | `INIT-ERROR` | 1 | hardware could not be opened or reset |
//! | `STAT-ERROR` | 2 | device did not answer with a status frame |
//! | `FW-ERROR` | 3 | firmware transfer failed |
//!
//! # Usage
//!
//! ```bash
//! malahit-stm                    # reset, print id
//! malahit-stm -r backup.bin      # download the installed firmware
//! malahit-stm -w malahit-r1-fw-107.bin   # install if newer
//! malahit-stm -f malahit-r1-fw-107.bin   # install unconditionally
//! malahit-stm -u                 # install the newest image from firmware_dir
//! malahit-stm -g                 # also start the radio firmware
//! ```
//!
//! An unknown option, or one missing its file, is logged and skipped.
//!
//! The device is located through `$MALAHIT_CONFIG` or
//! `/etc/malahit/frontend.json`; stock wiring is used when neither exists.

#![cfg_attr(not(feature = "linux"), allow(dead_code))]

use log::warn;
use std::path::PathBuf;

#[derive(Debug, PartialEq)]
enum Action {
    Status,
    Download(PathBuf),
    Install { path: PathBuf, force: bool },
    Update,
    Boot,
}

/// Options that cannot be used are ignored; the id is still reported.
fn parse_args(args: &[String]) -> Action {
    let file = |option: &str| match args.get(2) {
        Some(path) => Some(PathBuf::from(path)),
        None => {
            warn!("{} needs a file name, ignoring it", option);
            None
        }
    };

    let action = match args.get(1).map(String::as_str) {
        None => Some(Action::Status),
        Some("-r") => file("-r").map(Action::Download),
        Some("-w") => file("-w").map(|path| Action::Install { path, force: false }),
        Some("-f") => file("-f").map(|path| Action::Install { path, force: true }),
        Some("-u") => Some(Action::Update),
        Some("-g") => Some(Action::Boot),
        Some(other) => {
            warn!("Unknown option {}, ignoring it", other);
            None
        }
    };
    action.unwrap_or(Action::Status)
}

#[cfg(feature = "linux")]
mod cli {
    use super::{parse_args, Action};
    use log::{error, info, warn};
    use malahit_frontend::linux::{self, LinuxController};
    use malahit_frontend::{find_latest_firmware, DeviceConfig};
    use std::path::Path;
    use std::process::exit;

    fn fail(token: &str, code: i32) -> ! {
        println!("{}", token);
        exit(code);
    }

    fn install(controller: &LinuxController, path: &Path, force: bool) {
        if let Err(e) = controller.install_firmware_image(path, force) {
            error!("Failed to update STM firmware: {}", e);
            fail("FW-ERROR", 3);
        }
    }

    pub fn run() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .init();

        let args: Vec<String> = std::env::args().collect();
        let action = parse_args(&args);

        let config = match DeviceConfig::load_default() {
            Ok(config) => config,
            Err(e) => {
                error!("Bad device config: {}", e);
                fail("INIT-ERROR", 1);
            }
        };

        let controller = match linux::open(&config) {
            Ok(controller) => controller,
            Err(e) => {
                error!("Failed to open STM device: {}", e);
                fail("INIT-ERROR", 1);
            }
        };
        if let Err(e) = controller.hard_reset() {
            error!("Failed to reset STM device: {}", e);
            fail("INIT-ERROR", 1);
        }

        match action {
            Action::Status => {}
            Action::Download(path) => {
                if let Err(e) = controller.download_firmware_image(&path) {
                    error!("Failed to download STM firmware: {}", e);
                    fail("FW-ERROR", 3);
                }
            }
            Action::Install { path, force } => install(&controller, &path, force),
            Action::Update => match find_latest_firmware(&config.firmware_dir) {
                Some(path) => install(&controller, &path, false),
                None => warn!("No firmware images in {}", config.firmware_dir.display()),
            },
            Action::Boot => {
                if let Err(e) = controller.bring_up() {
                    error!("Failed to start STM device: {}", e);
                    fail("INIT-ERROR", 1);
                }
            }
        }

        match controller.query_status() {
            Ok(status) => {
                info!("{} ({})", status.id_line(), status);
                println!("STM-ID: {}", status.device_id());
            }
            Err(e) => {
                error!("Failed to read STM device ID: {}", e);
                fail("STAT-ERROR", 2);
            }
        }
    }
}

#[cfg(feature = "linux")]
fn main() {
    cli::run();
}

#[cfg(not(feature = "linux"))]
fn main() {
    eprintln!("This binary needs the Linux GPIO and SPI backends.");
    eprintln!();
    eprintln!("Build with:");
    eprintln!("  cargo build --release --features linux --bin malahit-stm");
    std::process::exit(1);
}
