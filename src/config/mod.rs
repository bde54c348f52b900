//! Device configuration.
//!
//! Where the front-end is wired and how strictly its frames are checked.
//! Stored as JSON; every field is optional and falls back to the stock
//! Malahit wiring.
//!
//! # Example
//!
//! ```
//! use malahit_frontend::config::DeviceConfig;
//! use malahit_frontend::transport::CrcPolicy;
//!
//! let config = DeviceConfig::from_json(r#"{ "crc_policy": "strict" }"#).unwrap();
//! assert_eq!(config.crc_policy, CrcPolicy::Strict);
//! assert_eq!(config.spi_device, "/dev/spidev0.0");
//! ```

use crate::transport::CrcPolicy;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "MALAHIT_CONFIG";

/// Config file read when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/malahit/frontend.json";

/// Highest SPI clock accepted, in Hz.
pub const MAX_SPI_SPEED_HZ: u32 = 50_000_000;

/// Where the front-end hangs and how to talk to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// GPIO chip holding the reset and busy lines.
    pub gpio_chip: String,
    /// spidev node of the front-end.
    pub spi_device: String,
    /// SPI clock in Hz.
    pub spi_speed_hz: u32,
    pub crc_policy: CrcPolicy,
    /// Directory searched for `malahit-r1-fw-*.bin` images.
    pub firmware_dir: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gpio_chip: "gpiochip0".to_string(),
            spi_device: "/dev/spidev0.0".to_string(),
            spi_speed_hz: 10_000_000,
            crc_policy: CrcPolicy::Lenient,
            firmware_dir: PathBuf::from("/usr/share/malahit"),
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// File could not be read.
    Io { path: PathBuf, source: io::Error },
    /// Content is not valid config JSON.
    Parse(serde_json::Error),
    /// A required name is empty.
    Empty { field: &'static str },
    /// SPI clock is zero or above [`MAX_SPI_SPEED_HZ`].
    SpiSpeed { hz: u32 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "cannot read {}: {}", path.display(), source),
            Self::Parse(e) => write!(f, "invalid config: {}", e),
            Self::Empty { field } => write!(f, "{} cannot be empty", field),
            Self::SpiSpeed { hz } => write!(
                f,
                "SPI speed {} Hz out of range (1..={})",
                hz, MAX_SPI_SPEED_HZ
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl DeviceConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&json)?;
        info!("Loaded device config from {}", path.display());
        Ok(config)
    }

    /// Load from `$MALAHIT_CONFIG`, else the default path, else defaults.
    ///
    /// A file named by the environment must exist; the default path is
    /// optional.
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }

        let path = Path::new(DEFAULT_CONFIG_PATH);
        if path.exists() {
            return Self::load(path);
        }

        debug!("No config at {}, using defaults", DEFAULT_CONFIG_PATH);
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gpio_chip.is_empty() {
            return Err(ConfigError::Empty { field: "gpio_chip" });
        }
        if self.spi_device.is_empty() {
            return Err(ConfigError::Empty {
                field: "spi_device",
            });
        }
        if self.spi_speed_hz == 0 || self.spi_speed_hz > MAX_SPI_SPEED_HZ {
            return Err(ConfigError::SpiSpeed {
                hz: self.spi_speed_hz,
            });
        }
        Ok(())
    }
}
