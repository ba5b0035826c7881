//! Configuration file support for microflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MICROFLASH_*)
//! 3. Local config file (./microflash.toml)
//! 4. Global config file (~/.config/microflash/config.toml)

use {
    directories::ProjectDirs,
    log::{debug, warn},
    microflash::{ConnectionOptions, DeviceFilter},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Preferred probe (`bus:address` or serial number prefix).
    pub probe: Option<String>,
    /// Serial baud rate.
    pub baud: Option<u32>,
    /// USB vendor ID to match instead of the micro:bit one.
    pub vendor_id: Option<u16>,
    /// USB product ID to match instead of the micro:bit one.
    pub product_id: Option<u16>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlashConfig {
    /// Always do a full flash.
    #[serde(default)]
    pub full: bool,
    /// Deadline for the pre-flash reset, in milliseconds.
    pub reset_timeout_ms: Option<u64>,
}

/// Monitor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Show timestamps by default.
    #[serde(default)]
    pub timestamp: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash settings.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new("microflash.toml")) {
            debug!("Loaded local config from microflash.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!("Could not load config from {}, using defaults", path.display());
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "microflash").map(|dirs| {
            dirs.config_dir()
                .to_path_buf()
        })
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Values set in `other` win.
    fn merge(&mut self, other: Self) {
        let connection = other.connection;
        if connection
            .probe
            .is_some()
        {
            self.connection.probe = connection.probe;
        }
        if connection
            .baud
            .is_some()
        {
            self.connection.baud = connection.baud;
        }
        if connection
            .vendor_id
            .is_some()
        {
            self.connection.vendor_id = connection.vendor_id;
        }
        if connection
            .product_id
            .is_some()
        {
            self.connection.product_id = connection.product_id;
        }

        if other.flash.full {
            self.flash.full = true;
        }
        if other
            .flash
            .reset_timeout_ms
            .is_some()
        {
            self.flash.reset_timeout_ms = other.flash.reset_timeout_ms;
        }

        if other.monitor.timestamp {
            self.monitor.timestamp = true;
        }
    }

    /// Device filter for probe discovery. IDs not set fall back to the
    /// micro:bit ones.
    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter {
            vendor_id: self
                .connection
                .vendor_id
                .or(DeviceFilter::MICROBIT.vendor_id),
            product_id: self
                .connection
                .product_id
                .or(DeviceFilter::MICROBIT.product_id),
        }
    }

    /// Library connection options, with `baud` from the command line taking
    /// precedence over the file.
    pub fn connection_options(&self, baud: Option<u32>) -> ConnectionOptions {
        let mut options = ConnectionOptions::default().with_filter(self.device_filter());
        if let Some(baud) = baud.or(self.connection.baud) {
            options = options.with_baud_rate(baud);
        }
        if let Some(ms) = self.flash.reset_timeout_ms {
            options = options.with_reset_timeout(Duration::from_millis(ms));
        }
        options
    }
}
