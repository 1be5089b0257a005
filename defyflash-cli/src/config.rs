//! Configuration file support for defyflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (DEFYFLASH_*)
//! 3. Local config file (./defyflash.toml, then ./defyflash_ports.toml)
//! 4. Global config file (<config dir>/defyflash/config.toml and ports.toml)
//!
//! Implicitly discovered files that fail to parse are reported and skipped.
//! A file passed with `--config` must load.

use defyflash::{UpdatePolicy, UpgradeOptions};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const APP_NAME: &str = "defyflash";
const LOCAL_CONFIG: &str = "defyflash.toml";
const LOCAL_PORTS: &str = "defyflash_ports.toml";
const GLOBAL_PORTS: &str = "ports.toml";

/// Errors raised while loading an explicitly requested configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        /// Offending file.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("Failed to parse config file {}: {source}", .path.display())]
    Parse {
        /// Offending file.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("Invalid value for {key}: {reason}")]
    Invalid {
        /// Dotted key of the setting.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Remembered USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

impl PortConfig {
    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        for device in other.usb_device {
            if !self.usb_device.contains(&device) {
                self.usb_device.push(device);
            }
        }
    }
}

/// Upgrade session defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// Delay between readiness polls, in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Give up after this many not-ready answers.
    pub max_ready_attempts: Option<u32>,
    /// Give up after polling readiness for this long, in milliseconds.
    pub ready_timeout_ms: Option<u64>,
    /// Time to wait for each response line, in milliseconds.
    pub response_timeout_ms: Option<u64>,
    /// Leave halves that already run the sealed program untouched.
    pub skip_current: Option<bool>,
    /// Send `upgrade.end` after the last half.
    pub send_end: Option<bool>,
}

impl UpgradeConfig {
    fn merge(&mut self, other: Self) {
        if other.poll_interval_ms.is_some() {
            self.poll_interval_ms = other.poll_interval_ms;
        }
        if other.max_ready_attempts.is_some() {
            self.max_ready_attempts = other.max_ready_attempts;
        }
        if other.ready_timeout_ms.is_some() {
            self.ready_timeout_ms = other.ready_timeout_ms;
        }
        if other.response_timeout_ms.is_some() {
            self.response_timeout_ms = other.response_timeout_ms;
        }
        if other.skip_current.is_some() {
            self.skip_current = other.skip_current;
        }
        if other.send_end.is_some() {
            self.send_end = other.send_end;
        }
    }

    /// Reject values the session cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_ready_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                key: "upgrade.max_ready_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.response_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                key: "upgrade.response_timeout_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Build session options from these settings.
    pub fn to_options(&self) -> UpgradeOptions {
        let defaults = UpgradeOptions::default();
        UpgradeOptions {
            poll_interval: self
                .poll_interval_ms
                .map_or(defaults.poll_interval, Duration::from_millis),
            max_ready_attempts: self.max_ready_attempts,
            ready_timeout: self.ready_timeout_ms.map(Duration::from_millis),
            response_timeout: self
                .response_timeout_ms
                .map_or(defaults.response_timeout, Duration::from_millis),
            policy: if self.skip_current.unwrap_or(false) {
                UpdatePolicy::SkipWhenCurrent
            } else {
                UpdatePolicy::Always
            },
            send_end: self.send_end.unwrap_or(false),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Upgrade configuration.
    #[serde(default)]
    pub upgrade: UpgradeConfig,
}

impl Config {
    /// Load configuration from all implicit sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::try_load(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::try_load(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        for ports_path in Self::ports_config_paths() {
            if let Some(ports) = Self::try_load_ports(&ports_path) {
                debug!("Loaded ports config from {}", ports_path.display());
                config.port.merge(ports);
            }
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_file(path)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse a config file, reporting failures.
    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse an optional config file, warning and skipping on failure.
    fn try_load(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        Self::read_file(path)
            .map_err(|e| warn!("{e}"))
            .ok()
    }

    fn try_load_ports(path: &Path) -> Option<PortConfig> {
        if !path.exists() {
            return None;
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(ports) => Some(ports),
                Err(e) => {
                    warn!("Failed to parse ports file {}: {e}", path.display());
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read ports file {}: {e}", path.display());
                None
            },
        }
    }

    /// Ports files in increasing priority.
    fn ports_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(global_dir) = Self::global_config_dir() {
            paths.push(global_dir.join(GLOBAL_PORTS));
        }
        paths.push(PathBuf::from(LOCAL_PORTS));
        paths
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        self.port.merge(other.port);
        self.upgrade.merge(other.upgrade);
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        // Stay local when the project already has local config
        let path = if Path::new(LOCAL_PORTS).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join(GLOBAL_PORTS)
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        self.port.usb_device.push(device);
        Self::write_ports(&path, &self.port)?;
        info!("Saved USB device to {}", path.display());
        Ok(())
    }

    fn write_ports(path: &Path, ports: &PortConfig) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(ports)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.port.connection.serial.is_none());
        assert!(config.port.connection.baud.is_none());
        assert!(config.port.usb_device.is_empty());
        assert!(config.upgrade.poll_interval_ms.is_none());
        assert!(config.upgrade.skip_current.is_none());
        assert!(config.upgrade.send_end.is_none());
    }

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x35EF,
            pid: 0x0010,
        };
        assert!(device.matches(0x35EF, 0x0010));
        assert!(!device.matches(0x35EF, 0x0012));
        assert!(!device.matches(0x1209, 0x0010));
    }

    #[test]
    fn test_config_merge_overrides_set_values() {
        let mut base = Config::default();
        base.port.connection.baud = Some(115200);
        base.upgrade.poll_interval_ms = Some(1000);

        let mut other = Config::default();
        other.port.connection.serial = Some("/dev/ttyACM0".to_string());
        other.port.connection.baud = Some(9600);
        other.upgrade.poll_interval_ms = Some(250);
        other.upgrade.skip_current = Some(true);

        base.merge(other);

        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.port.connection.baud, Some(9600));
        assert_eq!(base.upgrade.poll_interval_ms, Some(250));
        assert_eq!(base.upgrade.skip_current, Some(true));
    }

    #[test]
    fn test_config_merge_can_turn_switches_off() {
        let mut base = Config::default();
        base.upgrade.skip_current = Some(true);
        base.upgrade.send_end = Some(true);

        let mut other = Config::default();
        other.upgrade.skip_current = Some(false);

        base.merge(other);

        assert_eq!(base.upgrade.skip_current, Some(false));
        assert_eq!(base.upgrade.send_end, Some(true));
        let options = base.upgrade.to_options();
        assert_eq!(options.policy, UpdatePolicy::Always);
        assert!(options.send_end);
    }

    #[test]
    fn test_local_toml_disables_global_switch() {
        let mut global: Config = toml::from_str("[upgrade]\nskip_current = true\n").unwrap();
        let local: Config = toml::from_str("[upgrade]\nskip_current = false\n").unwrap();

        global.merge(local);
        assert_eq!(global.upgrade.skip_current, Some(false));
        assert_eq!(global.upgrade.to_options().policy, UpdatePolicy::Always);
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.port.connection.serial = Some("/dev/ttyACM0".to_string());
        base.upgrade.max_ready_attempts = Some(5);

        base.merge(Config::default());

        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.upgrade.max_ready_attempts, Some(5));
    }

    #[test]
    fn test_config_merge_usb_devices_deduplicated() {
        let mut base = Config::default();
        base.port.usb_device.push(UsbDevice { vid: 0x35EF, pid: 0x0010 });

        let mut other = Config::default();
        other.port.usb_device.push(UsbDevice { vid: 0x35EF, pid: 0x0010 });
        other.port.usb_device.push(UsbDevice { vid: 0x1209, pid: 0x2201 });

        base.merge(other);
        assert_eq!(base.port.usb_device.len(), 2);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[port.connection]
serial = "/dev/ttyACM0"
baud = 115200

[[port.usb_device]]
vid = 13807
pid = 16

[upgrade]
poll_interval_ms = 500
max_ready_attempts = 30
response_timeout_ms = 2000
skip_current = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.port.connection.baud, Some(115200));
        assert_eq!(config.port.usb_device[0].vid, 0x35EF);
        assert_eq!(config.upgrade.poll_interval_ms, Some(500));
        assert_eq!(config.upgrade.max_ready_attempts, Some(30));
        assert_eq!(config.upgrade.response_timeout_ms, Some(2000));
        assert_eq!(config.upgrade.skip_current, Some(true));
        assert!(config.upgrade.send_end.is_none());
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.port.connection.serial.is_none());
        assert!(config.upgrade.ready_timeout_ms.is_none());
    }

    #[test]
    fn test_upgrade_config_to_options() {
        let options = UpgradeConfig::default().to_options();
        let defaults = UpgradeOptions::default();
        assert_eq!(options.poll_interval, defaults.poll_interval);
        assert_eq!(options.response_timeout, defaults.response_timeout);
        assert_eq!(options.policy, UpdatePolicy::Always);
        assert!(options.max_ready_attempts.is_none());

        let upgrade = UpgradeConfig {
            poll_interval_ms: Some(200),
            max_ready_attempts: Some(10),
            ready_timeout_ms: Some(30_000),
            response_timeout_ms: Some(1500),
            skip_current: Some(true),
            send_end: Some(true),
        };
        let options = upgrade.to_options();
        assert_eq!(options.poll_interval, Duration::from_millis(200));
        assert_eq!(options.max_ready_attempts, Some(10));
        assert_eq!(options.ready_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.response_timeout, Duration::from_millis(1500));
        assert_eq!(options.policy, UpdatePolicy::SkipWhenCurrent);
        assert!(options.send_end);
    }

    #[test]
    fn test_upgrade_config_validate() {
        assert!(UpgradeConfig::default().validate().is_ok());

        let zero_attempts = UpgradeConfig {
            max_ready_attempts: Some(0),
            ..UpgradeConfig::default()
        };
        assert!(matches!(
            zero_attempts.validate(),
            Err(ConfigError::Invalid { key: "upgrade.max_ready_attempts", .. })
        ));

        let zero_timeout = UpgradeConfig {
            response_timeout_ms: Some(0),
            ..UpgradeConfig::default()
        };
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_port_config_toml_roundtrip() {
        let mut port = PortConfig::default();
        port.connection.serial = Some("/dev/ttyACM0".to_string());
        port.usb_device.push(UsbDevice { vid: 0x35EF, pid: 0x0010 });

        let serialized = toml::to_string_pretty(&port).unwrap();
        let deserialized: PortConfig = toml::from_str(&serialized).unwrap();

        assert_eq!(deserialized.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(deserialized.usb_device, port.usb_device);
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(
            &path,
            r#"
[port.connection]
serial = "COM7"
[upgrade]
send_end = true
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("COM7"));
        assert_eq!(config.upgrade.send_end, Some(true));
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let err = Config::load_from_path(Path::new("/nonexistent/path/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_from_path_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("TOML"));
    }

    #[test]
    fn test_try_load_skips_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[upgrade]\npoll_interval_ms = \"fast\"\n").unwrap();

        assert!(Config::try_load(&path).is_none());
        assert!(Config::try_load(&dir.path().join("missing.toml")).is_none());
    }

    #[test]
    fn test_write_ports_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCAL_PORTS);
        let mut ports = PortConfig::default();
        ports.usb_device.push(UsbDevice { vid: 0x1209, pid: 0x2201 });

        Config::write_ports(&path, &ports).unwrap();
        let loaded = Config::try_load_ports(&path).unwrap();
        assert_eq!(loaded.usb_device, ports.usb_device);
    }

    #[test]
    fn test_global_config_path_names_app() {
        if let Some(p) = Config::global_config_path() {
            let s = p.to_string_lossy();
            assert!(s.contains(APP_NAME));
            assert!(s.ends_with("config.toml"));
        }
    }
}
