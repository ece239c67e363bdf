//! Configuration Vault – reads/writes `~/.parcel-bridge/config.toml`.
//!
//! Settings are layered, later layers winning:
//!
//! 1. built-in defaults
//! 2. the TOML file (`--config PATH`, else `~/.parcel-bridge/config.toml`)
//! 3. environment variables (see [`apply_env_overrides`])
//! 4. command-line flags

use std::fs;
use std::path::{Path, PathBuf};

use kiosk_hal::SerialConfig;
use kiosk_middleware::{BridgeConfig, MqttSettings};
use kiosk_types::KioskError;
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

/// Persisted bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttSettings,

    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Config {
    /// # Errors
    ///
    /// Returns the first [`KioskError::Config`] raised by any section.
    pub fn validate(&self) -> Result<(), KioskError> {
        self.mqtt.validate()?;
        self.serial.validate()?;
        self.bridge.validate()
    }
}

/// Return the path to `~/.parcel-bridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".parcel-bridge").join("config.toml")
}

/// Load the config from a specific path.  Returns `None` if the file does not
/// exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, KioskError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        KioskError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| KioskError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MQTT_HOST` | `mqtt.host` |
/// | `MQTT_PORT` | `mqtt.port` |
/// | `CLIENT_ID` | `mqtt.client_id` |
/// | `MQTT_USER` | `mqtt.username` |
/// | `MQTT_PASS` | `mqtt.password` |
/// | `KIOSK_SERIAL_PORT` | `serial.port` |
/// | `KIOSK_BAUD` | `serial.baud` |
///
/// Unparsable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an injectable variable lookup.
pub(crate) fn apply_overrides_from(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("MQTT_HOST") {
        cfg.mqtt.host = v;
    }
    if let Some(v) = lookup("MQTT_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.mqtt.port = port;
    }
    if let Some(v) = lookup("CLIENT_ID") {
        cfg.mqtt.client_id = v;
    }
    if let Some(v) = lookup("MQTT_USER") {
        cfg.mqtt.username = Some(v);
    }
    if let Some(v) = lookup("MQTT_PASS") {
        cfg.mqtt.password = Some(v);
    }
    if let Some(v) = lookup("KIOSK_SERIAL_PORT") {
        cfg.serial.port = v;
    }
    if let Some(v) = lookup("KIOSK_BAUD")
        && let Ok(baud) = v.parse::<u32>()
    {
        cfg.serial.baud = baud;
    }
}

/// Build the effective configuration for this run.
///
/// Returns the config together with the path it was (or would be) stored at.
///
/// # Errors
///
/// [`KioskError::Config`] when an explicitly requested file is missing or
/// unreadable, or when the merged result does not validate.
pub fn resolve(cli: &Cli) -> Result<(Config, PathBuf), KioskError> {
    let path = cli.config.clone().unwrap_or_else(config_path);
    let loaded = load_from(&path)?;
    if loaded.is_none() && cli.config.is_some() && !cli.save_config {
        return Err(KioskError::Config(format!(
            "config file {} does not exist",
            path.display()
        )));
    }

    let mut cfg = loaded.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cli.apply(&mut cfg);
    cfg.validate()?;
    Ok((cfg, path))
}

/// Save the config to a specific path, creating its directory if necessary.
///
/// The file may hold broker credentials, so on Unix the directory is made
/// owner-only (`0o700`) and the file owner read/write (`0o600`).
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), KioskError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            KioskError::Config(format!("failed to create config directory: {e}"))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                KioskError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| KioskError::Config(format!("failed to serialize config: {e}")))?;
    let write_err =
        |e: std::io::Error| KioskError::Config(format!("failed to write {}: {e}", path.display()));
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
