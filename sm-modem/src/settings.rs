//! Application settings

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sm_host::HostConfig;
use sm_pipe::UartConfig;
use sm_sim::SimModemConfig;
use tracing::{info, warn};

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Serial port path; empty lists the available ports and exits
    pub port: String,
    /// Link rate of the serial port
    pub baud_rate: u32,
    /// AT host behavior
    pub host: HostConfig,
    /// UART buffering
    pub uart: UartConfig,
    /// Identity of the simulated modem answering commands
    pub modem: SimModemConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
            host: HostConfig::default(),
            uart: UartConfig::default(),
            modem: SimModemConfig::default(),
        }
    }
}

impl Settings {
    /// Get the XDG config directory for sm-modem
    /// Uses $XDG_CONFIG_HOME/sm-modem, falls back to ~/.config/sm-modem
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("sm-modem"));
            }
        }
        dirs::home_dir().map(|h| h.join(".config").join("sm-modem"))
    }

    /// Default settings file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from `path`, or from the default location
    ///
    /// A missing or malformed file gives the defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => {
                    warn!("Could not determine settings path, using defaults");
                    return Self::default();
                }
            },
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                info!("No settings at {} ({}), using defaults", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(settings) => {
                info!("Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                warn!("Invalid settings in {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// Host configuration with the link parameters filled in from the port settings
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            baud_rate: self.baud_rate,
            rx_buffer_size: self.uart.rx_buffer_size,
            ..self.host.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_protocol::LineTermination;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("sm-modem-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_partial_settings_keep_defaults() {
        let path = temp_file(
            "partial.json",
            r#"{ "port": "/dev/ttyACM0", "host": { "line_termination": "cr_lf", "echo": true } }"#,
        );
        let settings = Settings::load(Some(&path));
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.port, "/dev/ttyACM0");
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.host.line_termination, LineTermination::CrLf);
        assert!(settings.host.echo);
        assert_eq!(settings.host.quit_string, "+++");
        assert_eq!(settings.uart, UartConfig::default());
    }

    #[test]
    fn test_missing_or_bad_file_gives_defaults() {
        let missing = std::env::temp_dir().join("sm-modem-does-not-exist.json");
        assert_eq!(Settings::load(Some(&missing)), Settings::default());

        let path = temp_file("bad.json", "{ not json");
        let settings = Settings::load(Some(&path));
        std::fs::remove_file(&path).ok();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_host_config_follows_link() {
        let settings = Settings {
            baud_rate: 9600,
            ..Settings::default()
        };
        let config = settings.host_config();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.rx_buffer_size, 256);
        assert_eq!(config.min_time_limit_ms(), 276);
    }
}
