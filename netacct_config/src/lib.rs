//! Daemon configuration, loaded from `/etc/netacct.toml` (or the path in
//! the `NETACCT_CONFIG` environment variable). Every field other than the
//! interface name has a sensible default, so a minimal config is just:
//!
//! ```toml
//! interface = "eth0"
//! ```

use log::error;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "/etc/netacct.toml";

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    /// The interface being accounted. One daemon instance covers one
    /// interface.
    pub interface: String,

    /// Seconds between kernel counter samples.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Seconds between flushes of the in-memory counters to disk.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,

    /// Directory under which per-interface state and daily logs live.
    #[serde(default = "default_root_dir")]
    pub root_dir: String,

    /// Path of the Unix control socket.
    #[serde(default = "default_control_socket")]
    pub control_socket: String,

    /// Addresses to start tracking at startup, before the control channel
    /// says anything. Dotted-quad IPv4.
    #[serde(default)]
    pub tracked_ips: Vec<String>,
}

fn default_poll_interval() -> u64 {
    1
}

fn default_flush_interval() -> u64 {
    300
}

fn default_root_dir() -> String {
    "/var/lib/netacct".to_string()
}

fn default_control_socket() -> String {
    "/run/netacct.sock".to_string()
}

impl Config {
    /// Load the configuration from the default path, honoring the
    /// `NETACCT_CONFIG` override.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("NETACCT_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load the configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            error!("Unable to read {}: {:?}", path.display(), e);
            ConfigError::Unreadable(path.display().to_string())
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| {
            error!("Unable to parse {}: {:?}", path.display(), e);
            ConfigError::Parse(e.to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.is_empty() {
            return Err(ConfigError::Invalid("interface must not be empty".to_string()));
        }
        if self.poll_interval == 0 || self.flush_interval == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval and flush_interval must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),
    #[error("Configuration file unreadable: {0}")]
    Unreadable(String),
    #[error("Configuration parse error: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let file = write_config("interface = \"eth0\"\n");
        let cfg = Config::load_from(file.path()).unwrap();
        assert_eq!(cfg.interface, "eth0");
        assert_eq!(cfg.poll_interval, 1);
        assert_eq!(cfg.flush_interval, 300);
        assert_eq!(cfg.root_dir, "/var/lib/netacct");
        assert!(cfg.tracked_ips.is_empty());
    }

    #[test]
    fn full_config_round_trips() {
        let file = write_config(
            "interface = \"enp0s3\"\npoll_interval = 2\nflush_interval = 5\nroot_dir = \"/tmp/acct\"\ncontrol_socket = \"/tmp/acct.sock\"\ntracked_ips = [\"10.0.0.5\", \"10.0.0.6\"]\n",
        );
        let cfg = Config::load_from(file.path()).unwrap();
        assert_eq!(cfg.flush_interval, 5);
        assert_eq!(cfg.tracked_ips.len(), 2);
    }

    #[test]
    fn missing_file_is_not_found() {
        let result = Config::load_from(Path::new("/nonexistent/netacct.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn zero_interval_rejected() {
        let file = write_config("interface = \"eth0\"\nflush_interval = 0\n");
        let result = Config::load_from(file.path());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let file = write_config("interface = [not toml");
        let result = Config::load_from(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
