//! Rack configuration
//!
//! Loaded from a YAML file, then overridden from the environment:
//!
//! ```yaml
//! tftp_root: /var/lib/maas/boot-resources/current
//! tftp_port: 69
//! region_urls:
//!   - http://10.0.0.2:5240/MAAS
//! system_id: abc123
//! ```

use crate::error::{PxeError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Config file read when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/maas/rackd.conf";

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "MAAS_RACKD_CONFIG";

/// Rack controller settings, read from YAML. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RackConfig {
    /// Directory served over TFTP and HTTP.
    pub tftp_root: PathBuf,
    /// TFTP listening port.
    pub tftp_port: u16,
    /// Upper bound applied to any negotiated `blksize`.
    pub tftp_max_blksize: usize,
    /// Retransmission timeout, in seconds.
    pub tftp_timeout_secs: u64,
    /// Seconds between interface re-checks.
    pub interface_refresh_secs: u64,
    /// Address the HTTP boot bridge listens on.
    pub http_bind: SocketAddr,
    /// Base URL of the image cache.
    pub image_cache_url: String,
    /// Region controllers, tried round-robin.
    pub region_urls: Vec<String>,
    /// Rack identity sent to the region with every boot config request.
    pub system_id: String,
}

impl Default for RackConfig {
    fn default() -> Self {
        Self {
            tftp_root: PathBuf::from("/var/lib/maas/boot-resources/current"),
            tftp_port: 69,
            tftp_max_blksize: 1008,
            tftp_timeout_secs: 5,
            interface_refresh_secs: 45,
            http_bind: SocketAddr::from(([0u16; 8], 5249)),
            image_cache_url: "http://localhost:5248/images".to_string(),
            region_urls: Vec::new(),
            system_id: String::new(),
        }
    }
}

impl RackConfig {
    /// Loads the config file named by `MAAS_RACKD_CONFIG` (or the default path) and applies
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Reads `path`; a missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                info!("Loading rack configuration from {}", path.display());
                Self::from_yaml(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parses `text`; an empty document gives the defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
            .map_err(|e| PxeError::Configuration(format!("invalid rack configuration: {e}")))
    }

    /// Applies `MAAS_TFTP_ROOT`, `MAAS_TFTP_PORT`, `MAAS_REGION_URLS` (comma separated) and
    /// `MAAS_SYSTEM_ID`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("MAAS_TFTP_ROOT") {
            self.tftp_root = PathBuf::from(root);
        }
        if let Some(port) = lookup("MAAS_TFTP_PORT") {
            self.tftp_port = port
                .trim()
                .parse()
                .map_err(|_| PxeError::Configuration(format!("invalid MAAS_TFTP_PORT: {port}")))?;
        }
        if let Some(urls) = lookup("MAAS_REGION_URLS") {
            self.region_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(system_id) = lookup("MAAS_SYSTEM_ID") {
            self.system_id = system_id;
        }
        Ok(())
    }

    /// Retransmission timeout for TFTP transfers.
    pub fn tftp_timeout(&self) -> Duration {
        Duration::from_secs(self.tftp_timeout_secs)
    }

    /// How often the TFTP fleet re-reads the host interfaces.
    pub fn interface_refresh(&self) -> Duration {
        Duration::from_secs(self.interface_refresh_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = RackConfig::from_yaml("tftp_port: 6969\nsystem_id: rack1\n").unwrap();
        assert_eq!(config.tftp_port, 6969);
        assert_eq!(config.system_id, "rack1");
        assert_eq!(config.tftp_max_blksize, 1008);
        assert_eq!(config.interface_refresh(), Duration::from_secs(45));
    }

    #[test]
    fn test_empty_and_missing_file() {
        assert_eq!(RackConfig::from_yaml("").unwrap(), RackConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let config = RackConfig::from_file(&dir.path().join("absent.conf")).unwrap();
        assert_eq!(config, RackConfig::default());
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            RackConfig::from_yaml("tftp_port: [nope"),
            Err(PxeError::Configuration(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MAAS_TFTP_ROOT", "/srv/tftp"),
            ("MAAS_TFTP_PORT", "1069"),
            ("MAAS_REGION_URLS", "http://a:5240/MAAS, ,http://b:5240/MAAS"),
        ]);
        let mut config = RackConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.tftp_root, PathBuf::from("/srv/tftp"));
        assert_eq!(config.tftp_port, 1069);
        assert_eq!(
            config.region_urls,
            vec!["http://a:5240/MAAS".to_string(), "http://b:5240/MAAS".to_string()]
        );
        assert_eq!(config.system_id, "");
    }

    #[test]
    fn test_bad_port_override() {
        let mut config = RackConfig::default();
        let result = config.apply_env(|key| (key == "MAAS_TFTP_PORT").then(|| "tftp".to_string()));
        assert!(result.is_err());
    }
}
