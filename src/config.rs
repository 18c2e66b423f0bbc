//! Engine configuration
//!
//! The engine consumes one required value, the download root
//! (`DOWNLOAD_LOCATION`); everything else has a compile-time default and
//! can be overridden through the environment or the builder methods.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the acquisition engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for per-download subdirectories
    pub download_dir: PathBuf,

    /// Maximum concurrent downloads
    pub max_concurrent: usize,

    /// Always transcode when a client asks for it, regardless of codec
    pub force_transcoding: bool,

    /// Database path for the catalog store (None = in-memory)
    pub database_path: Option<PathBuf>,

    /// Address the HTTP server binds to
    pub listen_addr: SocketAddr,

    /// Seconds without any peer before a connecting torrent is declared dead
    pub no_peers_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("reelvault"),
            max_concurrent: 1,
            force_transcoding: false,
            database_path: None,
            listen_addr: "127.0.0.1:9090".parse().expect("valid default address"),
            no_peers_timeout_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from the environment.
    ///
    /// `DOWNLOAD_LOCATION` sets the download root; `MAX_CONCURRENT`,
    /// `DATABASE_PATH`, `FORCE_TRANSCODING` and `LISTEN_ADDR` override
    /// their respective defaults when present.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("DOWNLOAD_LOCATION") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Ok(raw) = std::env::var("MAX_CONCURRENT") {
            config.max_concurrent = raw.parse().map_err(|_| {
                EngineError::invalid_input("MAX_CONCURRENT", format!("not a number: {}", raw))
            })?;
        }
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Ok(raw) = std::env::var("FORCE_TRANSCODING") {
            config.force_transcoding = matches!(raw.as_str(), "1" | "true" | "yes");
        }
        if let Ok(raw) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = raw.parse().map_err(|_| {
                EngineError::invalid_input("LISTEN_ADDR", format!("not a socket address: {}", raw))
            })?;
        }

        Ok(config)
    }

    /// Set the download root directory
    pub fn download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = path.into();
        self
    }

    /// Set maximum concurrent downloads
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Force transcoding whenever a client hints at it
    pub fn force_transcoding(mut self, force: bool) -> Self {
        self.force_transcoding = force;
        self
    }

    /// Set the database path for persistence
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Set the HTTP listen address
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// The no-peers window as a [`Duration`]
    pub fn no_peers_timeout(&self) -> Duration {
        Duration::from_secs(self.no_peers_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(EngineError::invalid_input(
                "max_concurrent",
                "Must be at least 1",
            ));
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(EngineError::invalid_input(
                "download_dir",
                "Must not be empty",
            ));
        }
        Ok(())
    }

    /// Get the database path, using a default next to the download root if unset
    pub fn get_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.download_dir.join("reelvault.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent, 1);
        assert!(!config.force_transcoding);
        assert_eq!(config.no_peers_timeout_secs, 60);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .download_dir("/tmp/media")
            .max_concurrent(3)
            .force_transcoding(true);

        assert_eq!(config.download_dir, PathBuf::from("/tmp/media"));
        assert_eq!(config.max_concurrent, 3);
        assert!(config.force_transcoding);
    }

    #[test]
    fn test_config_validation() {
        let config = EngineConfig::new().download_dir("/tmp/media");
        assert!(config.validate().is_ok());

        let config = EngineConfig::new().max_concurrent(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_path_default() {
        let config = EngineConfig::new().download_dir("/tmp/media");
        assert_eq!(
            config.get_database_path(),
            PathBuf::from("/tmp/media/reelvault.db")
        );
    }
}
