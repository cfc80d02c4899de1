//! Configuration management for hostfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Exported tree configuration
    pub export: ExportConfig,

    /// File handle configuration
    #[serde(default)]
    pub handles: HandleConfig,
}

/// Exported host directory tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Host directory exported as the filesystem root
    pub root: PathBuf,

    /// Reject every mutating operation
    #[serde(default)]
    pub read_only: bool,

    /// Size quota in bytes (recorded, not enforced)
    #[serde(default)]
    pub size_quota: Option<u64>,

    /// Entry count quota (recorded, not enforced)
    #[serde(default)]
    pub entries_quota: Option<u64>,

    /// Logical sub-path -> physical host path overrides
    #[serde(default)]
    pub mountpoints: BTreeMap<PathBuf, PathBuf>,
}

/// File handle configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandleConfig {
    /// Use the 16-byte digest so handles fit in 32 bytes
    #[serde(default)]
    pub compact: bool,
}

impl ExportConfig {
    /// Export `root` read-write with no overrides
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ExportConfig {
            root: root.into(),
            read_only: false,
            size_quota: None,
            entries_quota: None,
            mountpoints: BTreeMap::new(),
        }
    }

    /// Validate the export settings
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "Export root must be absolute: {:?}",
                self.root
            )));
        }

        if !self.root.is_dir() {
            return Err(Error::PathNotFound(self.root.to_string_lossy().to_string()));
        }

        for (logical, physical) in &self.mountpoints {
            if !logical.is_absolute() || logical == Path::new("/") {
                return Err(Error::InvalidConfig(format!(
                    "Mountpoint must be an absolute sub-path of the export: {:?}",
                    logical
                )));
            }
            if !physical.is_absolute() {
                return Err(Error::InvalidConfig(format!(
                    "Mountpoint target must be absolute: {:?}",
                    physical
                )));
            }
        }

        Ok(())
    }
}

impl Config {
    /// Configuration exporting `root` with defaults everywhere else
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        Config {
            export: ExportConfig::new(root),
            handles: HandleConfig::default(),
        }
    }

    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hostfs")
            .join("config.json")
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("HOSTFS_ROOT") {
            let root = root.trim();
            if !root.is_empty() {
                self.export.root = PathBuf::from(root);
            }
        }

        if let Ok(read_only) = std::env::var("HOSTFS_READ_ONLY") {
            match read_only.trim() {
                "1" | "true" | "yes" => self.export.read_only = true,
                "0" | "false" | "no" => self.export.read_only = false,
                _ => {}
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.export.validate()
    }
}
