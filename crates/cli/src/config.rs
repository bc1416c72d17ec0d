//! Configuration persistence for the dit-parallel launcher.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/dit-parallel/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Persistent launch configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Ulysses (all-to-all) sequence split factor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ulysses_size: Option<usize>,

    /// Ring-attention sequence split factor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ring_size: Option<usize>,

    /// Batch-parallel replicas (1 or 3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_parallel_size: Option<usize>,

    /// Transformer blocks in the demo model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_layers: Option<usize>,

    /// Hidden width of the demo model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_size: Option<usize>,

    /// Attention heads of the demo model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_heads: Option<usize>,

    /// Width of the audio conditioning tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_dim: Option<usize>,

    /// Latent tokens per sample. Defaults to a multiple of the sequence-parallel width.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_len: Option<usize>,

    /// Audio tokens per sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_len: Option<usize>,

    /// Samples per forward pass. Defaults to the batch-parallel size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

impl LaunchConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("dit-parallel").join("config.toml"))
    }

    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &LaunchConfig) {
        macro_rules! prefer_other {
            ($($field:ident),* $(,)?) => {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field;
                    }
                )*
            };
        }
        prefer_other!(
            ulysses_size,
            ring_size,
            batch_parallel_size,
            num_layers,
            hidden_size,
            num_heads,
            audio_dim,
            seq_len,
            audio_len,
            batch_size,
        );
    }

    /// Whether any topology size was set explicitly.
    pub fn has_explicit_topology(&self) -> bool {
        self.ulysses_size.is_some() || self.ring_size.is_some() || self.batch_parallel_size.is_some()
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// No config directory available.
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}
