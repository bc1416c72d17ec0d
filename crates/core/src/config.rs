use std::path::Path;

use serde::{Deserialize, Serialize};

/// Shape of a talking-video diffusion transformer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DitConfig {
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    /// Width of the audio conditioning embeddings.
    pub audio_dim: usize,
    /// Blocks built without audio cross-attention, by index.
    #[serde(default)]
    pub blocks_without_audio: Vec<usize>,
}

impl DitConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Whether block `index` carries an audio cross-attention module.
    pub fn has_audio_cross_attention(&self, index: usize) -> bool {
        !self.blocks_without_audio.contains(&index)
    }

    pub fn validate(&self) -> candle_core::Result<()> {
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            candle_core::bail!(
                "hidden_size {} must be divisible by num_heads {}",
                self.hidden_size,
                self.num_heads
            );
        }
        if self.audio_dim == 0 {
            candle_core::bail!("audio_dim must be > 0");
        }
        Ok(())
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> candle_core::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| candle_core::Error::Msg(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for DitConfig {
    fn default() -> Self {
        Self {
            hidden_size: 5120,
            num_heads: 40,
            num_layers: 40,
            audio_dim: 768,
            blocks_without_audio: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIT_14B_CONFIG: &str = r#"{
        "hidden_size": 5120,
        "num_heads": 40,
        "num_layers": 40,
        "audio_dim": 768
    }"#;

    #[test]
    fn parse_dit_config() {
        let config: DitConfig = serde_json::from_str(DIT_14B_CONFIG).unwrap();
        assert_eq!(config, DitConfig::default());
        assert_eq!(config.head_dim(), 128);
        assert!(config.has_audio_cross_attention(0));
        config.validate().unwrap();
    }

    #[test]
    fn parse_blocks_without_audio() {
        let config: DitConfig = serde_json::from_str(
            r#"{"hidden_size": 64, "num_heads": 4, "num_layers": 3, "audio_dim": 16,
                "blocks_without_audio": [1]}"#,
        )
        .unwrap();
        assert!(config.has_audio_cross_attention(0));
        assert!(!config.has_audio_cross_attention(1));
    }

    #[test]
    fn validate_rejects_indivisible_heads() {
        let config = DitConfig {
            hidden_size: 100,
            num_heads: 3,
            ..DitConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, DIT_14B_CONFIG).unwrap();

        let config = DitConfig::from_file(&path).unwrap();
        assert_eq!(config.num_layers, 40);
    }

    #[test]
    fn from_file_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = DitConfig::from_file(&path).unwrap_err().to_string();
        assert!(err.contains("broken.json"));
    }
}
