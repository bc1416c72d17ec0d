use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use crate::config::DitConfig;
use crate::models::{DitModel, DitPipeline};

/// Tiny DiT config for testing (2 blocks, 32 hidden, 4 heads, 16 audio dim).
pub fn tiny_dit_config() -> DitConfig {
    DitConfig {
        hidden_size: 32,
        num_heads: 4,
        num_layers: 2,
        audio_dim: 16,
        blocks_without_audio: Vec::new(),
    }
}

/// DiT model with all-zero weights on CPU.
///
/// # Panics
/// Panics if `cfg` does not describe a valid model.
pub fn zero_dit_model(cfg: &DitConfig) -> DitModel {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    DitModel::new(cfg, vb).expect("test DiT config should build")
}

pub fn pipeline_from(cfg: &DitConfig) -> DitPipeline {
    DitPipeline::new(zero_dit_model(cfg))
}

pub fn tiny_pipeline() -> DitPipeline {
    pipeline_from(&tiny_dit_config())
}
