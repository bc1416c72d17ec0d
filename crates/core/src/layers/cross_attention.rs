//! Audio cross-attention for talking-video DiT blocks.
//!
//! Video latent tokens attend to audio conditioning tokens:
//!
//! - **Query** comes from the video hidden states
//! - **Key and Value** come from the audio context (its own embedding width)
//! - No causal masking
//!
//! # Example
//!
//! ```ignore
//! use dit_parallel_core::layers::AudioCrossAttention;
//!
//! let cross_attn = AudioCrossAttention::new(hidden_size, audio_dim, num_heads, vb)?;
//! let output = cross_attn.forward(&video_hidden, &audio_context)?;
//! ```

use std::sync::Arc;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::attention::AttentionWeights;
use super::routine::RoutineSlot;

/// How an [`AudioCrossAttention`] module computes its output.
pub trait CrossAttentionRoutine: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;

    /// `hidden`: `[batch, seq, hidden]`, `context`: `[batch, ctx_len, audio_dim]`.
    fn forward(&self, weights: &AttentionWeights, hidden: &Tensor, context: &Tensor)
        -> Result<Tensor>;
}

/// Every query attends to the whole audio context.
#[derive(Debug, Default, Clone, Copy)]
pub struct EagerCrossAttention;

impl CrossAttentionRoutine for EagerCrossAttention {
    fn name(&self) -> &'static str {
        "eager-cross-attention"
    }

    fn forward(
        &self,
        weights: &AttentionWeights,
        hidden: &Tensor,
        context: &Tensor,
    ) -> Result<Tensor> {
        let q = weights.project_query(hidden)?;
        let (k, v) = weights.project_key_value(context)?;
        weights.attend(&q, &k, &v)
    }
}

/// Cross-attention sub-module attending from video tokens to audio tokens.
pub struct AudioCrossAttention {
    weights: AttentionWeights,
    routine: RoutineSlot<dyn CrossAttentionRoutine>,
}

impl AudioCrossAttention {
    /// Create a new audio cross-attention layer.
    ///
    /// # Arguments
    /// * `hidden_size` - Video hidden dimension (must be divisible by `num_heads`)
    /// * `audio_dim` - Width of the audio context embeddings
    /// * `num_heads` - Number of attention heads
    /// * `vb` - Variable builder for loading weights
    pub fn new(hidden_size: usize, audio_dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let weights = AttentionWeights::new(hidden_size, audio_dim, num_heads, vb)?;
        Ok(Self {
            weights,
            routine: RoutineSlot::new(Arc::new(EagerCrossAttention)),
        })
    }

    /// Run the active routine.
    pub fn forward(&self, hidden: &Tensor, context: &Tensor) -> Result<Tensor> {
        self.routine.get().forward(&self.weights, hidden, context)
    }

    pub fn weights(&self) -> &AttentionWeights {
        &self.weights
    }

    pub fn routine(&self) -> &RoutineSlot<dyn CrossAttentionRoutine> {
        &self.routine
    }

    pub fn routine_mut(&mut self) -> &mut RoutineSlot<dyn CrossAttentionRoutine> {
        &mut self.routine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn create_cross_attention(
        hidden_size: usize,
        audio_dim: usize,
        num_heads: usize,
        device: &Device,
    ) -> Result<AudioCrossAttention> {
        let vb = VarBuilder::zeros(DType::F32, device);
        AudioCrossAttention::new(hidden_size, audio_dim, num_heads, vb)
    }

    // ─── Construction Tests ──────────────────────────────────────────────────

    #[test]
    fn construction_sets_correct_dimensions() {
        let device = Device::Cpu;
        let cross_attn = create_cross_attention(128, 48, 8, &device)
            .expect("cross attention creation should work");

        assert_eq!(cross_attn.weights().num_heads(), 8);
        assert_eq!(cross_attn.weights().head_dim(), 16);
    }

    // ─── Forward Tests ───────────────────────────────────────────────────────

    #[test]
    fn forward_output_shape_follows_query() {
        let device = Device::Cpu;
        let cross_attn = create_cross_attention(64, 32, 4, &device).unwrap();

        let hidden = Tensor::ones((2, 10, 64), DType::F32, &device).unwrap();
        let context = Tensor::ones((2, 6, 32), DType::F32, &device).unwrap();

        let output = cross_attn.forward(&hidden, &context).unwrap();
        assert_eq!(output.dims(), &[2, 10, 64]);
    }

    #[test]
    fn forward_rejects_wrong_context_width() {
        let device = Device::Cpu;
        let cross_attn = create_cross_attention(64, 32, 4, &device).unwrap();

        let hidden = Tensor::ones((1, 4, 64), DType::F32, &device).unwrap();
        let context = Tensor::ones((1, 6, 16), DType::F32, &device).unwrap();

        assert!(cross_attn.forward(&hidden, &context).is_err());
    }

    #[test]
    fn default_routine_is_eager() {
        let cross_attn = create_cross_attention(16, 8, 2, &Device::Cpu).unwrap();
        assert_eq!(cross_attn.routine().get().name(), "eager-cross-attention");
    }
}
