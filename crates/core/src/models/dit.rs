use std::sync::Arc;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::DitConfig;
use crate::layers::{
    AudioCrossAttention, CrossAttentionRoutine, RoutineSlot, SelfAttention, SelfAttentionRoutine,
};
use crate::parallel::ParallelTarget;

// ─── Model Routine ───────────────────────────────────────────────────────────

/// How a [`DitModel`] drives its blocks for one forward pass.
pub trait ModelRoutine: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;

    /// `hidden`: `[batch, seq, hidden]`, `audio_context`: `[batch, ctx_len, audio_dim]`.
    fn forward(&self, model: &DitModel, hidden: &Tensor, audio_context: &Tensor)
        -> Result<Tensor>;
}

/// Runs every block in order on the full local batch and sequence.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialForward;

impl ModelRoutine for SequentialForward {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn forward(
        &self,
        model: &DitModel,
        hidden: &Tensor,
        audio_context: &Tensor,
    ) -> Result<Tensor> {
        model.run_blocks(hidden, audio_context)
    }
}

// ─── Block ───────────────────────────────────────────────────────────────────

pub struct DitBlock {
    self_attn: SelfAttention,
    audio_cross_attn: Option<AudioCrossAttention>,
}

impl DitBlock {
    pub fn new(cfg: &DitConfig, with_audio: bool, vb: VarBuilder) -> Result<Self> {
        let self_attn = SelfAttention::new(cfg.hidden_size, cfg.num_heads, vb.pp("self_attn"))?;
        let audio_cross_attn = if with_audio {
            Some(AudioCrossAttention::new(
                cfg.hidden_size,
                cfg.audio_dim,
                cfg.num_heads,
                vb.pp("audio_cross_attn"),
            )?)
        } else {
            None
        };
        Ok(Self {
            self_attn,
            audio_cross_attn,
        })
    }

    pub fn forward(&self, hidden: &Tensor, audio_context: &Tensor) -> Result<Tensor> {
        let residual = hidden;
        let xs = (self.self_attn.forward(hidden)? + residual)?;
        match &self.audio_cross_attn {
            Some(cross_attn) => cross_attn.forward(&xs, audio_context)? + &xs,
            None => Ok(xs),
        }
    }

    pub fn self_attn(&self) -> &SelfAttention {
        &self.self_attn
    }

    pub fn audio_cross_attn(&self) -> Option<&AudioCrossAttention> {
        self.audio_cross_attn.as_ref()
    }
}

// ─── Model ───────────────────────────────────────────────────────────────────

/// Diffusion transformer over video latent tokens conditioned on audio.
pub struct DitModel {
    blocks: Vec<DitBlock>,
    routine: RoutineSlot<dyn ModelRoutine>,
    config: DitConfig,
}

impl DitModel {
    pub fn new(cfg: &DitConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let vb_blocks = vb.pp("blocks");
        let blocks = (0..cfg.num_layers)
            .map(|i| DitBlock::new(cfg, cfg.has_audio_cross_attention(i), vb_blocks.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            blocks,
            routine: RoutineSlot::new(Arc::new(SequentialForward)),
            config: cfg.clone(),
        })
    }

    /// Run the active top-level routine.
    pub fn forward(&self, hidden: &Tensor, audio_context: &Tensor) -> Result<Tensor> {
        self.routine.get().forward(self, hidden, audio_context)
    }

    /// Apply every block in order; each block dispatches through its own slots.
    pub fn run_blocks(&self, hidden: &Tensor, audio_context: &Tensor) -> Result<Tensor> {
        let mut xs = hidden.clone();
        for block in &self.blocks {
            xs = block.forward(&xs, audio_context)?;
        }
        Ok(xs)
    }

    pub fn blocks(&self) -> &[DitBlock] {
        &self.blocks
    }

    pub fn routine(&self) -> &RoutineSlot<dyn ModelRoutine> {
        &self.routine
    }

    pub fn config(&self) -> &DitConfig {
        &self.config
    }
}

impl ParallelTarget for DitModel {
    fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn self_attention_slot(
        &mut self,
        block: usize,
    ) -> Option<&mut RoutineSlot<dyn SelfAttentionRoutine>> {
        self.blocks
            .get_mut(block)
            .map(|b| b.self_attn.routine_mut())
    }

    fn cross_attention_slot(
        &mut self,
        block: usize,
    ) -> Option<&mut RoutineSlot<dyn CrossAttentionRoutine>> {
        self.blocks
            .get_mut(block)
            .and_then(|b| b.audio_cross_attn.as_mut())
            .map(|c| c.routine_mut())
    }

    fn model_slot(&mut self) -> Option<&mut RoutineSlot<dyn ModelRoutine>> {
        Some(&mut self.routine)
    }
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

/// Inference pipeline owning the transformer.
pub struct DitPipeline {
    model: DitModel,
}

impl DitPipeline {
    pub fn new(model: DitModel) -> Self {
        Self { model }
    }

    /// One denoising forward pass.
    pub fn forward(&self, latents: &Tensor, audio_context: &Tensor) -> Result<Tensor> {
        self.model.forward(latents, audio_context)
    }

    pub fn model(&self) -> &DitModel {
        &self.model
    }
}

impl ParallelTarget for DitPipeline {
    fn num_blocks(&self) -> usize {
        self.model.num_blocks()
    }

    fn self_attention_slot(
        &mut self,
        block: usize,
    ) -> Option<&mut RoutineSlot<dyn SelfAttentionRoutine>> {
        self.model.self_attention_slot(block)
    }

    fn cross_attention_slot(
        &mut self,
        block: usize,
    ) -> Option<&mut RoutineSlot<dyn CrossAttentionRoutine>> {
        self.model.cross_attention_slot(block)
    }

    fn model_slot(&mut self) -> Option<&mut RoutineSlot<dyn ModelRoutine>> {
        self.model.model_slot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_dit_config, zero_dit_model as zero_model};
    use candle_core::{DType, Device};

    #[test]
    fn construction_builds_all_blocks() {
        let cfg = tiny_dit_config();
        let model = zero_model(&cfg);
        assert_eq!(model.blocks().len(), cfg.num_layers);
        assert!(model.blocks().iter().all(|b| b.audio_cross_attn().is_some()));
        assert_eq!(model.routine().get().name(), "sequential");
    }

    #[test]
    fn forward_preserves_shape() {
        let cfg = tiny_dit_config();
        let pipeline = DitPipeline::new(zero_model(&cfg));

        let latents = Tensor::ones((2, 8, cfg.hidden_size), DType::F32, &Device::Cpu).unwrap();
        let audio = Tensor::ones((2, 4, cfg.audio_dim), DType::F32, &Device::Cpu).unwrap();

        let out = pipeline.forward(&latents, &audio).unwrap();
        assert_eq!(out.dims(), &[2, 8, cfg.hidden_size]);
    }

    #[test]
    fn zero_weights_make_blocks_identity() {
        // Zero projections give zero attention output; residuals carry the input through.
        let cfg = tiny_dit_config();
        let model = zero_model(&cfg);

        let latents = Tensor::ones((1, 4, cfg.hidden_size), DType::F32, &Device::Cpu).unwrap();
        let audio = Tensor::ones((1, 2, cfg.audio_dim), DType::F32, &Device::Cpu).unwrap();

        let out = model.forward(&latents, &audio).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn slots_follow_block_layout() {
        let cfg = DitConfig {
            blocks_without_audio: vec![1],
            ..tiny_dit_config()
        };
        let mut model = zero_model(&cfg);

        assert_eq!(model.num_blocks(), cfg.num_layers);
        assert!(model.self_attention_slot(1).is_some());
        assert!(model.cross_attention_slot(0).is_some());
        assert!(model.cross_attention_slot(1).is_none());
        assert!(model.self_attention_slot(cfg.num_layers).is_none());
        assert!(model.model_slot().is_some());
    }
}
