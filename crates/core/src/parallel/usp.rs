//! Unified sequence-parallel (USP) routines.
//!
//! These are the routines a [`ParallelScope`](super::ParallelScope) installs:
//!
//! - [`UspModelForward`] splits the batch across batch-parallel replicas and
//!   the sequence across the sequence-parallel group, runs the blocks on the
//!   local shard, and gathers the result back to full shape on every worker.
//! - [`UspSelfAttention`] lets local queries attend to the whole sequence by
//!   all-gathering keys and values across the sequence-parallel group.
//! - [`UspCrossAttention`] attends from the local query shard to the audio
//!   context, which every worker holds in full.
//!
//! With only batch parallelism the block routines stay untouched and
//! [`UspModelForward`] delegates to them on the local batch shard.

use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::distributed::{DistributedError, ParallelGroups};
use crate::layers::{AttentionWeights, CrossAttentionRoutine, SelfAttentionRoutine};
use crate::models::{DitModel, ModelRoutine};

/// Source of the topology-aware routines a scope installs.
pub trait RoutineProvider: Send + Sync {
    fn self_attention(&self, groups: &ParallelGroups) -> Arc<dyn SelfAttentionRoutine>;

    fn cross_attention(&self, groups: &ParallelGroups) -> Arc<dyn CrossAttentionRoutine>;

    /// Top-level routine; must fall back to the block routines when no
    /// per-block overrides are installed.
    fn orchestration(&self, groups: &ParallelGroups) -> Arc<dyn ModelRoutine>;
}

/// Default provider handing out the USP routines.
#[derive(Debug, Default, Clone, Copy)]
pub struct UspRoutines;

impl RoutineProvider for UspRoutines {
    fn self_attention(&self, groups: &ParallelGroups) -> Arc<dyn SelfAttentionRoutine> {
        Arc::new(UspSelfAttention::new(groups.clone()))
    }

    fn cross_attention(&self, groups: &ParallelGroups) -> Arc<dyn CrossAttentionRoutine> {
        Arc::new(UspCrossAttention::new(groups.clone()))
    }

    fn orchestration(&self, groups: &ParallelGroups) -> Arc<dyn ModelRoutine> {
        Arc::new(UspModelForward::new(groups.clone()))
    }
}

fn collective_error(op: &str, e: DistributedError) -> candle_core::Error {
    candle_core::Error::Msg(format!("{op} failed: {e}"))
}

/// Shard `tensor` along `dim` into `parts` equal pieces and keep piece `index`.
fn shard(tensor: &Tensor, dim: usize, parts: usize, index: usize, what: &str) -> Result<Tensor> {
    let size = tensor.dim(dim)?;
    if size % parts != 0 {
        candle_core::bail!("{what} size {size} is not divisible by {parts} parallel workers");
    }
    let chunk = size / parts;
    tensor.narrow(dim, index * chunk, chunk)
}

// ─── Self-Attention ──────────────────────────────────────────────────────────

/// Sequence-parallel self-attention: local queries, gathered keys/values.
pub struct UspSelfAttention {
    groups: ParallelGroups,
}

impl UspSelfAttention {
    pub fn new(groups: ParallelGroups) -> Self {
        Self { groups }
    }
}

impl SelfAttentionRoutine for UspSelfAttention {
    fn name(&self) -> &'static str {
        "usp-self-attention"
    }

    fn forward(&self, weights: &AttentionWeights, hidden: &Tensor) -> Result<Tensor> {
        let q = weights.project_query(hidden)?;
        let (k, v) = weights.project_key_value(hidden)?;
        if self.groups.sequence_parallel_width() == 1 {
            return weights.attend(&q, &k, &v);
        }

        // [batch, heads, local_seq, head_dim] -> [batch, heads, seq, head_dim]
        let comm = self.groups.sequence_parallel_group();
        let k = comm
            .all_gather(&k, 2)
            .map_err(|e| collective_error("sequence-parallel key all_gather", e))?;
        let v = comm
            .all_gather(&v, 2)
            .map_err(|e| collective_error("sequence-parallel value all_gather", e))?;
        weights.attend(&q, &k, &v)
    }
}

// ─── Cross-Attention ─────────────────────────────────────────────────────────

/// Cross-attention from a sequence shard to the replicated audio context.
pub struct UspCrossAttention {
    groups: ParallelGroups,
}

impl UspCrossAttention {
    pub fn new(groups: ParallelGroups) -> Self {
        Self { groups }
    }
}

impl CrossAttentionRoutine for UspCrossAttention {
    fn name(&self) -> &'static str {
        "usp-cross-attention"
    }

    fn forward(
        &self,
        weights: &AttentionWeights,
        hidden: &Tensor,
        context: &Tensor,
    ) -> Result<Tensor> {
        // Each query row only depends on the context, so the shard needs no collective.
        let (hidden_batch, _, _) = hidden.dims3()?;
        let (context_batch, _, _) = context.dims3()?;
        if hidden_batch != context_batch {
            candle_core::bail!(
                "audio context batch {context_batch} does not match shard batch {hidden_batch} \
                 on sequence rank {}",
                self.groups.sequence_parallel_rank()
            );
        }
        let q = weights.project_query(hidden)?;
        let (k, v) = weights.project_key_value(context)?;
        weights.attend(&q, &k, &v)
    }
}

// ─── Orchestration ───────────────────────────────────────────────────────────

/// Top-level routine splitting work across the batch and sequence groups.
pub struct UspModelForward {
    groups: ParallelGroups,
}

impl UspModelForward {
    pub fn new(groups: ParallelGroups) -> Self {
        Self { groups }
    }
}

impl ModelRoutine for UspModelForward {
    fn name(&self) -> &'static str {
        "usp-orchestration"
    }

    fn forward(
        &self,
        model: &DitModel,
        hidden: &Tensor,
        audio_context: &Tensor,
    ) -> Result<Tensor> {
        let batch_parallel = self.groups.degrees().batch_parallel;
        let sequence_parallel = self.groups.sequence_parallel_width();
        let (batch, _, _) = hidden.dims3()?;

        let (hidden, audio_context) = if batch_parallel > 1 {
            let bp_rank = self.groups.batch_parallel_rank();
            let local_hidden = shard(hidden, 0, batch_parallel, bp_rank, "batch")?;
            // A context with batch 1 is shared by every replica.
            let local_audio = if audio_context.dim(0)? == batch {
                shard(audio_context, 0, batch_parallel, bp_rank, "audio batch")?
            } else {
                audio_context.clone()
            };
            (local_hidden, local_audio)
        } else {
            (hidden.clone(), audio_context.clone())
        };

        let hidden = if sequence_parallel > 1 {
            let sp_rank = self.groups.sequence_parallel_rank();
            shard(&hidden, 1, sequence_parallel, sp_rank, "sequence")?
        } else {
            hidden
        };

        let audio_context = if audio_context.dim(0)? != hidden.dim(0)? {
            audio_context.broadcast_as((hidden.dim(0)?, audio_context.dim(1)?, audio_context.dim(2)?))?
        } else {
            audio_context
        };

        let mut out = model.run_blocks(&hidden.contiguous()?, &audio_context.contiguous()?)?;

        if sequence_parallel > 1 {
            out = self
                .groups
                .sequence_parallel_group()
                .all_gather(&out, 1)
                .map_err(|e| collective_error("sequence-parallel output all_gather", e))?;
        }
        if batch_parallel > 1 {
            out = self
                .groups
                .batch_parallel_group()
                .all_gather(&out, 0)
                .map_err(|e| collective_error("batch-parallel output all_gather", e))?;
        }
        Ok(out)
    }
}
