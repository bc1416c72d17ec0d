//! Self-attention over video latent tokens.
//!
//! The module owns its projections ([`AttentionWeights`]) and a
//! [`RoutineSlot`] deciding how the attention is computed. The default
//! routine, [`EagerSelfAttention`], is plain scaled dot-product attention on
//! the full local sequence.

use std::sync::Arc;

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use super::routine::RoutineSlot;

/// Query/key/value/output projections shared by self- and cross-attention.
pub struct AttentionWeights {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl AttentionWeights {
    /// Create projections for `num_heads` heads.
    ///
    /// # Arguments
    /// * `hidden_size` - Query/output dimension (must be divisible by `num_heads`)
    /// * `kv_input_size` - Dimension of the tensor keys and values are projected from
    /// * `num_heads` - Number of attention heads
    /// * `vb` - Variable builder for loading weights
    pub fn new(
        hidden_size: usize,
        kv_input_size: usize,
        num_heads: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_heads == 0 || hidden_size % num_heads != 0 {
            candle_core::bail!(
                "hidden_size {hidden_size} must be divisible by num_heads {num_heads}"
            );
        }
        let head_dim = hidden_size / num_heads;
        let scale = 1.0 / (head_dim as f64).sqrt();

        let q_proj = linear_no_bias(hidden_size, hidden_size, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(kv_input_size, hidden_size, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(kv_input_size, hidden_size, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(hidden_size, hidden_size, vb.pp("o_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            head_dim,
            scale,
        })
    }

    /// `[batch, seq, hidden]` -> `[batch, heads, seq, head_dim]`
    pub fn project_query(&self, hidden: &Tensor) -> Result<Tensor> {
        let q = self.q_proj.forward(hidden)?;
        self.split_heads(&q)
    }

    /// Project keys and values from `source` (`[batch, src_len, kv_input]`).
    pub fn project_key_value(&self, source: &Tensor) -> Result<(Tensor, Tensor)> {
        let k = self.k_proj.forward(source)?;
        let v = self.v_proj.forward(source)?;
        Ok((self.split_heads(&k)?, self.split_heads(&v)?))
    }

    /// Scaled dot-product attention followed by the output projection.
    ///
    /// `q`: `[batch, heads, tgt_len, head_dim]`, `k`/`v`: `[batch, heads, src_len, head_dim]`.
    /// Returns `[batch, tgt_len, hidden]`.
    pub fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let (batch_size, _, tgt_len, _) = q.dims4()?;

        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(v)?;

        let attn_output = attn_output.transpose(1, 2)?.contiguous()?.reshape((
            batch_size,
            tgt_len,
            self.num_heads * self.head_dim,
        ))?;
        self.o_proj.forward(&attn_output)
    }

    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = tensor.dims3()?;
        tensor
            .reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn hidden_size(&self) -> usize {
        self.num_heads * self.head_dim
    }
}

/// How a [`SelfAttention`] module computes its output.
pub trait SelfAttentionRoutine: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;

    /// `hidden`: `[batch, seq, hidden]` -> `[batch, seq, hidden]`
    fn forward(&self, weights: &AttentionWeights, hidden: &Tensor) -> Result<Tensor>;
}

/// Full-sequence attention on the local worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct EagerSelfAttention;

impl SelfAttentionRoutine for EagerSelfAttention {
    fn name(&self) -> &'static str {
        "eager-self-attention"
    }

    fn forward(&self, weights: &AttentionWeights, hidden: &Tensor) -> Result<Tensor> {
        let q = weights.project_query(hidden)?;
        let (k, v) = weights.project_key_value(hidden)?;
        weights.attend(&q, &k, &v)
    }
}

/// Self-attention sub-module of a DiT block.
pub struct SelfAttention {
    weights: AttentionWeights,
    routine: RoutineSlot<dyn SelfAttentionRoutine>,
}

impl SelfAttention {
    pub fn new(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let weights = AttentionWeights::new(hidden_size, hidden_size, num_heads, vb)?;
        Ok(Self {
            weights,
            routine: RoutineSlot::new(Arc::new(EagerSelfAttention)),
        })
    }

    /// Run the active routine.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        self.routine.get().forward(&self.weights, hidden)
    }

    pub fn weights(&self) -> &AttentionWeights {
        &self.weights
    }

    pub fn routine(&self) -> &RoutineSlot<dyn SelfAttentionRoutine> {
        &self.routine
    }

    pub fn routine_mut(&mut self) -> &mut RoutineSlot<dyn SelfAttentionRoutine> {
        &mut self.routine
    }
}
