use std::sync::Arc;

use super::dit::{DitPipeline, ModelRoutine};
use crate::layers::{CrossAttentionRoutine, SelfAttentionRoutine};

/// Identity of every routine a pipeline currently dispatches through.
pub struct RoutineSnapshot {
    self_attention: Vec<Arc<dyn SelfAttentionRoutine>>,
    cross_attention: Vec<Option<Arc<dyn CrossAttentionRoutine>>>,
    model: Arc<dyn ModelRoutine>,
}

impl RoutineSnapshot {
    pub fn take(pipeline: &DitPipeline) -> Self {
        let model = pipeline.model();
        Self {
            self_attention: model
                .blocks()
                .iter()
                .map(|b| b.self_attn().routine().get().clone())
                .collect(),
            cross_attention: model
                .blocks()
                .iter()
                .map(|b| b.audio_cross_attn().map(|c| c.routine().get().clone()))
                .collect(),
            model: model.routine().get().clone(),
        }
    }

    /// Whether both snapshots hold the very same routine instances.
    pub fn same_as(&self, other: &Self) -> bool {
        self.self_attention.len() == other.self_attention.len()
            && self
                .self_attention
                .iter()
                .zip(&other.self_attention)
                .all(|(a, b)| Arc::ptr_eq(a, b))
            && self.cross_attention.len() == other.cross_attention.len()
            && self
                .cross_attention
                .iter()
                .zip(&other.cross_attention)
                .all(|(a, b)| match (a, b) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                })
            && Arc::ptr_eq(&self.model, &other.model)
    }

    pub fn model_routine(&self) -> &str {
        self.model.name()
    }
}
