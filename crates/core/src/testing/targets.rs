use crate::layers::{CrossAttentionRoutine, RoutineSlot, SelfAttentionRoutine};
use crate::models::{DitPipeline, ModelRoutine};
use crate::parallel::ParallelTarget;

/// Pipeline wrapper that can stop exposing its self-attention slots.
///
/// Setting `hide_self_attention` while a scope is active makes the scope's
/// restoration fail.
pub struct VanishingSlots {
    pub pipeline: DitPipeline,
    pub hide_self_attention: bool,
}

impl VanishingSlots {
    pub fn new(pipeline: DitPipeline) -> Self {
        Self {
            pipeline,
            hide_self_attention: false,
        }
    }
}

impl ParallelTarget for VanishingSlots {
    fn num_blocks(&self) -> usize {
        self.pipeline.num_blocks()
    }

    fn self_attention_slot(
        &mut self,
        block: usize,
    ) -> Option<&mut RoutineSlot<dyn SelfAttentionRoutine>> {
        if self.hide_self_attention {
            return None;
        }
        self.pipeline.self_attention_slot(block)
    }

    fn cross_attention_slot(
        &mut self,
        block: usize,
    ) -> Option<&mut RoutineSlot<dyn CrossAttentionRoutine>> {
        self.pipeline.cross_attention_slot(block)
    }

    fn model_slot(&mut self) -> Option<&mut RoutineSlot<dyn ModelRoutine>> {
        self.pipeline.model_slot()
    }
}
