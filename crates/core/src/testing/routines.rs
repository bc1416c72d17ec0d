use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::distributed::ParallelGroups;
use crate::layers::{CrossAttentionRoutine, SelfAttentionRoutine};
use crate::models::ModelRoutine;
use crate::parallel::{RoutineProvider, UspRoutines};

/// Provider handing out the USP routines and counting each request.
#[derive(Debug, Default)]
pub struct RecordingRoutines {
    inner: UspRoutines,
    self_attention: AtomicUsize,
    cross_attention: AtomicUsize,
    orchestration: AtomicUsize,
}

impl RecordingRoutines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn self_attention_calls(&self) -> usize {
        self.self_attention.load(Ordering::SeqCst)
    }

    pub fn cross_attention_calls(&self) -> usize {
        self.cross_attention.load(Ordering::SeqCst)
    }

    pub fn orchestration_calls(&self) -> usize {
        self.orchestration.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.self_attention_calls() + self.cross_attention_calls() + self.orchestration_calls()
    }
}

impl RoutineProvider for RecordingRoutines {
    fn self_attention(&self, groups: &ParallelGroups) -> Arc<dyn SelfAttentionRoutine> {
        self.self_attention.fetch_add(1, Ordering::SeqCst);
        self.inner.self_attention(groups)
    }

    fn cross_attention(&self, groups: &ParallelGroups) -> Arc<dyn CrossAttentionRoutine> {
        self.cross_attention.fetch_add(1, Ordering::SeqCst);
        self.inner.cross_attention(groups)
    }

    fn orchestration(&self, groups: &ParallelGroups) -> Arc<dyn ModelRoutine> {
        self.orchestration.fetch_add(1, Ordering::SeqCst);
        self.inner.orchestration(groups)
    }
}
