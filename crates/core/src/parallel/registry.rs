//! Reversible routine overrides.
//!
//! [`OverrideRegistry`] swaps routines into the slots of a [`ParallelTarget`]
//! and remembers what it displaced. Restoration walks each kind of override
//! in reverse installation order: self-attention first, then
//! cross-attention, then the top-level model routine.
//!
//! Records are paired with targets by block position. The block layout must
//! not change while overrides are active; holding the target mutably for the
//! scope's lifetime guarantees that for [`ParallelScope`](super::ParallelScope).

use std::fmt;
use std::sync::Arc;

use super::error::{ParallelError, Result};
use crate::layers::{CrossAttentionRoutine, RoutineSlot, SelfAttentionRoutine};
use crate::models::ModelRoutine;

/// A pipeline whose attention and model routines can be swapped.
pub trait ParallelTarget {
    /// Number of transformer blocks, in execution order.
    fn num_blocks(&self) -> usize;

    /// Self-attention slot of block `block`, if the block has one.
    fn self_attention_slot(
        &mut self,
        block: usize,
    ) -> Option<&mut RoutineSlot<dyn SelfAttentionRoutine>>;

    /// Cross-attention slot of block `block`, if the block has one.
    fn cross_attention_slot(
        &mut self,
        block: usize,
    ) -> Option<&mut RoutineSlot<dyn CrossAttentionRoutine>>;

    /// Top-level execution slot of the model.
    fn model_slot(&mut self) -> Option<&mut RoutineSlot<dyn ModelRoutine>>;
}

/// Which slot an override lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverrideTarget {
    SelfAttention(usize),
    CrossAttention(usize),
    Model,
}

impl fmt::Display for OverrideTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfAttention(block) => write!(f, "blocks[{block}].self_attn"),
            Self::CrossAttention(block) => write!(f, "blocks[{block}].audio_cross_attn"),
            Self::Model => f.write_str("model"),
        }
    }
}

/// The routine a slot held before it was overridden.
///
/// Not `Clone`: restoring consumes the record, so it cannot be applied twice.
pub struct OverrideRecord<R: ?Sized> {
    target: OverrideTarget,
    original: Arc<R>,
}

impl<R: ?Sized> OverrideRecord<R> {
    pub fn target(&self) -> OverrideTarget {
        self.target
    }

    pub fn original(&self) -> &Arc<R> {
        &self.original
    }
}

/// Check that every slot the overrides will touch exists.
///
/// `per_block` selects whether block-level slots are required.
pub fn check_targets<T: ParallelTarget + ?Sized>(target: &mut T, per_block: bool) -> Result<()> {
    if per_block {
        for block in 0..target.num_blocks() {
            if target.self_attention_slot(block).is_none() {
                return Err(ParallelError::MalformedTarget {
                    target: OverrideTarget::SelfAttention(block),
                });
            }
            if target.cross_attention_slot(block).is_none() {
                return Err(ParallelError::MalformedTarget {
                    target: OverrideTarget::CrossAttention(block),
                });
            }
        }
    }
    if target.model_slot().is_none() {
        return Err(ParallelError::MalformedTarget {
            target: OverrideTarget::Model,
        });
    }
    Ok(())
}

/// Override counts by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverrideCounts {
    pub self_attention: usize,
    pub cross_attention: usize,
    pub model: usize,
}

impl OverrideCounts {
    pub fn total(&self) -> usize {
        self.self_attention + self.cross_attention + self.model
    }
}

/// Active overrides on one target, in installation order.
#[derive(Default)]
pub struct OverrideRegistry {
    self_attention: Vec<OverrideRecord<dyn SelfAttentionRoutine>>,
    cross_attention: Vec<OverrideRecord<dyn CrossAttentionRoutine>>,
    model: Option<OverrideRecord<dyn ModelRoutine>>,
}

impl OverrideRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap `routine` into block `block`'s self-attention slot.
    pub fn install_self_attention<T: ParallelTarget + ?Sized>(
        &mut self,
        target: &mut T,
        block: usize,
        routine: Arc<dyn SelfAttentionRoutine>,
    ) -> Result<()> {
        let at = OverrideTarget::SelfAttention(block);
        let slot = target
            .self_attention_slot(block)
            .ok_or(ParallelError::MalformedTarget { target: at })?;
        tracing::debug!(slot = %at, routine = routine.name(), "installing override");
        let original = slot.replace(routine);
        self.self_attention.push(OverrideRecord {
            target: at,
            original,
        });
        Ok(())
    }

    /// Swap `routine` into block `block`'s cross-attention slot.
    pub fn install_cross_attention<T: ParallelTarget + ?Sized>(
        &mut self,
        target: &mut T,
        block: usize,
        routine: Arc<dyn CrossAttentionRoutine>,
    ) -> Result<()> {
        let at = OverrideTarget::CrossAttention(block);
        let slot = target
            .cross_attention_slot(block)
            .ok_or(ParallelError::MalformedTarget { target: at })?;
        tracing::debug!(slot = %at, routine = routine.name(), "installing override");
        let original = slot.replace(routine);
        self.cross_attention.push(OverrideRecord {
            target: at,
            original,
        });
        Ok(())
    }

    /// Swap `routine` into the model's top-level slot.
    ///
    /// # Panics
    /// Panics if a model override is already registered.
    pub fn install_model<T: ParallelTarget + ?Sized>(
        &mut self,
        target: &mut T,
        routine: Arc<dyn ModelRoutine>,
    ) -> Result<()> {
        assert!(self.model.is_none(), "model routine overridden twice");
        let at = OverrideTarget::Model;
        let slot = target
            .model_slot()
            .ok_or(ParallelError::MalformedTarget { target: at })?;
        tracing::debug!(slot = %at, routine = routine.name(), "installing override");
        let original = slot.replace(routine);
        self.model = Some(OverrideRecord {
            target: at,
            original,
        });
        Ok(())
    }

    pub fn counts(&self) -> OverrideCounts {
        OverrideCounts {
            self_attention: self.self_attention.len(),
            cross_attention: self.cross_attention.len(),
            model: usize::from(self.model.is_some()),
        }
    }

    pub fn len(&self) -> usize {
        self.counts().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Put every captured routine back.
    ///
    /// Order: self-attention records reversed, cross-attention records
    /// reversed, then the model record. Every record is attempted even if an
    /// earlier one fails; the first failure is returned.
    pub fn restore<T: ParallelTarget + ?Sized>(self, target: &mut T) -> Result<()> {
        let mut first_error = None;
        let mut fail = |at: OverrideTarget| {
            tracing::error!(slot = %at, "routine slot missing during restore");
            first_error.get_or_insert(ParallelError::RestoreFailed { target: at });
        };

        for record in self.self_attention.into_iter().rev() {
            let OverrideTarget::SelfAttention(block) = record.target else {
                unreachable!("self-attention record with target {}", record.target)
            };
            match target.self_attention_slot(block) {
                Some(slot) => {
                    slot.replace(record.original);
                    tracing::debug!(slot = %record.target, "override restored");
                }
                None => fail(record.target),
            }
        }
        for record in self.cross_attention.into_iter().rev() {
            let OverrideTarget::CrossAttention(block) = record.target else {
                unreachable!("cross-attention record with target {}", record.target)
            };
            match target.cross_attention_slot(block) {
                Some(slot) => {
                    slot.replace(record.original);
                    tracing::debug!(slot = %record.target, "override restored");
                }
                None => fail(record.target),
            }
        }
        if let Some(record) = self.model {
            match target.model_slot() {
                Some(slot) => {
                    slot.replace(record.original);
                    tracing::debug!(slot = %record.target, "override restored");
                }
                None => fail(record.target),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
