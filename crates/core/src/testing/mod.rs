//! Shared test utilities for dit-parallel-core.
//!
//! Tiny DiT configurations, zero-weight pipelines, and helpers for checking
//! that routine slots come back untouched.

mod routines;
mod targets;
mod tiny_config;

pub use crate::models::RoutineSnapshot;
pub use routines::RecordingRoutines;
pub use targets::VanishingSlots;
pub use tiny_config::{pipeline_from, tiny_dit_config, tiny_pipeline, zero_dit_model};
