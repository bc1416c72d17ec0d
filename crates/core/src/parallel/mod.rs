//! Scoped reconfiguration of a DiT pipeline for sequence and batch
//! parallelism.
//!
//! - [`topology`]: turn a worker count or explicit sizes into a [`Topology`]
//! - [`gate`]: build the process communication groups at most once
//! - [`registry`]: swap routines into a pipeline and put them back
//! - [`scope`]: tie the above to a lexical scope
//! - [`usp`]: the sequence-parallel routines installed by default

pub mod error;
pub mod gate;
pub mod registry;
pub mod scope;
pub mod topology;
pub mod usp;

pub use error::{ParallelError, Result};
pub use gate::{GateState, GroupGate};
pub use registry::{check_targets, OverrideCounts, OverrideRecord, OverrideRegistry, OverrideTarget, ParallelTarget};
pub use scope::{with_parallel_context, ParallelContext, ParallelScope, ScopeState};
pub use topology::{Topology, TopologyRequest, SUPPORTED_BATCH_PARALLEL_SIZES};
pub use usp::{RoutineProvider, UspCrossAttention, UspModelForward, UspRoutines, UspSelfAttention};
