//! Error types for parallel scope management.

use thiserror::Error;

use super::registry::OverrideTarget;
use super::topology::Topology;
use crate::distributed::DistributedError;

/// Errors raised while entering, running or leaving a parallel scope.
#[derive(Error, Debug)]
pub enum ParallelError {
    /// Inferred mode got a worker count outside the supported shapes.
    #[error(
        "unsupported world size {world_size}: use 1 worker, 3 workers (3-way batch parallel) \
         or an even number of workers (sequence parallel)"
    )]
    UnsupportedTopology { world_size: usize },

    /// Topology sizes violate the product or batch-parallel invariants.
    #[error(
        "invalid topology ulysses={ulysses_size} ring={ring_size} \
         batch_parallel={batch_parallel_size} world_size={world_size}: {reason}"
    )]
    InvalidTopology {
        ulysses_size: usize,
        ring_size: usize,
        batch_parallel_size: usize,
        world_size: usize,
        reason: &'static str,
    },

    /// A block or the model lacks a routine slot the scope must override.
    #[error("malformed target: {target} has no routine slot")]
    MalformedTarget { target: OverrideTarget },

    /// Groups already exist for another topology in this process.
    #[error("process already parallelized as {active}; cannot re-initialize as {requested}")]
    TopologyMismatch { active: Topology, requested: Topology },

    /// A previous group initialization panicked mid-way.
    #[error("group initialization was interrupted; process parallel state is unusable")]
    GroupInitPoisoned,

    /// A captured routine could not be put back.
    #[error("failed to restore {target}: routine slot vanished while overridden")]
    RestoreFailed { target: OverrideTarget },

    /// Distributed runtime failure.
    #[error(transparent)]
    Distributed(#[from] DistributedError),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ParallelError>;
