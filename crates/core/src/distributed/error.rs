//! Error types for distributed operations.

use thiserror::Error;

/// Errors that can occur during distributed operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Requested group degrees do not tile the process world.
    #[error(
        "group degrees do not match world: batch_parallel {batch_parallel} x sequence_parallel \
         {sequence_parallel} != world_size {world_size}"
    )]
    DegreeMismatch {
        batch_parallel: usize,
        sequence_parallel: usize,
        world_size: usize,
    },

    /// Sequence-parallel degree is not ring x ulysses.
    #[error(
        "sequence_parallel degree {sequence_parallel} must equal ring {ring} x ulysses {ulysses}"
    )]
    SequenceDegreeMismatch {
        sequence_parallel: usize,
        ring: usize,
        ulysses: usize,
    },

    /// Group construction was attempted before the process topology was set.
    #[error("process topology not initialized")]
    ProcessNotInitialized,

    /// Tensor shape mismatch for collective operation.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
