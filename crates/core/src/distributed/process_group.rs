//! Process group abstractions for distributed inference.
//!
//! A process group represents a set of workers that participate in
//! collective operations. A parallel DiT run splits the world into
//! batch-parallel replicas, each made of one sequence-parallel group.

/// Trait for process group operations.
///
/// A process group manages rank assignment and provides the foundation
/// for collective communications.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this process within the group (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of processes in the group.
    fn world_size(&self) -> usize;

    /// Whether this is a single-process group.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Local process group backed by plain integers.
///
/// With world_size = 1 every collective becomes identity. Larger sizes let a
/// single process exercise multi-worker code paths.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    /// Create a single-process group.
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Create a local process group with specific rank/size.
    ///
    /// # Panics
    /// Panics if `rank >= world_size`.
    pub fn with_rank(rank: usize, world_size: usize) -> Self {
        assert!(rank < world_size, "rank must be < world_size");
        Self { rank, world_size }
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}

/// Position of one global rank inside the batch x sequence grid.
///
/// Ranks are laid out sequence-major: consecutive global ranks share a
/// batch-parallel replica and differ in their sequence shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCoordinates {
    /// Index of the batch-parallel replica (0..batch_parallel_degree).
    pub batch_parallel_rank: usize,
    /// Index within the sequence-parallel group (0..sequence_parallel_degree).
    pub sequence_parallel_rank: usize,
}

impl GroupCoordinates {
    /// Map a global rank onto the grid.
    ///
    /// # Panics
    /// Panics if `sequence_parallel_degree == 0`.
    pub fn of(rank: usize, sequence_parallel_degree: usize) -> Self {
        assert!(
            sequence_parallel_degree > 0,
            "sequence_parallel_degree must be > 0"
        );
        Self {
            batch_parallel_rank: rank / sequence_parallel_degree,
            sequence_parallel_rank: rank % sequence_parallel_degree,
        }
    }
}
