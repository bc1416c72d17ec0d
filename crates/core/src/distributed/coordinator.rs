//! Communication group construction.
//!
//! A [`GroupCoordinator`] is the boundary to the distributed runtime: it knows
//! this worker's rank and the world size, and it builds the batch-parallel and
//! sequence-parallel groups for a requested set of degrees. Deciding *whether*
//! to build them (once per process) is the job of the parallel gate, not of
//! the coordinator.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::communicator::{DeviceCommunicator, MockCommunicator};
use super::error::{DistributedError, Result};
use super::process_group::{GroupCoordinates, LocalProcessGroup};

/// Degrees of the communication groups, in the order the runtime takes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDegrees {
    /// Replicas along the batch/guidance dimension.
    pub batch_parallel: usize,
    /// Workers sharing one sequence (`ring * ulysses`).
    pub sequence_parallel: usize,
    /// Ring-attention split factor.
    pub ring: usize,
    /// Ulysses (all-to-all) split factor.
    pub ulysses: usize,
}

impl GroupDegrees {
    /// Total workers covered by these degrees.
    pub fn world_size(&self) -> usize {
        self.batch_parallel * self.sequence_parallel
    }

    /// Check internal consistency and coverage of `world_size` workers.
    pub fn validate(&self, world_size: usize) -> Result<()> {
        if self.sequence_parallel != self.ring * self.ulysses {
            return Err(DistributedError::SequenceDegreeMismatch {
                sequence_parallel: self.sequence_parallel,
                ring: self.ring,
                ulysses: self.ulysses,
            });
        }
        if self.world_size() != world_size {
            return Err(DistributedError::DegreeMismatch {
                batch_parallel: self.batch_parallel,
                sequence_parallel: self.sequence_parallel,
                world_size,
            });
        }
        Ok(())
    }
}

/// Handles to the groups this worker belongs to.
#[derive(Clone)]
pub struct ParallelGroups {
    degrees: GroupDegrees,
    coordinates: GroupCoordinates,
    sequence_parallel: Arc<dyn DeviceCommunicator>,
    batch_parallel: Arc<dyn DeviceCommunicator>,
}

impl ParallelGroups {
    pub fn new(
        degrees: GroupDegrees,
        coordinates: GroupCoordinates,
        sequence_parallel: Arc<dyn DeviceCommunicator>,
        batch_parallel: Arc<dyn DeviceCommunicator>,
    ) -> Self {
        Self {
            degrees,
            coordinates,
            sequence_parallel,
            batch_parallel,
        }
    }

    pub fn degrees(&self) -> GroupDegrees {
        self.degrees
    }

    pub fn coordinates(&self) -> GroupCoordinates {
        self.coordinates
    }

    /// Number of workers splitting one sequence.
    pub fn sequence_parallel_width(&self) -> usize {
        self.degrees.sequence_parallel
    }

    pub fn sequence_parallel_rank(&self) -> usize {
        self.coordinates.sequence_parallel_rank
    }

    pub fn batch_parallel_rank(&self) -> usize {
        self.coordinates.batch_parallel_rank
    }

    /// Communicator over the workers sharing this worker's sequence.
    pub fn sequence_parallel_group(&self) -> &dyn DeviceCommunicator {
        self.sequence_parallel.as_ref()
    }

    /// Communicator over the replicas holding this worker's sequence shard.
    pub fn batch_parallel_group(&self) -> &dyn DeviceCommunicator {
        self.batch_parallel.as_ref()
    }
}

impl fmt::Debug for ParallelGroups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelGroups")
            .field("degrees", &self.degrees)
            .field("coordinates", &self.coordinates)
            .finish_non_exhaustive()
    }
}

/// Distributed runtime boundary.
pub trait GroupCoordinator: Send + Sync {
    /// Total number of cooperating workers.
    fn current_world_size(&self) -> usize;

    /// Global rank of this worker.
    fn current_rank(&self) -> usize;

    /// Join the process-wide world.
    fn initialize_process_topology(&self, rank: usize, world_size: usize) -> Result<()>;

    /// Build the batch-parallel and sequence-parallel groups.
    fn initialize_group_topology(
        &self,
        batch_parallel_degree: usize,
        sequence_parallel_degree: usize,
        ring_degree: usize,
        ulysses_degree: usize,
    ) -> Result<ParallelGroups>;
}

/// In-process coordinator backed by [`MockCommunicator`]s.
///
/// Every worker of a simulated world can be driven from one process; the
/// coordinator counts how often each initialization step runs.
#[derive(Debug)]
pub struct LocalGroupCoordinator {
    rank: usize,
    world_size: usize,
    process_initialized: AtomicBool,
    process_init_calls: AtomicUsize,
    group_init_calls: AtomicUsize,
}

impl LocalGroupCoordinator {
    /// # Panics
    /// Panics if `rank >= world_size`.
    pub fn new(rank: usize, world_size: usize) -> Self {
        assert!(rank < world_size, "rank must be < world_size");
        Self {
            rank,
            world_size,
            process_initialized: AtomicBool::new(false),
            process_init_calls: AtomicUsize::new(0),
            group_init_calls: AtomicUsize::new(0),
        }
    }

    /// Coordinator for a lone worker.
    pub fn single_process() -> Self {
        Self::new(0, 1)
    }

    pub fn process_init_calls(&self) -> usize {
        self.process_init_calls.load(Ordering::SeqCst)
    }

    pub fn group_init_calls(&self) -> usize {
        self.group_init_calls.load(Ordering::SeqCst)
    }
}

impl GroupCoordinator for LocalGroupCoordinator {
    fn current_world_size(&self) -> usize {
        self.world_size
    }

    fn current_rank(&self) -> usize {
        self.rank
    }

    fn initialize_process_topology(&self, rank: usize, world_size: usize) -> Result<()> {
        self.process_init_calls.fetch_add(1, Ordering::SeqCst);
        if rank != self.rank || world_size != self.world_size || rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        self.process_initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn initialize_group_topology(
        &self,
        batch_parallel_degree: usize,
        sequence_parallel_degree: usize,
        ring_degree: usize,
        ulysses_degree: usize,
    ) -> Result<ParallelGroups> {
        self.group_init_calls.fetch_add(1, Ordering::SeqCst);
        if !self.process_initialized.load(Ordering::SeqCst) {
            return Err(DistributedError::ProcessNotInitialized);
        }

        let degrees = GroupDegrees {
            batch_parallel: batch_parallel_degree,
            sequence_parallel: sequence_parallel_degree,
            ring: ring_degree,
            ulysses: ulysses_degree,
        };
        degrees.validate(self.world_size)?;

        let coordinates = GroupCoordinates::of(self.rank, sequence_parallel_degree);
        let sequence_parallel: Arc<dyn DeviceCommunicator> =
            Arc::new(MockCommunicator::new(LocalProcessGroup::with_rank(
                coordinates.sequence_parallel_rank,
                sequence_parallel_degree,
            )));
        let batch_parallel: Arc<dyn DeviceCommunicator> =
            Arc::new(MockCommunicator::new(LocalProcessGroup::with_rank(
                coordinates.batch_parallel_rank,
                batch_parallel_degree,
            )));

        sequence_parallel.barrier()?;
        batch_parallel.barrier()?;

        tracing::debug!(
            rank = self.rank,
            sp_rank = coordinates.sequence_parallel_rank,
            bp_rank = coordinates.batch_parallel_rank,
            "local communication groups built"
        );

        Ok(ParallelGroups::new(
            degrees,
            coordinates,
            sequence_parallel,
            batch_parallel,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrees_validate_world_coverage() {
        let degrees = GroupDegrees {
            batch_parallel: 3,
            sequence_parallel: 2,
            ring: 1,
            ulysses: 2,
        };
        degrees.validate(6).unwrap();
        assert!(matches!(
            degrees.validate(4),
            Err(DistributedError::DegreeMismatch { world_size: 4, .. })
        ));
    }

    #[test]
    fn degrees_validate_sequence_factorization() {
        let degrees = GroupDegrees {
            batch_parallel: 1,
            sequence_parallel: 4,
            ring: 2,
            ulysses: 1,
        };
        assert!(matches!(
            degrees.validate(4),
            Err(DistributedError::SequenceDegreeMismatch { .. })
        ));
    }

    #[test]
    fn groups_require_process_init() {
        let coordinator = LocalGroupCoordinator::new(0, 2);
        let err = coordinator.initialize_group_topology(1, 2, 1, 2).unwrap_err();
        assert!(matches!(err, DistributedError::ProcessNotInitialized));
        assert_eq!(coordinator.group_init_calls(), 1);
    }

    #[test]
    fn builds_groups_with_rank_coordinates() {
        let coordinator = LocalGroupCoordinator::new(3, 4);
        coordinator.initialize_process_topology(3, 4).unwrap();
        let groups = coordinator.initialize_group_topology(1, 4, 1, 4).unwrap();

        assert_eq!(groups.sequence_parallel_width(), 4);
        assert_eq!(groups.sequence_parallel_rank(), 3);
        assert_eq!(groups.batch_parallel_rank(), 0);
        assert_eq!(groups.sequence_parallel_group().process_group().world_size(), 4);
        assert!(groups.batch_parallel_group().process_group().is_single());
        assert_eq!(coordinator.process_init_calls(), 1);
        assert_eq!(coordinator.group_init_calls(), 1);
    }

    #[test]
    fn batch_parallel_groups() {
        let coordinator = LocalGroupCoordinator::new(2, 3);
        coordinator.initialize_process_topology(2, 3).unwrap();
        let groups = coordinator.initialize_group_topology(3, 1, 1, 1).unwrap();

        assert_eq!(groups.sequence_parallel_width(), 1);
        assert_eq!(groups.batch_parallel_rank(), 2);
        assert_eq!(groups.batch_parallel_group().process_group().world_size(), 3);
    }

    #[test]
    fn process_init_rejects_foreign_rank() {
        let coordinator = LocalGroupCoordinator::new(0, 2);
        assert!(coordinator.initialize_process_topology(1, 2).is_err());
    }
}
