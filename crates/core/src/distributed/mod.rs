//! Distributed computing abstractions for sequence/batch parallelism.
//!
//! This module provides the runtime boundary used by the parallel scope:
//! - [`ProcessGroup`] - Process group management (ranks, world size)
//! - [`DeviceCommunicator`] - Collective operations (all_gather, barrier)
//! - [`GroupCoordinator`] - Builds the batch-parallel and sequence-parallel groups
//! - [`DistributedConfig`] - Worker identity from the launch environment
//!
//! # Architecture
//!
//! - Single worker: all operations are identity/no-op (world_size=1 bypass)
//! - Multiple workers: a backend implements [`GroupCoordinator`] and hands out
//!   communicators; [`LocalGroupCoordinator`] simulates one in-process
//!
//! # Usage
//!
//! ```ignore
//! use dit_parallel_core::distributed::{GroupCoordinator, LocalGroupCoordinator};
//!
//! let coordinator = LocalGroupCoordinator::single_process();
//! assert_eq!(coordinator.current_world_size(), 1);
//! ```

mod communicator;
mod coordinator;
mod error;
mod launcher;
mod process_group;

pub use communicator::{DeviceCommunicator, MockCommunicator};
pub use coordinator::{GroupCoordinator, GroupDegrees, LocalGroupCoordinator, ParallelGroups};
pub use error::DistributedError;
pub use launcher::DistributedConfig;
pub use process_group::{GroupCoordinates, LocalProcessGroup, ProcessGroup};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_process_group_defaults() {
        let pg = LocalProcessGroup::new();
        assert_eq!(pg.rank(), 0);
        assert_eq!(pg.world_size(), 1);
    }

    #[test]
    fn single_process_coordinator_matches_env_defaults() {
        let coordinator = LocalGroupCoordinator::single_process();
        let config = DistributedConfig::single_process();
        assert_eq!(coordinator.current_rank(), config.rank);
        assert_eq!(coordinator.current_world_size(), config.world_size);
    }
}
