//! Process-wide, at-most-once group initialization.
//!
//! Communication groups outlive any single parallel scope: the first scope
//! that needs them builds them, later scopes reuse them. [`GroupGate`] keeps
//! that lifecycle as an explicit three-state flag behind one lock, so "are
//! groups ready?" is a state query, never a failed call.
//!
//! Re-parallelizing a process with a different topology is not supported;
//! the gate rejects it with [`ParallelError::TopologyMismatch`].

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::error::{ParallelError, Result};
use super::topology::Topology;
use crate::distributed::{DistributedError, GroupCoordinator, ParallelGroups};

/// Lifecycle of the process-wide parallel state.
#[derive(Debug, Default)]
pub enum GateState {
    #[default]
    Uninitialized,
    /// Initialization started and has not completed. Only observable after
    /// the initializing call panicked.
    Initializing { topology: Topology },
    Initialized {
        topology: Topology,
        groups: ParallelGroups,
    },
}

/// Single initialization gate for communication groups.
#[derive(Debug, Default)]
pub struct GroupGate {
    state: Mutex<GateState>,
}

static GLOBAL_GATE: GroupGate = GroupGate::new();

impl GroupGate {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Uninitialized),
        }
    }

    /// The gate shared by every scope in this process.
    pub fn global() -> &'static GroupGate {
        &GLOBAL_GATE
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the groups for `topology`, building them on first use.
    ///
    /// The lock is held across initialization, so concurrent callers wait
    /// for the first one and then reuse its groups.
    pub fn ensure(
        &self,
        topology: Topology,
        coordinator: &dyn GroupCoordinator,
    ) -> Result<ParallelGroups> {
        let mut state = self.lock();
        match &*state {
            GateState::Initialized {
                topology: active,
                groups,
            } => {
                if *active == topology {
                    tracing::debug!(%topology, "parallel groups already initialized");
                    return Ok(groups.clone());
                }
                tracing::warn!(%active, requested = %topology, "rejecting re-initialization");
                return Err(ParallelError::TopologyMismatch {
                    active: *active,
                    requested: topology,
                });
            }
            GateState::Initializing { .. } => return Err(ParallelError::GroupInitPoisoned),
            GateState::Uninitialized => {}
        }

        *state = GateState::Initializing { topology };
        match Self::initialize(topology, coordinator) {
            Ok(groups) => {
                tracing::info!(
                    %topology,
                    rank = coordinator.current_rank(),
                    sp_rank = groups.sequence_parallel_rank(),
                    bp_rank = groups.batch_parallel_rank(),
                    "parallel groups initialized"
                );
                *state = GateState::Initialized {
                    topology,
                    groups: groups.clone(),
                };
                Ok(groups)
            }
            Err(e) => {
                *state = GateState::Uninitialized;
                Err(e)
            }
        }
    }

    fn initialize(
        topology: Topology,
        coordinator: &dyn GroupCoordinator,
    ) -> Result<ParallelGroups> {
        let rank = coordinator.current_rank();
        coordinator.initialize_process_topology(rank, topology.world_size())?;

        let degrees = topology.group_degrees();
        let groups = coordinator.initialize_group_topology(
            degrees.batch_parallel,
            degrees.sequence_parallel,
            degrees.ring,
            degrees.ulysses,
        )?;
        if groups.degrees() != degrees {
            return Err(DistributedError::DegreeMismatch {
                batch_parallel: groups.degrees().batch_parallel,
                sequence_parallel: groups.degrees().sequence_parallel,
                world_size: topology.world_size(),
            }
            .into());
        }
        Ok(groups)
    }

    /// Sequence-parallel width of the established groups, if any.
    pub fn sequence_parallel_width(&self) -> Option<usize> {
        match &*self.lock() {
            GateState::Initialized { groups, .. } => Some(groups.sequence_parallel_width()),
            _ => None,
        }
    }

    /// Topology the process was parallelized with, if any.
    pub fn topology(&self) -> Option<Topology> {
        match &*self.lock() {
            GateState::Initialized { topology, .. } => Some(*topology),
            _ => None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(&*self.lock(), GateState::Initialized { .. })
    }
}
