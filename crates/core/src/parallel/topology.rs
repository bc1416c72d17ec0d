//! Parallel topology resolution.
//!
//! A [`Topology`] splits the world of cooperating workers into
//! `batch_parallel_size` replicas, each splitting one sequence across
//! `ulysses_size * ring_size` workers. Two front-ends build one:
//!
//! - [`Topology::infer`] derives the sizes from the worker count alone
//! - [`Topology::explicit`] takes caller-supplied sizes as-is
//!
//! Both go through the same validator, so every `Topology` value satisfies
//! `ulysses * ring * batch_parallel == world_size` and `batch_parallel ∈ {1, 3}`.

use std::fmt;

use super::error::{ParallelError, Result};
use crate::distributed::{GroupCoordinator, GroupDegrees};

/// Batch-parallel sizes the orchestration supports: no split, or one replica
/// each for the conditional and the two unconditional guidance passes.
pub const SUPPORTED_BATCH_PARALLEL_SIZES: [usize; 2] = [1, 3];

/// Validated parallel execution topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topology {
    ulysses_size: usize,
    ring_size: usize,
    batch_parallel_size: usize,
    world_size: usize,
}

impl Topology {
    /// Derive a topology from the worker count.
    ///
    /// | world_size | ulysses | ring | batch_parallel |
    /// |------------|---------|------|----------------|
    /// | 3          | 1       | 1    | 3              |
    /// | 1          | 1       | 1    | 1              |
    /// | even       | w       | 1    | 1              |
    pub fn infer(world_size: usize) -> Result<Self> {
        let (ulysses_size, ring_size, batch_parallel_size) = match world_size {
            3 => (1, 1, 3),
            1 => (1, 1, 1),
            w if w > 0 && w % 2 == 0 => (w, 1, 1),
            _ => return Err(ParallelError::UnsupportedTopology { world_size }),
        };
        Self::validate(world_size, ulysses_size, ring_size, batch_parallel_size)
    }

    /// Accept caller-supplied sizes after the invariant checks.
    pub fn explicit(
        world_size: usize,
        ulysses_size: usize,
        ring_size: usize,
        batch_parallel_size: usize,
    ) -> Result<Self> {
        Self::validate(world_size, ulysses_size, ring_size, batch_parallel_size)
    }

    /// The single degenerate topology.
    pub fn single() -> Self {
        Self {
            ulysses_size: 1,
            ring_size: 1,
            batch_parallel_size: 1,
            world_size: 1,
        }
    }

    fn validate(
        world_size: usize,
        ulysses_size: usize,
        ring_size: usize,
        batch_parallel_size: usize,
    ) -> Result<Self> {
        let invalid = |reason| ParallelError::InvalidTopology {
            ulysses_size,
            ring_size,
            batch_parallel_size,
            world_size,
            reason,
        };

        if ulysses_size == 0 || ring_size == 0 || batch_parallel_size == 0 || world_size == 0 {
            return Err(invalid("all sizes must be positive"));
        }
        let product = ulysses_size
            .checked_mul(ring_size)
            .and_then(|p| p.checked_mul(batch_parallel_size));
        if product != Some(world_size) {
            return Err(invalid(
                "ulysses_size * ring_size * batch_parallel_size must equal world_size",
            ));
        }
        if !SUPPORTED_BATCH_PARALLEL_SIZES.contains(&batch_parallel_size) {
            return Err(invalid("batch_parallel_size must be 1 or 3"));
        }

        Ok(Self {
            ulysses_size,
            ring_size,
            batch_parallel_size,
            world_size,
        })
    }

    pub fn ulysses_size(&self) -> usize {
        self.ulysses_size
    }

    pub fn ring_size(&self) -> usize {
        self.ring_size
    }

    pub fn batch_parallel_size(&self) -> usize {
        self.batch_parallel_size
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Workers jointly processing one sequence.
    pub fn sequence_parallel_width(&self) -> usize {
        self.ulysses_size * self.ring_size
    }

    /// `(1, 1, 1)`: nothing to initialize, nothing to override.
    pub fn is_degenerate(&self) -> bool {
        self.ulysses_size == 1 && self.ring_size == 1 && self.batch_parallel_size == 1
    }

    /// Whether attention itself must run sequence-parallel.
    pub fn uses_sequence_parallelism(&self) -> bool {
        self.ulysses_size > 1 || self.ring_size > 1
    }

    /// Degrees handed to the group coordinator.
    pub fn group_degrees(&self) -> GroupDegrees {
        GroupDegrees {
            batch_parallel: self.batch_parallel_size,
            sequence_parallel: self.sequence_parallel_width(),
            ring: self.ring_size,
            ulysses: self.ulysses_size,
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(ulysses={}, ring={}, batch_parallel={}, world_size={})",
            self.ulysses_size, self.ring_size, self.batch_parallel_size, self.world_size
        )
    }
}

/// How the caller wants the topology chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyRequest {
    /// Derive sizes from the worker count.
    Inferred { world_size: usize },
    /// Use these sizes over the runtime's world.
    Explicit {
        ulysses_size: usize,
        ring_size: usize,
        batch_parallel_size: usize,
    },
}

impl TopologyRequest {
    /// Inferred request over the coordinator's world.
    pub fn inferred_from(coordinator: &dyn GroupCoordinator) -> Self {
        Self::Inferred {
            world_size: coordinator.current_world_size(),
        }
    }

    /// Resolve against the runtime world size.
    ///
    /// Explicit requests are checked against `runtime_world_size`; inferred
    /// requests must name the same world the runtime runs.
    pub fn resolve(&self, runtime_world_size: usize) -> Result<Topology> {
        match *self {
            Self::Inferred { world_size } => {
                let topology = Topology::infer(world_size)?;
                if world_size != runtime_world_size {
                    return Err(ParallelError::InvalidTopology {
                        ulysses_size: topology.ulysses_size,
                        ring_size: topology.ring_size,
                        batch_parallel_size: topology.batch_parallel_size,
                        world_size: runtime_world_size,
                        reason: "inferred world_size differs from the runtime world size",
                    });
                }
                Ok(topology)
            }
            Self::Explicit {
                ulysses_size,
                ring_size,
                batch_parallel_size,
            } => Topology::explicit(
                runtime_world_size,
                ulysses_size,
                ring_size,
                batch_parallel_size,
            ),
        }
    }
}
