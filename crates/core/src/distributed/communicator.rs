//! Device communicator for collective operations.
//!
//! The sequence-parallel routines only need two primitives: gathering shards
//! back along a dimension and a barrier that fences group construction.

use candle_core::Tensor;

use super::error::{DistributedError, Result};
use super::process_group::ProcessGroup;

/// Trait for device-to-device communication inside one group.
///
/// Implementations can wrap a real collective backend or be no-ops for a
/// single process.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// All-gather: gather tensors from all ranks along `gather_dim`.
    ///
    /// Input shape: `[d0, d1, ...]`
    /// Output shape: `[d0, d1 * world_size, ...]` (if gather_dim = 1)
    ///
    /// For a single rank, this is identity.
    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor>;

    /// Barrier: synchronize all ranks of the group.
    fn barrier(&self) -> Result<()>;
}

/// Mock communicator for single-process execution.
///
/// A single rank makes every collective an identity. With a simulated
/// multi-rank group the gather repeats the local shard so output shapes
/// match what a real backend would produce.
pub struct MockCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> MockCommunicator<P> {
    /// Create a new mock communicator with the given process group.
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl<P: ProcessGroup + Send + Sync> DeviceCommunicator for MockCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        if self.process_group.is_single() {
            return Ok(tensor.clone());
        }
        let rank = tensor.rank();
        if gather_dim >= rank {
            let mut expected = tensor.dims().to_vec();
            expected.resize(gather_dim + 1, 1);
            return Err(DistributedError::ShapeMismatch {
                expected,
                actual: tensor.dims().to_vec(),
            });
        }
        let world_size = self.process_group.world_size();
        let tensors: Vec<Tensor> = (0..world_size).map(|_| tensor.clone()).collect();
        Ok(Tensor::cat(&tensors, gather_dim)?)
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
