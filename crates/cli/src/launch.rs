//! Single-worker launch of a zero-weight DiT under a parallel scope.
//!
//! Each worker of a job runs this with its own `RANK`; collectives go
//! through the in-process coordinator, so a worker can be exercised on its
//! own without a communication backend.

use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use dit_parallel_core::config::DitConfig;
use dit_parallel_core::distributed::{DistributedConfig, LocalGroupCoordinator};
use dit_parallel_core::models::{DitModel, DitPipeline, RoutineSnapshot};
use dit_parallel_core::parallel::{
    ParallelContext, ParallelError, Topology, TopologyRequest, UspRoutines,
};

use crate::config::LaunchConfig;

const DEFAULT_TOKENS_PER_WORKER: usize = 4;
const DEFAULT_AUDIO_LEN: usize = 8;

/// Topology request implied by the launch settings.
///
/// Any explicit size switches to explicit mode; unset sizes default to 1.
pub fn topology_request(launch: &LaunchConfig, world_size: usize) -> TopologyRequest {
    if launch.has_explicit_topology() {
        TopologyRequest::Explicit {
            ulysses_size: launch.ulysses_size.unwrap_or(1),
            ring_size: launch.ring_size.unwrap_or(1),
            batch_parallel_size: launch.batch_parallel_size.unwrap_or(1),
        }
    } else {
        TopologyRequest::Inferred { world_size }
    }
}

/// Resolve the topology a launch would run with.
pub fn resolve_topology(launch: &LaunchConfig, world_size: usize) -> Result<Topology, ParallelError> {
    topology_request(launch, world_size).resolve(world_size)
}

/// Model configuration: a JSON file when given, else the launch overrides
/// applied to a small default model.
pub fn dit_config(launch: &LaunchConfig, model_config: Option<&Path>) -> anyhow::Result<DitConfig> {
    let mut cfg = match model_config {
        Some(path) => DitConfig::from_file(path)?,
        None => DitConfig {
            hidden_size: 64,
            num_heads: 4,
            num_layers: 2,
            audio_dim: 32,
            blocks_without_audio: Vec::new(),
        },
    };
    if let Some(v) = launch.hidden_size {
        cfg.hidden_size = v;
    }
    if let Some(v) = launch.num_heads {
        cfg.num_heads = v;
    }
    if let Some(v) = launch.num_layers {
        cfg.num_layers = v;
    }
    if let Some(v) = launch.audio_dim {
        cfg.audio_dim = v;
    }
    cfg.validate().context("invalid model configuration")?;
    Ok(cfg)
}

/// What one worker observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub topology: Topology,
    pub width: usize,
    pub output_shape: Vec<usize>,
    pub restored: bool,
}

/// Run one forward pass on this worker under a parallel scope.
pub fn run(
    launch: &LaunchConfig,
    model_config: Option<&Path>,
    distributed: &DistributedConfig,
) -> anyhow::Result<RunReport> {
    distributed
        .validate()
        .context("invalid distributed environment")?;
    let cfg = dit_config(launch, model_config)?;

    let device = Device::Cpu;
    let vb = VarBuilder::zeros(DType::F32, &device);
    let mut pipeline = DitPipeline::new(DitModel::new(&cfg, vb)?);
    let original = RoutineSnapshot::take(&pipeline);

    let coordinator = LocalGroupCoordinator::new(distributed.rank, distributed.world_size);
    let request = topology_request(launch, distributed.world_size);
    let scope = ParallelContext::new(&coordinator, &UspRoutines)
        .enter(&mut pipeline, request)
        .with_context(|| format!("failed to enter parallel scope for {request:?}"))?;

    let topology = scope.topology();
    let width = scope.width();
    let batch = launch.batch_size.unwrap_or(topology.batch_parallel_size());
    let seq_len = launch
        .seq_len
        .unwrap_or(width * DEFAULT_TOKENS_PER_WORKER);
    let audio_len = launch.audio_len.unwrap_or(DEFAULT_AUDIO_LEN);

    let latents = Tensor::ones((batch, seq_len, cfg.hidden_size), DType::F32, &device)?;
    let audio = Tensor::ones((batch, audio_len, cfg.audio_dim), DType::F32, &device)?;
    let output = scope
        .forward(&latents, &audio)
        .context("parallel forward pass failed")?;
    let output_shape = output.dims().to_vec();
    tracing::info!(
        rank = distributed.rank,
        %topology,
        width,
        shape = ?output_shape,
        "forward pass complete"
    );
    scope.exit()?;

    let restored = RoutineSnapshot::take(&pipeline).same_as(&original);
    if !restored {
        tracing::error!(rank = distributed.rank, "pipeline routines not restored");
    }
    Ok(RunReport {
        topology,
        width,
        output_shape,
        restored,
    })
}
