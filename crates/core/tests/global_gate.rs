//! Closure front-end over the process-wide group gate.
//!
//! This binary is its own process, so the global gate starts uninitialized.
//! Every test here asks for the same 4-worker topology as rank 0. The gate
//! keys on topology alone, so whichever test builds the groups first, the
//! others reuse them with rank-0 coordinates.

use candle_core::{DType, Device, Tensor};
use dit_parallel_core::distributed::LocalGroupCoordinator;
use dit_parallel_core::parallel::{
    with_parallel_context, GroupGate, OverrideTarget, ParallelError, TopologyRequest, UspRoutines,
};
use dit_parallel_core::testing::{tiny_pipeline, RoutineSnapshot, VanishingSlots};

fn request() -> TopologyRequest {
    TopologyRequest::Inferred { world_size: 4 }
}

#[derive(Debug)]
enum StepError {
    Parallel(ParallelError),
    Diverged,
}

impl From<ParallelError> for StepError {
    fn from(e: ParallelError) -> Self {
        Self::Parallel(e)
    }
}

#[test]
fn closure_runs_with_width_and_restores() {
    let coordinator = LocalGroupCoordinator::new(0, 4);
    let mut pipeline = tiny_pipeline();
    let before = RoutineSnapshot::take(&pipeline);

    let dims = with_parallel_context(
        &mut pipeline,
        request(),
        &coordinator,
        &UspRoutines,
        |pipeline, width| -> Result<Vec<usize>, ParallelError> {
            assert_eq!(width, 4);
            let cfg = pipeline.model().config();
            let latents = Tensor::ones((1, 8, cfg.hidden_size), DType::F32, &Device::Cpu)?;
            let audio = Tensor::ones((1, 2, cfg.audio_dim), DType::F32, &Device::Cpu)?;
            Ok(pipeline.forward(&latents, &audio)?.dims().to_vec())
        },
    )
    .unwrap();

    assert_eq!(dims, vec![1, 8, 32]);
    assert!(RoutineSnapshot::take(&pipeline).same_as(&before));
    assert!(GroupGate::global().is_initialized());
    assert_eq!(GroupGate::global().sequence_parallel_width(), Some(4));
}

#[test]
fn closure_error_is_returned_unchanged_after_restore() {
    let coordinator = LocalGroupCoordinator::new(0, 4);
    let mut pipeline = tiny_pipeline();
    let before = RoutineSnapshot::take(&pipeline);

    let err = with_parallel_context(
        &mut pipeline,
        request(),
        &coordinator,
        &UspRoutines,
        |_, _| -> Result<(), StepError> { Err(StepError::Diverged) },
    )
    .unwrap_err();

    assert!(matches!(err, StepError::Diverged));
    assert!(RoutineSnapshot::take(&pipeline).same_as(&before));
}

#[test]
fn closure_error_wins_over_restore_failure() {
    let coordinator = LocalGroupCoordinator::new(0, 4);
    let mut target = VanishingSlots::new(tiny_pipeline());

    let err = with_parallel_context(
        &mut target,
        request(),
        &coordinator,
        &UspRoutines,
        |target, _| -> Result<(), StepError> {
            target.hide_self_attention = true;
            Err(StepError::Diverged)
        },
    )
    .unwrap_err();

    assert!(matches!(err, StepError::Diverged));
    assert_eq!(target.pipeline.model().routine().get().name(), "sequential");
}

#[test]
fn restore_failure_after_successful_closure_is_reported() {
    let coordinator = LocalGroupCoordinator::new(0, 4);
    let mut target = VanishingSlots::new(tiny_pipeline());

    let err = with_parallel_context(
        &mut target,
        request(),
        &coordinator,
        &UspRoutines,
        |target, _| -> Result<(), StepError> {
            target.hide_self_attention = true;
            Ok(())
        },
    )
    .unwrap_err();

    assert!(matches!(
        err,
        StepError::Parallel(ParallelError::RestoreFailed {
            target: OverrideTarget::SelfAttention(_)
        })
    ));
}

#[test]
fn entry_failure_surfaces_through_caller_error_type() {
    let coordinator = LocalGroupCoordinator::new(0, 7);
    let mut pipeline = tiny_pipeline();
    let mut ran = false;

    let err = with_parallel_context(
        &mut pipeline,
        TopologyRequest::inferred_from(&coordinator),
        &coordinator,
        &UspRoutines,
        |_, _| -> Result<(), StepError> {
            ran = true;
            Ok(())
        },
    )
    .unwrap_err();

    assert!(matches!(
        err,
        StepError::Parallel(ParallelError::UnsupportedTopology { world_size: 7 })
    ));
    assert!(!ran);
}

#[test]
fn process_groups_survive_across_scopes() {
    let coordinator = LocalGroupCoordinator::new(0, 4);
    let mut pipeline = tiny_pipeline();

    for _ in 0..2 {
        with_parallel_context(
            &mut pipeline,
            request(),
            &coordinator,
            &UspRoutines,
            |_, width| -> Result<(), ParallelError> {
                assert_eq!(width, 4);
                Ok(())
            },
        )
        .unwrap();
    }

    // Another test may have initialized the gate first; either way this
    // coordinator is asked at most once.
    assert!(coordinator.group_init_calls() <= 1);
    assert_eq!(GroupGate::global().topology().map(|t| t.world_size()), Some(4));
}
