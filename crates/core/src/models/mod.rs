pub mod dit;
pub mod snapshot;

pub use dit::{DitBlock, DitModel, DitPipeline, ModelRoutine, SequentialForward};
pub use snapshot::RoutineSnapshot;
