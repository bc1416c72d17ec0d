pub mod attention;
pub mod cross_attention;
pub mod routine;

pub use attention::{AttentionWeights, EagerSelfAttention, SelfAttention, SelfAttentionRoutine};
pub use cross_attention::{AudioCrossAttention, CrossAttentionRoutine, EagerCrossAttention};
pub use routine::RoutineSlot;
