pub mod accumulate;
pub mod adamw;
pub mod schedule;

pub use accumulate::GradAccumulator;
pub use adamw::{AdamW, AdamWConfig, AdamWState, TensorState};
pub use schedule::{cosine_with_warmup, total_optimizer_steps, CosineSchedule};
