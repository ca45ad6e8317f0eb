//! Cosine learning rate schedule with linear warmup.

use serde::{Deserialize, Serialize};

/// Cosine multiplier with linear warmup.
///
/// Returns a value in [0.0, 1.0]:
/// - Warmup phase: linear ramp from 0 to 1 over `warmup_steps`
/// - Decay phase: cosine anneal from 1.0 to 0.0 at `total_steps`
pub fn cosine_with_warmup(step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    if step < warmup_steps {
        return step as f64 / warmup_steps.max(1) as f64;
    }
    let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
    let progress = ((step - warmup_steps) as f64 / decay_steps as f64).min(1.0);
    0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
}

/// Stateful scheduler advanced once per optimizer step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosineSchedule {
    pub base_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
    step: usize,
}

impl CosineSchedule {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            step: 0,
        }
    }

    /// Learning rate for the next optimizer step.
    pub fn current_lr(&self) -> f64 {
        self.base_lr * cosine_with_warmup(self.step, self.warmup_steps, self.total_steps)
    }

    /// Advance by one optimizer step and return the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.step += 1;
        self.current_lr()
    }

    pub fn position(&self) -> usize {
        self.step
    }

    /// Jump to `step` optimizer steps in, used when resuming without saved state.
    pub fn seek(&mut self, step: usize) {
        self.step = step;
    }
}

/// Total optimizer steps over a run: `n_batches / grad_accum * epochs`, at least 1.
pub fn total_optimizer_steps(n_batches: usize, grad_accum: usize, epochs: usize) -> usize {
    (n_batches.div_ceil(grad_accum.max(1)) * epochs).max(1)
}
