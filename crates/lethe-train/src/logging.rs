//! Structured logging for training with tracing.
//!
//! JSON output for production runs, pretty output for local runs, and a few
//! event helpers so step, checkpoint and evaluation records share field names.

use tracing::{debug, error, info, span, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging.
///
/// Reads log level from RUST_LOG environment variable (defaults to "info").
/// Outputs JSON-formatted logs for production monitoring.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lethe_train=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();

    info!("Structured logging initialized");
}

/// Initialize simple console logging (for local runs and debugging).
pub fn init_console_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lethe_train=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .try_init();
}

/// Per-step values reported by the trainer.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// Loss of this micro-step, averaged across ranks.
    pub loss: f64,
    /// Learning rate in effect.
    pub learning_rate: f64,
    /// Global gradient norm, when an optimizer step ran this micro-step.
    pub grad_norm: Option<f64>,
    /// Entries written into the memory bank this step (this rank).
    pub memories_stored: usize,
    pub tokens_per_sec: f64,
}

/// Log a training step with structured metrics.
///
/// Emits an error for non-finite loss and a warning for a gradient norm above 10.
pub fn log_training_step(step: usize, metrics: &StepMetrics) {
    let span = span!(Level::INFO, "training_step", step = step);
    let _enter = span.enter();

    if !metrics.loss.is_finite() {
        error!(
            loss = metrics.loss,
            step = step,
            "Training diverged! NaN or infinite loss detected"
        );
        return;
    }

    info!(
        loss = metrics.loss,
        lr = metrics.learning_rate,
        grad_norm = metrics.grad_norm,
        memories_stored = metrics.memories_stored,
        tokens_per_sec = metrics.tokens_per_sec,
        "Training step completed"
    );

    if let Some(grad_norm) = metrics.grad_norm {
        if grad_norm > 10.0 {
            warn!(
                grad_norm = grad_norm,
                step = step,
                threshold = 10.0,
                "High gradient norm detected - potential instability"
            );
        }
    }

    debug!(step = step, memories = metrics.memories_stored, "Memory bank reset");
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(step: usize, path: &str, tag: &str) {
    info!(
        step = step,
        path = path,
        tag = tag,
        event = "checkpoint_saved",
        "Checkpoint saved successfully"
    );
}

/// Log evaluation results.
pub fn log_evaluation(step: usize, val_loss: f64, n_examples: usize) {
    info!(
        step = step,
        val_loss = val_loss,
        val_perplexity = val_loss.exp(),
        n_examples = n_examples,
        event = "evaluation",
        "Evaluation completed"
    );
}

/// Log a registry publish that failed; training continues.
pub fn log_publish_failure(name: &str, err: &dyn std::fmt::Display) {
    warn!(
        name = name,
        error = %err,
        event = "publish_failed",
        "Publishing checkpoint failed; continuing"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_does_not_panic() {
        let metrics = StepMetrics {
            loss: 2.5,
            learning_rate: 1e-3,
            grad_norm: Some(15.0),
            memories_stored: 4,
            tokens_per_sec: 5000.0,
        };
        log_training_step(100, &metrics);
        log_training_step(
            101,
            &StepMetrics {
                loss: f64::NAN,
                grad_norm: None,
                ..metrics
            },
        );
        log_checkpoint_save(100, "/tmp/checkpoint", "step_100");
        log_evaluation(100, 2.3, 16);
        log_publish_failure("lethe-epoch_0", &"registry offline");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_console_logging();
        init_logging();
    }
}
