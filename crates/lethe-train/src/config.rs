//! Training configuration for Lethe retrieval-augmented fine-tuning.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{config_error, IoResultExt, TrainResult};

fn default_seed() -> u64 {
    42
}

fn default_adam_betas() -> (f64, f64) {
    (0.9, 0.999)
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_mem_chunk_size() -> usize {
    64
}

fn default_log_lr_every() -> usize {
    100
}

fn default_log_grads_every() -> usize {
    0 // disabled
}

fn default_output_dir() -> String {
    "ckpts/lethe".to_string()
}

fn default_save_name() -> String {
    "lethe".to_string()
}

fn default_true() -> bool {
    true
}

/// Model + training hyperparameter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    // Model architecture
    pub vocab_size: usize,
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub ffn_mult: f32,
    pub max_seq_len: usize,
    pub rope_theta: f32,
    /// 0-indexed layers whose attention also reads the memory bank.
    pub memory_attn_layers: Vec<usize>,

    // Optimization
    #[serde(default = "default_seed")]
    pub seed: u64,
    pub lr: f64,
    pub weight_decay: f64,
    #[serde(default = "default_adam_betas")]
    pub adam_betas: (f64, f64),
    #[serde(default = "default_adam_eps")]
    pub adam_eps: f64,
    pub batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub warmup_steps: usize,
    pub num_epochs: usize,
    /// Global-norm gradient clipping threshold (0.0 = disabled).
    #[serde(default)]
    pub grad_clip: f64,
    /// Cosine schedule with linear warmup; constant LR when false.
    #[serde(default = "default_true")]
    pub scheduler: bool,

    // Memory protocol
    /// Entries per head per batch element in each memory index.
    pub num_memories_per_index: usize,
    /// Neighbors read per query token during the answer pass.
    pub num_neighbors_to_retrieve: usize,
    /// Retrieved-context candidates written into memory per example.
    pub num_neighbors_to_store: usize,
    /// Rows per population forward call (peak memory vs. call overhead).
    #[serde(default = "default_mem_chunk_size")]
    pub mem_chunk_size: usize,

    // Cadence
    /// Save step-tagged weights every N steps (0 = never).
    #[serde(default)]
    pub save_every: usize,
    /// Evaluate every N steps (0 = only at the end of each epoch).
    #[serde(default)]
    pub eval_every: usize,
    #[serde(default = "default_log_lr_every")]
    pub log_lr_every: usize,
    /// Log gradient norm every N optimizer steps (0 = disabled).
    #[serde(default = "default_log_grads_every")]
    pub log_grads_every: usize,
    /// Keep only the last N `step_*` checkpoints (0 = keep all).
    #[serde(default)]
    pub keep_last_checkpoints: usize,

    // Output
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Checkpoint directory to resume from.
    #[serde(default)]
    pub checkpoint: Option<String>,
    /// Emit named scalar metrics to the metrics sink.
    #[serde(default)]
    pub log_metrics: bool,
    /// Publish each epoch checkpoint to the model registry.
    #[serde(default)]
    pub push_to_hub: bool,
    #[serde(default = "default_save_name")]
    pub save_name: String,
}

impl TrainConfig {
    /// Validate configuration and return list of errors
    ///
    /// # Returns
    /// * `Ok(())` if configuration is valid
    /// * `Err(errors)` if configuration has critical errors
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.dim == 0 {
            errors.push("dim must be greater than 0".to_string());
        }

        if self.n_layers == 0 {
            errors.push("n_layers must be greater than 0".to_string());
        }

        if self.n_heads == 0 {
            errors.push("n_heads must be greater than 0".to_string());
        } else if self.dim % self.n_heads != 0 {
            errors.push(format!(
                "dim ({}) must be divisible by n_heads ({})",
                self.dim, self.n_heads
            ));
        } else if self.head_dim() % 2 != 0 {
            errors.push(format!(
                "head_dim ({}) must be even for rotary embeddings",
                self.head_dim()
            ));
        }

        if self.vocab_size == 0 {
            errors.push("vocab_size must be greater than 0".to_string());
        }

        if self.memory_attn_layers.is_empty() {
            errors.push("memory_attn_layers must name at least one layer".to_string());
        }
        for &layer in &self.memory_attn_layers {
            if layer >= self.n_layers {
                errors.push(format!(
                    "memory_attn_layers entry {} out of range for n_layers ({})",
                    layer, self.n_layers
                ));
            }
        }

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }

        if self.gradient_accumulation_steps == 0 {
            errors.push("gradient_accumulation_steps must be greater than 0".to_string());
        }

        if self.lr <= 0.0 {
            errors.push(format!("learning rate ({}) must be positive", self.lr));
        }

        if self.num_memories_per_index == 0 {
            errors.push("num_memories_per_index must be greater than 0".to_string());
        }

        if self.num_neighbors_to_retrieve == 0 {
            errors.push("num_neighbors_to_retrieve must be greater than 0".to_string());
        }

        if self.num_neighbors_to_store == 0 {
            errors.push("num_neighbors_to_store must be greater than 0".to_string());
        } else if self.num_neighbors_to_store > self.num_memories_per_index {
            errors.push(format!(
                "num_neighbors_to_store ({}) exceeds num_memories_per_index ({}); \
                 every population would overflow the index",
                self.num_neighbors_to_store, self.num_memories_per_index
            ));
        }

        if self.mem_chunk_size == 0 {
            errors.push("mem_chunk_size must be greater than 0".to_string());
        }

        if self.push_to_hub && self.save_name.is_empty() {
            errors.push("save_name must be set when push_to_hub is true".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Load a config from a JSON file and validate it.
    pub fn from_json_file(path: &Path) -> TrainResult<Self> {
        let raw = std::fs::read_to_string(path).with_path(path)?;
        let config: TrainConfig = serde_json::from_str(&raw)
            .map_err(|e| config_error(format!("{}: {}", path.display(), e)))?;
        config
            .validate()
            .map_err(|errors| config_error(errors.join("; ")))?;
        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// SwiGLU hidden width, rounded up to a multiple of 8.
    pub fn ffn_dim(&self) -> usize {
        let raw = (self.dim as f32 * self.ffn_mult) as usize;
        raw.div_ceil(8) * 8
    }

    /// Retrieval count actually served per query (never above capacity).
    pub fn effective_neighbors_to_retrieve(&self) -> usize {
        self.num_neighbors_to_retrieve.min(self.num_memories_per_index)
    }

    /// Tiny CPU config for smoke tests and the synthetic pipeline.
    pub fn tiny_cpu() -> Self {
        Self {
            vocab_size: 64,
            dim: 32,
            n_layers: 2,
            n_heads: 4,
            ffn_mult: 2.0,
            max_seq_len: 32,
            rope_theta: 10000.0,
            memory_attn_layers: vec![1],

            seed: 42,
            lr: 3e-3,
            weight_decay: 0.0,
            adam_betas: default_adam_betas(),
            adam_eps: default_adam_eps(),
            batch_size: 2,
            gradient_accumulation_steps: 1,
            warmup_steps: 2,
            num_epochs: 1,
            grad_clip: 1.0,
            scheduler: true,

            num_memories_per_index: 4,
            num_neighbors_to_retrieve: 2,
            num_neighbors_to_store: 2,
            mem_chunk_size: 2,

            save_every: 0,
            eval_every: 0,
            log_lr_every: 10,
            log_grads_every: 0,
            keep_last_checkpoints: 0,

            output_dir: default_output_dir(),
            checkpoint: None,
            log_metrics: false,
            push_to_hub: false,
            save_name: default_save_name(),
        }
    }

    /// Small GPU-sized config (~25M params) for real fine-tuning runs.
    pub fn small() -> Self {
        Self {
            vocab_size: 32000,
            dim: 512,
            n_layers: 8,
            n_heads: 8,
            ffn_mult: 2.75,
            max_seq_len: 512,
            rope_theta: 10000.0,
            memory_attn_layers: vec![5],

            seed: 42,
            lr: 2e-5,
            weight_decay: 0.0,
            adam_betas: default_adam_betas(),
            adam_eps: default_adam_eps(),
            batch_size: 8,
            gradient_accumulation_steps: 4,
            warmup_steps: 500,
            num_epochs: 2,
            grad_clip: 1.0,
            scheduler: true,

            num_memories_per_index: 4096,
            num_neighbors_to_retrieve: 32,
            num_neighbors_to_store: 16,
            mem_chunk_size: 64,

            save_every: 1000,
            eval_every: 500,
            log_lr_every: 100,
            log_grads_every: 100,
            keep_last_checkpoints: 3,

            output_dir: default_output_dir(),
            checkpoint: None,
            log_metrics: true,
            push_to_hub: false,
            save_name: default_save_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(TrainConfig::tiny_cpu().validate().is_ok());
        assert!(TrainConfig::small().validate().is_ok());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.n_heads = 3;
        cfg.memory_attn_layers = vec![7];
        cfg.gradient_accumulation_steps = 0;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("divisible by n_heads")));
        assert!(errors.iter().any(|e| e.contains("out of range")));
        assert!(errors.iter().any(|e| e.contains("gradient_accumulation_steps")));
    }

    #[test]
    fn test_store_count_must_fit_capacity() {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.num_neighbors_to_store = 5;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("num_memories_per_index")));
    }

    #[test]
    fn test_config_serde_roundtrip_fills_defaults() {
        let cfg = TrainConfig::tiny_cpu();
        let mut value = serde_json::to_value(&cfg).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("mem_chunk_size");
        obj.remove("output_dir");
        obj.remove("checkpoint");

        let restored: TrainConfig = serde_json::from_value(value).unwrap();
        assert_eq!(restored.mem_chunk_size, default_mem_chunk_size());
        assert_eq!(restored.output_dir, default_output_dir());
        assert!(restored.checkpoint.is_none());
        assert_eq!(restored.memory_attn_layers, cfg.memory_attn_layers);
    }

    #[test]
    fn test_from_json_file_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.mem_chunk_size = 0;
        std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();
        assert!(TrainConfig::from_json_file(&path).is_err());

        cfg.mem_chunk_size = 2;
        std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();
        let loaded = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.mem_chunk_size, 2);
    }

    #[test]
    fn test_effective_retrieve_capped_by_capacity() {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.num_neighbors_to_retrieve = 10;
        assert_eq!(cfg.effective_neighbors_to_retrieve(), 4);
    }
}
