//! Training checkpoint save/load and resume arithmetic.
//!
//! Layout of a checkpoint directory:
//!   - `model.safetensors`: consolidated weights
//!   - `meta.json`: config, tag and step
//!   - `training_state.json`: optimizer, scheduler and counters (epoch and
//!     final checkpoints only)
//!
//! Every file is written to a temporary name and renamed into place, so an
//! interrupted save never leaves a truncated file under the real name.

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::TrainConfig;
use crate::error::{checkpoint_error, IoResultExt, TrainResult};
use crate::model::LetheModel;
use crate::optim::{AdamWState, CosineSchedule};

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const META_FILE: &str = "meta.json";
pub const STATE_FILE: &str = "training_state.json";

/// Metadata stored alongside model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub config: TrainConfig,
    /// Directory name: `step_<n>`, `epoch_<n>` or `final`.
    pub tag: String,
    pub global_step: usize,
    pub epoch: usize,
    pub train_loss: Option<f64>,
}

/// Everything beyond the weights needed to continue a run exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: usize,
    /// Micro-steps finished since the start of training, across epochs.
    pub completed_micro_steps: usize,
    pub optimizer_steps: usize,
    pub optimizer: AdamWState,
    pub scheduler: Option<CosineSchedule>,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> TrainResult<()> {
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).with_path(&tmp)?;
    fs::rename(&tmp, path).with_path(path)?;
    Ok(())
}

/// Save weights and metadata to `dir`.
pub fn save_model(varmap: &VarMap, meta: &CheckpointMeta, dir: &Path) -> TrainResult<()> {
    fs::create_dir_all(dir).with_path(dir)?;

    let weights = dir.join(WEIGHTS_FILE);
    let tmp = tmp_path(&weights);
    varmap
        .save(&tmp)
        .map_err(|e| checkpoint_error(format!("saving weights: {}", e), &tmp))?;
    fs::rename(&tmp, &weights).with_path(&weights)?;

    let json = serde_json::to_string_pretty(meta)
        .map_err(|e| checkpoint_error(e.to_string(), dir))?;
    write_atomic(&dir.join(META_FILE), json.as_bytes())
}

/// Save the optimizer/scheduler/counter record to `dir`.
pub fn save_training_state(state: &TrainingState, dir: &Path) -> TrainResult<()> {
    fs::create_dir_all(dir).with_path(dir)?;
    let json = serde_json::to_vec(state).map_err(|e| checkpoint_error(e.to_string(), dir))?;
    write_atomic(&dir.join(STATE_FILE), &json)
}

pub fn read_meta(dir: &Path) -> TrainResult<CheckpointMeta> {
    let path = dir.join(META_FILE);
    let raw = fs::read_to_string(&path).with_path(&path)?;
    serde_json::from_str(&raw).map_err(|e| checkpoint_error(e.to_string(), &path))
}

/// The training state record, if this checkpoint has one.
pub fn read_training_state(dir: &Path) -> TrainResult<Option<TrainingState>> {
    let path = dir.join(STATE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read(&path).with_path(&path)?;
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| checkpoint_error(e.to_string(), &path))
}

/// Overwrite the values of existing variables with the saved weights.
pub fn load_weights_into(varmap: &mut VarMap, dir: &Path) -> TrainResult<()> {
    let path = dir.join(WEIGHTS_FILE);
    varmap
        .load(&path)
        .map_err(|e| checkpoint_error(format!("loading weights: {}", e), &path))
}

/// A checkpoint materialized without a trainer.
pub struct LoadedCheckpoint {
    pub varmap: VarMap,
    pub model: LetheModel,
    pub meta: CheckpointMeta,
    pub state: Option<TrainingState>,
}

/// Rebuild the model described by `meta.json` and load its weights.
pub fn load_checkpoint(dir: &Path, device: &Device) -> TrainResult<LoadedCheckpoint> {
    let meta = read_meta(dir)?;
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = LetheModel::new(&meta.config, vb)?;
    load_weights_into(&mut varmap, dir)?;
    let state = read_training_state(dir)?;
    Ok(LoadedCheckpoint {
        varmap,
        model,
        meta,
        state,
    })
}

/// `n` from a directory named `step_<n>`.
pub fn parse_step_tag(dir: &Path) -> Option<usize> {
    dir.file_name()?
        .to_str()?
        .strip_prefix("step_")?
        .parse()
        .ok()
}

/// Optimizer steps taken after `completed` micro-steps: one every
/// `grad_accum` micro-steps, plus a flush on the last batch of each epoch.
pub fn optimizer_steps_after(completed: usize, n_batches: usize, grad_accum: usize) -> usize {
    if n_batches == 0 {
        return 0;
    }
    let grad_accum = grad_accum.max(1);
    let full_epochs = completed / n_batches;
    let rem = completed % n_batches;
    full_epochs * n_batches.div_ceil(grad_accum) + rem / grad_accum
}

/// Where to pick up a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub completed_micro_steps: usize,
    pub optimizer_steps: usize,
    pub epoch: usize,
    /// Batches of `epoch` to skip.
    pub skip_batches: usize,
}

impl ResumePoint {
    pub fn from_completed(completed: usize, n_batches: usize, grad_accum: usize) -> Self {
        let n = n_batches.max(1);
        Self {
            completed_micro_steps: completed,
            optimizer_steps: optimizer_steps_after(completed, n_batches, grad_accum),
            epoch: completed / n,
            skip_batches: completed % n,
        }
    }

    /// Resume point for the checkpoint in `dir`.
    ///
    /// With a training state record the saved counters are used. Otherwise a
    /// `step_<n>` directory means micro-step `n` finished, and any other tag
    /// falls back to the step in `meta.json`.
    pub fn for_checkpoint(dir: &Path, n_batches: usize, grad_accum: usize) -> TrainResult<Self> {
        if let Some(state) = read_training_state(dir)? {
            let mut point = Self::from_completed(state.completed_micro_steps, n_batches, grad_accum);
            point.optimizer_steps = state.optimizer_steps;
            return Ok(point);
        }
        let last_step = match parse_step_tag(dir) {
            Some(step) => step,
            None => read_meta(dir)?.global_step,
        };
        Ok(Self::from_completed(last_step + 1, n_batches, grad_accum))
    }
}

/// Remove all but the newest `keep_last` `step_<n>` directories under `dir`.
pub fn cleanup_old_checkpoints(dir: &Path, keep_last: usize) -> TrainResult<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut checkpoints: Vec<(PathBuf, usize)> = Vec::new();
    for entry in fs::read_dir(dir).with_path(dir)? {
        let path = entry.with_path(dir)?.path();
        if path.is_dir() {
            if let Some(step) = parse_step_tag(&path) {
                checkpoints.push((path, step));
            }
        }
    }

    checkpoints.sort_by_key(|(_, step)| *step);
    let to_remove = checkpoints.len().saturating_sub(keep_last);

    for (path, step) in checkpoints.iter().take(to_remove) {
        info!(step = step, path = %path.display(), "Removing old checkpoint");
        fs::remove_dir_all(path).with_path(path)?;
    }
    Ok(to_remove)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{AdamW, AdamWConfig, GradAccumulator};

    fn tiny_model() -> (VarMap, LetheModel, TrainConfig) {
        let cfg = TrainConfig::tiny_cpu();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = LetheModel::new(&cfg, vb).unwrap();
        (varmap, model, cfg)
    }

    fn meta(cfg: &TrainConfig, tag: &str, step: usize) -> CheckpointMeta {
        CheckpointMeta {
            config: cfg.clone(),
            tag: tag.to_string(),
            global_step: step,
            epoch: 0,
            train_loss: Some(3.5),
        }
    }

    #[test]
    fn test_save_then_load_restores_weights() {
        let (varmap, model, cfg) = tiny_model();
        let dir = tempfile::tempdir().unwrap();
        let ckpt = dir.path().join("step_4");
        save_model(&varmap, &meta(&cfg, "step_4", 4), &ckpt).unwrap();

        assert!(ckpt.join(WEIGHTS_FILE).exists());
        assert!(ckpt.join(META_FILE).exists());
        assert!(!ckpt.join("model.safetensors.tmp").exists());

        let loaded = load_checkpoint(&ckpt, &Device::Cpu).unwrap();
        assert_eq!(loaded.meta.global_step, 4);
        assert!(loaded.state.is_none());
        let a = model.tok_embed.embeddings().to_vec2::<f32>().unwrap();
        let b = loaded.model.tok_embed.embeddings().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_training_state_roundtrip() {
        let (varmap, _model, cfg) = tiny_model();
        let acc = GradAccumulator::from_varmap(&varmap).unwrap();
        let opt = AdamW::new(acc.named_vars(), AdamWConfig::default()).unwrap();
        let state = TrainingState {
            epoch: 1,
            completed_micro_steps: 20,
            optimizer_steps: 5,
            optimizer: opt.export_state().unwrap(),
            scheduler: Some(CosineSchedule::new(cfg.lr, 2, 10)),
        };

        let dir = tempfile::tempdir().unwrap();
        save_training_state(&state, dir.path()).unwrap();
        let back = read_training_state(dir.path()).unwrap().unwrap();
        assert_eq!(back.completed_micro_steps, 20);
        assert_eq!(back.optimizer.names, state.optimizer.names);
        assert!(read_training_state(&dir.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn test_parse_step_tag() {
        assert_eq!(parse_step_tag(Path::new("/ckpts/step_120")), Some(120));
        assert_eq!(parse_step_tag(Path::new("/ckpts/epoch_1")), None);
        assert_eq!(parse_step_tag(Path::new("/ckpts/step_x")), None);
    }

    #[test]
    fn test_optimizer_steps_after_counts_flushes() {
        // 10 batches, accumulation 4: steps at 3, 7 and the flush at 9.
        assert_eq!(optimizer_steps_after(0, 10, 4), 0);
        assert_eq!(optimizer_steps_after(4, 10, 4), 1);
        assert_eq!(optimizer_steps_after(9, 10, 4), 2);
        assert_eq!(optimizer_steps_after(10, 10, 4), 3);
        assert_eq!(optimizer_steps_after(14, 10, 4), 4);
    }

    #[test]
    fn test_resume_from_step_directory_without_state() {
        let (varmap, _model, cfg) = tiny_model();
        let dir = tempfile::tempdir().unwrap();
        let ckpt = dir.path().join("step_12");
        save_model(&varmap, &meta(&cfg, "step_12", 12), &ckpt).unwrap();

        // Step 12 done -> 13 micro-steps completed; epoch 1 of 10 batches, skip 3.
        let point = ResumePoint::for_checkpoint(&ckpt, 10, 4).unwrap();
        assert_eq!(point.completed_micro_steps, 13);
        assert_eq!(point.epoch, 1);
        assert_eq!(point.skip_batches, 3);
        assert_eq!(point.optimizer_steps, 3);
    }

    #[test]
    fn test_cleanup_keeps_newest_step_dirs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["step_5", "step_10", "step_15", "epoch_0"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        let removed = cleanup_old_checkpoints(dir.path(), 2).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("step_5").exists());
        assert!(dir.path().join("step_10").exists());
        assert!(dir.path().join("epoch_0").exists());
    }
}
