//! Integration tests for full training workflows
//!
//! These tests verify end-to-end training behavior including:
//! - Optimizer cadence under gradient accumulation
//! - Checkpoint layout, evaluation records and publishing
//! - Resume from step and epoch checkpoints

use std::path::Path;

use candle_core::Device;
use lethe_train::{
    checkpoint::{self, ResumePoint},
    config::TrainConfig,
    data::{RetrievalLoader, SyntheticRetrievalDataset},
    error::TrainResult,
    eval::LossTable,
    metrics::RecordingMetricsSink,
    publish::DirectoryRegistry,
    train::{StepPhase, Trainer},
};

fn tiny_config(output_dir: &Path) -> TrainConfig {
    let mut cfg = TrainConfig::tiny_cpu();
    cfg.output_dir = output_dir.display().to_string();
    cfg
}

fn dataset(n: usize, seed: u64) -> SyntheticRetrievalDataset {
    SyntheticRetrievalDataset::new(64, 6, 3, 4, n, seed)
}

#[test]
fn test_optimizer_steps_follow_accumulation_and_flush() -> TrainResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = tiny_config(dir.path());
    cfg.gradient_accumulation_steps = 4;
    let mut trainer = Trainer::new(cfg, Device::Cpu)?;

    // 26 examples, batch 2 -> 13 batches.
    let ds = dataset(26, 0);
    let loader = RetrievalLoader::for_training(&ds, 2, 0, 0, 1, &Device::Cpu);
    let n_batches = loader.n_batches();
    assert_eq!(n_batches, 13);

    let mut stepped_at = Vec::new();
    for item in loader {
        let (step, batch) = item?;
        let report = trainer.train_step(batch.as_ref(), 0, step, n_batches)?;
        if report.ran(StepPhase::OptimizerStep) {
            stepped_at.push(step);
        }
        assert!(trainer.bank.is_empty());
    }

    assert_eq!(stepped_at, vec![3, 7, 11, 12]);
    assert_eq!(trainer.optimizer_steps(), 4);
    assert_eq!(
        checkpoint::optimizer_steps_after(trainer.completed_micro_steps(), n_batches, 4),
        4
    );
    Ok(())
}

#[test]
fn test_end_to_end_synthetic_run() -> TrainResult<()> {
    let out = tempfile::tempdir().unwrap();
    let registry_root = tempfile::tempdir().unwrap();
    let sink = RecordingMetricsSink::new();

    let mut cfg = tiny_config(out.path());
    cfg.num_epochs = 2;
    cfg.save_every = 2;
    cfg.log_metrics = true;
    cfg.push_to_hub = true;
    let mut trainer = Trainer::new(cfg, Device::Cpu)?
        .with_metrics_sink(Box::new(sink.clone()))
        .with_registry(Box::new(DirectoryRegistry::new(registry_root.path())));

    // 8 examples, batch 2 -> 4 batches per epoch.
    let train = dataset(8, 1);
    let eval = dataset(5, 2);
    let summary = trainer.train(&train, Some(&eval))?;

    assert_eq!(summary.completed_micro_steps, 8);
    assert_eq!(summary.optimizer_steps, 8);
    assert!(summary.last_val_loss.unwrap().is_finite());

    // Step checkpoints at step 2 of each epoch, tagged with the global step.
    assert!(out.path().join("step_2").join(checkpoint::WEIGHTS_FILE).exists());
    assert!(out.path().join("step_6").join(checkpoint::META_FILE).exists());
    assert!(!out.path().join("step_2").join(checkpoint::STATE_FILE).exists());
    for tag in ["epoch_0", "epoch_1", "final"] {
        let dir = out.path().join(tag);
        assert!(dir.join(checkpoint::WEIGHTS_FILE).exists(), "{tag}");
        assert!(dir.join(checkpoint::STATE_FILE).exists(), "{tag}");
    }
    assert_eq!(summary.final_checkpoint, Some(out.path().join("final")));

    // Evaluation on the last step of each epoch, one row per example.
    for step in [3, 7] {
        let table = LossTable::read(&LossTable::record_path(out.path(), step, 0))?;
        assert_eq!(table.len(), 5);
        assert!(table.losses.iter().all(|l| l.is_finite()));
    }

    assert!(registry_root.path().join("lethe-epoch_0").join(checkpoint::WEIGHTS_FILE).exists());
    assert!(registry_root.path().join("lethe-epoch_1").exists());

    assert_eq!(sink.named("loss").len(), 8);
    let val = sink.named("val_loss");
    assert_eq!(val.iter().map(|e| e.step).collect::<Vec<_>>(), vec![3, 7]);
    assert_eq!(sink.named("train_loss").len(), 2);
    Ok(())
}

#[test]
fn test_resume_from_step_checkpoint_skips_completed_batches() -> TrainResult<()> {
    let first = tempfile::tempdir().unwrap();
    let mut cfg = tiny_config(first.path());
    cfg.save_every = 2;
    let train = dataset(8, 3);
    Trainer::new(cfg.clone(), Device::Cpu)?.train(&train, None)?;

    let step_dir = first.path().join("step_2");
    let point = ResumePoint::for_checkpoint(&step_dir, 4, 1)?;
    assert_eq!(point.epoch, 0);
    assert_eq!(point.skip_batches, 3);

    let second = tempfile::tempdir().unwrap();
    let mut resumed_cfg = tiny_config(second.path());
    resumed_cfg.save_every = 2;
    resumed_cfg.checkpoint = Some(step_dir.display().to_string());
    let mut resumed = Trainer::new(resumed_cfg, Device::Cpu)?;
    let summary = resumed.train(&train, None)?;

    // Only batch 3 remains; three optimizer steps were already taken.
    assert_eq!(summary.completed_micro_steps, 4);
    assert_eq!(summary.optimizer_steps, 4);
    assert!(!second.path().join("step_2").exists());
    Ok(())
}

#[test]
fn test_resume_from_epoch_checkpoint_restores_state() -> TrainResult<()> {
    let out = tempfile::tempdir().unwrap();
    let train = dataset(8, 4);
    Trainer::new(tiny_config(out.path()), Device::Cpu)?.train(&train, None)?;

    let epoch_dir = out.path().join("epoch_0");
    let state = checkpoint::read_training_state(&epoch_dir)?.unwrap();
    assert_eq!(state.completed_micro_steps, 4);
    assert_eq!(state.optimizer.step, 4);

    let next = tempfile::tempdir().unwrap();
    let mut cfg = tiny_config(next.path());
    cfg.num_epochs = 2;
    cfg.checkpoint = Some(epoch_dir.display().to_string());
    let mut trainer = Trainer::new(cfg, Device::Cpu)?;
    let summary = trainer.train(&train, None)?;

    assert_eq!(summary.completed_micro_steps, 8);
    assert_eq!(summary.optimizer_steps, 8);
    assert!(!next.path().join("epoch_0").exists());
    assert!(next.path().join("epoch_1").exists());

    let restored = checkpoint::read_training_state(&next.path().join("final"))?.unwrap();
    assert_eq!(restored.optimizer.step, 8);
    Ok(())
}

#[test]
fn test_saved_checkpoint_loads_without_trainer() -> TrainResult<()> {
    let out = tempfile::tempdir().unwrap();
    let mut trainer = Trainer::new(tiny_config(out.path()), Device::Cpu)?;
    trainer.train(&dataset(4, 5), None)?;

    let loaded = checkpoint::load_checkpoint(&out.path().join("final"), &Device::Cpu)?;
    assert_eq!(loaded.meta.tag, "final");
    assert_eq!(loaded.meta.config.dim, trainer.config.dim);
    let a = trainer.model.tok_embed.embeddings().to_vec2::<f32>()?;
    let b = loaded.model.tok_embed.embeddings().to_vec2::<f32>()?;
    assert_eq!(a, b);
    Ok(())
}
