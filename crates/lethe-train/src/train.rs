//! Training loop: populate memory, answer, accumulate, step.
//!
//! Every rank runs the same sequence of steps and collectives. One step is:
//!
//! 1. `Populate`: the first `num_neighbors_to_store` context candidates of each
//!    example are pushed through the model in chunks and written to the bank.
//! 2. `AnswerForward`: the question batch reads the bank; scalar loss.
//! 3. `GradientSyncAndBackward`: the loss is gathered from all ranks into the
//!    running train loss, then scaled by `1 / gradient_accumulation_steps` and
//!    back-propagated into the accumulator.
//! 4. `IndexReset`: the bank is cleared.
//! 5. `OptimizerStep` (every `gradient_accumulation_steps` and on the last
//!    batch): gradients are averaged across ranks, clipped, applied.
//! 6. `Checkpoint` and `Evaluate` on their own cadences.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info, warn};

use crate::checkpoint::{
    cleanup_old_checkpoints, load_weights_into, read_training_state, save_model,
    save_training_state, CheckpointMeta, ResumePoint, TrainingState,
};
use crate::config::TrainConfig;
use crate::data::{Batch, RetrievalDataset, RetrievalLoader};
use crate::distributed::{broadcast_vars, DistributedContext, SingleProcess};
use crate::error::{config_error, TrainError, TrainResult};
use crate::eval::{evaluate, LossTable};
use crate::logging::{log_checkpoint_save, log_evaluation, log_publish_failure, log_training_step, StepMetrics};
use crate::memory::MemoryBank;
use crate::metrics::{format_metrics, MeanMetric, MetricsSink};
use crate::model::LetheModel;
use crate::optim::{total_optimizer_steps, AdamW, AdamWConfig, CosineSchedule, GradAccumulator};
use crate::publish::{epoch_publish_name, ModelRegistry};

/// Phases of one training step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Populate,
    AnswerForward,
    GradientSyncAndBackward,
    IndexReset,
    OptimizerStep,
    Checkpoint,
    Evaluate,
}

/// What one step did.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub epoch: usize,
    /// Batch index within the epoch.
    pub step: usize,
    /// `epoch * n_batches + step`.
    pub global_step: usize,
    /// Batch loss averaged over the ranks that had a batch.
    pub loss: f64,
    pub learning_rate: f64,
    /// Set when an optimizer step ran.
    pub grad_norm: Option<f64>,
    /// Entries this rank wrote into the bank.
    pub memories_stored: usize,
    pub val_loss: Option<f64>,
    pub phases: Vec<StepPhase>,
}

impl StepReport {
    pub fn ran(&self, phase: StepPhase) -> bool {
        self.phases.contains(&phase)
    }
}

/// Counters at the end of [`Trainer::train`].
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub completed_micro_steps: usize,
    pub optimizer_steps: usize,
    pub last_val_loss: Option<f64>,
    pub final_checkpoint: Option<PathBuf>,
}

/// Model, memory bank, optimizer and the collective context of one rank.
pub struct Trainer {
    pub model: LetheModel,
    pub varmap: VarMap,
    pub bank: MemoryBank,
    pub config: TrainConfig,
    pub device: Device,
    optimizer: AdamW,
    scheduler: Option<CosineSchedule>,
    accumulator: GradAccumulator,
    dist: Arc<dyn DistributedContext>,
    metrics: Option<Box<dyn MetricsSink>>,
    registry: Option<Box<dyn ModelRegistry>>,
    train_loss: MeanMetric,
    completed_micro_steps: usize,
    optimizer_steps: usize,
}

impl Trainer {
    /// Single-process trainer.
    pub fn new(config: TrainConfig, device: Device) -> TrainResult<Self> {
        Self::with_context(config, device, Arc::new(SingleProcess))
    }

    /// Trainer for one rank of `dist`; parameters are taken from rank 0.
    pub fn with_context(
        config: TrainConfig,
        device: Device,
        dist: Arc<dyn DistributedContext>,
    ) -> TrainResult<Self> {
        config
            .validate()
            .map_err(|errors| config_error(errors.join("; ")))?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = LetheModel::new(&config, vb)?;
        let bank = MemoryBank::from_config(&config);

        let accumulator = GradAccumulator::from_varmap(&varmap)?;
        broadcast_vars(dist.as_ref(), accumulator.vars())?;

        let optimizer = AdamW::new(
            accumulator.named_vars(),
            AdamWConfig {
                lr: config.lr,
                beta1: config.adam_betas.0,
                beta2: config.adam_betas.1,
                eps: config.adam_eps,
                weight_decay: config.weight_decay,
            },
        )?;

        if dist.is_main_process() {
            let n_params: usize = accumulator
                .vars()
                .iter()
                .map(|v| v.as_tensor().elem_count())
                .sum();
            info!(
                params = n_params,
                world_size = dist.world_size(),
                memory_layers = ?config.memory_attn_layers,
                "Trainer initialized"
            );
        }

        Ok(Self {
            model,
            varmap,
            bank,
            config,
            device,
            optimizer,
            scheduler: None,
            accumulator,
            dist,
            metrics: None,
            registry: None,
            train_loss: MeanMetric::new("train_loss"),
            completed_micro_steps: 0,
            optimizer_steps: 0,
        })
    }

    pub fn with_metrics_sink(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn with_registry(mut self, registry: Box<dyn ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn dist(&self) -> &dyn DistributedContext {
        self.dist.as_ref()
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    pub fn completed_micro_steps(&self) -> usize {
        self.completed_micro_steps
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.lr()
    }

    pub fn scheduler(&self) -> Option<&CosineSchedule> {
        self.scheduler.as_ref()
    }

    /// Running train loss since the last evaluation.
    pub fn train_loss(&self) -> &MeanMetric {
        &self.train_loss
    }

    /// Set up the cosine schedule for a run of `n_batches` per epoch.
    ///
    /// A schedule restored from a checkpoint is kept as is.
    pub fn init_scheduler(&mut self, n_batches: usize) {
        if !self.config.scheduler {
            return;
        }
        if self.scheduler.is_none() {
            let total = total_optimizer_steps(
                n_batches,
                self.config.gradient_accumulation_steps,
                self.config.num_epochs,
            );
            let mut schedule = CosineSchedule::new(self.config.lr, self.config.warmup_steps, total);
            schedule.seek(self.optimizer_steps);
            self.scheduler = Some(schedule);
        }
        if let Some(schedule) = &self.scheduler {
            self.optimizer.set_lr(schedule.current_lr());
        }
    }

    /// Load the checkpoint in `dir` and work out where to continue.
    pub fn resume_from(&mut self, dir: &Path, n_batches: usize) -> TrainResult<ResumePoint> {
        let point =
            ResumePoint::for_checkpoint(dir, n_batches, self.config.gradient_accumulation_steps)?;
        load_weights_into(&mut self.varmap, dir)?;

        match read_training_state(dir)? {
            Some(state) => {
                self.optimizer.import_state(&state.optimizer)?;
                self.scheduler = state.scheduler;
            }
            None => {
                if self.dist.is_main_process() {
                    warn!(
                        path = %dir.display(),
                        "No training state in checkpoint; optimizer moments start fresh"
                    );
                }
            }
        }
        self.completed_micro_steps = point.completed_micro_steps;
        self.optimizer_steps = point.optimizer_steps;

        if self.dist.is_main_process() {
            info!(
                path = %dir.display(),
                epoch = point.epoch,
                skip_batches = point.skip_batches,
                completed_micro_steps = point.completed_micro_steps,
                optimizer_steps = point.optimizer_steps,
                "Resuming training"
            );
        }
        Ok(point)
    }

    /// Run one micro-step on `batch` (`None` when this rank has no batch at
    /// this index; it still joins every collective).
    ///
    /// Covers the phases up to and including `OptimizerStep`.
    pub fn train_step(
        &mut self,
        batch: Option<&Batch>,
        epoch: usize,
        step: usize,
        n_batches: usize,
    ) -> TrainResult<StepReport> {
        let step_start = Instant::now();
        let global_step = epoch * n_batches + step;
        let accum = self.config.gradient_accumulation_steps;
        let mut phases = Vec::with_capacity(7);

        let mut memories_stored = 0;
        let mut local_loss = Vec::with_capacity(1);
        let mut loss_tensor = None;
        if let Some(batch) = batch {
            batch.validate(self.config.num_neighbors_to_store)?;
            let rows = self.model.populate_batch(
                &mut self.bank,
                batch,
                self.config.num_neighbors_to_store,
                self.config.mem_chunk_size,
            )?;
            memories_stored = rows * self.bank.layers().count();
            phases.push(StepPhase::Populate);

            let out = self.model.answer(
                &self.bank,
                &batch.input_ids,
                &batch.attention_mask,
                &batch.labels,
            )?;
            phases.push(StepPhase::AnswerForward);
            local_loss.push(out.loss.to_scalar::<f32>()? as f64);
            loss_tensor = Some(out.loss);
        }

        let gathered = self.dist.all_gather(&local_loss)?;
        self.train_loss.update_many(&gathered)?;
        let loss = if gathered.is_empty() {
            0.0
        } else {
            gathered.iter().sum::<f64>() / gathered.len() as f64
        };
        self.log_metric("loss", loss, global_step);

        if let Some(loss) = loss_tensor {
            let scaled = (loss / accum as f64)?;
            let grads = scaled.backward()?;
            self.accumulator.accumulate(&grads)?;
        }
        phases.push(StepPhase::GradientSyncAndBackward);

        self.bank.reset_all();
        phases.push(StepPhase::IndexReset);

        let learning_rate = self.optimizer.lr();
        let mut grad_norm = None;
        if (step + 1) % accum == 0 || step + 1 == n_batches {
            grad_norm = Some(self.optimizer_step(global_step)?);
            phases.push(StepPhase::OptimizerStep);
        }

        self.completed_micro_steps = global_step + 1;

        if self.config.log_lr_every > 0
            && global_step > 0
            && global_step % self.config.log_lr_every == 0
        {
            self.log_metric("lr", learning_rate, global_step);
        }

        if self.dist.is_main_process() {
            let elapsed = step_start.elapsed().as_secs_f64();
            let n_tokens = batch.map(|b| b.n_tokens()).unwrap_or(0) as f64;
            log_training_step(
                global_step,
                &StepMetrics {
                    loss,
                    learning_rate,
                    grad_norm,
                    memories_stored,
                    tokens_per_sec: if elapsed > 0.0 { n_tokens / elapsed } else { 0.0 },
                },
            );
        }

        Ok(StepReport {
            epoch,
            step,
            global_step,
            loss,
            learning_rate,
            grad_norm,
            memories_stored,
            val_loss: None,
            phases,
        })
    }

    /// Average gradients across ranks, clip, apply, advance the schedule.
    fn optimizer_step(&mut self, global_step: usize) -> TrainResult<f64> {
        self.accumulator.sync_mean(self.dist.as_ref())?;
        let (grad_norm, clip_scale) = self.accumulator.clip_scale(self.config.grad_clip)?;
        self.optimizer.step(self.accumulator.grads(), clip_scale)?;
        self.accumulator.zero();
        self.optimizer_steps += 1;

        if let Some(schedule) = self.scheduler.as_mut() {
            let lr = schedule.step();
            self.optimizer.set_lr(lr);
        }

        if self.config.log_grads_every > 0 && self.optimizer_steps % self.config.log_grads_every == 0 {
            self.log_metric("grad_norm", grad_norm, global_step);
        }
        debug!(
            optimizer_step = self.optimizer_steps,
            grad_norm = grad_norm,
            clip_scale = clip_scale,
            "Optimizer step"
        );
        Ok(grad_norm)
    }

    /// Full training run over `train_ds`, evaluating on `eval_ds` when given.
    pub fn train(
        &mut self,
        train_ds: &dyn RetrievalDataset,
        eval_ds: Option<&dyn RetrievalDataset>,
    ) -> TrainResult<TrainSummary> {
        let train_start = Instant::now();
        let rank = self.dist.rank();
        let world = self.dist.world_size();
        let output_dir = PathBuf::from(&self.config.output_dir);

        let mut loader = RetrievalLoader::for_training(
            train_ds,
            self.config.batch_size,
            self.config.seed,
            rank,
            world,
            &self.device,
        );
        let n_batches = loader.n_batches();
        if n_batches == 0 {
            return Err(TrainError::DataLoading(format!(
                "{} training examples give no batches for world size {}",
                train_ds.len(),
                world
            )));
        }
        let eval_loader = eval_ds.map(|ds| {
            RetrievalLoader::for_evaluation(ds, self.config.batch_size, rank, world, &self.device)
        });

        let resume = match self.config.checkpoint.clone() {
            Some(dir) => self.resume_from(Path::new(&dir), n_batches)?,
            None => ResumePoint::from_completed(0, n_batches, self.config.gradient_accumulation_steps),
        };
        self.init_scheduler(n_batches);

        if self.dist.is_main_process() {
            info!(
                n_batches = n_batches,
                epochs = self.config.num_epochs,
                start_epoch = resume.epoch,
                grad_accum = self.config.gradient_accumulation_steps,
                "Starting training"
            );
        }

        let mut last_val_loss = None;
        for epoch in resume.epoch..self.config.num_epochs {
            let epoch_start = Instant::now();
            loader.set_epoch(epoch);
            if epoch == resume.epoch {
                loader.skip_first_batches(resume.skip_batches);
            }

            for item in loader.by_ref() {
                let (step, batch) = item?;
                let mut report = self.train_step(batch.as_ref(), epoch, step, n_batches)?;
                let global_step = report.global_step;

                let save_every = self.config.save_every;
                if step > 0 && save_every > 0 && step % save_every == 0 {
                    self.save_step_checkpoint(&output_dir, global_step, epoch)?;
                    report.phases.push(StepPhase::Checkpoint);
                }

                let eval_every = self.config.eval_every;
                let last_step = step + 1 == n_batches;
                if (eval_every > 0 && step > 0 && step % eval_every == 0) || last_step {
                    report.val_loss = self.evaluate_and_log(eval_loader.as_ref(), &output_dir, global_step)?;
                    if report.val_loss.is_some() {
                        last_val_loss = report.val_loss;
                        report.phases.push(StepPhase::Evaluate);
                    }
                }
            }

            self.dist.barrier()?;
            if self.dist.is_main_process() {
                let tag = format!("epoch_{}", epoch);
                let dir = output_dir.join(&tag);
                self.save_checkpoint(&dir, &tag, self.completed_micro_steps.saturating_sub(1), epoch, true)?;
                if self.config.push_to_hub {
                    self.publish(&epoch_publish_name(&self.config.save_name, epoch), &dir);
                }
                println!(
                    "--- Epoch {}/{} done ({} batches, {:.1}s) step={} ---",
                    epoch + 1,
                    self.config.num_epochs,
                    n_batches,
                    epoch_start.elapsed().as_secs_f64(),
                    self.completed_micro_steps,
                );
            }
        }

        self.dist.barrier()?;
        let mut final_checkpoint = None;
        if self.dist.is_main_process() {
            let dir = output_dir.join("final");
            let last_epoch = self.config.num_epochs.saturating_sub(1);
            self.save_checkpoint(&dir, "final", self.completed_micro_steps.saturating_sub(1), last_epoch, true)?;
            final_checkpoint = Some(dir);

            if let Some(sink) = self.metrics.as_mut() {
                if let Err(e) = sink.close() {
                    warn!(error = %e, "Closing metrics sink failed");
                }
            }
            let total_elapsed = train_start.elapsed().as_secs_f64();
            info!(
                completed_micro_steps = self.completed_micro_steps,
                optimizer_steps = self.optimizer_steps,
                elapsed_secs = total_elapsed,
                "Training complete"
            );
        }

        Ok(TrainSummary {
            completed_micro_steps: self.completed_micro_steps,
            optimizer_steps: self.optimizer_steps,
            last_val_loss,
            final_checkpoint,
        })
    }

    /// Evaluate, write this rank's loss table, log both losses, reset the
    /// running train loss. Returns `None` when there is no eval set.
    fn evaluate_and_log(
        &mut self,
        eval_loader: Option<&RetrievalLoader<'_>>,
        output_dir: &Path,
        global_step: usize,
    ) -> TrainResult<Option<f64>> {
        let train_loss = self.train_loss.compute();
        let mut val_loss = None;

        if let Some(loader) = eval_loader {
            let (metric, table) = evaluate(
                &self.model,
                &mut self.bank,
                loader,
                self.dist.as_ref(),
                &self.config,
            )?;
            let path = LossTable::record_path(output_dir, global_step, self.dist.rank());
            table.write(&path)?;
            val_loss = metric.compute();
            if self.dist.is_main_process() {
                if let Some(v) = val_loss {
                    log_evaluation(global_step, v, table.len());
                }
            }
        }

        if let Some(v) = train_loss {
            self.log_metric("train_loss", v, global_step);
            if self.dist.is_main_process() {
                println!("{}", format_metrics("train", global_step, &[("train_loss", v)]));
            }
        }
        if let Some(v) = val_loss {
            self.log_metric("val_loss", v, global_step);
            if self.dist.is_main_process() {
                println!("{}", format_metrics("val", global_step, &[("val_loss", v)]));
            }
        }
        self.train_loss.reset();
        Ok(val_loss)
    }

    fn save_step_checkpoint(&self, output_dir: &Path, global_step: usize, epoch: usize) -> TrainResult<()> {
        if !self.dist.is_main_process() {
            return Ok(());
        }
        let tag = format!("step_{}", global_step);
        self.save_checkpoint(&output_dir.join(&tag), &tag, global_step, epoch, false)?;
        if self.config.keep_last_checkpoints > 0 {
            let removed = cleanup_old_checkpoints(output_dir, self.config.keep_last_checkpoints)?;
            if removed > 0 {
                info!(
                    removed = removed,
                    keep_last = self.config.keep_last_checkpoints,
                    "Cleaned old checkpoints"
                );
            }
        }
        Ok(())
    }

    /// Write weights and metadata, plus the training state when `with_state`.
    pub fn save_checkpoint(
        &self,
        dir: &Path,
        tag: &str,
        global_step: usize,
        epoch: usize,
        with_state: bool,
    ) -> TrainResult<()> {
        let meta = CheckpointMeta {
            config: self.config.clone(),
            tag: tag.to_string(),
            global_step,
            epoch,
            train_loss: self.train_loss.compute(),
        };
        save_model(&self.varmap, &meta, dir)?;
        if with_state {
            let state = TrainingState {
                epoch,
                completed_micro_steps: self.completed_micro_steps,
                optimizer_steps: self.optimizer_steps,
                optimizer: self.optimizer.export_state()?,
                scheduler: self.scheduler.clone(),
            };
            save_training_state(&state, dir)?;
        }
        log_checkpoint_save(global_step, &dir.display().to_string(), tag);
        Ok(())
    }

    fn publish(&mut self, name: &str, dir: &Path) {
        match self.registry.as_mut() {
            Some(registry) => {
                if let Err(e) = registry.publish(name, dir) {
                    log_publish_failure(name, &e);
                }
            }
            None => warn!(name = name, "push_to_hub is set but no registry is configured"),
        }
    }

    /// Send a scalar to the sink; main process only, never fails training.
    fn log_metric(&mut self, name: &str, value: f64, step: usize) {
        if !self.config.log_metrics || !self.dist.is_main_process() {
            return;
        }
        if let Some(sink) = self.metrics.as_mut() {
            if let Err(e) = sink.log(name, value, step) {
                warn!(metric = name, step = step, error = %e, "Metrics sink rejected event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticRetrievalDataset;
    use crate::metrics::RecordingMetricsSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tiny_config(output_dir: &Path) -> TrainConfig {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.output_dir = output_dir.display().to_string();
        cfg
    }

    fn dataset(n: usize) -> SyntheticRetrievalDataset {
        SyntheticRetrievalDataset::new(64, 6, 3, 4, n, 11)
    }

    #[test]
    fn test_step_runs_phases_in_order() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(tiny_config(dir.path()), Device::Cpu)?;
        let ds = dataset(4);
        let loader = RetrievalLoader::for_training(&ds, 2, 0, 0, 1, &Device::Cpu);
        let batch = loader.batch_at(0)?;

        let report = trainer.train_step(batch.as_ref(), 0, 0, 2)?;
        assert_eq!(
            report.phases,
            vec![
                StepPhase::Populate,
                StepPhase::AnswerForward,
                StepPhase::GradientSyncAndBackward,
                StepPhase::IndexReset,
                StepPhase::OptimizerStep,
            ]
        );
        assert!(report.loss.is_finite());
        // 2 examples * 2 stored candidates, one memory layer.
        assert_eq!(report.memories_stored, 4);
        assert!(trainer.bank.is_empty());
        assert_eq!(trainer.optimizer_steps(), 1);
        Ok(())
    }

    #[test]
    fn test_accumulation_defers_optimizer_step() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = tiny_config(dir.path());
        cfg.gradient_accumulation_steps = 2;
        let mut trainer = Trainer::new(cfg, Device::Cpu)?;
        let ds = dataset(6);
        let loader = RetrievalLoader::for_training(&ds, 2, 0, 0, 1, &Device::Cpu);

        let before = trainer.model.tok_embed.embeddings().to_vec2::<f32>()?;
        let first = trainer.train_step(loader.batch_at(0)?.as_ref(), 0, 0, 3)?;
        assert!(!first.ran(StepPhase::OptimizerStep));
        assert_eq!(trainer.model.tok_embed.embeddings().to_vec2::<f32>()?, before);

        let second = trainer.train_step(loader.batch_at(1)?.as_ref(), 0, 1, 3)?;
        assert!(second.ran(StepPhase::OptimizerStep));
        assert!(second.grad_norm.is_some());
        Ok(())
    }

    #[test]
    fn test_idle_step_still_resets_and_steps() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(tiny_config(dir.path()), Device::Cpu)?;
        let report = trainer.train_step(None, 0, 0, 1)?;
        assert!(!report.ran(StepPhase::Populate));
        assert!(report.ran(StepPhase::IndexReset));
        assert!(report.ran(StepPhase::OptimizerStep));
        assert_eq!(report.loss, 0.0);
        Ok(())
    }

    #[test]
    fn test_scheduler_warmup_starts_at_zero() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(tiny_config(dir.path()), Device::Cpu)?;
        trainer.init_scheduler(10);
        assert_eq!(trainer.learning_rate(), 0.0);
        let schedule = trainer.scheduler().unwrap();
        assert_eq!(schedule.total_steps, 10);

        let mut cfg = tiny_config(dir.path());
        cfg.scheduler = false;
        let mut constant = Trainer::new(cfg, Device::Cpu)?;
        constant.init_scheduler(10);
        assert!(constant.scheduler().is_none());
        assert_eq!(constant.learning_rate(), 3e-3);
        Ok(())
    }

    #[test]
    fn test_metrics_only_when_enabled() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingMetricsSink::new();
        let mut cfg = tiny_config(dir.path());
        cfg.log_metrics = true;
        let mut trainer = Trainer::new(cfg, Device::Cpu)?.with_metrics_sink(Box::new(sink.clone()));
        let ds = dataset(2);
        let loader = RetrievalLoader::for_training(&ds, 2, 0, 0, 1, &Device::Cpu);
        trainer.train_step(loader.batch_at(0)?.as_ref(), 0, 0, 1)?;

        assert_eq!(sink.named("loss").len(), 1);

        let quiet = RecordingMetricsSink::new();
        let mut trainer = Trainer::new(tiny_config(dir.path()), Device::Cpu)?
            .with_metrics_sink(Box::new(quiet.clone()));
        trainer.train_step(loader.batch_at(0)?.as_ref(), 0, 0, 1)?;
        assert!(quiet.events().is_empty());
        Ok(())
    }

    #[test]
    fn test_lr_logged_on_cadence_after_first_step() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingMetricsSink::new();
        let mut cfg = tiny_config(dir.path());
        cfg.log_metrics = true;
        cfg.log_lr_every = 2;
        let mut trainer = Trainer::new(cfg, Device::Cpu)?.with_metrics_sink(Box::new(sink.clone()));
        let ds = dataset(10);
        let loader = RetrievalLoader::for_training(&ds, 2, 0, 0, 1, &Device::Cpu);
        let n_batches = loader.n_batches();
        for step in 0..n_batches {
            trainer.train_step(loader.batch_at(step)?.as_ref(), 0, step, n_batches)?;
        }

        let steps: Vec<usize> = sink.named("lr").iter().map(|e| e.step).collect();
        assert_eq!(steps, vec![2, 4]);
        Ok(())
    }

    struct OfflineRegistry {
        attempts: Arc<AtomicUsize>,
    }

    impl ModelRegistry for OfflineRegistry {
        fn publish(&mut self, name: &str, _dir: &Path) -> TrainResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TrainError::Publish {
                name: name.to_string(),
                message: "registry offline".to_string(),
            })
        }
    }

    #[test]
    fn test_publish_failure_does_not_stop_training() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut cfg = tiny_config(dir.path());
        cfg.num_epochs = 2;
        cfg.push_to_hub = true;
        let mut trainer = Trainer::new(cfg, Device::Cpu)?.with_registry(Box::new(OfflineRegistry {
            attempts: Arc::clone(&attempts),
        }));

        let summary = trainer.train(&dataset(4), None)?;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(summary.completed_micro_steps, 4);
        assert_eq!(summary.final_checkpoint, Some(dir.path().join("final")));
        assert!(dir.path().join("epoch_1").exists());
        assert!(dir.path().join("final").join(crate::checkpoint::WEIGHTS_FILE).exists());
        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.batch_size = 0;
        assert!(matches!(
            Trainer::new(cfg, Device::Cpu),
            Err(TrainError::Config(_))
        ));
    }
}
