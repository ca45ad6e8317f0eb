//! CLI entry point for lethe-train.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use candle_core::Device;
use clap::{Parser, Subcommand};
use lethe_train::checkpoint::load_checkpoint;
use lethe_train::config::TrainConfig;
use lethe_train::data::{JsonlRetrievalDataset, RetrievalDataset, RetrievalLoader, SyntheticRetrievalDataset};
use lethe_train::distributed::SingleProcess;
use lethe_train::eval::{evaluate, LossTable};
use lethe_train::logging::{init_console_logging, init_logging};
use lethe_train::memory::MemoryBank;
use lethe_train::metrics::{format_metrics, JsonlMetricsSink, TracingMetricsSink};
use lethe_train::publish::DirectoryRegistry;
use lethe_train::train::Trainer;

fn resolve_train_config(config: &str) -> Option<TrainConfig> {
    match config {
        "tiny-cpu" | "tiny_cpu" => Some(TrainConfig::tiny_cpu()),
        "small" => Some(TrainConfig::small()),
        _ => None,
    }
}

fn resolve_device(device: &str) -> anyhow::Result<Device> {
    match device {
        "cpu" => Ok(Device::Cpu),
        #[cfg(feature = "cuda")]
        "cuda" => Device::new_cuda(0).context("initializing CUDA device 0"),
        #[cfg(feature = "cuda")]
        s if s.starts_with("cuda:") => {
            let id: usize = s
                .trim_start_matches("cuda:")
                .parse()
                .with_context(|| format!("invalid CUDA device id in '{}'", s))?;
            Device::new_cuda(id).with_context(|| format!("initializing CUDA device {}", id))
        }
        other => bail!("unknown device: {}. Use 'cpu', 'cuda', or 'cuda:N'.", other),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DatasetSpec {
    Synthetic,
    Jsonl(PathBuf),
}

fn resolve_dataset_spec(dataset: &str, data_path: Option<&Path>) -> anyhow::Result<DatasetSpec> {
    match dataset {
        "synthetic" => Ok(DatasetSpec::Synthetic),
        "jsonl" => match data_path {
            Some(path) => Ok(DatasetSpec::Jsonl(path.to_path_buf())),
            None => bail!("a data path is required when --dataset=jsonl"),
        },
        other => bail!("unknown dataset: {}. Use 'synthetic' or 'jsonl'.", other),
    }
}

fn build_dataset(
    spec: &DatasetSpec,
    cfg: &TrainConfig,
    n_samples: usize,
    seed: u64,
) -> anyhow::Result<Box<dyn RetrievalDataset>> {
    match spec {
        DatasetSpec::Synthetic => {
            let seq_len = cfg.max_seq_len.clamp(4, 16);
            let ctx_len = cfg.max_seq_len.clamp(2, 8);
            Ok(Box::new(SyntheticRetrievalDataset::new(
                cfg.vocab_size as u32,
                seq_len,
                cfg.num_neighbors_to_store + 2,
                ctx_len,
                n_samples,
                seed,
            )))
        }
        DatasetSpec::Jsonl(path) => Ok(Box::new(
            JsonlRetrievalDataset::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
        )),
    }
}

#[derive(Parser)]
#[command(
    name = "lethe-train",
    about = "Retrieval-augmented training for the Lethe memory transformer"
)]
struct Cli {
    /// Emit JSON logs instead of pretty console output
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model
    Train {
        /// Preset: tiny-cpu or small
        #[arg(long, default_value = "tiny-cpu")]
        config: String,

        /// JSON config file; takes precedence over --config
        #[arg(long)]
        config_file: Option<PathBuf>,

        #[arg(long, default_value = "synthetic")]
        dataset: String,

        #[arg(long)]
        data_path: Option<PathBuf>,

        #[arg(long)]
        eval_data_path: Option<PathBuf>,

        /// Synthetic training examples
        #[arg(long, default_value = "1024")]
        n_samples: usize,

        /// Synthetic evaluation examples (0 = no evaluation)
        #[arg(long, default_value = "64")]
        eval_samples: usize,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        output_dir: Option<String>,

        /// Resume training from a checkpoint directory
        #[arg(long)]
        resume: Option<String>,

        /// Append metrics as JSON lines to this file
        #[arg(long)]
        metrics_jsonl: Option<PathBuf>,

        /// Publish epoch checkpoints into this directory
        #[arg(long)]
        registry_dir: Option<PathBuf>,

        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Evaluate a checkpoint and write its per-example loss table
    Eval {
        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long, default_value = "synthetic")]
        dataset: String,

        #[arg(long)]
        data_path: Option<PathBuf>,

        #[arg(long, default_value = "64")]
        eval_samples: usize,

        /// Directory for the loss table (default: the checkpoint directory)
        #[arg(long)]
        output_dir: Option<PathBuf>,

        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        init_logging();
    } else {
        init_console_logging();
    }

    match cli.command {
        Commands::Train {
            config,
            config_file,
            dataset,
            data_path,
            eval_data_path,
            n_samples,
            eval_samples,
            epochs,
            batch_size,
            output_dir,
            resume,
            metrics_jsonl,
            registry_dir,
            device,
        } => {
            let device = resolve_device(&device)?;
            let mut cfg = match config_file {
                Some(path) => TrainConfig::from_json_file(&path)?,
                None => match resolve_train_config(&config) {
                    Some(cfg) => cfg,
                    None => bail!("unknown config: {}. Use tiny-cpu or small.", config),
                },
            };
            if let Some(epochs) = epochs {
                cfg.num_epochs = epochs;
            }
            if let Some(bs) = batch_size {
                if bs == 0 {
                    bail!("--batch-size must be > 0");
                }
                cfg.batch_size = bs;
            }
            if let Some(dir) = output_dir {
                cfg.output_dir = dir;
            }
            if resume.is_some() {
                cfg.checkpoint = resume;
            }
            if metrics_jsonl.is_some() {
                cfg.log_metrics = true;
            }
            if registry_dir.is_some() {
                cfg.push_to_hub = true;
            }

            let spec = resolve_dataset_spec(&dataset, data_path.as_deref())?;
            let train_ds = build_dataset(&spec, &cfg, n_samples, cfg.seed)?;
            let eval_ds = match (&spec, eval_data_path) {
                (_, Some(path)) => Some(build_dataset(&DatasetSpec::Jsonl(path), &cfg, 0, 0)?),
                (DatasetSpec::Synthetic, None) if eval_samples > 0 => {
                    Some(build_dataset(&spec, &cfg, eval_samples, cfg.seed + 1)?)
                }
                _ => None,
            };

            tracing::info!("=== lethe-train ===");
            tracing::info!("Config: {}", config);
            tracing::info!("Device: {:?}", device);
            tracing::info!("Train examples: {}", train_ds.len());
            tracing::info!(
                "Eval examples: {}",
                eval_ds.as_ref().map(|d| d.len()).unwrap_or(0)
            );
            tracing::info!("Output dir: {}", cfg.output_dir);

            let mut trainer = Trainer::new(cfg, device)?;
            trainer = match metrics_jsonl {
                Some(path) => trainer.with_metrics_sink(Box::new(JsonlMetricsSink::create(&path)?)),
                None if trainer.config.log_metrics => {
                    trainer.with_metrics_sink(Box::new(TracingMetricsSink))
                }
                None => trainer,
            };
            if let Some(root) = registry_dir {
                trainer = trainer.with_registry(Box::new(DirectoryRegistry::new(root)));
            }

            let summary = trainer.train(train_ds.as_ref(), eval_ds.as_deref())?;
            tracing::info!(
                "Done: {} micro-steps, {} optimizer steps",
                summary.completed_micro_steps,
                summary.optimizer_steps
            );
            if let Some(dir) = summary.final_checkpoint {
                tracing::info!("Final checkpoint: {}", dir.display());
            }
        }

        Commands::Eval {
            checkpoint,
            dataset,
            data_path,
            eval_samples,
            output_dir,
            device,
        } => {
            let device = resolve_device(&device)?;
            let loaded = load_checkpoint(&checkpoint, &device)
                .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;
            let cfg = loaded.meta.config.clone();

            let spec = resolve_dataset_spec(&dataset, data_path.as_deref())?;
            let eval_ds = build_dataset(&spec, &cfg, eval_samples, cfg.seed + 1)?;
            let loader = RetrievalLoader::for_evaluation(eval_ds.as_ref(), cfg.batch_size, 0, 1, &device);
            let mut bank = MemoryBank::from_config(&cfg);

            let (metric, table) = evaluate(&loaded.model, &mut bank, &loader, &SingleProcess, &cfg)?;
            let out = output_dir.unwrap_or_else(|| checkpoint.clone());
            let path = LossTable::record_path(&out, loaded.meta.global_step, 0);
            table.write(&path)?;

            match metric.compute() {
                Some(v) => println!(
                    "{}",
                    format_metrics("val", loaded.meta.global_step, &[("val_loss", v)])
                ),
                None => println!("no evaluation batches"),
            }
            println!("Loss table ({} rows): {}", table.len(), path.display());
        }
    }

    Ok(())
}
