//! # Lethe Training Library
//!
//! Retrieval-augmented fine-tuning for a causal transformer whose memory layers
//! read from a per-step key/value bank.
//!
//! ## Architecture Overview
//!
//! - **Memory**: fixed-capacity per-layer indices filled from each example's
//!   retrieved context and cleared after every step
//! - **Model**: one parameter set with two entry points, population (no grad)
//!   and answer (loss), selected by a `MemoryMode` inside each block
//! - **Optimization**: AdamW with gradient accumulation, global-norm clipping
//!   and a cosine schedule with linear warmup
//! - **Distribution**: an injected `DistributedContext` for loss gathers,
//!   gradient all-reduce and barriers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lethe_train::{config::TrainConfig, data::SyntheticRetrievalDataset, train::Trainer};
//! use candle_core::Device;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = TrainConfig::tiny_cpu();
//! let train = SyntheticRetrievalDataset::new(64, 8, 4, 6, 256, 0);
//! let eval = SyntheticRetrievalDataset::new(64, 8, 4, 6, 32, 1);
//!
//! let mut trainer = Trainer::new(config, Device::Cpu)?;
//! let summary = trainer.train(&train, Some(&eval))?;
//! println!("optimizer steps: {}", summary.optimizer_steps);
//! # Ok(())
//! # }
//! ```

pub mod attention;
pub mod block;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod eval;
pub mod ffn;
pub mod layers;
pub mod logging;
pub mod loss;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod publish;
pub mod train;
