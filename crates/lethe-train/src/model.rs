//! Full training model: embedding -> blocks -> LM head, with two entry points
//! sharing one parameter set.
//!
//! [`LetheModel::populate`] pushes retrieved-context rows through the blocks up
//! to the last memory layer and writes their pooled activations into the
//! [`MemoryBank`]. [`LetheModel::answer`] runs the question batch through every
//! block, reading the bank at the memory layers, and returns the loss.

use candle_core::{DType, Tensor};
use candle_nn::{self, Module, VarBuilder};

use crate::attention::precompute_rope_freqs;
use crate::block::{MemoryMode, TransformerBlockTrain};
use crate::config::TrainConfig;
use crate::data::Batch;
use crate::error::{shape_error, TrainResult};
use crate::layers::RMSNormTrain;
use crate::loss::mean_loss;
use crate::memory::MemoryBank;

/// Result of an answer-mode forward pass.
pub struct ModelOutput {
    /// Scalar mean of per-example losses.
    pub loss: Tensor,
    /// `[batch, seq, vocab]`.
    pub logits: Tensor,
}

/// Memory-augmented causal language model.
pub struct LetheModel {
    pub config: TrainConfig,
    pub tok_embed: candle_nn::Embedding,
    pub blocks: Vec<TransformerBlockTrain>,
    pub norm_final: RMSNormTrain,
    freqs_cos: Tensor,
    freqs_sin: Tensor,
}

impl LetheModel {
    pub fn new(config: &TrainConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        // candle_nn::embedding defaults to stdev 1.0, far too large for a tied head.
        let embed_weights = vb.pp("tok_embed").get_with_hints(
            (config.vocab_size, config.dim),
            "weight",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let tok_embed = candle_nn::Embedding::new(embed_weights, config.dim);

        let blocks = (0..config.n_layers)
            .map(|i| TransformerBlockTrain::new(config, i, vb.pp(format!("blocks.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let norm_final = RMSNormTrain::new(config.dim, vb.pp("norm_final"))?;

        let (freqs_cos, freqs_sin) = precompute_rope_freqs(
            config.head_dim(),
            config.max_seq_len,
            config.rope_theta,
            vb.device(),
        )?;

        Ok(Self {
            config: config.clone(),
            tok_embed,
            blocks,
            norm_final,
            freqs_cos,
            freqs_sin,
        })
    }

    fn rope(&self, seq_len: usize) -> TrainResult<(Tensor, Tensor)> {
        if seq_len == 0 || seq_len > self.config.max_seq_len {
            return Err(shape_error(format!(
                "sequence length {} outside 1..={}",
                seq_len, self.config.max_seq_len
            )));
        }
        Ok((
            self.freqs_cos.narrow(0, 0, seq_len)?,
            self.freqs_sin.narrow(0, 0, seq_len)?,
        ))
    }

    /// Index of the deepest memory layer.
    pub fn last_memory_layer(&self) -> Option<usize> {
        self.blocks
            .iter()
            .filter(|b| b.has_memory())
            .map(|b| b.layer)
            .max()
    }

    /// Write pooled activations of `memory_chunk` into every memory layer's index.
    ///
    /// `memory_chunk` is `[rows, s_mem]` token ids; `row_mask` marks its real
    /// tokens with 1 so padding is neither attended to nor pooled. `owners[r]`
    /// is the batch element that row `r` belongs to. Nothing computed here is
    /// part of the autograd graph.
    pub fn populate(
        &self,
        bank: &mut MemoryBank,
        memory_chunk: &Tensor,
        row_mask: Option<&Tensor>,
        owners: &[usize],
    ) -> TrainResult<()> {
        let (rows, seq_len) = memory_chunk.dims2()?;
        if let Some(mask) = row_mask {
            if mask.dims() != memory_chunk.dims() {
                return Err(shape_error(format!(
                    "populate: row mask {:?} does not match context rows {:?}",
                    mask.dims(),
                    memory_chunk.dims()
                )));
            }
        }
        if owners.len() != rows {
            return Err(shape_error(format!(
                "populate: {} owners for {} context rows",
                owners.len(),
                rows
            )));
        }
        let Some(last) = self.last_memory_layer() else {
            return Ok(());
        };
        let (cos, sin) = self.rope(seq_len)?;
        let key_mask = row_mask.map(|m| m.to_dtype(DType::F32)).transpose()?;

        let mut x = self.tok_embed.forward(memory_chunk)?.detach();
        for block in &self.blocks[..=last] {
            let mode = if block.has_memory() {
                let index = bank
                    .get_mut(block.layer)
                    .ok_or_else(|| block.missing_index())?;
                MemoryMode::Populate { index, owners }
            } else {
                MemoryMode::Local
            };
            x = block.forward(&x, &cos, &sin, key_mask.as_ref(), mode)?.detach();
        }
        Ok(())
    }

    /// Populate from the first `n_store` context rows of every example in
    /// `batch`, at most `chunk_size` rows per forward. Returns rows written.
    pub fn populate_batch(
        &self,
        bank: &mut MemoryBank,
        batch: &Batch,
        n_store: usize,
        chunk_size: usize,
    ) -> TrainResult<usize> {
        let rows = batch.memory_rows(n_store)?;
        let total = rows.owners.len();
        let chunk_size = chunk_size.max(1);
        let mut start = 0;
        while start < total {
            let len = chunk_size.min(total - start);
            let chunk = rows.tokens.narrow(0, start, len)?;
            let mask = rows.mask.narrow(0, start, len)?;
            self.populate(bank, &chunk, Some(&mask), &rows.owners[start..start + len])?;
            start += len;
        }
        Ok(total)
    }

    /// Answer-mode forward reading `bank`; loss is next-token cross-entropy.
    pub fn answer(
        &self,
        bank: &MemoryBank,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        labels: &Tensor,
    ) -> TrainResult<ModelOutput> {
        let logits = self.answer_logits(bank, input_ids, attention_mask)?;
        let loss = mean_loss(&logits, labels)?;
        Ok(ModelOutput { loss, logits })
    }

    /// Answer-mode forward returning logits `[batch, seq, vocab]` only.
    pub fn answer_logits(
        &self,
        bank: &MemoryBank,
        input_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> TrainResult<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        if attention_mask.dims() != input_ids.dims() {
            return Err(shape_error(format!(
                "attention_mask {:?} does not match input_ids {:?}",
                attention_mask.dims(),
                input_ids.dims()
            )));
        }
        let (cos, sin) = self.rope(seq_len)?;
        let key_mask = attention_mask.to_dtype(DType::F32)?;
        let k = self.config.effective_neighbors_to_retrieve();

        let mut x = self.tok_embed.forward(input_ids)?;
        for block in &self.blocks {
            let mode = if block.has_memory() {
                let index = bank.get(block.layer).ok_or_else(|| block.missing_index())?;
                MemoryMode::Answer { index, k }
            } else {
                MemoryMode::Local
            };
            x = block.forward(&x, &cos, &sin, Some(&key_mask), mode)?;
        }
        let hidden = self.norm_final.forward(&x)?;
        Ok(self.project_hidden_to_logits(&hidden)?)
    }

    /// Project hidden states to logits through the tied embedding matrix.
    pub fn project_hidden_to_logits(&self, hidden: &Tensor) -> candle_core::Result<Tensor> {
        let lm_w = self.tok_embed.embeddings().t()?;
        let x_dims = hidden.dims().to_vec();
        if x_dims.len() == 3 {
            let (b, m, k) = (x_dims[0], x_dims[1], x_dims[2]);
            hidden
                .reshape((b * m, k))?
                .matmul(&lm_w)?
                .reshape((b, m, ()))
        } else {
            hidden.matmul(&lm_w)
        }
    }
}
