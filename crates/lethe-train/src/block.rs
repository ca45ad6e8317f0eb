//! Pre-norm transformer block, optionally memory-augmented.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::attention::{AttentionTrain, MemoryAttention};
use crate::config::TrainConfig;
use crate::error::{shape_error, TrainResult};
use crate::ffn::FeedForwardTrain;
use crate::layers::RMSNormTrain;
use crate::memory::MemoryIndex;

/// Attention layer variant for training.
pub enum AttentionTrainLayer {
    Standard(AttentionTrain),
    Memory(MemoryAttention),
}

/// How a memory layer treats its index during one forward pass.
pub enum MemoryMode<'a> {
    /// Plain local attention; the index is neither read nor written.
    Local,
    /// Write pooled rows; `owners[r]` is the batch element of row `r`.
    Populate {
        index: &'a mut MemoryIndex,
        owners: &'a [usize],
    },
    /// Read the top `k` entries per query.
    Answer { index: &'a MemoryIndex, k: usize },
}

/// A single transformer block: `x + attn(norm(x))`, then `x + ffn(norm(x))`.
pub struct TransformerBlockTrain {
    pub norm_attn: RMSNormTrain,
    pub norm_ffn: RMSNormTrain,
    pub attention: AttentionTrainLayer,
    pub ffn: FeedForwardTrain,
    pub layer: usize,
}

impl TransformerBlockTrain {
    pub fn new(config: &TrainConfig, layer: usize, vb: VarBuilder) -> Result<Self> {
        let attention = if config.memory_attn_layers.contains(&layer) {
            AttentionTrainLayer::Memory(MemoryAttention::new(
                config.dim,
                config.n_heads,
                layer,
                vb.pp("attn"),
            )?)
        } else {
            AttentionTrainLayer::Standard(AttentionTrain::new(
                config.dim,
                config.n_heads,
                vb.pp("attn"),
            )?)
        };
        Ok(Self {
            norm_attn: RMSNormTrain::new(config.dim, vb.pp("norm_attn"))?,
            norm_ffn: RMSNormTrain::new(config.dim, vb.pp("norm_ffn"))?,
            attention,
            ffn: FeedForwardTrain::new(config.dim, config.ffn_dim(), vb.pp("ffn"))?,
            layer,
        })
    }

    pub fn has_memory(&self) -> bool {
        matches!(self.attention, AttentionTrainLayer::Memory(_))
    }

    /// Forward: x [batch, seq, dim] -> [batch, seq, dim].
    ///
    /// `mode` only matters for memory layers; standard layers ignore it.
    pub fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        key_mask: Option<&Tensor>,
        mode: MemoryMode<'_>,
    ) -> TrainResult<Tensor> {
        let attn_normed = self.norm_attn.forward(x)?;
        let attn_out = match (&self.attention, mode) {
            (AttentionTrainLayer::Standard(attn), _) => {
                attn.forward(&attn_normed, cos, sin, key_mask)?
            }
            (AttentionTrainLayer::Memory(mem), MemoryMode::Local) => {
                mem.attn.forward(&attn_normed, cos, sin, key_mask)?
            }
            (AttentionTrainLayer::Memory(mem), MemoryMode::Populate { index, owners }) => {
                mem.forward_populate(&attn_normed, cos, sin, key_mask, index, owners)?
            }
            (AttentionTrainLayer::Memory(mem), MemoryMode::Answer { index, k }) => {
                mem.forward_answer(&attn_normed, cos, sin, key_mask, index, k)?
            }
        };
        let x = (x + attn_out)?;

        let ffn_normed = self.norm_ffn.forward(&x)?;
        let ffn_out = self.ffn.forward(&ffn_normed)?;
        Ok((x + ffn_out)?)
    }

    /// Error for a memory layer whose index is missing from the bank.
    pub(crate) fn missing_index(&self) -> crate::error::TrainError {
        shape_error(format!("no memory index registered for layer {}", self.layer))
    }
}
