//! Multi-head attention with RoPE, plus the memory-augmented variant.

use candle_core::{Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::error::{shape_error, TrainResult};
use crate::layers::LinearTrain;
use crate::memory::MemoryIndex;

/// Large negative bias used for padded keys and padded neighbors.
const MASK_BIAS: f64 = 1e9;

/// Precompute RoPE cos/sin frequency tables.
pub fn precompute_rope_freqs(
    head_dim: usize,
    max_seq_len: usize,
    theta: f32,
    device: &candle_core::Device,
) -> Result<(Tensor, Tensor)> {
    let half_dim = head_dim / 2;
    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| 1.0 / theta.powf(2.0 * i as f32 / head_dim as f32))
        .collect();
    let freqs = Tensor::from_vec(freqs, (1, half_dim), device)?;
    let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
    let positions = Tensor::from_vec(positions, (max_seq_len, 1), device)?;
    let angles = positions.matmul(&freqs)?; // [max_seq_len, half_dim]
    let cos = angles.cos()?;
    let sin = angles.sin()?;
    Ok((cos, sin))
}

/// Apply rotary position embedding to Q and K tensors.
/// q, k: [batch, n_heads, seq_len, head_dim]
/// cos, sin: [seq_len, half_dim] (sliced from precomputed table)
fn apply_rotary_emb(
    q: &Tensor,
    k: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let head_dim = q.dim(D::Minus1)?;
    let half = head_dim / 2;

    let q0 = q.narrow(D::Minus1, 0, half)?;
    let q1 = q.narrow(D::Minus1, half, half)?;
    let k0 = k.narrow(D::Minus1, 0, half)?;
    let k1 = k.narrow(D::Minus1, half, half)?;

    // [1, 1, seq_len, half_dim]
    let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
    let sin = sin.unsqueeze(0)?.unsqueeze(0)?;

    // [x0, x1] -> [x0*cos - x1*sin, x0*sin + x1*cos]
    let q_rot0 = (q0.broadcast_mul(&cos)? - q1.broadcast_mul(&sin)?)?;
    let q_rot1 = (q0.broadcast_mul(&sin)? + q1.broadcast_mul(&cos)?)?;
    let k_rot0 = (k0.broadcast_mul(&cos)? - k1.broadcast_mul(&sin)?)?;
    let k_rot1 = (k0.broadcast_mul(&sin)? + k1.broadcast_mul(&cos)?)?;

    let q_out = Tensor::cat(&[&q_rot0, &q_rot1], D::Minus1)?;
    let k_out = Tensor::cat(&[&k_rot0, &k_rot1], D::Minus1)?;

    Ok((q_out, k_out))
}

/// Create causal attention mask: upper triangle filled with -inf, diagonal and below = 0.
fn causal_mask(seq_len: usize, device: &candle_core::Device) -> Result<Tensor> {
    let mut mask_data = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(mask_data, (seq_len, seq_len), device)
}

/// Additive bias `[b, 1, 1, s]` from a `[b, s]` f32 key mask (1 = keep, 0 = pad).
fn key_padding_bias(key_mask: &Tensor) -> Result<Tensor> {
    let (batch, seq_len) = key_mask.dims2()?;
    ((key_mask - 1.0)? * MASK_BIAS)?.reshape((batch, 1, 1, seq_len))
}

/// Training-mode multi-head attention (no KV cache).
pub struct AttentionTrain {
    pub wq: LinearTrain,
    pub wk: LinearTrain,
    pub wv: LinearTrain,
    pub wo: LinearTrain,
    pub n_heads: usize,
    pub head_dim: usize,
}

/// Per-head projections before RoPE, each `[batch, n_heads, seq, head_dim]`.
struct Projections {
    q: Tensor,
    k: Tensor,
    v: Tensor,
}

impl AttentionTrain {
    pub fn new(dim: usize, n_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / n_heads;
        let wq = LinearTrain::new(dim, n_heads * head_dim, vb.pp("wq"))?;
        let wk = LinearTrain::new(dim, n_heads * head_dim, vb.pp("wk"))?;
        let wv = LinearTrain::new(dim, n_heads * head_dim, vb.pp("wv"))?;
        let wo = LinearTrain::new(n_heads * head_dim, dim, vb.pp("wo"))?;
        Ok(Self {
            wq,
            wk,
            wv,
            wo,
            n_heads,
            head_dim,
        })
    }

    fn project(&self, x: &Tensor) -> Result<Projections> {
        let (batch, seq_len, _dim) = x.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            t.reshape((batch, seq_len, self.n_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        Ok(Projections {
            q: split(self.wq.forward(x)?)?,
            k: split(self.wk.forward(x)?)?,
            v: split(self.wv.forward(x)?)?,
        })
    }

    /// Causal attention over the local sequence, per head, before `wo`.
    fn attend(
        &self,
        p: &Projections,
        cos: &Tensor,
        sin: &Tensor,
        key_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let seq_len = p.q.dim(2)?;
        let (q, k) = apply_rotary_emb(&p.q, &p.k, cos, sin)?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / scale)?;
        let mut scores = scores.broadcast_add(&causal_mask(seq_len, scores.device())?)?;
        if let Some(mask) = key_mask {
            scores = scores.broadcast_add(&key_padding_bias(mask)?)?;
        }

        let attn_weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        attn_weights.matmul(&p.v)
    }

    fn merge_heads(&self, heads: &Tensor) -> Result<Tensor> {
        let (batch, _h, seq_len, _hd) = heads.dims4()?;
        let merged = heads
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.n_heads * self.head_dim))?;
        self.wo.forward(&merged)
    }

    /// Forward pass: x [batch, seq_len, dim] -> [batch, seq_len, dim].
    ///
    /// `key_mask` is an optional `[batch, seq_len]` f32 mask over keys.
    pub fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        key_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let p = self.project(x)?;
        let heads = self.attend(&p, cos, sin, key_mask)?;
        self.merge_heads(&heads)
    }
}

/// Attention layer that also reads from an external key/value memory.
///
/// During population the layer runs ordinary causal attention and writes one
/// entry per input row: the mean of its (pre-RoPE) keys and values over the
/// unpadded positions. During answering every query position retrieves its
/// top-k entries and mixes the memory readout into the local readout through a
/// learned per-head sigmoid gate. Batch elements with an empty memory fall
/// back to local attention only.
pub struct MemoryAttention {
    pub attn: AttentionTrain,
    gate: Tensor, // [n_heads]
    layer: usize,
}

impl MemoryAttention {
    pub fn new(dim: usize, n_heads: usize, layer: usize, vb: VarBuilder) -> Result<Self> {
        let attn = AttentionTrain::new(dim, n_heads, vb.clone())?;
        let gate = vb.get_with_hints(n_heads, "mem_gate", candle_nn::Init::Const(0.0))?;
        Ok(Self { attn, gate, layer })
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn gate(&self) -> &Tensor {
        &self.gate
    }

    /// Local attention that also writes pooled rows into `index`.
    ///
    /// `owners[r]` names the batch element that row `r` of `x` belongs to.
    pub fn forward_populate(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        key_mask: Option<&Tensor>,
        index: &mut MemoryIndex,
        owners: &[usize],
    ) -> TrainResult<Tensor> {
        if index.layer() != self.layer {
            return Err(shape_error(format!(
                "memory attention at layer {} given index for layer {}",
                self.layer,
                index.layer()
            )));
        }
        let p = self.attn.project(x)?;
        let (keys, values) = pool_rows(&p.k, &p.v, key_mask)?;
        index.store(&keys, &values, owners)?;

        let heads = self.attn.attend(&p, cos, sin, key_mask)?;
        Ok(self.attn.merge_heads(&heads)?)
    }

    /// Local attention gated with a top-`k` readout from `index`.
    pub fn forward_answer(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        key_mask: Option<&Tensor>,
        index: &MemoryIndex,
        k: usize,
    ) -> TrainResult<Tensor> {
        let p = self.attn.project(x)?;
        let local = self.attn.attend(&p, cos, sin, key_mask)?;

        let neighbors = index.retrieve(&p.q, k)?;
        if neighbors.is_empty() {
            return Ok(self.attn.merge_heads(&local)?);
        }

        // [b, h, s, 1, hd] * [b, h, s, k, hd] -> [b, h, s, k]
        let scale = (self.attn.head_dim as f64).sqrt();
        let scores = (p.q.unsqueeze(3)?.broadcast_mul(&neighbors.keys)?.sum(D::Minus1)? / scale)?;
        let scores = (scores + ((&neighbors.valid - 1.0)? * MASK_BIAS)?)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let mem_out = weights
            .unsqueeze(D::Minus1)?
            .broadcast_mul(&neighbors.values)?
            .sum(3)?; // [b, h, s, hd]

        let batch = neighbors.counts.len();
        let has_mem: Vec<f32> = neighbors
            .counts
            .iter()
            .map(|&c| if c > 0 { 1.0 } else { 0.0 })
            .collect();
        let has_mem = Tensor::from_vec(has_mem, (batch, 1, 1, 1), x.device())?;
        let gate = candle_nn::ops::sigmoid(&self.gate)?.reshape((1, self.attn.n_heads, 1, 1))?;

        let mix = has_mem.broadcast_mul(&gate)?;
        let combined = (&local + (mem_out - &local)?.broadcast_mul(&mix)?)?;
        Ok(self.attn.merge_heads(&combined)?)
    }
}

/// Mean over unpadded positions: `[rows, h, s, hd]` -> `[rows, h, hd]`.
fn pool_rows(k: &Tensor, v: &Tensor, key_mask: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
    match key_mask {
        None => Ok((k.mean(2)?, v.mean(2)?)),
        Some(mask) => {
            let (rows, seq_len) = mask.dims2()?;
            let m = mask.reshape((rows, 1, seq_len, 1))?;
            let count = m.sum(2)?.clamp(1.0f32, f32::MAX)?; // [rows, 1, 1]
            let pooled_k = k.broadcast_mul(&m)?.sum(2)?.broadcast_div(&count)?;
            let pooled_v = v.broadcast_mul(&m)?.sum(2)?.broadcast_div(&count)?;
            Ok((pooled_k, pooled_v))
        }
    }
}
