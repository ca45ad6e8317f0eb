//! Collated batches and their shape invariants.

use candle_core::{DType, Device, Tensor};

use super::dataset::{RetrievalExample, PAD_TOKEN};
use crate::error::{shape_error, TrainResult};
use crate::loss::IGNORE_INDEX;

/// A collated batch of retrieval examples.
#[derive(Debug, Clone)]
pub struct Batch {
    pub ids: Vec<i32>,
    /// `[b, s]` u32
    pub input_ids: Tensor,
    /// `[b, s]` u32, 1 for real tokens
    pub attention_mask: Tensor,
    /// `[b, s]` i64, [`IGNORE_INDEX`] where no loss applies
    pub labels: Tensor,
    /// `[b, n_candidates, s_mem]` u32
    pub retrieved_context: Tensor,
    /// `[b, n_candidates, s_mem]` u32, 1 for real context tokens
    pub context_mask: Tensor,
}

/// Context rows selected for population.
#[derive(Debug, Clone)]
pub struct MemoryRows {
    /// `[rows, s_mem]` u32
    pub tokens: Tensor,
    /// `[rows, s_mem]` u32, 0 on padding
    pub mask: Tensor,
    pub owners: Vec<usize>,
}

impl Batch {
    /// Stack examples, right-padding questions to the longest in the batch.
    ///
    /// Context rows are padded to the longest row; every example must carry
    /// the same number of candidates.
    pub fn collate(examples: &[RetrievalExample], device: &Device) -> TrainResult<Self> {
        if examples.is_empty() {
            return Err(shape_error("cannot collate an empty batch"));
        }
        for ex in examples {
            ex.check()?;
        }
        let b = examples.len();
        let s = examples.iter().map(|e| e.input_ids.len()).max().unwrap_or(0);
        let n_cand = examples[0].retrieved_context.len();
        if let Some(bad) = examples.iter().find(|e| e.retrieved_context.len() != n_cand) {
            return Err(shape_error(format!(
                "example {} has {} context rows, batch expects {}",
                bad.id,
                bad.retrieved_context.len(),
                n_cand
            )));
        }
        let s_mem = examples
            .iter()
            .flat_map(|e| e.retrieved_context.iter().map(Vec::len))
            .max()
            .unwrap_or(0);

        let mut input_ids = Vec::with_capacity(b * s);
        let mut attention_mask = Vec::with_capacity(b * s);
        let mut labels = Vec::with_capacity(b * s);
        let mut context = Vec::with_capacity(b * n_cand * s_mem);
        let mut context_mask = Vec::with_capacity(b * n_cand * s_mem);
        for ex in examples {
            let pad = s - ex.input_ids.len();
            input_ids.extend(ex.input_ids.iter().copied().chain(std::iter::repeat_n(PAD_TOKEN, pad)));
            attention_mask.extend(ex.attention_mask.iter().copied().chain(std::iter::repeat_n(0, pad)));
            labels.extend(ex.labels.iter().copied().chain(std::iter::repeat_n(IGNORE_INDEX, pad)));
            for row in &ex.retrieved_context {
                let pad = s_mem - row.len();
                context.extend(row.iter().copied().chain(std::iter::repeat_n(PAD_TOKEN, pad)));
                context_mask.extend(std::iter::repeat_n(1u32, row.len()).chain(std::iter::repeat_n(0, pad)));
            }
        }

        Ok(Self {
            ids: examples.iter().map(|e| e.id).collect(),
            input_ids: Tensor::from_vec(input_ids, (b, s), device)?,
            attention_mask: Tensor::from_vec(attention_mask, (b, s), device)?,
            labels: Tensor::from_vec(labels, (b, s), device)?,
            retrieved_context: Tensor::from_vec(context, (b, n_cand, s_mem), device)?,
            context_mask: Tensor::from_vec(context_mask, (b, n_cand, s_mem), device)?,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.ids.len()
    }

    /// Question tokens in the batch, padding included.
    pub fn n_tokens(&self) -> usize {
        self.input_ids.elem_count()
    }

    /// Check the invariants the step loop relies on.
    pub fn validate(&self, num_neighbors_to_store: usize) -> TrainResult<()> {
        let b = self.ids.len();
        let dims = self.input_ids.dims();
        if dims.len() != 2 || dims[0] != b {
            return Err(shape_error(format!(
                "input_ids {:?} inconsistent with {} ids",
                dims, b
            )));
        }
        if self.attention_mask.dims() != dims || self.labels.dims() != dims {
            return Err(shape_error(format!(
                "input_ids {:?}, attention_mask {:?} and labels {:?} must share a shape",
                dims,
                self.attention_mask.dims(),
                self.labels.dims()
            )));
        }
        if self.labels.dtype() != DType::I64 {
            return Err(shape_error(format!(
                "labels must be i64, got {:?}",
                self.labels.dtype()
            )));
        }
        let ctx = self.retrieved_context.dims();
        if ctx.len() != 3 || ctx[0] != b {
            return Err(shape_error(format!(
                "retrieved_context {:?} must be [{}, n_candidates, s_mem]",
                ctx, b
            )));
        }
        if self.context_mask.dims() != ctx {
            return Err(shape_error(format!(
                "context_mask {:?} does not match retrieved_context {:?}",
                self.context_mask.dims(),
                ctx
            )));
        }
        if ctx[1] < num_neighbors_to_store {
            return Err(shape_error(format!(
                "retrieved_context has {} candidates, {} are stored per example",
                ctx[1], num_neighbors_to_store
            )));
        }
        Ok(())
    }

    /// The first `n_store` context rows of every example, flattened to
    /// `[b * n_store, s_mem]`, with their padding mask and the batch element
    /// each row belongs to.
    pub fn memory_rows(&self, n_store: usize) -> TrainResult<MemoryRows> {
        let (b, _n_cand, s_mem) = self.retrieved_context.dims3()?;
        let flatten = |t: &Tensor| -> TrainResult<Tensor> {
            Ok(t.narrow(1, 0, n_store)?
                .contiguous()?
                .reshape((b * n_store, s_mem))?)
        };
        let owners = (0..b)
            .flat_map(|element| std::iter::repeat_n(element, n_store))
            .collect();
        Ok(MemoryRows {
            tokens: flatten(&self.retrieved_context)?,
            mask: flatten(&self.context_mask)?,
            owners,
        })
    }
}
