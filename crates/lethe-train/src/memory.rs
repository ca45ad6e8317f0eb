//! External key/value memory populated from retrieved context.
//!
//! Each designated attention layer owns one [`MemoryIndex`]: a pre-allocated
//! arena laid out as `[batch, heads, capacity, head_dim]` with one write
//! cursor per batch element. An entry is one retrieved-context row, reduced to
//! the mean of its per-token keys and values at that layer.
//!
//! The arena lives on the host and `retrieve` hands out fresh tensors, so the
//! autograd graph of the answer pass never references arena storage. The
//! training loop still resets only after backward so that the bank reflects
//! exactly one batch from population until the step ends.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::config::TrainConfig;
use crate::error::{shape_error, TrainError, TrainResult};

/// Neighbors returned by [`MemoryIndex::retrieve`].
#[derive(Debug)]
pub struct Neighbors {
    /// `[b, heads, q, k, head_dim]`, zero-padded past `counts[b]`.
    pub keys: Tensor,
    /// `[b, heads, q, k, head_dim]`, zero-padded past `counts[b]`.
    pub values: Tensor,
    /// `[b, heads, q, k]`: 1.0 for a real neighbor, 0.0 for padding.
    pub valid: Tensor,
    /// Real neighbors served per batch element (same for every head and query).
    pub counts: Vec<usize>,
    pub k: usize,
}

impl Neighbors {
    /// True when no batch element received any neighbor.
    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|&c| c == 0)
    }
}

/// Fixed-capacity key/value store for one attention layer.
#[derive(Debug, Clone)]
pub struct MemoryIndex {
    layer: usize,
    batch_size: usize,
    n_heads: usize,
    head_dim: usize,
    capacity: usize,
    keys: Vec<f32>,
    values: Vec<f32>,
    lens: Vec<usize>,
}

impl MemoryIndex {
    pub fn new(
        layer: usize,
        batch_size: usize,
        n_heads: usize,
        head_dim: usize,
        capacity: usize,
    ) -> Self {
        let slots = batch_size * n_heads * capacity * head_dim;
        Self {
            layer,
            batch_size,
            n_heads,
            head_dim,
            capacity,
            keys: vec![0.0; slots],
            values: vec![0.0; slots],
            lens: vec![0; batch_size],
        }
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Entries currently stored for batch element `element`.
    pub fn len(&self, element: usize) -> usize {
        self.lens.get(element).copied().unwrap_or(0)
    }

    pub fn total_len(&self) -> usize {
        self.lens.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    #[inline]
    fn offset(&self, element: usize, head: usize, entry: usize) -> usize {
        ((element * self.n_heads + head) * self.capacity + entry) * self.head_dim
    }

    /// Append rows of pooled activations.
    ///
    /// `keys` and `values` are `[rows, heads, head_dim]`; `owners[r]` is the
    /// batch element row `r` belongs to. Capacity is checked for every owner
    /// before anything is written, so a failed store leaves the index as it was.
    pub fn store(&mut self, keys: &Tensor, values: &Tensor, owners: &[usize]) -> TrainResult<()> {
        let (rows, heads, head_dim) = keys.dims3()?;
        if values.dims() != keys.dims() {
            return Err(shape_error(format!(
                "memory store: keys {:?} and values {:?} differ",
                keys.dims(),
                values.dims()
            )));
        }
        if heads != self.n_heads || head_dim != self.head_dim {
            return Err(shape_error(format!(
                "memory store: expected [rows, {}, {}], got {:?}",
                self.n_heads,
                self.head_dim,
                keys.dims()
            )));
        }
        if owners.len() != rows {
            return Err(shape_error(format!(
                "memory store: {} owners for {} rows",
                owners.len(),
                rows
            )));
        }

        let mut incoming = vec![0usize; self.batch_size];
        for &owner in owners {
            if owner >= self.batch_size {
                return Err(shape_error(format!(
                    "memory store: owner {} outside batch of {}",
                    owner, self.batch_size
                )));
            }
            incoming[owner] += 1;
        }
        for (element, &requested) in incoming.iter().enumerate() {
            if self.lens[element] + requested > self.capacity {
                return Err(TrainError::MemoryOverflow {
                    layer: self.layer,
                    element,
                    stored: self.lens[element],
                    requested,
                    capacity: self.capacity,
                });
            }
        }

        let k_host = keys.detach().to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_host = values.detach().to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let row_width = heads * head_dim;

        for (row, &owner) in owners.iter().enumerate() {
            let entry = self.lens[owner];
            for head in 0..heads {
                let src = row * row_width + head * head_dim;
                let dst = self.offset(owner, head, entry);
                self.keys[dst..dst + head_dim].copy_from_slice(&k_host[src..src + head_dim]);
                self.values[dst..dst + head_dim].copy_from_slice(&v_host[src..src + head_dim]);
            }
            self.lens[owner] += 1;
        }
        Ok(())
    }

    /// Top-`k` entries by inner-product similarity, per batch element, head and query.
    ///
    /// `queries` is `[b, heads, q, head_dim]` with `b <= batch_size`.
    pub fn retrieve(&self, queries: &Tensor, k: usize) -> TrainResult<Neighbors> {
        let (b, heads, n_queries, head_dim) = queries.dims4()?;
        if k == 0 {
            return Err(shape_error("memory retrieve: k must be > 0"));
        }
        if b > self.batch_size || heads != self.n_heads || head_dim != self.head_dim {
            return Err(shape_error(format!(
                "memory retrieve: queries {:?} incompatible with index [{}, {}, _, {}]",
                queries.dims(),
                self.batch_size,
                self.n_heads,
                self.head_dim
            )));
        }

        let q_host = queries
            .detach()
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let mut keys_out = vec![0.0f32; b * heads * n_queries * k * head_dim];
        let mut values_out = vec![0.0f32; keys_out.len()];
        let mut valid = vec![0.0f32; b * heads * n_queries * k];
        let mut counts = Vec::with_capacity(b);
        let mut scored: Vec<(f32, usize)> = Vec::with_capacity(self.capacity);

        for element in 0..b {
            let stored = self.lens[element];
            let take = stored.min(k);
            counts.push(take);
            if take == 0 {
                continue;
            }
            for head in 0..heads {
                for t in 0..n_queries {
                    let row = (element * heads + head) * n_queries + t;
                    let query = &q_host[row * head_dim..(row + 1) * head_dim];

                    scored.clear();
                    for entry in 0..stored {
                        let off = self.offset(element, head, entry);
                        let dot: f32 = query
                            .iter()
                            .zip(&self.keys[off..off + head_dim])
                            .map(|(a, b)| a * b)
                            .sum();
                        scored.push((dot, entry));
                    }
                    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

                    for (rank, &(_, entry)) in scored.iter().take(take).enumerate() {
                        let src = self.offset(element, head, entry);
                        let dst = (row * k + rank) * head_dim;
                        keys_out[dst..dst + head_dim]
                            .copy_from_slice(&self.keys[src..src + head_dim]);
                        values_out[dst..dst + head_dim]
                            .copy_from_slice(&self.values[src..src + head_dim]);
                        valid[row * k + rank] = 1.0;
                    }
                }
            }
        }

        let device = queries.device();
        Ok(Neighbors {
            keys: Tensor::from_vec(keys_out, (b, heads, n_queries, k, head_dim), device)?,
            values: Tensor::from_vec(values_out, (b, heads, n_queries, k, head_dim), device)?,
            valid: Tensor::from_vec(valid, (b, heads, n_queries, k), device)?,
            counts,
            k,
        })
    }

    /// Clear every entry for every batch element. Storage is kept.
    pub fn reset(&mut self) {
        self.lens.iter_mut().for_each(|len| *len = 0);
    }
}

/// All memory indices of a model, keyed by layer.
#[derive(Debug, Clone, Default)]
pub struct MemoryBank {
    indices: BTreeMap<usize, MemoryIndex>,
}

impl MemoryBank {
    pub fn new(
        layers: &[usize],
        batch_size: usize,
        n_heads: usize,
        head_dim: usize,
        capacity: usize,
    ) -> Self {
        let indices = layers
            .iter()
            .map(|&layer| {
                (
                    layer,
                    MemoryIndex::new(layer, batch_size, n_heads, head_dim, capacity),
                )
            })
            .collect();
        Self { indices }
    }

    pub fn from_config(config: &TrainConfig) -> Self {
        Self::new(
            &config.memory_attn_layers,
            config.batch_size,
            config.n_heads,
            config.head_dim(),
            config.num_memories_per_index,
        )
    }

    pub fn get(&self, layer: usize) -> Option<&MemoryIndex> {
        self.indices.get(&layer)
    }

    pub fn get_mut(&mut self, layer: usize) -> Option<&mut MemoryIndex> {
        self.indices.get_mut(&layer)
    }

    pub fn layers(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.keys().copied()
    }

    pub fn reset_all(&mut self) {
        for index in self.indices.values_mut() {
            index.reset();
        }
    }

    pub fn total_len(&self) -> usize {
        self.indices.values().map(MemoryIndex::total_len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn rows(data: &[f32], rows: usize, heads: usize, hd: usize) -> Tensor {
        Tensor::from_vec(data.to_vec(), (rows, heads, hd), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_store_retrieve_scenario_fills_capacity_exactly() -> TrainResult<()> {
        // batch 2, capacity 4, two chunks of two rows each (owners 0,0 then 1,1).
        let mut index = MemoryIndex::new(0, 2, 2, 4, 4);
        let chunk_a = Tensor::randn(0.0f32, 1.0, (2, 2, 4), &Device::Cpu)?;
        let chunk_b = Tensor::randn(0.0f32, 1.0, (2, 2, 4), &Device::Cpu)?;
        index.store(&chunk_a, &chunk_a, &[0, 0])?;
        index.store(&chunk_b, &chunk_b, &[1, 1])?;
        assert_eq!(index.total_len(), 4);

        let queries = Tensor::randn(0.0f32, 1.0, (2, 2, 3, 4), &Device::Cpu)?;
        let neighbors = index.retrieve(&queries, 2)?;
        assert_eq!(neighbors.counts, vec![2, 2]);
        assert_eq!(neighbors.keys.dims(), &[2, 2, 3, 2, 4]);
        let valid_sum = neighbors.valid.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(valid_sum, (2 * 2 * 3 * 2) as f32);
        Ok(())
    }

    #[test]
    fn test_retrieve_returns_exactly_k_when_enough_stored() -> TrainResult<()> {
        let mut index = MemoryIndex::new(0, 1, 1, 2, 8);
        let keys = Tensor::randn(0.0f32, 1.0, (5, 1, 2), &Device::Cpu)?;
        index.store(&keys, &keys, &[0; 5])?;
        for k in 1..=5 {
            let q = Tensor::randn(0.0f32, 1.0, (1, 1, 1, 2), &Device::Cpu)?;
            let neighbors = index.retrieve(&q, k)?;
            assert_eq!(neighbors.counts, vec![k]);
        }
        Ok(())
    }

    #[test]
    fn test_retrieve_orders_by_similarity() -> TrainResult<()> {
        let mut index = MemoryIndex::new(0, 1, 1, 2, 3);
        let keys = rows(&[1.0, 0.0, 0.0, 1.0, -1.0, 0.0], 3, 1, 2);
        let values = rows(&[10.0, 10.0, 20.0, 20.0, 30.0, 30.0], 3, 1, 2);
        index.store(&keys, &values, &[0, 0, 0])?;

        let q = Tensor::from_vec(vec![0.0f32, 1.0], (1, 1, 1, 2), &Device::Cpu)?;
        let neighbors = index.retrieve(&q, 1)?;
        let best = neighbors.values.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(best, vec![20.0, 20.0]);
        Ok(())
    }

    #[test]
    fn test_chunked_store_matches_single_store() -> TrainResult<()> {
        let keys = Tensor::randn(0.0f32, 1.0, (4, 2, 3), &Device::Cpu)?;
        let owners = [0, 0, 1, 1];

        let mut single = MemoryIndex::new(0, 2, 2, 3, 4);
        single.store(&keys, &keys, &owners)?;

        let mut chunked = MemoryIndex::new(0, 2, 2, 3, 4);
        for start in 0..4 {
            let chunk = keys.narrow(0, start, 1)?;
            chunked.store(&chunk, &chunk, &owners[start..start + 1])?;
        }

        assert_eq!(single.keys, chunked.keys);
        assert_eq!(single.values, chunked.values);
        assert_eq!(single.lens, chunked.lens);
        Ok(())
    }

    #[test]
    fn test_overflow_is_rejected_without_partial_write() -> TrainResult<()> {
        let mut index = MemoryIndex::new(5, 2, 1, 2, 2);
        let keys = Tensor::ones((2, 1, 2), DType::F32, &Device::Cpu)?;
        index.store(&keys, &keys, &[1, 1])?;

        let more = Tensor::ones((2, 1, 2), DType::F32, &Device::Cpu)?;
        let err = index.store(&more, &more, &[0, 1]).unwrap_err();
        assert!(matches!(
            err,
            TrainError::MemoryOverflow { layer: 5, element: 1, .. }
        ));
        assert_eq!(index.len(0), 0);
        assert_eq!(index.len(1), 2);
        Ok(())
    }

    #[test]
    fn test_reset_clears_and_is_idempotent() -> TrainResult<()> {
        let mut index = MemoryIndex::new(0, 2, 1, 2, 4);
        assert!(index.is_empty());
        let keys = Tensor::ones((3, 1, 2), DType::F32, &Device::Cpu)?;
        index.store(&keys, &keys, &[0, 1, 1])?;
        assert_eq!(index.total_len(), 3);

        index.reset();
        assert_eq!(index.total_len(), 0);
        index.reset();
        assert_eq!(index.total_len(), 0);

        // Capacity is available again after reset.
        let full = Tensor::ones((4, 1, 2), DType::F32, &Device::Cpu)?;
        index.store(&full, &full, &[0, 0, 0, 0])?;
        assert_eq!(index.len(0), 4);
        Ok(())
    }

    #[test]
    fn test_retrieve_before_store_is_all_invalid() -> TrainResult<()> {
        let index = MemoryIndex::new(0, 2, 2, 4, 4);
        let q = Tensor::randn(0.0f32, 1.0, (2, 2, 3, 4), &Device::Cpu)?;
        let neighbors = index.retrieve(&q, 2)?;
        assert!(neighbors.is_empty());
        assert_eq!(neighbors.valid.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_store_rejects_bad_owner_and_shape() {
        let mut index = MemoryIndex::new(0, 2, 2, 4, 4);
        let keys = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            index.store(&keys, &keys, &[2]),
            Err(TrainError::DataShape(_))
        ));
        let wrong_heads = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            index.store(&wrong_heads, &wrong_heads, &[0]),
            Err(TrainError::DataShape(_))
        ));
    }

    #[test]
    fn test_bank_resets_every_layer() -> TrainResult<()> {
        let mut bank = MemoryBank::new(&[1, 3], 1, 1, 2, 2);
        let keys = Tensor::ones((1, 1, 2), DType::F32, &Device::Cpu)?;
        for layer in [1, 3] {
            bank.get_mut(layer).unwrap().store(&keys, &keys, &[0])?;
        }
        assert_eq!(bank.total_len(), 2);
        bank.reset_all();
        assert!(bank.is_empty());
        assert_eq!(bank.layers().collect::<Vec<_>>(), vec![1, 3]);
        Ok(())
    }
}
