//! Shuffled, rank-sharded batch loader.
//!
//! The epoch order is a permutation seeded by `seed + epoch`, identical on
//! every rank. Rank `r` of `w` takes positions `r, r + w, r + 2w, ...` of that
//! order. In training mode the order is first cut down to a multiple of `w`
//! so all ranks run the same number of steps. In evaluation mode nothing is
//! dropped; ranks with a shorter shard see `None` for their last batch index
//! and still take part in every collective.

use candle_core::Device;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::batch::Batch;
use super::dataset::RetrievalDataset;
use crate::error::TrainResult;

pub struct RetrievalLoader<'a> {
    dataset: &'a dyn RetrievalDataset,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    rank: usize,
    world_size: usize,
    drop_uneven: bool,
    shard: Vec<usize>,
    n_batches: usize,
    pos: usize,
    device: Device,
}

impl<'a> RetrievalLoader<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dataset: &'a dyn RetrievalDataset,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        rank: usize,
        world_size: usize,
        drop_uneven: bool,
        device: &Device,
    ) -> Self {
        let mut loader = Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
            rank,
            world_size: world_size.max(1),
            drop_uneven,
            shard: Vec::new(),
            n_batches: 0,
            pos: 0,
            device: device.clone(),
        };
        loader.set_epoch(0);
        loader
    }

    /// Training loader: shuffled, uneven tail dropped.
    pub fn for_training(
        dataset: &'a dyn RetrievalDataset,
        batch_size: usize,
        seed: u64,
        rank: usize,
        world_size: usize,
        device: &Device,
    ) -> Self {
        Self::new(dataset, batch_size, true, seed, rank, world_size, true, device)
    }

    /// Evaluation loader: fixed order, nothing dropped.
    pub fn for_evaluation(
        dataset: &'a dyn RetrievalDataset,
        batch_size: usize,
        rank: usize,
        world_size: usize,
        device: &Device,
    ) -> Self {
        Self::new(dataset, batch_size, false, 0, rank, world_size, false, device)
    }

    /// Rebuild this rank's shard for `epoch` and rewind.
    pub fn set_epoch(&mut self, epoch: usize) {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed + epoch as u64);
            order.shuffle(&mut rng);
        }
        if self.drop_uneven {
            order.truncate(order.len() - order.len() % self.world_size);
        }
        self.shard = order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect();

        // Same on every rank: the longest shard decides.
        let longest = self.dataset.len().div_ceil(self.world_size);
        let per_rank = if self.drop_uneven {
            self.dataset.len() / self.world_size
        } else {
            longest
        };
        self.n_batches = per_rank.div_ceil(self.batch_size);
        self.pos = 0;
    }

    /// Batches per epoch, identical on every rank.
    pub fn n_batches(&self) -> usize {
        self.n_batches
    }

    /// Examples this rank sees per epoch.
    pub fn shard_len(&self) -> usize {
        self.shard.len()
    }

    /// Batch `i` of this rank's shard, `None` when the shard is exhausted.
    pub fn batch_at(&self, i: usize) -> TrainResult<Option<Batch>> {
        let start = i * self.batch_size;
        if start >= self.shard.len() {
            return Ok(None);
        }
        let end = (start + self.batch_size).min(self.shard.len());
        let examples: Vec<_> = self.shard[start..end]
            .iter()
            .map(|&idx| self.dataset.get_item(idx))
            .collect();
        Batch::collate(&examples, &self.device).map(Some)
    }

    /// Resume inside an epoch: the next batch yielded is batch `n`.
    pub fn skip_first_batches(&mut self, n: usize) {
        self.pos = n.min(self.n_batches);
    }

    /// Index of the next batch to be yielded.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl Iterator for RetrievalLoader<'_> {
    /// `(batch index within the epoch, batch)`; `None` batch marks an idle step.
    type Item = TrainResult<(usize, Option<Batch>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.n_batches {
            return None;
        }
        let i = self.pos;
        self.pos += 1;
        Some(self.batch_at(i).map(|b| (i, b)))
    }
}
