//! Collective operations across data-parallel workers.
//!
//! Every rank runs the same step loop and must issue the same sequence of
//! collectives; a rank that skips one leaves the others waiting forever.

use std::sync::{Arc, Barrier, Mutex};

use candle_core::{Tensor, Var};

use crate::error::{TrainError, TrainResult};

/// Capability handed to the trainer for talking to the other workers.
pub trait DistributedContext: Send + Sync {
    /// This rank's index (0-based).
    fn rank(&self) -> usize;
    /// Total number of ranks in the group.
    fn world_size(&self) -> usize;
    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }
    /// Concatenate every rank's `values` in rank order. Ranks may contribute
    /// different lengths, including none.
    fn all_gather(&self, values: &[f64]) -> TrainResult<Vec<f64>>;
    /// In-place element-wise sum across ranks.
    fn all_reduce_sum(&self, buf: &mut [f32]) -> TrainResult<()>;
    fn barrier(&self) -> TrainResult<()>;
}

/// Single worker: every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl DistributedContext for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, values: &[f64]) -> TrainResult<Vec<f64>> {
        Ok(values.to_vec())
    }

    fn all_reduce_sum(&self, _buf: &mut [f32]) -> TrainResult<()> {
        Ok(())
    }

    fn barrier(&self) -> TrainResult<()> {
        Ok(())
    }
}

struct GroupState {
    world: usize,
    barrier: Barrier,
    gather_slots: Mutex<Vec<Vec<f64>>>,
    reduce_slots: Mutex<Vec<Vec<f32>>>,
}

/// In-process group of ranks, one per thread.
///
/// Each collective publishes this rank's contribution, waits for every rank,
/// reads the combined result, then waits again so no rank can overwrite a
/// slot that another is still reading.
pub struct LocalProcessGroup {
    rank_id: usize,
    state: Arc<GroupState>,
}

impl LocalProcessGroup {
    /// Create a set of N handles sharing one group.
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let world = world_size.max(1);
        let state = Arc::new(GroupState {
            world,
            barrier: Barrier::new(world),
            gather_slots: Mutex::new(vec![Vec::new(); world]),
            reduce_slots: Mutex::new(vec![Vec::new(); world]),
        });
        (0..world)
            .map(|r| LocalProcessGroup {
                rank_id: r,
                state: Arc::clone(&state),
            })
            .collect()
    }

    fn poisoned(&self) -> TrainError {
        TrainError::Distributed {
            rank: self.rank_id,
            message: "collective state poisoned by a panicked rank".to_string(),
        }
    }
}

impl DistributedContext for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank_id
    }

    fn world_size(&self) -> usize {
        self.state.world
    }

    fn all_gather(&self, values: &[f64]) -> TrainResult<Vec<f64>> {
        {
            let mut slots = self.state.gather_slots.lock().map_err(|_| self.poisoned())?;
            slots[self.rank_id] = values.to_vec();
        }
        self.state.barrier.wait();
        let gathered = {
            let slots = self.state.gather_slots.lock().map_err(|_| self.poisoned())?;
            slots.iter().flatten().copied().collect()
        };
        self.state.barrier.wait();
        Ok(gathered)
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> TrainResult<()> {
        {
            let mut slots = self.state.reduce_slots.lock().map_err(|_| self.poisoned())?;
            slots[self.rank_id] = buf.to_vec();
        }
        self.state.barrier.wait();
        let result = {
            let slots = self.state.reduce_slots.lock().map_err(|_| self.poisoned())?;
            if slots.iter().any(|s| s.len() != buf.len()) {
                Err(TrainError::Distributed {
                    rank: self.rank_id,
                    message: format!(
                        "all_reduce length mismatch: {:?}",
                        slots.iter().map(Vec::len).collect::<Vec<_>>()
                    ),
                })
            } else {
                buf.iter_mut().for_each(|v| *v = 0.0);
                for slot in slots.iter() {
                    for (acc, v) in buf.iter_mut().zip(slot) {
                        *acc += v;
                    }
                }
                Ok(())
            }
        };
        self.state.barrier.wait();
        result
    }

    fn barrier(&self) -> TrainResult<()> {
        self.state.barrier.wait();
        Ok(())
    }
}

/// Overwrite `buf` on every rank with rank 0's contents.
pub fn broadcast_from_main(dist: &dyn DistributedContext, buf: &mut [f32]) -> TrainResult<()> {
    if dist.world_size() == 1 {
        return Ok(());
    }
    if !dist.is_main_process() {
        buf.iter_mut().for_each(|v| *v = 0.0);
    }
    dist.all_reduce_sum(buf)
}

/// Make every rank's parameters identical to rank 0's.
///
/// `vars` must list the same parameters in the same order on every rank.
pub fn broadcast_vars(dist: &dyn DistributedContext, vars: &[Var]) -> TrainResult<()> {
    if dist.world_size() == 1 {
        return Ok(());
    }
    for var in vars {
        let t = var.as_tensor();
        let mut flat = t.flatten_all()?.to_vec1::<f32>()?;
        broadcast_from_main(dist, &mut flat)?;
        var.set(&Tensor::from_vec(flat, t.dims(), t.device())?)?;
    }
    Ok(())
}

/// Mean of a scalar across ranks.
pub fn mean_across(dist: &dyn DistributedContext, value: f64) -> TrainResult<f64> {
    let all = dist.all_gather(&[value])?;
    Ok(all.iter().sum::<f64>() / all.len().max(1) as f64)
}
