//! Gradient accumulation across micro-steps.
//!
//! candle hands back a fresh `GradStore` per backward pass. The accumulator
//! sums them into one buffer per parameter, in a fixed name-sorted order so
//! that every rank flattens gradients identically for the all-reduce.

use candle_core::{backprop::GradStore, Tensor, Var};
use candle_nn::VarMap;

use crate::distributed::DistributedContext;
use crate::error::{TrainError, TrainResult};

pub struct GradAccumulator {
    names: Vec<String>,
    vars: Vec<Var>,
    grads: Vec<Option<Tensor>>,
    micro_steps: usize,
}

impl GradAccumulator {
    /// Track every variable in `varmap`, sorted by name.
    pub fn from_varmap(varmap: &VarMap) -> TrainResult<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| TrainError::Optimizer("varmap lock poisoned".to_string()))?;
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        drop(data);
        named.sort_by(|a, b| a.0.cmp(&b.0));
        let (names, vars): (Vec<_>, Vec<_>) = named.into_iter().unzip();
        let grads = vec![None; vars.len()];
        Ok(Self {
            names,
            vars,
            grads,
            micro_steps: 0,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// `(name, var)` pairs in accumulation order.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        self.names.iter().cloned().zip(self.vars.iter().cloned()).collect()
    }

    pub fn grads(&self) -> &[Option<Tensor>] {
        &self.grads
    }

    /// Backward passes folded in since the last [`GradAccumulator::zero`].
    pub fn micro_steps(&self) -> usize {
        self.micro_steps
    }

    /// Add the gradients of one backward pass.
    pub fn accumulate(&mut self, store: &GradStore) -> TrainResult<()> {
        for (slot, var) in self.grads.iter_mut().zip(&self.vars) {
            let Some(g) = store.get(var.as_tensor()) else {
                continue;
            };
            let g = g.detach();
            *slot = Some(match slot.take() {
                Some(acc) => (acc + g)?,
                None => g,
            });
        }
        self.micro_steps += 1;
        Ok(())
    }

    /// Replace every gradient with its mean across ranks.
    ///
    /// Missing gradients count as zeros so every rank sends the same layout.
    pub fn sync_mean(&mut self, dist: &dyn DistributedContext) -> TrainResult<()> {
        let world = dist.world_size();
        if world == 1 {
            return Ok(());
        }
        let mut flat = Vec::new();
        for (slot, var) in self.grads.iter().zip(&self.vars) {
            match slot {
                Some(g) => flat.extend(g.flatten_all()?.to_vec1::<f32>()?),
                None => flat.extend(std::iter::repeat_n(0.0f32, var.as_tensor().elem_count())),
            }
        }
        dist.all_reduce_sum(&mut flat)?;
        let scale = 1.0 / world as f32;

        let mut offset = 0;
        for (slot, var) in self.grads.iter_mut().zip(&self.vars) {
            let t = var.as_tensor();
            let n = t.elem_count();
            let mean: Vec<f32> = flat[offset..offset + n].iter().map(|v| v * scale).collect();
            *slot = Some(Tensor::from_vec(mean, t.dims(), t.device())?);
            offset += n;
        }
        Ok(())
    }

    /// L2 norm over all accumulated gradients.
    pub fn global_norm(&self) -> TrainResult<f64> {
        let mut total = 0.0f64;
        for g in self.grads.iter().flatten() {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
        Ok(total.sqrt())
    }

    /// Gradient norm and the factor that brings it down to `max_norm`.
    ///
    /// `max_norm <= 0` disables clipping (scale 1.0).
    pub fn clip_scale(&self, max_norm: f64) -> TrainResult<(f64, f64)> {
        let norm = self.global_norm()?;
        let scale = if max_norm > 0.0 && norm > max_norm {
            max_norm / (norm + 1e-6)
        } else {
            1.0
        };
        Ok((norm, scale))
    }

    pub fn zero(&mut self) {
        self.grads.iter_mut().for_each(|g| *g = None);
        self.micro_steps = 0;
    }
}
