//! AdamW with decoupled weight decay and serializable moments.

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};

/// Flat snapshot of one tensor for JSON persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorState {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorState {
    fn capture(t: &Tensor) -> TrainResult<Self> {
        Ok(Self {
            shape: t.dims().to_vec(),
            data: t.flatten_all()?.to_vec1::<f32>()?,
        })
    }
}

/// AdamW hyperparameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// AdamW optimizer.
///
/// Update rule for each parameter `p` with gradient `g` at step `t`:
///   1. Weight decay: p *= (1 - lr * wd)
///   2. m = beta1*m + (1-beta1)*g,  v = beta2*v + (1-beta2)*g^2
///   3. p -= lr * (m / (1-beta1^t)) / (sqrt(v / (1-beta2^t)) + eps)
pub struct AdamW {
    names: Vec<String>,
    vars: Vec<Var>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    step: usize,
    config: AdamWConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamWState {
    pub names: Vec<String>,
    pub exp_avg: Vec<TensorState>,
    pub exp_avg_sq: Vec<TensorState>,
    pub step: usize,
    pub config: AdamWConfig,
}

impl AdamW {
    /// `params` pairs each variable with its stable name; order is kept.
    pub fn new(params: Vec<(String, Var)>, config: AdamWConfig) -> TrainResult<Self> {
        let (names, vars): (Vec<_>, Vec<_>) = params.into_iter().unzip();
        let exp_avg = vars
            .iter()
            .map(|v| Tensor::zeros_like(v.as_tensor()))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let exp_avg_sq = vars
            .iter()
            .map(|v| Tensor::zeros_like(v.as_tensor()))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            names,
            vars,
            exp_avg,
            exp_avg_sq,
            step: 0,
            config,
        })
    }

    /// Apply one update. `grads[i]` belongs to the i-th parameter; `None` skips it.
    ///
    /// Gradients are multiplied by `grad_scale` first (clipping).
    pub fn step(&mut self, grads: &[Option<Tensor>], grad_scale: f64) -> TrainResult<()> {
        if grads.len() != self.vars.len() {
            return Err(TrainError::Optimizer(format!(
                "AdamW got {} gradients for {} parameters",
                grads.len(),
                self.vars.len()
            )));
        }
        self.step += 1;
        let AdamWConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        let bias1 = 1.0 - beta1.powi(self.step as i32);
        let bias2 = 1.0 - beta2.powi(self.step as i32);

        for (i, var) in self.vars.iter().enumerate() {
            let grad = match &grads[i] {
                Some(g) => g,
                None => continue,
            };
            let grad = (grad * grad_scale)?;

            if weight_decay > 0.0 {
                let decayed = (var.as_tensor() * (1.0 - lr * weight_decay))?;
                var.set(&decayed)?;
            }

            let m = ((&self.exp_avg[i] * beta1)? + (&grad * (1.0 - beta1))?)?;
            let v = ((&self.exp_avg_sq[i] * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&m / bias1)?;
            let v_hat = (&v / bias2)?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let new_val = var.as_tensor().sub(&(update * lr)?)?;
            var.set(&new_val)?;

            self.exp_avg[i] = m;
            self.exp_avg_sq[i] = v;
        }
        Ok(())
    }

    pub fn lr(&self) -> f64 {
        self.config.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn export_state(&self) -> TrainResult<AdamWState> {
        Ok(AdamWState {
            names: self.names.clone(),
            exp_avg: self
                .exp_avg
                .iter()
                .map(TensorState::capture)
                .collect::<TrainResult<Vec<_>>>()?,
            exp_avg_sq: self
                .exp_avg_sq
                .iter()
                .map(TensorState::capture)
                .collect::<TrainResult<Vec<_>>>()?,
            step: self.step,
            config: self.config,
        })
    }

    pub fn import_state(&mut self, state: &AdamWState) -> TrainResult<()> {
        if state.names != self.names {
            return Err(TrainError::Optimizer(format!(
                "AdamW state covers {} parameters that do not match the model's {}",
                state.names.len(),
                self.names.len()
            )));
        }
        if state.exp_avg.len() != self.vars.len() || state.exp_avg_sq.len() != self.vars.len() {
            return Err(TrainError::Optimizer(format!(
                "AdamW state mismatch: expected {} moment pairs, got {}/{}",
                self.vars.len(),
                state.exp_avg.len(),
                state.exp_avg_sq.len()
            )));
        }

        let restore = |idx: usize, snap: &TensorState| -> TrainResult<Tensor> {
            let expected_shape = self.vars[idx].as_tensor().dims().to_vec();
            if snap.shape != expected_shape {
                return Err(TrainError::Optimizer(format!(
                    "AdamW state shape mismatch for '{}': expected {:?}, got {:?}",
                    self.names[idx], expected_shape, snap.shape
                )));
            }
            if snap.data.len() != expected_shape.iter().product::<usize>() {
                return Err(TrainError::Optimizer(format!(
                    "AdamW state data length mismatch for '{}'",
                    self.names[idx]
                )));
            }
            Ok(Tensor::from_vec(
                snap.data.clone(),
                snap.shape.as_slice(),
                self.vars[idx].device(),
            )?)
        };

        let mut m = Vec::with_capacity(self.vars.len());
        let mut v = Vec::with_capacity(self.vars.len());
        for idx in 0..self.vars.len() {
            m.push(restore(idx, &state.exp_avg[idx])?);
            v.push(restore(idx, &state.exp_avg_sq[idx])?);
        }

        self.exp_avg = m;
        self.exp_avg_sq = v;
        self.step = state.step;
        self.config = state.config;
        Ok(())
    }
}
