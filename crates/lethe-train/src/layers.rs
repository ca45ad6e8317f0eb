//! Trainable primitives: bias-free linear projection and RMSNorm.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// Bias-free linear layer, `y = x @ W^T`.
pub struct LinearTrain {
    weight: Tensor, // [out_features, in_features]
    pub in_features: usize,
    pub out_features: usize,
}

impl LinearTrain {
    pub fn new(in_f: usize, out_f: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_f, in_f),
            "weight",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(Self {
            weight,
            in_features: in_f,
            out_features: out_f,
        })
    }

    /// Handles `[n, in]` and batched `[b, m, in]` input.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.weight.t()?;
        let x_dims = x.dims().to_vec();
        if x_dims.len() == 3 {
            let (b, m, k) = (x_dims[0], x_dims[1], x_dims[2]);
            x.reshape((b * m, k))?.matmul(&w)?.reshape((b, m, ()))
        } else {
            x.matmul(&w)
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

/// RMSNorm for training (differentiable).
pub struct RMSNormTrain {
    weight: Tensor, // [dim]
    eps: f64,
    pub dim: usize,
}

impl RMSNormTrain {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self {
            weight,
            eps: 1e-6,
            dim,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last_dim = x.dims().len() - 1;
        let variance = x.sqr()?.mean_keepdim(last_dim)?;
        let denominator = (variance + self.eps)?.sqrt()?;
        x.broadcast_div(&denominator)?.broadcast_mul(&self.weight)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}
