//! Next-token cross-entropy with ignored positions.

use candle_core::{DType, Tensor, D};

use crate::error::{shape_error, TrainResult};

/// Label value that excludes a position from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Token-level cross-entropy averaged per example.
///
/// `logits` is `[b, s, vocab]` and `labels` is `[b, s]` (i64). Logits at
/// position `t` predict the label at `t + 1`. Each example's loss is the mean
/// over its positions whose label is not [`IGNORE_INDEX`]; an example with no
/// such position scores 0. Returns `[b]`.
pub fn per_example_loss(logits: &Tensor, labels: &Tensor) -> TrainResult<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    let (l_batch, l_seq) = labels.dims2()?;
    if (l_batch, l_seq) != (batch, seq_len) {
        return Err(shape_error(format!(
            "labels {:?} do not match logits {:?}",
            labels.dims(),
            logits.dims()
        )));
    }
    let device = logits.device();
    if seq_len < 2 {
        return Ok(Tensor::zeros(batch, DType::F32, device)?);
    }

    let n_pred = seq_len - 1;
    let host_labels = labels.to_dtype(DType::I64)?.to_vec2::<i64>()?;
    let mut targets = Vec::with_capacity(batch * n_pred);
    let mut mask = Vec::with_capacity(batch * n_pred);
    let mut inv_count = Vec::with_capacity(batch);
    for row in &host_labels {
        let mut count = 0usize;
        for &label in &row[1..] {
            if label == IGNORE_INDEX {
                targets.push(0u32);
                mask.push(0.0f32);
                continue;
            }
            if label < 0 || label as usize >= vocab {
                return Err(shape_error(format!(
                    "label {} outside vocabulary of {}",
                    label, vocab
                )));
            }
            targets.push(label as u32);
            mask.push(1.0f32);
            count += 1;
        }
        inv_count.push(if count == 0 { 0.0 } else { 1.0 / count as f32 });
    }

    let targets = Tensor::from_vec(targets, (batch, n_pred, 1), device)?;
    let mask = Tensor::from_vec(mask, (batch, n_pred), device)?;
    let inv_count = Tensor::from_vec(inv_count, batch, device)?;

    let shifted = logits.narrow(1, 0, n_pred)?.to_dtype(DType::F32)?;
    let log_probs = candle_nn::ops::log_softmax(&shifted, D::Minus1)?;
    let picked = log_probs.contiguous()?.gather(&targets, 2)?.squeeze(2)?; // [b, n_pred]
    let nll = (picked * mask)?.neg()?;
    Ok((nll.sum(1)? * inv_count)?)
}

/// Batch loss: mean of [`per_example_loss`].
pub fn mean_loss(logits: &Tensor, labels: &Tensor) -> TrainResult<Tensor> {
    Ok(per_example_loss(logits, labels)?.mean(0)?)
}
