//! Evaluation loop and the per-example loss record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;

use crate::checkpoint::write_atomic;
use crate::config::TrainConfig;
use crate::data::RetrievalLoader;
use crate::distributed::DistributedContext;
use crate::error::{checkpoint_error, shape_error, IoResultExt, TrainError, TrainResult};
use crate::loss::per_example_loss;
use crate::memory::MemoryBank;
use crate::metrics::MeanMetric;
use crate::model::LetheModel;

/// Append-only table of `(id, loss)` rows in evaluation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossTable {
    pub ids: Vec<i32>,
    pub losses: Vec<f64>,
}

impl LossTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn extend(&mut self, ids: &[i32], losses: &[f64]) -> TrainResult<()> {
        if ids.len() != losses.len() {
            return Err(shape_error(format!(
                "loss table: {} ids for {} losses",
                ids.len(),
                losses.len()
            )));
        }
        self.ids.extend_from_slice(ids);
        self.losses.extend_from_slice(losses);
        Ok(())
    }

    /// `<output_dir>/val_losses_step_<step>_rank_<rank>.safetensors`
    pub fn record_path(output_dir: &Path, step: usize, rank: usize) -> PathBuf {
        output_dir.join(format!("val_losses_step_{}_rank_{}.safetensors", step, rank))
    }

    /// Write columns `loss` (F64) and `id` (I32).
    pub fn write(&self, path: &Path) -> TrainResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        let n = self.len();
        let loss_bytes: Vec<u8> = self.losses.iter().flat_map(|v| v.to_le_bytes()).collect();
        let id_bytes: Vec<u8> = self.ids.iter().flat_map(|v| v.to_le_bytes()).collect();

        let to_err = |e: safetensors::SafeTensorError| checkpoint_error(e.to_string(), path);
        let loss = TensorView::new(Dtype::F64, vec![n], &loss_bytes).map_err(to_err)?;
        let id = TensorView::new(Dtype::I32, vec![n], &id_bytes).map_err(to_err)?;
        let columns: HashMap<String, TensorView<'_>> =
            [("loss".to_string(), loss), ("id".to_string(), id)].into();
        let bytes = safetensors::serialize(columns, &None).map_err(to_err)?;
        write_atomic(path, &bytes)
    }

    pub fn read(path: &Path) -> TrainResult<Self> {
        let bytes = std::fs::read(path).with_path(path)?;
        let to_err = |e: safetensors::SafeTensorError| checkpoint_error(e.to_string(), path);
        let st = SafeTensors::deserialize(&bytes).map_err(to_err)?;

        let loss = st.tensor("loss").map_err(to_err)?;
        let id = st.tensor("id").map_err(to_err)?;
        if loss.dtype() != Dtype::F64 || id.dtype() != Dtype::I32 {
            return Err(checkpoint_error(
                format!("unexpected column types {:?}/{:?}", loss.dtype(), id.dtype()),
                path,
            ));
        }
        let losses: Vec<f64> = loss
            .data()
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        let ids: Vec<i32> = id
            .data()
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if ids.len() != losses.len() {
            return Err(checkpoint_error("loss and id columns differ in length", path));
        }
        Ok(Self { ids, losses })
    }
}

/// Run one pass over `loader` without gradients.
///
/// Every batch index is visited on every rank so the loss gathers line up;
/// a rank whose shard is exhausted contributes an empty gather. The bank is
/// reset after each batch. Returns the mean of all gathered batch losses and
/// this rank's per-example rows.
pub fn evaluate(
    model: &LetheModel,
    bank: &mut MemoryBank,
    loader: &RetrievalLoader<'_>,
    dist: &dyn DistributedContext,
    config: &TrainConfig,
) -> TrainResult<(MeanMetric, LossTable)> {
    let mut val_loss = MeanMetric::new("val_loss");
    let mut table = LossTable::new();

    for i in 0..loader.n_batches() {
        let local = match loader.batch_at(i)? {
            Some(batch) => {
                batch.validate(config.num_neighbors_to_store)?;
                let result = (|| {
                    model.populate_batch(
                        bank,
                        &batch,
                        config.num_neighbors_to_store,
                        config.mem_chunk_size,
                    )?;
                    let out = model.answer(
                        bank,
                        &batch.input_ids,
                        &batch.attention_mask,
                        &batch.labels,
                    )?;
                    let per_example: Vec<f64> = per_example_loss(&out.logits, &batch.labels)?
                        .to_vec1::<f32>()?
                        .into_iter()
                        .map(f64::from)
                        .collect();
                    let loss = out.loss.to_scalar::<f32>()? as f64;
                    Ok::<_, TrainError>((loss, per_example))
                })();
                bank.reset_all();
                let (loss, per_example) = result?;
                table.extend(&batch.ids, &per_example)?;
                vec![loss]
            }
            None => Vec::new(),
        };
        let gathered = dist.all_gather(&local)?;
        val_loss.update_many(&gathered)?;
    }

    Ok((val_loss, table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticRetrievalDataset;
    use crate::distributed::SingleProcess;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn test_loss_table_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = LossTable::record_path(dir.path(), 40, 1);
        assert!(path.ends_with("val_losses_step_40_rank_1.safetensors"));

        let mut table = LossTable::new();
        table.extend(&[7, 3, 9], &[1.25, 0.5, 2.0]).unwrap();
        table.write(&path).unwrap();
        assert_eq!(LossTable::read(&path).unwrap(), table);
    }

    #[test]
    fn test_empty_table_is_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.safetensors");
        LossTable::new().write(&path).unwrap();
        assert!(LossTable::read(&path).unwrap().is_empty());
    }

    #[test]
    fn test_extend_rejects_mismatched_columns() {
        let mut table = LossTable::new();
        assert!(table.extend(&[1, 2], &[0.1]).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_evaluate_one_row_per_example_and_clean_bank() {
        let config = TrainConfig::tiny_cpu();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = LetheModel::new(&config, vb).unwrap();
        let mut bank = MemoryBank::from_config(&config);

        let ds = SyntheticRetrievalDataset::new(64, 6, 3, 4, 5, 3);
        let loader = RetrievalLoader::for_evaluation(&ds, config.batch_size, 0, 1, &Device::Cpu);
        let (metric, table) = evaluate(&model, &mut bank, &loader, &SingleProcess, &config).unwrap();

        assert_eq!(table.len(), 5);
        let mut ids = table.ids.clone();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(metric.count(), 3);
        assert!(metric.compute().unwrap().is_finite());
        assert!(bank.is_empty());
    }
}
