//! Retrieval-augmented examples and the datasets that produce them.

use std::path::Path;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{shape_error, IoResultExt, TrainError, TrainResult};
use crate::loss::IGNORE_INDEX;

/// One question plus the context rows retrieved for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalExample {
    pub id: i32,
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<i64>,
    /// `n_candidates` rows of `s_mem` tokens, best match first.
    pub retrieved_context: Vec<Vec<u32>>,
}

impl RetrievalExample {
    /// Per-example structural checks (lengths line up, context is rectangular).
    pub fn check(&self) -> TrainResult<()> {
        let s = self.input_ids.len();
        if s == 0 {
            return Err(shape_error(format!("example {}: empty input_ids", self.id)));
        }
        if self.attention_mask.len() != s || self.labels.len() != s {
            return Err(shape_error(format!(
                "example {}: input_ids {} / attention_mask {} / labels {} lengths differ",
                self.id,
                s,
                self.attention_mask.len(),
                self.labels.len()
            )));
        }
        let Some(first) = self.retrieved_context.first() else {
            return Err(shape_error(format!(
                "example {}: no retrieved_context rows",
                self.id
            )));
        };
        if first.is_empty() || self.retrieved_context.iter().any(|r| r.len() != first.len()) {
            return Err(shape_error(format!(
                "example {}: retrieved_context rows must be non-empty and equal length",
                self.id
            )));
        }
        Ok(())
    }
}

/// A dataset of retrieval examples.
pub trait RetrievalDataset: Send + Sync {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn get_item(&self, idx: usize) -> RetrievalExample;
}

/// Pad token for questions and context rows.
pub const PAD_TOKEN: u32 = 0;
/// Marks the end of the question in synthetic examples.
pub const QUERY_TOKEN: u32 = 1;
/// Starts every synthetic question.
pub const BOS_TOKEN: u32 = 2;
const FIRST_CONTENT_TOKEN: u32 = 3;

/// Key/value lookup task whose answers exist only in the retrieved context.
///
/// Each example draws a fresh random mapping from keys to values. The
/// question is `[BOS, key, QUERY, value, PAD...]` with only the value
/// position labelled; row 0 of the context repeats `key value` pairs from the
/// mapping, the remaining rows hold distractor pairs. A model can only beat
/// chance on the value by reading its memory.
pub struct SyntheticRetrievalDataset {
    examples: Vec<RetrievalExample>,
}

impl SyntheticRetrievalDataset {
    pub fn new(
        vocab_size: u32,
        seq_len: usize,
        n_candidates: usize,
        ctx_len: usize,
        num_samples: usize,
        seed: u64,
    ) -> Self {
        assert!(seq_len >= 4, "seq_len must be >= 4");
        assert!(ctx_len >= 2, "ctx_len must be >= 2");
        assert!(n_candidates > 0, "n_candidates must be > 0");
        assert!(
            vocab_size >= FIRST_CONTENT_TOKEN + 3,
            "vocab_size too small for synthetic retrieval"
        );
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut content: Vec<u32> = (FIRST_CONTENT_TOKEN..vocab_size).collect();
        let mut examples = Vec::with_capacity(num_samples);

        for i in 0..num_samples {
            content.shuffle(&mut rng);
            let key = content[0];
            let value = content[1];

            let mut input_ids = vec![PAD_TOKEN; seq_len];
            let mut attention_mask = vec![0u32; seq_len];
            let mut labels = vec![IGNORE_INDEX; seq_len];
            input_ids[..4].copy_from_slice(&[BOS_TOKEN, key, QUERY_TOKEN, value]);
            attention_mask[..4].fill(1);
            labels[3] = value as i64;

            let mut retrieved_context = Vec::with_capacity(n_candidates);
            let answer_row: Vec<u32> = [key, value].iter().copied().cycle().take(ctx_len).collect();
            retrieved_context.push(answer_row);
            for _ in 1..n_candidates {
                let row: Vec<u32> = (0..ctx_len)
                    .map(|_| content[rng.gen_range(2..content.len())])
                    .collect();
                retrieved_context.push(row);
            }

            examples.push(RetrievalExample {
                id: i as i32,
                input_ids,
                attention_mask,
                labels,
                retrieved_context,
            });
        }

        Self { examples }
    }
}

impl RetrievalDataset for SyntheticRetrievalDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get_item(&self, idx: usize) -> RetrievalExample {
        self.examples[idx].clone()
    }
}

/// Pre-tokenized examples, one JSON object per line.
///
/// ```json
/// {"id": 7, "input_ids": [2, 41, 1, 9], "attention_mask": [1, 1, 1, 1],
///  "labels": [-100, -100, -100, 9], "retrieved_context": [[41, 9, 41, 9]]}
/// ```
pub struct JsonlRetrievalDataset {
    examples: Vec<RetrievalExample>,
}

impl JsonlRetrievalDataset {
    /// Unparseable lines are skipped with a warning; structurally invalid
    /// examples are an error.
    pub fn load(path: impl AsRef<Path>) -> TrainResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).with_path(path)?;
        let mut examples = Vec::new();

        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RetrievalExample>(line) {
                Ok(example) => {
                    example.check()?;
                    examples.push(example);
                }
                Err(e) => {
                    warn!(line = i + 1, path = %path.display(), error = %e, "Skipping malformed example");
                }
            }
        }

        if examples.is_empty() {
            return Err(TrainError::DataLoading(format!(
                "no examples loaded from {}",
                path.display()
            )));
        }
        Ok(Self { examples })
    }

    pub fn from_examples(examples: Vec<RetrievalExample>) -> TrainResult<Self> {
        for example in &examples {
            example.check()?;
        }
        Ok(Self { examples })
    }
}

impl RetrievalDataset for JsonlRetrievalDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get_item(&self, idx: usize) -> RetrievalExample {
        self.examples[idx].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_synthetic_examples_are_well_formed() {
        let ds = SyntheticRetrievalDataset::new(64, 8, 3, 6, 10, 42);
        assert_eq!(ds.len(), 10);
        for i in 0..ds.len() {
            let ex = ds.get_item(i);
            ex.check().unwrap();
            assert_eq!(ex.id, i as i32);
            assert_eq!(ex.input_ids.len(), 8);
            assert_eq!(ex.retrieved_context.len(), 3);
            assert!(ex.retrieved_context.iter().all(|r| r.len() == 6));
        }
    }

    #[test]
    fn test_synthetic_answer_lives_in_first_context_row() {
        let ds = SyntheticRetrievalDataset::new(64, 8, 2, 4, 5, 7);
        for i in 0..ds.len() {
            let ex = ds.get_item(i);
            let key = ex.input_ids[1];
            let value = ex.labels[3];
            assert_eq!(value, ex.input_ids[3] as i64);
            assert_eq!(ex.retrieved_context[0], vec![key, value as u32, key, value as u32]);
            assert_eq!(ex.labels.iter().filter(|&&l| l != IGNORE_INDEX).count(), 1);
        }
    }

    #[test]
    fn test_synthetic_is_deterministic_per_seed() {
        let a = SyntheticRetrievalDataset::new(64, 8, 2, 4, 5, 3);
        let b = SyntheticRetrievalDataset::new(64, 8, 2, 4, 5, 3);
        assert_eq!(a.get_item(4), b.get_item(4));
    }

    #[test]
    fn test_jsonl_load_skips_malformed_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"id": 1, "input_ids": [2, 5, 1, 9], "attention_mask": [1, 1, 1, 1], "labels": [-100, -100, -100, 9], "retrieved_context": [[5, 9], [7, 8]]}}"#
        )
        .unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();
        let ds = JsonlRetrievalDataset::load(file.path()).unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.get_item(0).retrieved_context.len(), 2);
    }

    #[test]
    fn test_jsonl_rejects_ragged_example() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"id": 1, "input_ids": [2, 5, 1], "attention_mask": [1, 1], "labels": [-100, -100, 9], "retrieved_context": [[5, 9]]}}"#
        )
        .unwrap();
        let err = JsonlRetrievalDataset::load(file.path()).err().unwrap();
        assert!(matches!(err, TrainError::DataShape(_)));
    }

    #[test]
    fn test_jsonl_empty_file_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(JsonlRetrievalDataset::load(file.path()).is_err());
    }
}
