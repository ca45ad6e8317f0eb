//! Running loss aggregates and scalar metric sinks.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{IoResultExt, TrainError, TrainResult};

/// Running mean that refuses non-finite values.
#[derive(Debug, Clone)]
pub struct MeanMetric {
    name: String,
    sum: f64,
    count: u64,
}

impl MeanMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sum: 0.0,
            count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add one value. NaN or infinity fails immediately and leaves the
    /// aggregate unchanged.
    pub fn update(&mut self, value: f64) -> TrainResult<()> {
        if !value.is_finite() {
            return Err(TrainError::NonFiniteLoss {
                metric: self.name.clone(),
                value,
            });
        }
        self.sum += value;
        self.count += 1;
        Ok(())
    }

    /// Add several values; all are checked before any is added.
    pub fn update_many(&mut self, values: &[f64]) -> TrainResult<()> {
        if let Some(&bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(TrainError::NonFiniteLoss {
                metric: self.name.clone(),
                value: bad,
            });
        }
        self.sum += values.iter().sum::<f64>();
        self.count += values.len() as u64;
        Ok(())
    }

    /// Mean of everything added since the last reset, `None` if empty.
    pub fn compute(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// One named scalar tagged with a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub name: String,
    pub value: f64,
    pub step: usize,
}

/// Destination for scalar training metrics.
pub trait MetricsSink: Send {
    fn log(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()>;

    fn flush(&mut self) -> TrainResult<()> {
        Ok(())
    }

    /// Called once at the end of training.
    fn close(&mut self) -> TrainResult<()> {
        self.flush()
    }
}

/// Appends one JSON object per event to a file.
pub struct JsonlMetricsSink {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl JsonlMetricsSink {
    pub fn create(path: &Path) -> TrainResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_path(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn log(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()> {
        let event = MetricEvent {
            name: name.to_string(),
            value,
            step,
        };
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n").with_path(&self.path)?;
        Ok(())
    }

    fn flush(&mut self) -> TrainResult<()> {
        self.writer.flush().with_path(&self.path)
    }
}

/// Emits every event as a structured `tracing` record.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn log(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()> {
        info!(metric = name, value = value, step = step, event = "metric");
        Ok(())
    }
}

/// Keeps events in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct RecordingMetricsSink {
    events: Arc<Mutex<Vec<MetricEvent>>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events with the given name, in logging order.
    pub fn named(&self, name: &str) -> Vec<MetricEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name == name)
            .collect()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn log(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| TrainError::DataLoading("metrics buffer poisoned".to_string()))?;
        events.push(MetricEvent {
            name: name.to_string(),
            value,
            step,
        });
        Ok(())
    }
}

/// Console summary such as `[train] step 12 train_loss: 2.3100`.
pub fn format_metrics(stage: &str, step: usize, values: &[(&str, f64)]) -> String {
    let mut line = format!("[{}] step {}", stage, step);
    for (name, value) in values {
        line.push_str(&format!(" {}: {:.4}", name, value));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_metric_accumulates_and_resets() {
        let mut m = MeanMetric::new("train_loss");
        assert_eq!(m.compute(), None);
        m.update(1.0).unwrap();
        m.update_many(&[2.0, 3.0]).unwrap();
        assert_eq!(m.count(), 3);
        assert!((m.compute().unwrap() - 2.0).abs() < 1e-12);
        m.reset();
        assert_eq!(m.compute(), None);
    }

    #[test]
    fn test_non_finite_values_fail_without_side_effects() {
        let mut m = MeanMetric::new("val_loss");
        m.update(4.0).unwrap();
        assert!(matches!(
            m.update(f64::NAN),
            Err(TrainError::NonFiniteLoss { .. })
        ));
        assert!(m.update_many(&[1.0, f64::INFINITY]).is_err());
        assert_eq!(m.count(), 1);
        assert_eq!(m.compute(), Some(4.0));
    }

    #[test]
    fn test_jsonl_sink_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics/run.jsonl");
        let mut sink = JsonlMetricsSink::create(&path).unwrap();
        sink.log("loss", 2.5, 0).unwrap();
        sink.log("lr", 1e-4, 0).unwrap();
        sink.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let events: Vec<MetricEvent> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "loss");
        assert_eq!(events[1].value, 1e-4);
    }

    #[test]
    fn test_recording_sink_clones_share_buffer() {
        let sink = RecordingMetricsSink::new();
        let mut writer = sink.clone();
        writer.log("val_loss", 1.0, 5).unwrap();
        assert_eq!(sink.named("val_loss").len(), 1);
        assert!(sink.named("loss").is_empty());
    }

    #[test]
    fn test_format_metrics() {
        let line = format_metrics("val", 12, &[("val_loss", 2.31)]);
        assert_eq!(line, "[val] step 12 val_loss: 2.3100");
    }
}
