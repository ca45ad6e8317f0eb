//! Error types for the Lethe training loop.
//!
//! Shape and overflow errors are fatal by policy: they propagate out of the
//! step loop and abort the process. Registry failures are the only errors the
//! orchestrator swallows.

use thiserror::Error;

/// Main error type for training operations
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TrainError {
    /// Errors from the Candle tensor library
    #[error("Candle error: {0}")]
    Candle(String),

    /// Malformed batch or activation shapes
    #[error("Data shape error: {0}")]
    DataShape(String),

    /// A store would write past the fixed capacity of a memory index
    #[error(
        "Memory index overflow at layer {layer}: batch element {element} holds {stored} entries, \
         store of {requested} exceeds capacity {capacity}"
    )]
    MemoryOverflow {
        layer: usize,
        element: usize,
        stored: usize,
        requested: usize,
        capacity: usize,
    },

    /// Loss became NaN or infinite while being aggregated
    #[error("Non-finite loss in metric '{metric}': {value}")]
    NonFiniteLoss { metric: String, value: f64 },

    /// Checkpoint save/load failures
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// Optimizer-specific errors
    #[error("Optimizer error: {0}")]
    Optimizer(String),

    /// Data loading failures
    #[error("Data loading error: {0}")]
    DataLoading(String),

    /// Configuration validation failures
    #[error("Configuration error: {0}")]
    Config(String),

    /// Collective operation failures
    #[error("Distributed error on rank {rank}: {message}")]
    Distributed { rank: usize, message: String },

    /// Model registry publish failures
    #[error("Publish of '{name}' failed: {message}")]
    Publish { name: String, message: String },

    /// I/O errors with path context
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },
}

/// Result type alias for training operations
pub type TrainResult<T> = std::result::Result<T, TrainError>;

impl TrainError {
    /// Errors that must abort training rather than be retried or skipped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TrainError::Publish { .. })
    }

    /// Get the path associated with this error (if any)
    pub fn path(&self) -> Option<&str> {
        match self {
            TrainError::Checkpoint { path, .. } => Some(path),
            TrainError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for TrainError {
    fn from(err: candle_core::Error) -> Self {
        TrainError::Candle(err.to_string())
    }
}

impl From<std::io::Error> for TrainError {
    fn from(err: std::io::Error) -> Self {
        TrainError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

impl From<serde_json::Error> for TrainError {
    fn from(err: serde_json::Error) -> Self {
        TrainError::DataLoading(format!("json: {}", err))
    }
}

/// Helper trait for adding path context to IO operations
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T> {
        self.map_err(|e| TrainError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating checkpoint errors
pub fn checkpoint_error<P: AsRef<std::path::Path>>(
    message: impl Into<String>,
    path: P,
) -> TrainError {
    TrainError::Checkpoint {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

/// Helper for creating data-shape errors
pub fn shape_error(message: impl Into<String>) -> TrainError {
    TrainError::DataShape(message.into())
}

/// Helper for creating config errors
pub fn config_error(message: impl Into<String>) -> TrainError {
    TrainError::Config(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_publish_errors_are_non_fatal() {
        let publish = TrainError::Publish {
            name: "lethe-epoch_0".to_string(),
            message: "registry offline".to_string(),
        };
        assert!(!publish.is_fatal());
        assert!(shape_error("ids length 3 != batch 2").is_fatal());
        assert!(TrainError::NonFiniteLoss {
            metric: "train_loss".to_string(),
            value: f64::NAN,
        }
        .is_fatal());
    }

    #[test]
    fn test_overflow_message_names_layer_and_capacity() {
        let err = TrainError::MemoryOverflow {
            layer: 3,
            element: 1,
            stored: 4,
            requested: 1,
            capacity: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("layer 3"));
        assert!(msg.contains("capacity 4"));
    }

    #[test]
    fn test_path_extraction() {
        let err = checkpoint_error("failed", "/tmp/checkpoint");
        assert_eq!(err.path(), Some("/tmp/checkpoint"));

        let other_err = TrainError::Optimizer("failed".to_string());
        assert_eq!(other_err.path(), None);
    }

    #[test]
    fn test_io_with_path() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        let train_result: TrainResult<()> = result.with_path("/tmp/missing.txt");

        match train_result {
            Err(TrainError::Io { path, .. }) => assert_eq!(path, "/tmp/missing.txt"),
            _ => panic!("Expected IO error with path"),
        }
    }

    #[test]
    fn test_candle_error_converts() {
        let err: TrainError = candle_core::Error::Msg("shape mismatch".to_string()).into();
        assert!(matches!(err, TrainError::Candle(_)));
    }
}
