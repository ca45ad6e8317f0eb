//! Publishing checkpoints to a model registry.
//!
//! Publishing is best effort: the trainer logs a failure and keeps going.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{TrainError, TrainResult};

/// Somewhere finished checkpoints can be pushed to.
pub trait ModelRegistry: Send {
    /// Publish the checkpoint in `dir` under `name`.
    fn publish(&mut self, name: &str, dir: &Path) -> TrainResult<()>;
}

/// Registry backed by a local directory: `publish` copies the checkpoint to
/// `<root>/<name>/`, replacing any earlier copy.
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn publish_error(name: &str, message: impl std::fmt::Display) -> TrainError {
    TrainError::Publish {
        name: name.to_string(),
        message: message.to_string(),
    }
}

impl ModelRegistry for DirectoryRegistry {
    fn publish(&mut self, name: &str, dir: &Path) -> TrainResult<()> {
        if !dir.is_dir() {
            return Err(publish_error(
                name,
                format!("{} is not a checkpoint directory", dir.display()),
            ));
        }
        let target = self.root.join(name);
        if target.exists() {
            fs::remove_dir_all(&target).map_err(|e| publish_error(name, e))?;
        }
        fs::create_dir_all(&target).map_err(|e| publish_error(name, e))?;

        let entries = fs::read_dir(dir).map_err(|e| publish_error(name, e))?;
        for entry in entries {
            let path = entry.map_err(|e| publish_error(name, e))?.path();
            if path.is_file() {
                if let Some(file_name) = path.file_name() {
                    fs::copy(&path, target.join(file_name)).map_err(|e| publish_error(name, e))?;
                }
            }
        }
        info!(name = name, target = %target.display(), "Checkpoint published");
        Ok(())
    }
}

/// Registry name for an epoch checkpoint: `<save_name>-epoch_<n>`.
pub fn epoch_publish_name(save_name: &str, epoch: usize) -> String {
    format!("{}-epoch_{}", save_name, epoch)
}
