use crate::error::{JoinError, Result};
use crate::shared::files::DEFAULT_CHUNK_BYTES;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tuning knobs of a join run. Every field has a default, so a config file only needs
/// to name what it changes; unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JoinConfig {
    /// gzip level of the data outputs; 0 writes plain text.
    pub compression_level: u32,
    /// Bytes requested from a decoder per read.
    pub chunk_bytes: usize,
    /// Decode each partition on its own worker thread.
    pub prefetch: bool,
    pub prefetch_batch_lines: usize,
    pub prefetch_queue_batches: usize,
    /// Draw a progress bar when stderr is a terminal.
    pub progress: bool,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            prefetch: false,
            prefetch_batch_lines: 1024,
            prefetch_queue_batches: 16,
            progress: true,
        }
    }
}

impl JoinConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            JoinError::Config(format!("reading {}: {e}", path.display()))
        })?;
        let config: JoinConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(JoinError::Config(format!(
                "compression_level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        for (name, value) in [
            ("chunk_bytes", self.chunk_bytes),
            ("prefetch_batch_lines", self.prefetch_batch_lines),
            ("prefetch_queue_batches", self.prefetch_queue_batches),
        ] {
            if value == 0 {
                return Err(JoinError::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}
