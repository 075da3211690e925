//! Solver configuration.
//!
//! The solver takes its configuration explicitly at construction; there are
//! no ambient globals. `load`/`save` persist the configuration as JSON next
//! to the rest of the engine state.

use crate::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persistent configuration for the solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Maximum concurrent worker invocations. Fast-key probing is never
    /// subject to this cap.
    pub max_parallelism: usize,
    /// Path of the cache database.
    pub cache_db_path: PathBuf,
    /// Cache records older than this are dropped by `prune`.
    pub keep_duration_secs: u64,
    /// Buffer size of the progress broadcast channel.
    pub progress_buffer: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            cache_db_path: PathBuf::from("cache.db"),
            keep_duration_secs: 14 * 24 * 3600,
            progress_buffer: 256,
        }
    }
}

impl SolverConfig {
    /// Load configuration from disk, falling back to defaults if the file
    /// does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| KilnError::InvalidConfig {
            reason: format!("failed to read config: {}", e),
        })?;
        serde_json::from_str(&content).map_err(|e| KilnError::InvalidConfig {
            reason: format!("failed to parse config: {}", e),
        })
    }

    /// Save configuration to disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KilnError::InvalidConfig {
                reason: format!("failed to create {}: {}", parent.display(), e),
            })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| KilnError::InvalidConfig {
            reason: format!("failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content).map_err(|e| KilnError::InvalidConfig {
            reason: format!("failed to write config: {}", e),
        })
    }
}
