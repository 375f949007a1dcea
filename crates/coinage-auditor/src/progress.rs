//! Persistent progress of the deposit check

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AuditorError, Result};

/// Highest merchant confirmation row known to be matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressMarker {
    pub last_row_id: u64,
}

/// Progress marker kept in a JSON file
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored marker, or row 0 before the first pass
    pub fn load(&self) -> Result<ProgressMarker> {
        if !self.path.exists() {
            debug!("No progress at {}, starting from row 0", self.path.display());
            return Ok(ProgressMarker::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|e| {
            AuditorError::Progress(format!("{}: {}", self.path.display(), e))
        })
    }

    /// Replace the stored marker atomically
    pub fn save(&self, marker: &ProgressMarker) -> Result<()> {
        let content = serde_json::to_string_pretty(marker)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
