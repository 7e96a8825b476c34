//! Results directory -- one timestamped directory per suite run, one JSON
//! document per phase.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

pub const THROUGHPUT_FILE: &str = "throughput.json";
pub const LATENCY_FILE: &str = "latency.json";
pub const FRAME_LOSS_FILE: &str = "frame_loss.json";
pub const BACK_TO_BACK_FILE: &str = "back_to_back.json";
pub const SOCKPERF_FILE: &str = "sockperf.json";
pub const RESULTS_FILE: &str = "results.json";

#[derive(Debug, Clone)]
pub struct ResultsDir {
    path: PathBuf,
}

impl ResultsDir {
    /// Create `<parent>/rfc2544_results_<YYYYmmdd_HHMMSS>`.
    pub fn create(parent: &Path, started: DateTime<Utc>) -> Result<Self> {
        let name = format!("rfc2544_results_{}", started.format("%Y%m%d_%H%M%S"));
        Self::create_named(&parent.join(name))
    }

    pub fn create_named(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create results directory {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pretty-printed JSON, staged next to the target and renamed into place.
    pub fn write_json<T: Serialize + ?Sized>(&self, file_name: &str, value: &T) -> Result<PathBuf> {
        let target = self.path.join(file_name);
        let staging = self.path.join(format!(".{}.tmp", file_name));
        let json = serde_json::to_string_pretty(value).context("failed to serialize results")?;
        std::fs::write(&staging, json)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        std::fs::rename(&staging, &target)
            .with_context(|| format!("failed to move results into {}", target.display()))?;
        debug!(path = %target.display(), "results written");
        Ok(target)
    }
}
