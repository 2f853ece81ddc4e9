//! Per-run staging directory

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;

const PARTIAL_DIR: &str = ".partial";

/// Local staging area of one run: `<staging_root>/<dataset>/<run id>`
///
/// Finished resources live directly in the run directory under their deposition
/// filename. In-progress downloads and bundle parts live under `.partial/` and only
/// reach the run directory through a rename once they passed their integrity checks.
#[derive(Clone, Debug)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Create (or reuse) the staging directory of a run
    pub async fn create(root: &Path, dataset: &str, run_id: &str) -> Result<Self> {
        let dir = root.join(dataset).join(run_id);
        tokio::fs::create_dir_all(dir.join(PARTIAL_DIR)).await?;
        debug!(dir = %dir.display(), "staging area ready");
        Ok(Self { dir })
    }

    /// Run directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where a finished resource is staged
    pub fn final_path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Where a resource is assembled before it is promoted
    pub fn partial_path(&self, filename: &str) -> PathBuf {
        self.dir.join(PARTIAL_DIR).join(filename)
    }

    /// Scratch file for the raw bytes of one part of a packaged resource
    pub fn scratch_path(&self, filename: &str, part: usize) -> PathBuf {
        self.dir
            .join(PARTIAL_DIR)
            .join(format!("{filename}.{part}.raw"))
    }

    /// Remove every trace of a resource: scratch parts, partial and final file
    pub async fn discard(&self, filename: &str) {
        let partial_dir = self.dir.join(PARTIAL_DIR);
        if let Ok(mut entries) = tokio::fs::read_dir(&partial_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_name().to_string_lossy().starts_with(filename) {
                    remove_if_exists(&entry.path()).await;
                }
            }
        }
        remove_if_exists(&self.final_path(filename)).await;
    }

    /// Remove scratch parts once a packaged resource has been assembled
    pub async fn clear_scratch(&self, filename: &str, parts: usize) {
        for part in 0..parts {
            remove_if_exists(&self.scratch_path(filename, part)).await;
        }
    }

    /// Delete the whole run directory
    pub async fn cleanup(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                debug!(dir = %self.dir.display(), "staging area removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove staged file");
    }
}
