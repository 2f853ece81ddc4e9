//! Test configuration helpers: isolated directories, a mock source server and
//! orchestrators wired to a filesystem depositor

use dataset_archiver::{
    Config, DepositorConfig, RetryConfig, RunOrchestrator, StorageConfig, StorageDepositor,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::MockServer;

/// Dataset id used by every integration test
pub const DATASET: &str = "ds";

/// One isolated test environment
///
/// Keep it alive for the duration of the test: dropping it deletes the staging and
/// archive directories and shuts the mock server down.
pub struct TestEnv {
    /// Temp directory holding staging, summaries and the archive root
    pub dir: TempDir,
    /// Mock server the fetch tasks download from
    pub server: MockServer,
}

impl TestEnv {
    /// Fresh environment with an empty archive
    pub async fn start() -> Self {
        Self {
            dir: tempfile::tempdir().expect("temp dir"),
            server: MockServer::start().await,
        }
    }

    /// Root of the filesystem depositor
    pub fn archive_root(&self) -> PathBuf {
        self.dir.path().join("archive")
    }

    /// Directory of a published version (`v1`, `v2`, ...)
    pub fn published_dir(&self, version: &str) -> PathBuf {
        self.archive_root()
            .join(DATASET)
            .join("published")
            .join(version)
    }

    /// Directory of the open draft
    pub fn draft_dir(&self) -> PathBuf {
        self.archive_root().join(DATASET).join("draft")
    }

    /// Path a run summary is written to
    pub fn summary_path(&self, name: &str) -> PathBuf {
        self.dir.path().join("summaries").join(format!("{name}.json"))
    }

    /// Configuration with fast retries and the filesystem depositor
    pub fn config(&self) -> Config {
        config_for(self.dir.path(), &self.archive_root())
    }

    /// Orchestrator for `config` against this environment's archive
    pub fn orchestrator(&self, config: Config) -> RunOrchestrator {
        orchestrator_at(config, &self.archive_root())
    }
}

/// Configuration staging under `base` and archiving into `archive_root`
pub fn config_for(base: &Path, archive_root: &Path) -> Config {
    let mut config = Config::for_dataset(DATASET);
    config.staging_dir = base.join("staging");
    config.min_free_space = 0;
    config.max_concurrent_fetches = 3;
    config.request_timeout = Duration::from_secs(10);
    config.retry = fast_retry(2);
    config.depositor = DepositorConfig::Storage(StorageConfig {
        root: archive_root.to_path_buf(),
    });
    config
}

/// Retry policy without noticeable delays
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Orchestrator using a filesystem depositor rooted at `archive_root`
pub fn orchestrator_at(config: Config, archive_root: &Path) -> RunOrchestrator {
    RunOrchestrator::new(config, Arc::new(StorageDepositor::new(archive_root)))
        .expect("valid test config")
}
