//! # dataset-archiver
//!
//! Library for archiving public datasets into immutable, versioned deposition stores.
//!
//! ## How a run works
//!
//! A [`TaskSource`] yields [`FetchTask`]s, one per partition of a dataset (a year, a
//! state, a form). The [`RunOrchestrator`] fetches them concurrently into a local
//! staging area, compares the result with the latest published version, stages the
//! changed files into a draft of the [`Depositor`], validates the proposed version
//! and then publishes it, leaves it as a draft for review, or discards it when
//! nothing changed. Every run ends with a [`RunSummary`] on disk, which is also what
//! a failed run is resumed from.
//!
//! ## Quick Start
//!
//! ```no_run
//! use dataset_archiver::{
//!     Config, FetchTask, PartitionKey, RunOrchestrator, StaticTaskSource, depositor,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::for_dataset("eia860");
//!     config.run.auto_publish = true;
//!
//!     let source: StaticTaskSource = (2019..=2023)
//!         .map(|year| {
//!             FetchTask::file(
//!                 PartitionKey::single("year", year),
//!                 format!("https://example.org/eia860/{year}.zip"),
//!                 "zip",
//!             )
//!         })
//!         .collect();
//!
//!     let depositor = depositor::from_config(&config.depositor, None)?;
//!     let orchestrator = RunOrchestrator::new(config, depositor)?;
//!     dataset_archiver::cancel_on_signal(orchestrator.cancellation_token());
//!
//!     let summary = orchestrator.run(&source).await;
//!     println!("{} finished: {:?}", summary.run_id, summary.outcome);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Change detection against the prior version
pub mod change;
/// Configuration types
pub mod config;
/// Deposition backends
pub mod depositor;
/// Error types
pub mod error;
/// Resource fetching and staging
pub mod fetcher;
/// Run state machine
pub mod orchestrator;
/// Retry logic with exponential backoff
pub mod retry;
/// Fetch task sources
pub mod source;
/// Persistent run summaries
pub mod summary;
/// Core domain types
pub mod types;
/// Utility functions
pub mod utils;
/// Validation checks
pub mod validation;

// Re-export commonly used types
pub use change::{ChangeDetector, ChangeEntry, ChangeKind, ChangeSet};
pub use config::{
    Config, Credentials, DepositorConfig, PartitionFilter, RemovedPolicy, RetryConfig,
    RunSettings, StorageConfig, ValidationConfig, ZenodoConfig, ZipLayout,
};
pub use depositor::{Depositor, ManifestTarget, StorageDepositor, ZenodoDepositor};
pub use error::{DepositorError, Error, FetchError, PublishError, Result, ResumeError};
pub use fetcher::ResourceFetcher;
pub use orchestrator::RunOrchestrator;
pub use source::{ChannelTaskSource, StaticTaskSource, TaskSource};
pub use summary::{RunOutcome, RunState, RunSummary, TaskFailure, TaskSuccess};
pub use types::{
    BundlePart, DepositionManifest, DraftHandle, FetchPayload, FetchRequest, FetchTask,
    Fingerprint, ManifestEntry, PartitionKey, PartitionValue, PublishedVersionId, RemoteFileId,
    ResourceInfo,
};
pub use validation::{
    ValidationCheck, ValidationContext, ValidationEngine, ValidationReport, ValidationResult,
    ValidationStatus,
};

/// Cancel `token` when the process receives a termination signal.
///
/// Spawns a background task, so it must be called from within a tokio runtime.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// A run whose token is cancelled stops dispatching fetches, lets in-flight fetches
/// finish and ends FAILED with its summary written, ready to be resumed.
pub fn cancel_on_signal(token: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => {
                tracing::info!("cancelling run");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal handlers may fail to register in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
