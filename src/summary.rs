//! Persistent record of one archive run
//!
//! A [`RunSummary`] is written at the end of every run, whatever its outcome. It is
//! the only input needed to resume a failed run: it records the draft the run
//! owned, a digest of that draft's manifest, and which tasks succeeded or failed.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use crate::change::ChangeSet;
use crate::config::Config;
use crate::error::{Error, FetchError, Result};
use crate::types::{
    DepositionManifest, DraftHandle, FetchTask, PartitionKey, PublishedVersionId, ResourceInfo,
};
use crate::validation::ValidationReport;

/// Stage of the run state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Loading configuration, prior manifest and draft
    Init,
    /// Dispatching fetch tasks
    Fetching,
    /// Fetches finished and the draft is being reconciled
    Staged,
    /// Running validation checks
    Validating,
    /// Draft left open for review
    DraftReady,
    /// Publishing the draft
    Publishing,
    /// New version published
    Published,
    /// Abandoning an unchanged draft
    Discarding,
    /// Draft discarded
    Discarded,
    /// Run stopped on an error
    Failed,
}

impl RunState {
    /// Whether the state machine stops here
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::DraftReady | RunState::Published | RunState::Discarded | RunState::Failed
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Init => "INIT",
            RunState::Fetching => "FETCHING",
            RunState::Staged => "STAGED",
            RunState::Validating => "VALIDATING",
            RunState::DraftReady => "DRAFT_READY",
            RunState::Publishing => "PUBLISHING",
            RunState::Published => "PUBLISHED",
            RunState::Discarding => "DISCARDING",
            RunState::Discarded => "DISCARDED",
            RunState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Final outcome of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    /// A new version was published
    Published,
    /// The draft was left open for review
    Drafted,
    /// Nothing changed and the draft was discarded
    Discarded,
    /// The run stopped on an error
    Failed,
}

/// A task that produced a staged resource
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSuccess {
    /// The task as dispatched
    pub task: FetchTask,
    /// What it produced
    pub resource: ResourceInfo,
}

/// A task that failed permanently
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// The task as dispatched
    pub task: FetchTask,
    /// Display text of the final error
    pub cause: String,
    /// Machine-readable code of the final error
    pub code: String,
    /// Attempts made (0 when the task was never dispatched)
    pub attempts: u32,
}

impl TaskFailure {
    /// Failure record for a task whose fetch gave up
    pub fn from_fetch_error(task: FetchTask, error: &FetchError) -> Self {
        Self {
            task,
            cause: error.cause.clone(),
            code: error.code.clone(),
            attempts: error.attempts,
        }
    }

    /// Failure record for a task rejected because its filename is already claimed
    pub fn filename_collision(
        task: FetchTask,
        filename: &str,
        owner: Option<&PartitionKey>,
    ) -> Self {
        let cause = match owner {
            Some(owner) => format!("filename {filename} is already produced by partition {owner}"),
            None => format!("filename {filename} is already committed to the draft"),
        };
        Self {
            task,
            cause,
            code: "filename_collision".to_string(),
            attempts: 0,
        }
    }

    /// Failure record for a task that was never dispatched because the run was cancelled
    pub fn cancelled(task: FetchTask) -> Self {
        Self {
            task,
            cause: "cancelled".to_string(),
            code: "cancelled".to_string(),
            attempts: 0,
        }
    }
}

/// Fatal error that ended a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// Machine-readable code
    pub code: String,
    /// Display text
    pub message: String,
}

impl From<&Error> for RunError {
    fn from(e: &Error) -> Self {
        Self {
            code: e.error_code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Record of one archive run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run id
    pub run_id: String,
    /// Dataset archived
    pub dataset: String,
    /// Backend the run deposited into
    pub backend: String,
    /// Configuration the run used
    pub config: Config,
    /// Run this one resumed, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Last state reached
    pub state: RunState,
    /// Final outcome (set when the run finishes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    /// Tasks that produced a resource
    #[serde(default)]
    pub successes: Vec<TaskSuccess>,
    /// Tasks that failed permanently
    #[serde(default)]
    pub failures: Vec<TaskFailure>,
    /// Classification against the prior published version
    #[serde(default)]
    pub changes: ChangeSet,
    /// Validation results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    /// Draft the run owned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<DraftHandle>,
    /// Manifest of the draft as this run last left it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_manifest: Option<DepositionManifest>,
    /// Digest of `draft_manifest`, compared on resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_manifest_digest: Option<String>,
    /// Version created when the run published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_version: Option<PublishedVersionId>,
    /// Identifier resolving to every version of the dataset, when the backend has one;
    /// set `depositor.concept_dois.<dataset>` to it so later runs add versions to the
    /// same record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept_doi: Option<String>,
    /// Fatal error, when the run failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunSummary {
    /// Fresh summary for a run starting now
    pub fn new(config: &Config, backend: &str) -> Self {
        Self {
            run_id: new_run_id(&config.dataset),
            dataset: config.dataset.clone(),
            backend: backend.to_string(),
            config: config.clone(),
            resumed_from: None,
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Init,
            outcome: None,
            successes: Vec::new(),
            failures: Vec::new(),
            changes: ChangeSet::default(),
            validation: None,
            draft: None,
            draft_manifest: None,
            draft_manifest_digest: None,
            published_version: None,
            concept_doi: None,
            error: None,
        }
    }

    /// Move to the next state
    pub fn transition(&mut self, state: RunState) {
        info!(run_id = %self.run_id, from = %self.state, to = %state, "run state change");
        self.state = state;
    }

    /// Record the draft manifest as the run leaves it
    pub fn record_draft_manifest(&mut self, manifest: DepositionManifest) {
        let digest = manifest.digest();
        debug!(run_id = %self.run_id, %digest, files = manifest.len(), "draft manifest recorded");
        self.draft_manifest_digest = Some(digest);
        self.draft_manifest = Some(manifest);
    }

    /// Close the summary with an outcome
    pub fn finish(&mut self, outcome: RunOutcome) {
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }

    /// Close the summary on a fatal error
    pub fn fail(&mut self, error: &Error) {
        self.error = Some(RunError::from(error));
        self.transition(RunState::Failed);
        self.finish(RunOutcome::Failed);
    }

    /// Number of distinct partitions the run accounted for
    pub fn partitions(&self) -> BTreeSet<&PartitionKey> {
        self.successes
            .iter()
            .map(|s| &s.task.partition)
            .chain(self.failures.iter().map(|f| &f.task.partition))
            .collect()
    }

    /// Whether every task of the run succeeded
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Write the summary as pretty JSON, atomically replacing any previous file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        crate::utils::write_atomic(path, &bytes).await?;
        debug!(run_id = %self.run_id, path = %path.display(), "run summary saved");
        Ok(())
    }

    /// Read a summary written by [`save`](Self::save)
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            Error::Config {
                message: format!("cannot read run summary {}: {e}", path.display()),
                key: Some("run.resume_from".to_string()),
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// `<dataset>-<UTC timestamp>-<random suffix>`
fn new_run_id(dataset: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x10000);
    format!(
        "{dataset}-{}-{suffix:04x}",
        Utc::now().format("%Y%m%dT%H%M%SZ")
    )
}
