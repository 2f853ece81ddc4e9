//! Run orchestration: the state machine driving one archive run
//!
//! ```text
//! INIT → FETCHING → STAGED → VALIDATING ─┬→ DRAFT_READY
//!                                        ├→ PUBLISHING → PUBLISHED
//!                                        └→ DISCARDING → DISCARDED
//! any state ──(fatal error or cancellation)──→ FAILED
//! ```
//!
//! A run owns exactly one draft. Fetches run concurrently up to
//! [`Config::max_concurrent_fetches`]; everything that touches the depositor runs
//! sequentially from this module. Whatever the outcome, the [`RunSummary`] is
//! written to disk before [`RunOrchestrator::run`] returns.

mod fetching;
mod resume;

use futures::StreamExt;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::change::{ChangeDetector, plan_removals, proposed_manifest};
use crate::config::Config;
use crate::depositor::{Depositor, ManifestTarget};
use crate::error::{DepositorError, Error, FetchError, Result};
use crate::fetcher::ResourceFetcher;
use crate::fetcher::staging::StagingArea;
use crate::source::TaskSource;
use crate::summary::{RunOutcome, RunState, RunSummary};
use crate::types::{
    DepositionManifest, DraftHandle, FetchTask, ManifestEntry, RemoteFileId, ResourceInfo,
};
use crate::validation::{ValidationContext, ValidationEngine};

/// Where a run gets its tasks from
enum RunInput<'a> {
    Fresh(&'a dyn TaskSource),
    Resume(&'a RunSummary),
}

/// Drives archive runs for one dataset against one depositor
pub struct RunOrchestrator {
    config: Config,
    depositor: Arc<dyn Depositor>,
    validation: ValidationEngine,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RunOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOrchestrator")
            .field("dataset", &self.config.dataset)
            .field("backend", &self.depositor.backend_name())
            .field("validation", &self.validation)
            .finish()
    }
}

impl RunOrchestrator {
    /// Create an orchestrator with the built-in validation checks
    pub fn new(config: Config, depositor: Arc<dyn Depositor>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            depositor,
            validation: ValidationEngine::with_default_checks(),
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the validation engine
    #[must_use]
    pub fn with_validation(mut self, engine: ValidationEngine) -> Self {
        self.validation = engine;
        self
    }

    /// Token that stops dispatching new fetches when cancelled
    ///
    /// In-flight fetches finish; tasks not yet started are recorded as cancelled and
    /// the run ends FAILED with its summary persisted.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Configuration of this orchestrator
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Where the summary of `run_id` is written
    ///
    /// `run.summary_path` when configured, otherwise
    /// `<staging_dir>/<dataset>/summaries/<run_id>.json`.
    pub fn summary_path(&self, run_id: &str) -> PathBuf {
        self.config.run.summary_path.clone().unwrap_or_else(|| {
            self.config
                .staging_dir
                .join(&self.config.dataset)
                .join("summaries")
                .join(format!("{run_id}.json"))
        })
    }

    /// Execute one run
    ///
    /// When `run.resume_from` is configured the summary at that path is resumed and
    /// `source` is not consulted.
    pub async fn run(&self, source: &dyn TaskSource) -> RunSummary {
        if let Some(path) = &self.config.run.resume_from {
            return match RunSummary::load(path).await {
                Ok(prior) => self.resume(&prior).await,
                Err(e) => {
                    let mut summary = self.new_summary();
                    self.finish(&mut summary, Err(e)).await;
                    summary
                }
            };
        }

        let mut summary = self.new_summary();
        let result = self.execute(&mut summary, RunInput::Fresh(source)).await;
        self.finish(&mut summary, result).await;
        summary
    }

    /// Resume a failed run from its summary
    ///
    /// Only previously failed tasks and successes that never reached the draft are
    /// fetched again. Fails fast when the draft changed since `prior` was written.
    pub async fn resume(&self, prior: &RunSummary) -> RunSummary {
        let mut summary = self.new_summary();
        summary.resumed_from = Some(prior.run_id.clone());
        info!(run_id = %summary.run_id, resumed_run = %prior.run_id, "resuming run");
        let result = self.execute(&mut summary, RunInput::Resume(prior)).await;
        self.finish(&mut summary, result).await;
        summary
    }

    fn new_summary(&self) -> RunSummary {
        RunSummary::new(&self.config, self.depositor.backend_name())
    }

    async fn finish(&self, summary: &mut RunSummary, result: Result<RunOutcome>) {
        match result {
            Ok(outcome) => {
                summary.finish(outcome);
                info!(
                    run_id = %summary.run_id,
                    dataset = %summary.dataset,
                    outcome = ?outcome,
                    succeeded = summary.successes.len(),
                    failed = summary.failures.len(),
                    "run finished"
                );
            }
            Err(e) => {
                error!(run_id = %summary.run_id, state = %summary.state, error = %e, "run failed");
                summary.fail(&e);
            }
        }

        let path = self.summary_path(&summary.run_id);
        if let Err(e) = summary.save(&path).await {
            error!(run_id = %summary.run_id, path = %path.display(), error = %e, "failed to persist run summary");
        } else {
            info!(run_id = %summary.run_id, path = %path.display(), "run summary written");
        }
    }

    async fn execute(&self, summary: &mut RunSummary, input: RunInput<'_>) -> Result<RunOutcome> {
        let staging =
            StagingArea::create(&self.config.staging_dir, &self.config.dataset, &summary.run_id)
                .await?;
        let result = self.drive(summary, input, &staging).await;
        if self.config.run.keep_staging {
            debug!(dir = %staging.dir().display(), "keeping staging area");
        } else if let Err(e) = staging.cleanup().await {
            warn!(dir = %staging.dir().display(), error = %e, "failed to clean staging area");
        }
        result
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn drive(
        &self,
        summary: &mut RunSummary,
        input: RunInput<'_>,
        staging: &StagingArea,
    ) -> Result<RunOutcome> {
        let dataset = self.config.dataset.as_str();
        let settings = &self.config.run;
        let depositor = self.depositor.as_ref();

        // INIT
        if let RunInput::Resume(prior) = &input {
            resume::check_resumable(prior, dataset)?;
        }
        let draft = depositor.open_draft(dataset).await?;
        summary.draft = Some(draft.clone());

        let prior_manifest = match depositor.latest_published(dataset).await? {
            Some(version) => {
                depositor
                    .manifest_of(ManifestTarget::Published {
                        dataset,
                        version: &version,
                    })
                    .await?
            }
            None => DepositionManifest::empty(dataset),
        };
        let mut draft_manifest = depositor.manifest_of(ManifestTarget::Draft(&draft)).await?;

        let (prepared, carried) = match input {
            RunInput::Fresh(source) => {
                let tasks: Vec<FetchTask> = source.tasks().collect().await;
                let prepared = fetching::prepare_tasks(
                    tasks,
                    settings.partition_filter.as_ref(),
                    dataset,
                    &BTreeSet::new(),
                );
                (prepared, Vec::new())
            }
            RunInput::Resume(prior) => {
                resume::verify_draft(prior, &draft, &draft_manifest)?;
                let plan = resume::plan(prior, &draft_manifest);
                let carried_files: BTreeSet<String> = plan
                    .carried
                    .iter()
                    .map(|s| s.resource.filename.clone())
                    .collect();
                let prepared =
                    fetching::prepare_tasks(plan.requeue, None, dataset, &carried_files);
                (prepared, plan.carried)
            }
        };
        let tasks = prepared.tasks;
        summary.record_draft_manifest(draft_manifest.clone());
        info!(
            run_id = %summary.run_id,
            dataset,
            draft = %draft.id,
            prior_version = ?prior_manifest.version,
            prior_files = prior_manifest.len(),
            tasks = tasks.len(),
            carried = carried.len(),
            rejected = prepared.rejected.len(),
            "run initialized"
        );

        // FETCHING
        summary.transition(RunState::Fetching);
        let fetcher = Arc::new(ResourceFetcher::new(&self.config, staging.clone())?);
        let round = fetching::dispatch(
            fetcher,
            tasks,
            self.config.max_concurrent_fetches,
            &self.cancel,
        )
        .await;
        let committed: BTreeSet<String> = carried
            .iter()
            .map(|s| s.resource.filename.clone())
            .collect();
        summary.successes = carried;
        summary.successes.extend(round.successes);
        summary.failures = prepared.rejected;
        summary.failures.extend(round.failures);
        if round.cancelled {
            return Err(Error::Cancelled);
        }
        if summary.successes.is_empty()
            && let Some(first) = summary.failures.first()
        {
            return Err(FetchError {
                partition: first.task.partition.clone(),
                cause: format!(
                    "all {} fetch task(s) failed, first cause: {}",
                    summary.failures.len(),
                    first.cause
                ),
                code: first.code.clone(),
                attempts: first.attempts,
            }
            .into());
        }

        // STAGED
        summary.transition(RunState::Staged);
        let resources: Vec<ResourceInfo> = summary
            .successes
            .iter()
            .map(|s| s.resource.clone())
            .collect();
        let changes = ChangeDetector::classify(&resources, &prior_manifest);
        let proposed =
            proposed_manifest(dataset, &resources, &prior_manifest, settings.removed_policy);
        summary.changes = changes.clone();
        self.checkpoint()?;
        self.reconcile(summary, &draft, &mut draft_manifest, &resources, &proposed)
            .await?;

        // VALIDATING
        summary.transition(RunState::Validating);
        let ctx = ValidationContext {
            dataset: dataset.to_string(),
            resources,
            committed,
            prior: prior_manifest,
            proposed,
            changes,
            settings: self.config.validation.clone(),
            removed_policy: settings.removed_policy,
        };
        let engine = self.validation.clone();
        let report = tokio::task::spawn_blocking(move || engine.evaluate(&ctx))
            .await
            .map_err(|e| Error::Other(format!("validation task failed: {e}")))?;
        summary.validation = Some(report.clone());

        if report.unchanged {
            summary.transition(RunState::Discarding);
            depositor.discard(&draft).await?;
            summary.transition(RunState::Discarded);
            return Ok(RunOutcome::Discarded);
        }

        if !report.allows_publish(settings.override_warnings) {
            info!(
                run_id = %summary.run_id,
                draft = %draft.id,
                failures = report.has_failures(),
                warnings = report.has_warnings(),
                "validation blocks publication, leaving draft for review"
            );
            summary.transition(RunState::DraftReady);
            return Ok(RunOutcome::Drafted);
        }
        if !settings.auto_publish {
            summary.transition(RunState::DraftReady);
            return Ok(RunOutcome::Drafted);
        }
        if report.has_warnings() {
            warn!(run_id = %summary.run_id, "publishing despite validation warnings (override set)");
        }

        self.checkpoint()?;
        summary.transition(RunState::Publishing);
        let version = depositor.publish(&draft).await?;
        info!(run_id = %summary.run_id, dataset, %version, "new version published");
        summary.published_version = Some(version);
        summary.concept_doi = depositor.concept_doi(dataset);
        summary.transition(RunState::Published);
        Ok(RunOutcome::Published)
    }

    /// Bring the draft in line with the proposed manifest
    ///
    /// Uploads run one at a time. The summary's draft manifest is updated after each
    /// backend call, so a run that fails halfway can still be resumed.
    async fn reconcile(
        &self,
        summary: &mut RunSummary,
        draft: &DraftHandle,
        draft_manifest: &mut DepositionManifest,
        resources: &[ResourceInfo],
        proposed: &DepositionManifest,
    ) -> Result<()> {
        let depositor = self.depositor.as_ref();
        let mut uploaded = 0usize;

        for resource in resources {
            let in_draft = draft_manifest
                .get(&resource.filename)
                .is_some_and(|e| e.fingerprint == resource.fingerprint);
            if in_draft {
                debug!(filename = %resource.filename, "already in draft");
                continue;
            }
            let remote_id = depositor.upload(draft, resource).await?;
            draft_manifest.entries.insert(
                resource.filename.clone(),
                ManifestEntry {
                    partition: resource.partition.clone(),
                    fingerprint: resource.fingerprint.clone(),
                    size: resource.size,
                    remote_id: Some(remote_id),
                },
            );
            summary.record_draft_manifest(draft_manifest.clone());
            uploaded += 1;
        }

        let pruned: BTreeSet<String> = plan_removals(&summary.changes, self.config.run.removed_policy)
            .into_iter()
            .collect();
        let orphans: Vec<(String, Option<RemoteFileId>)> = draft_manifest
            .entries
            .iter()
            .filter(|(name, _)| proposed.get(name).is_none())
            .map(|(name, entry)| (name.clone(), entry.remote_id.clone()))
            .collect();
        for (filename, remote_id) in &orphans {
            let reason = if pruned.contains(filename) {
                "pruning removed partition"
            } else {
                "removing file not in proposed version"
            };
            info!(%filename, draft = %draft.id, "{reason}");
            let id = remote_id
                .clone()
                .unwrap_or_else(|| RemoteFileId(filename.clone()));
            depositor.remove(draft, &id).await?;
            draft_manifest.entries.remove(filename);
            summary.record_draft_manifest(draft_manifest.clone());
        }

        let mut document = proposed.clone();
        for (name, entry) in document.entries.iter_mut() {
            entry.remote_id = draft_manifest.get(name).and_then(|e| e.remote_id.clone());
        }
        depositor.write_manifest(draft, &document).await?;

        let listed = depositor.manifest_of(ManifestTarget::Draft(draft)).await?;
        let diverged = diverging_files(proposed, &listed);
        *draft_manifest = listed.clone();
        summary.record_draft_manifest(listed);
        if !diverged.is_empty() {
            error!(
                draft = %draft.id,
                files = ?diverged,
                "draft listing differs from the proposed manifest"
            );
            return Err(DepositorError::DraftDiverged {
                draft: draft.id.clone(),
                files: diverged,
            }
            .into());
        }

        info!(
            draft = %draft.id,
            uploaded,
            removed = orphans.len(),
            files = draft_manifest.len(),
            "draft reconciled"
        );
        Ok(())
    }
}

/// Filenames whose fingerprint or size in `listed` differs from `proposed`, including
/// files present on only one side
fn diverging_files(proposed: &DepositionManifest, listed: &DepositionManifest) -> Vec<String> {
    let names: BTreeSet<&String> = proposed.entries.keys().chain(listed.entries.keys()).collect();
    names
        .into_iter()
        .filter(|name| {
            match (proposed.get(name.as_str()), listed.get(name.as_str())) {
                (Some(want), Some(have)) => {
                    want.fingerprint != have.fingerprint || want.size != have.size
                }
                _ => true,
            }
        })
        .cloned()
        .collect()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::depositor::StorageDepositor;
    use crate::source::StaticTaskSource;
    use crate::types::{Fingerprint, PartitionKey};
    use tempfile::tempdir;

    fn orchestrator(root: &std::path::Path) -> RunOrchestrator {
        let mut config = Config::for_dataset("ds");
        config.staging_dir = root.join("staging");
        RunOrchestrator::new(config, Arc::new(StorageDepositor::new(root.join("archive")))).unwrap()
    }

    #[test]
    fn diverging_files_names_changed_missing_and_extra_files() {
        let entry = |tag: &str, size: u64| ManifestEntry {
            partition: PartitionKey::single("file", tag),
            fingerprint: Fingerprint::of_bytes(tag.as_bytes()),
            size,
            remote_id: None,
        };
        let mut proposed = DepositionManifest::empty("ds");
        proposed.entries.insert("same.csv".into(), entry("same", 4));
        proposed.entries.insert("short.csv".into(), entry("short", 10));
        proposed.entries.insert("missing.csv".into(), entry("missing", 3));
        let mut listed = proposed.clone();
        listed.entries.get_mut("short.csv").unwrap().size = 5;
        listed.entries.remove("missing.csv");
        listed.entries.insert("extra.csv".into(), entry("extra", 1));
        listed.entries.get_mut("same.csv").unwrap().remote_id = Some(RemoteFileId("r".into()));

        assert_eq!(
            diverging_files(&proposed, &listed),
            vec!["extra.csv", "missing.csv", "short.csv"]
        );
        assert!(diverging_files(&proposed, &proposed).is_empty());
    }

    #[test]
    fn default_summary_path_lives_under_staging_dir() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        assert_eq!(
            orch.summary_path("run-1"),
            dir.path().join("staging/ds/summaries/run-1.json")
        );
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let dir = tempdir().unwrap();
        let mut config = Config::for_dataset("ds");
        config.max_concurrent_fetches = 0;
        let err = RunOrchestrator::new(config, Arc::new(StorageDepositor::new(dir.path())))
            .unwrap_err();
        assert_eq!(err.error_code(), "config_error");
    }

    #[tokio::test]
    async fn empty_source_discards_the_draft() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let summary = orch.run(&StaticTaskSource::new(Vec::new())).await;

        assert_eq!(summary.outcome, Some(RunOutcome::Discarded));
        assert_eq!(summary.state, RunState::Discarded);
        assert!(orch.summary_path(&summary.run_id).exists());
    }

    #[tokio::test]
    async fn unreadable_resume_summary_fails_the_run() {
        let dir = tempdir().unwrap();
        let mut config = Config::for_dataset("ds");
        config.staging_dir = dir.path().join("staging");
        config.run.resume_from = Some(dir.path().join("missing.json"));
        let orch =
            RunOrchestrator::new(config, Arc::new(StorageDepositor::new(dir.path().join("a"))))
                .unwrap();

        let summary = orch.run(&StaticTaskSource::new(Vec::new())).await;
        assert_eq!(summary.outcome, Some(RunOutcome::Failed));
        assert_eq!(summary.error.unwrap().code, "config_error");
    }
}
