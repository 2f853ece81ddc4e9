//! Resuming a failed run from its summary
//!
//! A resumed run reuses the draft the failed run owned. It refuses to continue when
//! the backend hands out a different draft or when the draft's manifest no longer
//! matches the digest the failed run recorded, since something other than this tool
//! touched it in between.

use tracing::info;

use crate::error::{Error, ResumeError, Result};
use crate::summary::{RunOutcome, RunSummary, TaskSuccess};
use crate::types::{DepositionManifest, DraftHandle, FetchTask};

/// Work left over from a failed run
#[derive(Debug, Default)]
pub(crate) struct ResumePlan {
    /// Successes whose resource is already in the draft with the same fingerprint
    pub carried: Vec<TaskSuccess>,
    /// Failed tasks, plus successes that never reached the draft
    pub requeue: Vec<FetchTask>,
}

/// Reject summaries that cannot be resumed for `dataset`
pub(crate) fn check_resumable(prior: &RunSummary, dataset: &str) -> Result<()> {
    if prior.dataset != dataset {
        return Err(ResumeError::DatasetMismatch {
            expected: dataset.to_string(),
            found: prior.dataset.clone(),
        }
        .into());
    }

    let reason = match prior.outcome {
        Some(RunOutcome::Published) => Some("it already published a version"),
        Some(RunOutcome::Discarded) => Some("its draft was discarded"),
        _ if prior.draft.is_none() || prior.draft_manifest_digest.is_none() => {
            Some("it never recorded a draft")
        }
        _ => None,
    };
    match reason {
        Some(reason) => Err(not_resumable(prior, reason)),
        None => Ok(()),
    }
}

/// Check that the draft the backend returned is the one the failed run left behind
pub(crate) fn verify_draft(
    prior: &RunSummary,
    draft: &DraftHandle,
    current: &DepositionManifest,
) -> Result<()> {
    let (Some(expected), Some(digest)) = (&prior.draft, &prior.draft_manifest_digest) else {
        return Err(not_resumable(prior, "it never recorded a draft"));
    };

    if expected.id != draft.id {
        return Err(ResumeError::DraftMismatch {
            expected: expected.id.clone(),
            found: draft.id.clone(),
        }
        .into());
    }

    let found = current.digest();
    if &found != digest {
        return Err(ResumeError::DraftMutated {
            draft: draft.id.clone(),
            expected: digest.clone(),
            found,
        }
        .into());
    }
    Ok(())
}

/// Split the failed run's tasks into carried successes and tasks to fetch again
pub(crate) fn plan(prior: &RunSummary, current: &DepositionManifest) -> ResumePlan {
    let mut plan = ResumePlan::default();

    for success in &prior.successes {
        let committed = current
            .get(&success.resource.filename)
            .is_some_and(|e| e.fingerprint == success.resource.fingerprint);
        if committed {
            plan.carried.push(success.clone());
        } else {
            plan.requeue.push(success.task.clone());
        }
    }
    plan.requeue
        .extend(prior.failures.iter().map(|f| f.task.clone()));

    info!(
        resumed_run = %prior.run_id,
        carried = plan.carried.len(),
        requeued = plan.requeue.len(),
        "resume plan ready"
    );
    plan
}

fn not_resumable(prior: &RunSummary, reason: &str) -> Error {
    ResumeError::NotResumable {
        run_id: prior.run_id.clone(),
        reason: reason.to_string(),
    }
    .into()
}
