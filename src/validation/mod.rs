//! Validation of a proposed deposition version
//!
//! The engine runs every registered [`ValidationCheck`] over a [`ValidationContext`]
//! and collects one [`ValidationResult`] per check. Checks are pure functions of the
//! context (plus reads of staged files); they never touch the depositor.
//!
//! A single FAIL blocks automatic publication. WARNs block it too unless the run was
//! started with the override flag.

pub mod checks;
pub mod filetype;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::change::ChangeSet;
use crate::config::{RemovedPolicy, ValidationConfig};
use crate::types::{DepositionManifest, ResourceInfo};

/// Outcome of one check
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    /// Check passed
    Pass,
    /// Reviewable anomaly
    Warn,
    /// Hard failure
    Fail,
}

/// Result of one check
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Name of the check
    pub check: String,
    /// Outcome
    pub status: ValidationStatus,
    /// Human-readable explanation
    pub note: String,
}

impl ValidationResult {
    /// Passing result
    pub fn pass(check: &str, note: impl Into<String>) -> Self {
        Self::new(check, ValidationStatus::Pass, note)
    }

    /// Warning result
    pub fn warn(check: &str, note: impl Into<String>) -> Self {
        Self::new(check, ValidationStatus::Warn, note)
    }

    /// Failing result
    pub fn fail(check: &str, note: impl Into<String>) -> Self {
        Self::new(check, ValidationStatus::Fail, note)
    }

    fn new(check: &str, status: ValidationStatus, note: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            status,
            note: note.into(),
        }
    }
}

/// Everything a check may look at
#[derive(Clone, Debug)]
pub struct ValidationContext {
    /// Dataset id
    pub dataset: String,
    /// Resources staged by this run
    pub resources: Vec<ResourceInfo>,
    /// Filenames carried over from an earlier attempt of the same run, already
    /// verified and committed to the draft
    pub committed: BTreeSet<String>,
    /// Manifest of the prior published version
    pub prior: DepositionManifest,
    /// Manifest the new version will have
    pub proposed: DepositionManifest,
    /// Classification of the new run against the prior version
    pub changes: ChangeSet,
    /// Thresholds
    pub settings: ValidationConfig,
    /// Policy for partitions missing from this run
    pub removed_policy: RemovedPolicy,
}

/// A single validation rule
pub trait ValidationCheck: Send + Sync {
    /// Stable name recorded in results
    fn name(&self) -> &'static str;

    /// Evaluate the rule
    fn evaluate(&self, ctx: &ValidationContext) -> ValidationResult;
}

/// Results of every registered check for one run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// One result per check, in registration order
    pub results: Vec<ValidationResult>,
    /// The new version would be identical to the prior one
    pub unchanged: bool,
}

impl ValidationReport {
    /// Any check failed
    pub fn has_failures(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.status == ValidationStatus::Fail)
    }

    /// Any check warned
    pub fn has_warnings(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.status == ValidationStatus::Warn)
    }

    /// Whether automatic publication may proceed
    pub fn allows_publish(&self, override_warnings: bool) -> bool {
        !self.has_failures() && (override_warnings || !self.has_warnings())
    }

    /// Result of a check by name
    pub fn get(&self, check: &str) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.check == check)
    }
}

/// Ordered set of checks
#[derive(Clone, Default)]
pub struct ValidationEngine {
    checks: Vec<Arc<dyn ValidationCheck>>,
}

impl std::fmt::Debug for ValidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.checks.iter().map(|c| c.name()))
            .finish()
    }
}

impl ValidationEngine {
    /// Engine with no checks
    pub fn empty() -> Self {
        Self::default()
    }

    /// Engine with the built-in checks
    pub fn with_default_checks() -> Self {
        let mut engine = Self::empty();
        engine
            .register(checks::IntegrityCheck)
            .register(checks::FileTypeCheck)
            .register(checks::ZipLayoutCheck)
            .register(checks::CompletenessCheck)
            .register(checks::SizeDeltaCheck)
            .register(checks::NoOpCheck)
            .register(checks::EmptyFileCheck)
            .register(checks::FileSizeChangeCheck)
            .register(checks::RemovedPartitionsCheck);
        engine
    }

    /// Add a check; it runs after those already registered
    pub fn register(&mut self, check: impl ValidationCheck + 'static) -> &mut Self {
        self.checks.push(Arc::new(check));
        self
    }

    /// Names of the registered checks
    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run every check
    pub fn evaluate(&self, ctx: &ValidationContext) -> ValidationReport {
        let results: Vec<ValidationResult> = self
            .checks
            .iter()
            .map(|check| {
                let result = check.evaluate(ctx);
                match result.status {
                    ValidationStatus::Pass => {}
                    ValidationStatus::Warn => {
                        warn!(check = %result.check, note = %result.note, "validation warning")
                    }
                    ValidationStatus::Fail => {
                        warn!(check = %result.check, note = %result.note, "validation failed")
                    }
                }
                result
            })
            .collect();

        let report = ValidationReport {
            results,
            unchanged: ctx.changes.is_noop(),
        };
        info!(
            dataset = %ctx.dataset,
            checks = report.results.len(),
            failures = report.has_failures(),
            warnings = report.has_warnings(),
            unchanged = report.unchanged,
            "validation complete"
        );
        report
    }
}
