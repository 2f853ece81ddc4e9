//! Built-in validation checks

use std::collections::BTreeSet;

use super::filetype::{validate_file, zip_entry_names};
use super::{ValidationCheck, ValidationContext, ValidationResult};
use crate::change::ChangeKind;
use crate::config::RemovedPolicy;
use crate::fetcher::archive::verify_zip;
use crate::types::{PartitionKey, ResourceInfo};

/// Most names listed in a single note
const NOTE_LIMIT: usize = 10;

fn list<I: IntoIterator<Item = String>>(items: I) -> String {
    let items: Vec<String> = items.into_iter().collect();
    if items.len() <= NOTE_LIMIT {
        items.join(", ")
    } else {
        format!(
            "{} and {} more",
            items[..NOTE_LIMIT].join(", "),
            items.len() - NOTE_LIMIT
        )
    }
}

fn is_zip(resource: &ResourceInfo) -> bool {
    resource
        .local_path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

/// Resources staged by this run that were not already committed to the draft
fn fresh(ctx: &ValidationContext) -> impl Iterator<Item = &ResourceInfo> {
    ctx.resources
        .iter()
        .filter(move |r| !ctx.committed.contains(&r.filename))
}

fn is_allowed_absent(ctx: &ValidationContext, partition: &PartitionKey) -> bool {
    ctx.settings.allowed_absent.contains(partition)
}

/// Every staged archive can be listed and decompressed
pub struct IntegrityCheck;

impl ValidationCheck for IntegrityCheck {
    fn name(&self) -> &'static str {
        "integrity"
    }

    fn evaluate(&self, ctx: &ValidationContext) -> ValidationResult {
        let mut broken = Vec::new();
        let mut checked = 0usize;
        for resource in fresh(ctx).filter(|r| is_zip(r)) {
            checked += 1;
            if let Err(e) = verify_zip(&resource.local_path) {
                broken.push(format!("{} ({e})", resource.filename));
            }
        }

        if broken.is_empty() {
            ValidationResult::pass(self.name(), format!("{checked} archive(s) verified"))
        } else {
            ValidationResult::fail(self.name(), format!("corrupt archives: {}", list(broken)))
        }
    }
}

/// Staged files parse as the type their extension names
///
/// CSV, XML, XLSX and zip archives (with their members) are checked; other types
/// pass. Empty files are left to [`EmptyFileCheck`].
pub struct FileTypeCheck;

impl ValidationCheck for FileTypeCheck {
    fn name(&self) -> &'static str {
        "file_type"
    }

    fn evaluate(&self, ctx: &ValidationContext) -> ValidationResult {
        let invalid: Vec<String> = fresh(ctx)
            .filter(|r| r.size > 0)
            .filter_map(|r| {
                validate_file(&r.filename, &r.local_path)
                    .err()
                    .map(|reason| format!("{} ({reason})", r.filename))
            })
            .collect();

        if invalid.is_empty() {
            ValidationResult::pass(self.name(), "staged files match their types")
        } else {
            ValidationResult::fail(self.name(), format!("invalid files: {}", list(invalid)))
        }
    }
}

/// Staged zip archives hold exactly the entries of the configured layout
pub struct ZipLayoutCheck;

impl ValidationCheck for ZipLayoutCheck {
    fn name(&self) -> &'static str {
        "zip_layout"
    }

    fn evaluate(&self, ctx: &ValidationContext) -> ValidationResult {
        let Some(layout) = &ctx.settings.zip_layout else {
            return ValidationResult::pass(self.name(), "no zip layout configured");
        };

        let mut problems = Vec::new();
        for resource in fresh(ctx).filter(|r| is_zip(r)) {
            let names: BTreeSet<String> = match zip_entry_names(&resource.local_path) {
                Ok(names) => names.into_iter().collect(),
                Err(reason) => {
                    problems.push(format!("{} ({reason})", resource.filename));
                    continue;
                }
            };
            let unexpected: Vec<String> =
                names.difference(&layout.file_paths).cloned().collect();
            let missing: Vec<String> = layout.file_paths.difference(&names).cloned().collect();
            if !unexpected.is_empty() {
                problems.push(format!(
                    "{} has unexpected entries: {}",
                    resource.filename,
                    list(unexpected)
                ));
            }
            if !missing.is_empty() {
                problems.push(format!(
                    "{} is missing entries: {}",
                    resource.filename,
                    list(missing)
                ));
            }
        }

        if problems.is_empty() {
            ValidationResult::pass(
                self.name(),
                format!("archives match the {}-entry layout", layout.file_paths.len()),
            )
        } else {
            ValidationResult::fail(self.name(), problems.join("; "))
        }
    }
}

/// Every expected partition was produced, or is allow-listed as absent
pub struct CompletenessCheck;

impl ValidationCheck for CompletenessCheck {
    fn name(&self) -> &'static str {
        "completeness"
    }

    fn evaluate(&self, ctx: &ValidationContext) -> ValidationResult {
        if ctx.settings.expected_partitions.is_empty() {
            return ValidationResult::pass(self.name(), "no expected partitions configured");
        }

        let produced: BTreeSet<&PartitionKey> =
            ctx.resources.iter().map(|r| &r.partition).collect();
        let missing: Vec<String> = ctx
            .settings
            .expected_partitions
            .iter()
            .filter(|p| !produced.contains(p) && !is_allowed_absent(ctx, p))
            .map(|p| p.to_string())
            .collect();

        if missing.is_empty() {
            ValidationResult::pass(
                self.name(),
                format!(
                    "all {} expected partition(s) present",
                    ctx.settings.expected_partitions.len()
                ),
            )
        } else {
            ValidationResult::fail(
                self.name(),
                format!("missing partitions: {}", list(missing)),
            )
        }
    }
}

/// Aggregate size stays within the configured shrink fraction and growth multiple
///
/// Shrinking past the tolerance fails; growing past the multiple warns.
pub struct SizeDeltaCheck;

impl ValidationCheck for SizeDeltaCheck {
    fn name(&self) -> &'static str {
        "size_delta"
    }

    fn evaluate(&self, ctx: &ValidationContext) -> ValidationResult {
        let old = ctx.prior.total_size();
        let new = ctx.proposed.total_size();
        if old == 0 {
            return ValidationResult::pass(self.name(), format!("no prior version, {new} bytes"));
        }

        let ratio = new as f64 / old as f64;
        let shrink = 1.0 - ratio;
        let note = format!("{old} -> {new} bytes ({:+.1}%)", (ratio - 1.0) * 100.0);

        if shrink > ctx.settings.max_shrink_fraction {
            ValidationResult::fail(
                self.name(),
                format!(
                    "{note}: shrank by more than {:.0}%",
                    ctx.settings.max_shrink_fraction * 100.0
                ),
            )
        } else if ratio > ctx.settings.max_growth_multiple {
            ValidationResult::warn(
                self.name(),
                format!(
                    "{note}: grew by more than {}x",
                    ctx.settings.max_growth_multiple
                ),
            )
        } else {
            ValidationResult::pass(self.name(), note)
        }
    }
}

/// Reports whether the new version would differ from the prior one
pub struct NoOpCheck;

impl ValidationCheck for NoOpCheck {
    fn name(&self) -> &'static str {
        "no_op"
    }

    fn evaluate(&self, ctx: &ValidationContext) -> ValidationResult {
        if ctx.changes.is_noop() {
            ValidationResult::pass(self.name(), "no changes relative to the prior version")
        } else {
            ValidationResult::pass(
                self.name(),
                format!(
                    "{} created, {} updated, {} removed",
                    ctx.changes.count(ChangeKind::Created),
                    ctx.changes.count(ChangeKind::Updated),
                    ctx.changes.count(ChangeKind::Removed)
                ),
            )
        }
    }
}

/// No staged resource is empty
pub struct EmptyFileCheck;

impl ValidationCheck for EmptyFileCheck {
    fn name(&self) -> &'static str {
        "empty_files"
    }

    fn evaluate(&self, ctx: &ValidationContext) -> ValidationResult {
        let empty: Vec<String> = ctx
            .resources
            .iter()
            .filter(|r| r.size == 0)
            .map(|r| r.filename.clone())
            .collect();
        if empty.is_empty() {
            ValidationResult::pass(self.name(), "no empty files")
        } else {
            ValidationResult::fail(self.name(), format!("empty files: {}", list(empty)))
        }
    }
}

/// Updated files did not change size by more than the configured fraction
pub struct FileSizeChangeCheck;

impl ValidationCheck for FileSizeChangeCheck {
    fn name(&self) -> &'static str {
        "file_size_change"
    }

    fn evaluate(&self, ctx: &ValidationContext) -> ValidationResult {
        let tolerance = ctx.settings.max_file_size_change;
        let swings: Vec<String> = ctx
            .changes
            .of_kind(ChangeKind::Updated)
            .filter_map(|(name, entry)| {
                let old = entry.old_size.filter(|s| *s > 0)?;
                let change = entry.size_delta().unsigned_abs() as f64 / old as f64;
                (change > tolerance).then(|| format!("{name} ({:+})", entry.size_delta()))
            })
            .collect();

        if swings.is_empty() {
            ValidationResult::pass(self.name(), "updated files within tolerance")
        } else {
            ValidationResult::warn(
                self.name(),
                format!(
                    "size changed by more than {:.0}%: {}",
                    tolerance * 100.0,
                    list(swings)
                ),
            )
        }
    }
}

/// Partitions present in the prior version but missing from this run
///
/// Warns when they are retained, fails when they would be pruned, unless every one
/// of them is allow-listed as absent.
pub struct RemovedPartitionsCheck;

impl ValidationCheck for RemovedPartitionsCheck {
    fn name(&self) -> &'static str {
        "removed_partitions"
    }

    fn evaluate(&self, ctx: &ValidationContext) -> ValidationResult {
        let removed: Vec<String> = ctx
            .changes
            .of_kind(ChangeKind::Removed)
            .filter(|(_, entry)| !is_allowed_absent(ctx, &entry.partition))
            .map(|(name, _)| name.clone())
            .collect();

        if removed.is_empty() {
            return ValidationResult::pass(self.name(), "no unexpected removals");
        }
        match ctx.removed_policy {
            RemovedPolicy::Retain => ValidationResult::warn(
                self.name(),
                format!("not produced by this run, retained: {}", list(removed)),
            ),
            RemovedPolicy::Prune => ValidationResult::fail(
                self.name(),
                format!("would be pruned: {}", list(removed)),
            ),
        }
    }
}
