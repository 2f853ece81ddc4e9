//! Change detection against a prior deposition version

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::RemovedPolicy;
use crate::types::{DepositionManifest, Fingerprint, ManifestEntry, PartitionKey, ResourceInfo};

/// Classification of one partition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// Not present in the prior version
    Created,
    /// Present with a different fingerprint
    Updated,
    /// Present with the same fingerprint
    Unchanged,
    /// Only present in the prior version
    Removed,
}

/// One classified file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Partition the file holds
    pub partition: PartitionKey,
    /// Classification
    pub kind: ChangeKind,
    /// Size in the prior version
    pub old_size: Option<u64>,
    /// Size in this run
    pub new_size: Option<u64>,
    /// Fingerprint in this run (absent for removed files)
    pub fingerprint: Option<Fingerprint>,
}

impl ChangeEntry {
    /// Signed size change in bytes
    pub fn size_delta(&self) -> i64 {
        let old = self.old_size.unwrap_or(0) as i128;
        let new = self.new_size.unwrap_or(0) as i128;
        (new - old).clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

/// Classification of every file present in the new run or the prior version
///
/// Keyed by deposition filename, which is derived from dataset and partition, so each
/// partition appears exactly once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
    entries: BTreeMap<String, ChangeEntry>,
}

impl ChangeSet {
    /// Entry for a filename
    pub fn get(&self, filename: &str) -> Option<&ChangeEntry> {
        self.entries.get(filename)
    }

    /// All entries in filename order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ChangeEntry)> {
        self.entries.iter()
    }

    /// Entries of one kind
    pub fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = (&String, &ChangeEntry)> {
        self.entries.iter().filter(move |(_, e)| e.kind == kind)
    }

    /// Number of entries of one kind
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.of_kind(kind).count()
    }

    /// Total number of classified files
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was classified
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// No created, updated or removed files
    pub fn is_noop(&self) -> bool {
        self.entries
            .values()
            .all(|e| e.kind == ChangeKind::Unchanged)
    }
}

/// Compares a fetched resource set with the manifest of the prior version
pub struct ChangeDetector;

impl ChangeDetector {
    /// Classify new resources against a prior manifest
    ///
    /// Comparison is by fingerprint only: a file whose content changed but kept its
    /// size is still UPDATED.
    pub fn classify(new_resources: &[ResourceInfo], prior: &DepositionManifest) -> ChangeSet {
        let mut entries = BTreeMap::new();

        for resource in new_resources {
            let previous = prior.get(&resource.filename);
            let kind = match previous {
                None => ChangeKind::Created,
                Some(p) if p.fingerprint != resource.fingerprint => ChangeKind::Updated,
                Some(_) => ChangeKind::Unchanged,
            };
            entries.insert(
                resource.filename.clone(),
                ChangeEntry {
                    partition: resource.partition.clone(),
                    kind,
                    old_size: previous.map(|p| p.size),
                    new_size: Some(resource.size),
                    fingerprint: Some(resource.fingerprint.clone()),
                },
            );
        }

        for (filename, entry) in &prior.entries {
            if !entries.contains_key(filename) {
                entries.insert(
                    filename.clone(),
                    ChangeEntry {
                        partition: entry.partition.clone(),
                        kind: ChangeKind::Removed,
                        old_size: Some(entry.size),
                        new_size: None,
                        fingerprint: None,
                    },
                );
            }
        }

        ChangeSet { entries }
    }
}

/// Filenames to delete from the draft for removed partitions
///
/// Nothing is deleted under [`RemovedPolicy::Retain`]: a partition missing because of
/// a transient fetch failure must not erase history.
pub fn plan_removals(changes: &ChangeSet, policy: RemovedPolicy) -> Vec<String> {
    match policy {
        RemovedPolicy::Retain => Vec::new(),
        RemovedPolicy::Prune => changes
            .of_kind(ChangeKind::Removed)
            .map(|(name, _)| name.clone())
            .collect(),
    }
}

/// Manifest the new version will have once the draft is reconciled
///
/// New resources, plus removed partitions carried over from the prior version
/// when they are retained.
pub fn proposed_manifest(
    dataset: &str,
    new_resources: &[ResourceInfo],
    prior: &DepositionManifest,
    policy: RemovedPolicy,
) -> DepositionManifest {
    let mut manifest = DepositionManifest::from_resources(dataset, new_resources);
    if policy == RemovedPolicy::Retain {
        for (filename, entry) in &prior.entries {
            manifest
                .entries
                .entry(filename.clone())
                .or_insert_with(|| ManifestEntry {
                    remote_id: None,
                    ..entry.clone()
                });
        }
    }
    manifest
}
