//! Depositor abstraction: lifecycle of a versioned deposition on one backend
//!
//! A deposition is a sequence of immutable published versions plus at most one open
//! draft. Runs stage files into the draft, then either publish it (creating a new
//! version) or discard it. Two backends ship:
//!
//! - [`ZenodoDepositor`]: research-data-repository REST API (drafts, buckets, publish)
//! - [`StorageDepositor`]: a directory tree emulating draft/publish with a working
//!   prefix that is renamed into a versioned prefix
//!
//! Besides its data files every version carries a `manifest.json` document holding the
//! [`DepositionManifest`], which is where partition keys live. File listings from the
//! backend stay authoritative for checksums, sizes and ids.

pub mod storage;
pub mod zenodo;

pub use storage::StorageDepositor;
pub use zenodo::ZenodoDepositor;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{Credentials, DepositorConfig};
use crate::error::Result;
use crate::types::{
    DepositionManifest, DraftHandle, Fingerprint, MANIFEST_FILENAME, ManifestEntry,
    PartitionKey, PublishedVersionId, RemoteFileId, ResourceInfo,
};

/// Which version's manifest to read
#[derive(Clone, Copy, Debug)]
pub enum ManifestTarget<'a> {
    /// The open draft
    Draft(&'a DraftHandle),
    /// An immutable published version
    Published {
        /// Dataset id
        dataset: &'a str,
        /// Version id
        version: &'a PublishedVersionId,
    },
}

/// Storage backend for versioned depositions
///
/// Implementations must make [`open_draft`](Depositor::open_draft) idempotent (one
/// draft per dataset at a time) and [`upload`](Depositor::upload) overwrite by
/// filename rather than duplicate.
#[async_trait]
pub trait Depositor: Send + Sync {
    /// Short backend name recorded in run summaries
    fn backend_name(&self) -> &'static str;

    /// Identifier resolving to every version of the dataset, once the backend knows it
    fn concept_doi(&self, _dataset: &str) -> Option<String> {
        None
    }

    /// Return the open draft of a dataset, creating one from the latest published
    /// version if none is open
    async fn open_draft(&self, dataset: &str) -> Result<DraftHandle>;

    /// Newest published version, if the dataset has been published before
    async fn latest_published(&self, dataset: &str) -> Result<Option<PublishedVersionId>>;

    /// Manifest of a draft or published version (excluding the manifest document)
    async fn manifest_of(&self, target: ManifestTarget<'_>) -> Result<DepositionManifest>;

    /// Upload a staged resource under its filename, replacing any existing file
    async fn upload(&self, draft: &DraftHandle, resource: &ResourceInfo) -> Result<RemoteFileId>;

    /// Remove a file from the draft
    async fn remove(&self, draft: &DraftHandle, file: &RemoteFileId) -> Result<()>;

    /// Store the manifest document in the draft
    async fn write_manifest(&self, draft: &DraftHandle, manifest: &DepositionManifest)
    -> Result<()>;

    /// Publish the draft as a new immutable version
    async fn publish(&self, draft: &DraftHandle) -> Result<PublishedVersionId>;

    /// Abandon the draft without touching published history
    async fn discard(&self, draft: &DraftHandle) -> Result<()>;
}

/// Build the depositor selected by the configuration
///
/// The REST backend needs credentials; they are read from the environment when
/// `credentials` is `None`.
pub fn from_config(
    config: &DepositorConfig,
    credentials: Option<Credentials>,
) -> Result<Arc<dyn Depositor>> {
    match config {
        DepositorConfig::Zenodo(zenodo) => {
            let credentials = match credentials {
                Some(c) => c,
                None => Credentials::from_env(zenodo.sandbox)?,
            };
            Ok(Arc::new(ZenodoDepositor::new(zenodo.clone(), credentials)?))
        }
        DepositorConfig::Storage(storage) => Ok(Arc::new(StorageDepositor::new(&storage.root))),
    }
}

/// One file as reported by a backend listing
#[derive(Clone, Debug)]
pub(crate) struct ListedFile {
    pub filename: String,
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub remote_id: RemoteFileId,
}

/// Serialize a manifest into the document stored alongside data files
pub(crate) fn manifest_document(manifest: &DepositionManifest) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(manifest)?)
}

/// Combine a backend listing with the partition keys of a manifest document
///
/// Files the document does not know about get a partition derived from their
/// filename so they are still tracked (and can be classified as removed).
pub(crate) fn merge_listing(
    dataset: &str,
    version: Option<String>,
    listing: Vec<ListedFile>,
    document: Option<&DepositionManifest>,
) -> DepositionManifest {
    let mut manifest = DepositionManifest::empty(dataset);
    manifest.version = version;
    for file in listing {
        if file.filename == MANIFEST_FILENAME {
            continue;
        }
        let partition = document
            .and_then(|d| d.get(&file.filename))
            .map(|e| e.partition.clone())
            .unwrap_or_else(|| PartitionKey::single("file", file.filename.as_str()));
        manifest.entries.insert(
            file.filename,
            ManifestEntry {
                partition,
                fingerprint: file.fingerprint,
                size: file.size,
                remote_id: Some(file.remote_id),
            },
        );
    }
    manifest
}

/// Parse a manifest document, ignoring one that is unreadable
pub(crate) fn parse_manifest_document(bytes: &[u8]) -> Option<DepositionManifest> {
    match serde_json::from_slice(bytes) {
        Ok(doc) => Some(doc),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unreadable manifest document");
            None
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn listed(name: &str, tag: &str) -> ListedFile {
        ListedFile {
            filename: name.to_string(),
            fingerprint: Fingerprint::of_bytes(tag.as_bytes()),
            size: tag.len() as u64,
            remote_id: RemoteFileId(format!("id-{name}")),
        }
    }

    #[test]
    fn listing_is_authoritative_and_document_supplies_partitions() {
        let mut document = DepositionManifest::empty("ds");
        document.entries.insert(
            "ds-2020.zip".into(),
            ManifestEntry {
                partition: PartitionKey::single("year", 2020),
                fingerprint: Fingerprint::of_bytes(b"stale"),
                size: 1,
                remote_id: None,
            },
        );

        let manifest = merge_listing(
            "ds",
            Some("2.0.0".into()),
            vec![
                listed("ds-2020.zip", "fresh"),
                listed("extra.csv", "x"),
                listed(MANIFEST_FILENAME, "{}"),
            ],
            Some(&document),
        );

        assert_eq!(manifest.len(), 2);
        let entry = manifest.get("ds-2020.zip").unwrap();
        assert_eq!(entry.partition, PartitionKey::single("year", 2020));
        assert_eq!(entry.fingerprint, Fingerprint::of_bytes(b"fresh"));
        assert_eq!(
            manifest.get("extra.csv").unwrap().partition,
            PartitionKey::single("file", "extra.csv")
        );
        assert_eq!(manifest.version.as_deref(), Some("2.0.0"));
    }

    #[test]
    fn manifest_document_round_trips() {
        let mut manifest = DepositionManifest::empty("ds");
        manifest.entries.insert(
            "ds-2021.zip".into(),
            ManifestEntry {
                partition: PartitionKey::single("year", 2021),
                fingerprint: Fingerprint::of_bytes(b"a"),
                size: 1,
                remote_id: None,
            },
        );
        let bytes = manifest_document(&manifest).unwrap();
        assert_eq!(parse_manifest_document(&bytes).unwrap(), manifest);
        assert!(parse_manifest_document(b"not json").is_none());
    }
}
