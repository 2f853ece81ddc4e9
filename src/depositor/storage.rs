//! Filesystem depositor
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/<dataset>/draft/               open draft (at most one)
//! <root>/<dataset>/draft/.draft.json    draft id and the version it started from
//! <root>/<dataset>/published/v1/        immutable published versions
//! <root>/<dataset>/published/v2/
//! ```
//!
//! A new draft starts as a copy of the latest published version. Uploads land under
//! a temporary name and are renamed over the target, so a file in the draft is
//! always complete. Publishing renames the draft directory to the next version
//! number; discarding deletes it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{
    Depositor, ListedFile, ManifestTarget, manifest_document, merge_listing,
    parse_manifest_document,
};
use crate::error::{DepositorError, Error, Result};
use crate::types::{
    DepositionManifest, DraftHandle, MANIFEST_FILENAME, PublishedVersionId, RemoteFileId,
    ResourceInfo,
};
use crate::utils::{hash_file, write_atomic};

const DRAFT_DIR: &str = "draft";
const PUBLISHED_DIR: &str = "published";
const DRAFT_MARKER: &str = ".draft.json";

#[derive(Debug, Serialize, Deserialize)]
struct DraftMarker {
    id: String,
    base_version: Option<PublishedVersionId>,
}

/// Depositor keeping versions as directories on a local or mounted filesystem
#[derive(Clone, Debug)]
pub struct StorageDepositor {
    root: PathBuf,
}

impl StorageDepositor {
    /// Depositor rooted at `root`
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn dataset_dir(&self, dataset: &str) -> PathBuf {
        self.root.join(dataset)
    }

    fn draft_dir(&self, dataset: &str) -> PathBuf {
        self.dataset_dir(dataset).join(DRAFT_DIR)
    }

    fn published_dir(&self, dataset: &str) -> PathBuf {
        self.dataset_dir(dataset).join(PUBLISHED_DIR)
    }

    fn version_dir(&self, dataset: &str, version: &PublishedVersionId) -> PathBuf {
        self.published_dir(dataset).join(&version.0)
    }

    async fn read_marker(&self, dataset: &str) -> Result<Option<DraftMarker>> {
        match tokio::fs::read(self.draft_dir(dataset).join(DRAFT_MARKER)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Draft directory of a handle, if that draft is still the open one
    async fn checked_draft_dir(&self, draft: &DraftHandle) -> Result<PathBuf> {
        match self.read_marker(&draft.dataset).await? {
            Some(marker) if marker.id == draft.id => Ok(self.draft_dir(&draft.dataset)),
            _ => Err(DepositorError::DraftNotOpen {
                draft: draft.id.clone(),
            }
            .into()),
        }
    }

    /// Published version numbers in ascending order
    async fn version_numbers(&self, dataset: &str) -> Result<Vec<u64>> {
        let mut numbers = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.published_dir(dataset)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(numbers),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(n) = name
                .to_str()
                .and_then(|s| s.strip_prefix('v'))
                .and_then(|s| s.parse::<u64>().ok())
            {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    async fn manifest_in(
        &self,
        dataset: &str,
        dir: PathBuf,
        version: Option<String>,
    ) -> Result<DepositionManifest> {
        let document = match tokio::fs::read(dir.join(MANIFEST_FILENAME)).await {
            Ok(bytes) => parse_manifest_document(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let listing = tokio::task::spawn_blocking(move || list_dir(&dir))
            .await
            .map_err(|e| Error::Other(format!("listing task failed: {e}")))??;
        Ok(merge_listing(dataset, version, listing, document.as_ref()))
    }
}

/// List the data files of a version directory with their fingerprints
fn list_dir(dir: &Path) -> Result<Vec<ListedFile>> {
    let mut listing = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.file_type()?.is_file() {
            continue;
        }
        let (fingerprint, size) = hash_file(&entry.path())?;
        listing.push(ListedFile {
            remote_id: RemoteFileId(name.clone()),
            filename: name,
            fingerprint,
            size,
        });
    }
    Ok(listing)
}

async fn copy_dir_files(from: &Path, to: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(from).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::copy(entry.path(), to.join(entry.file_name())).await?;
        }
    }
    Ok(())
}

fn new_draft_id() -> String {
    format!(
        "draft-{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ"),
        std::process::id()
    )
}

#[async_trait]
impl Depositor for StorageDepositor {
    fn backend_name(&self) -> &'static str {
        "storage"
    }

    async fn open_draft(&self, dataset: &str) -> Result<DraftHandle> {
        if let Some(marker) = self.read_marker(dataset).await? {
            debug!(dataset, draft = %marker.id, "reusing open draft");
            return Ok(DraftHandle {
                dataset: dataset.to_string(),
                id: marker.id,
                base_version: marker.base_version,
                link: Some(self.draft_dir(dataset).display().to_string()),
            });
        }

        let base_version = self.latest_published(dataset).await?;
        let marker = DraftMarker {
            id: new_draft_id(),
            base_version: base_version.clone(),
        };

        // Assemble next to the final location, then rename into place
        let dataset_dir = self.dataset_dir(dataset);
        tokio::fs::create_dir_all(&dataset_dir).await?;
        let building = dataset_dir.join(format!(".{DRAFT_DIR}-{}", marker.id));
        tokio::fs::create_dir_all(&building).await?;
        if let Some(version) = &base_version {
            copy_dir_files(&self.version_dir(dataset, version), &building).await?;
        }
        tokio::fs::write(building.join(DRAFT_MARKER), serde_json::to_vec(&marker)?).await?;

        if let Err(e) = tokio::fs::rename(&building, self.draft_dir(dataset)).await {
            let _ = tokio::fs::remove_dir_all(&building).await;
            // Another process opened a draft first
            if let Some(existing) = self.read_marker(dataset).await? {
                return Ok(DraftHandle {
                    dataset: dataset.to_string(),
                    id: existing.id,
                    base_version: existing.base_version,
                    link: Some(self.draft_dir(dataset).display().to_string()),
                });
            }
            return Err(e.into());
        }

        info!(dataset, draft = %marker.id, base = ?base_version, "draft created");
        Ok(DraftHandle {
            dataset: dataset.to_string(),
            id: marker.id,
            base_version,
            link: Some(self.draft_dir(dataset).display().to_string()),
        })
    }

    async fn latest_published(&self, dataset: &str) -> Result<Option<PublishedVersionId>> {
        Ok(self
            .version_numbers(dataset)
            .await?
            .last()
            .map(|n| PublishedVersionId(format!("v{n}"))))
    }

    async fn manifest_of(&self, target: ManifestTarget<'_>) -> Result<DepositionManifest> {
        match target {
            ManifestTarget::Draft(draft) => {
                let dir = self.checked_draft_dir(draft).await?;
                self.manifest_in(&draft.dataset, dir, None).await
            }
            ManifestTarget::Published { dataset, version } => {
                let dir = self.version_dir(dataset, version);
                if !tokio::fs::try_exists(&dir).await? {
                    return Err(DepositorError::DepositionNotFound {
                        dataset: format!("{dataset}@{version}"),
                    }
                    .into());
                }
                self.manifest_in(dataset, dir, Some(version.0.clone())).await
            }
        }
    }

    async fn upload(&self, draft: &DraftHandle, resource: &ResourceInfo) -> Result<RemoteFileId> {
        let dir = self.checked_draft_dir(draft).await?;
        let tmp = dir.join(format!(".upload-{}", resource.filename));
        tokio::fs::copy(&resource.local_path, &tmp).await?;
        if let Err(e) = tokio::fs::rename(&tmp, dir.join(&resource.filename)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(draft = %draft.id, filename = %resource.filename, "uploaded");
        Ok(RemoteFileId(resource.filename.clone()))
    }

    async fn remove(&self, draft: &DraftHandle, file: &RemoteFileId) -> Result<()> {
        let dir = self.checked_draft_dir(draft).await?;
        if file.0.starts_with('.') || file.0.contains(['/', '\\']) {
            return Err(DepositorError::FileNotFound {
                draft: draft.id.clone(),
                filename: file.0.clone(),
            }
            .into());
        }
        match tokio::fs::remove_file(dir.join(&file.0)).await {
            Ok(()) => {
                debug!(draft = %draft.id, filename = %file, "removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DepositorError::FileNotFound {
                    draft: draft.id.clone(),
                    filename: file.0.clone(),
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_manifest(
        &self,
        draft: &DraftHandle,
        manifest: &DepositionManifest,
    ) -> Result<()> {
        let dir = self.checked_draft_dir(draft).await?;
        write_atomic(&dir.join(MANIFEST_FILENAME), &manifest_document(manifest)?).await
    }

    async fn publish(&self, draft: &DraftHandle) -> Result<PublishedVersionId> {
        let dir = self.checked_draft_dir(draft).await?;
        let next = self
            .version_numbers(&draft.dataset)
            .await?
            .last()
            .map_or(1, |n| n + 1);
        let version = PublishedVersionId(format!("v{next}"));
        let target = self.version_dir(&draft.dataset, &version);

        tokio::fs::create_dir_all(self.published_dir(&draft.dataset)).await?;
        tokio::fs::rename(&dir, &target).await?;
        tokio::fs::remove_file(target.join(DRAFT_MARKER)).await?;

        info!(dataset = %draft.dataset, %version, "published");
        Ok(version)
    }

    async fn discard(&self, draft: &DraftHandle) -> Result<()> {
        let dir = self.checked_draft_dir(draft).await?;
        tokio::fs::remove_dir_all(&dir).await?;
        info!(dataset = %draft.dataset, draft = %draft.id, "draft discarded");
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fingerprint, PartitionKey};
    use tempfile::TempDir;

    fn staged(dir: &Path, year: i64, content: &[u8]) -> ResourceInfo {
        let partition = PartitionKey::single("year", year);
        let filename = partition.filename("ds", "csv");
        let local_path = dir.join(&filename);
        std::fs::write(&local_path, content).unwrap();
        ResourceInfo {
            partition,
            filename,
            local_path,
            size: content.len() as u64,
            fingerprint: Fingerprint::of_bytes(content),
        }
    }

    #[tokio::test]
    async fn open_draft_is_idempotent() {
        let root = TempDir::new().unwrap();
        let depositor = StorageDepositor::new(root.path());

        let a = depositor.open_draft("ds").await.unwrap();
        let b = depositor.open_draft("ds").await.unwrap();

        assert_eq!(a, b);
        assert!(a.base_version.is_none());
    }

    #[tokio::test]
    async fn upload_overwrites_by_filename() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let depositor = StorageDepositor::new(root.path());
        let draft = depositor.open_draft("ds").await.unwrap();

        depositor
            .upload(&draft, &staged(staging.path(), 2020, b"first"))
            .await
            .unwrap();
        depositor
            .upload(&draft, &staged(staging.path(), 2020, b"second!"))
            .await
            .unwrap();

        let manifest = depositor
            .manifest_of(ManifestTarget::Draft(&draft))
            .await
            .unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(
            manifest.get("ds-year=2020.csv").unwrap().fingerprint,
            Fingerprint::of_bytes(b"second!")
        );
    }

    #[tokio::test]
    async fn publish_then_new_draft_starts_from_published_files() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let depositor = StorageDepositor::new(root.path());

        let draft = depositor.open_draft("ds").await.unwrap();
        let resource = staged(staging.path(), 2019, b"abc");
        depositor.upload(&draft, &resource).await.unwrap();
        let mut manifest = DepositionManifest::from_resources("ds", [&resource]);
        manifest.version = None;
        depositor.write_manifest(&draft, &manifest).await.unwrap();
        let v1 = depositor.publish(&draft).await.unwrap();
        assert_eq!(v1, PublishedVersionId("v1".into()));

        let published = depositor
            .manifest_of(ManifestTarget::Published {
                dataset: "ds",
                version: &v1,
            })
            .await
            .unwrap();
        assert_eq!(
            published.get("ds-year=2019.csv").unwrap().partition,
            PartitionKey::single("year", 2019)
        );

        let next = depositor.open_draft("ds").await.unwrap();
        assert_ne!(next.id, draft.id);
        assert_eq!(next.base_version, Some(v1));
        let copied = depositor
            .manifest_of(ManifestTarget::Draft(&next))
            .await
            .unwrap();
        assert_eq!(copied.digest(), published.digest());
    }

    #[tokio::test]
    async fn stale_handle_is_rejected_after_discard() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let depositor = StorageDepositor::new(root.path());
        let draft = depositor.open_draft("ds").await.unwrap();

        depositor.discard(&draft).await.unwrap();

        let err = depositor
            .upload(&draft, &staged(staging.path(), 2020, b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "draft_not_open");
        assert_eq!(depositor.latest_published("ds").await.unwrap(), None);
    }

    #[tokio::test]
    async fn removing_missing_file_reports_file_not_found() {
        let root = TempDir::new().unwrap();
        let depositor = StorageDepositor::new(root.path());
        let draft = depositor.open_draft("ds").await.unwrap();

        let err = depositor
            .remove(&draft, &RemoteFileId("nope.zip".into()))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "file_not_found");

        let err = depositor
            .remove(&draft, &RemoteFileId(DRAFT_MARKER.into()))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "file_not_found");
    }
}
