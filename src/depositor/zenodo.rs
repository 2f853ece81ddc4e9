//! REST depositor for Zenodo-style research data repositories
//!
//! Protocol summary:
//! - the concept DOI of a dataset resolves to its latest published record
//!   (`GET /records/{concept id}`)
//! - `POST /records/{id}/versions` returns the open draft of a record, creating one
//!   if necessary, so draft creation is idempotent on the server side
//! - files are uploaded to the draft's bucket with `PUT {bucket}/{filename}`, which
//!   replaces an existing object of the same name
//! - publication uses the publish-scoped token and is never retried
//!
//! All other requests are retried on transient failures.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::{
    Depositor, ListedFile, ManifestTarget, manifest_document, merge_listing,
    parse_manifest_document,
};
use crate::config::{Credentials, ZenodoConfig};
use crate::error::{DepositorError, Error, PublishError, Result};
use crate::retry::with_retry;
use crate::types::{
    DepositionManifest, DraftHandle, Fingerprint, MANIFEST_FILENAME, PublishedVersionId,
    RemoteFileId, ResourceInfo,
};

const CONCEPT_DOI_PATTERN: &str = r"^10\.(5281|5072)/zenodo\.(\d+)$";
const PRODUCTION_DOI_PREFIX: &str = "10.5281";
const SANDBOX_DOI_PREFIX: &str = "10.5072";
/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Deserialize)]
struct Record {
    #[serde(deserialize_with = "id_string")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct Deposition {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default, deserialize_with = "opt_id_string")]
    conceptrecid: Option<String>,
    #[serde(default)]
    submitted: bool,
    #[serde(default)]
    links: DepositionLinks,
    #[serde(default)]
    files: Vec<DepositionFile>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct DepositionLinks {
    bucket: Option<String>,
    publish: Option<String>,
    discard: Option<String>,
    html: Option<String>,
    latest_draft: Option<String>,
    #[serde(rename = "self")]
    this: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DepositionFile {
    #[serde(deserialize_with = "id_string")]
    id: String,
    filename: String,
    filesize: u64,
    checksum: String,
    #[serde(default)]
    links: FileLinks,
}

#[derive(Debug, Default, Deserialize)]
struct FileLinks {
    #[serde(rename = "self")]
    this: Option<String>,
    download: Option<String>,
}

impl Deposition {
    fn title(&self) -> Option<&str> {
        self.metadata.get("title").and_then(|v| v.as_str())
    }

    fn version(&self) -> Option<String> {
        self.metadata
            .get("version")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn file(&self, filename: &str) -> Option<&DepositionFile> {
        self.files.iter().find(|f| f.filename == filename)
    }

    fn listing(&self) -> Vec<ListedFile> {
        self.files
            .iter()
            .map(|f| ListedFile {
                filename: f.filename.clone(),
                fingerprint: Fingerprint::from_checksum(&f.checksum),
                size: f.filesize,
                remote_id: RemoteFileId(f.filename.clone()),
            })
            .collect()
    }
}

/// Ids come back as numbers from some endpoints and strings from others
fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected id, got {other}"
        ))),
    }
}

fn opt_id_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected id, got {other}"
        ))),
    }
}

/// Record id embedded in a concept DOI such as `10.5281/zenodo.123`
pub fn concept_record_id(doi: &str) -> Result<String> {
    let pattern = regex::Regex::new(CONCEPT_DOI_PATTERN)
        .map_err(|e| Error::Other(format!("invalid concept DOI pattern: {e}")))?;
    pattern
        .captures(doi.trim())
        .and_then(|c| c.get(2))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| Error::config(format!("not a concept DOI: {doi}"), "concept_dois"))
}

/// Next semantic major version (`"2.1.0"` → `"3.0.0"`)
pub fn next_major_version(current: Option<&str>) -> String {
    let major = current
        .and_then(|v| v.trim().trim_start_matches('v').split('.').next())
        .and_then(|m| m.parse::<u64>().ok());
    match major {
        Some(m) => format!("{}.0.0", m + 1),
        None => "1.0.0".to_string(),
    }
}

/// Depositor talking to a Zenodo-compatible REST API
pub struct ZenodoDepositor {
    client: reqwest::Client,
    config: ZenodoConfig,
    api_root: String,
    credentials: Credentials,
    /// Concept DOIs learned from publications made by this process
    concepts: Mutex<HashMap<String, String>>,
    /// Draft ids handed out by this process, per dataset
    drafts: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for ZenodoDepositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZenodoDepositor")
            .field("api_root", &self.api_root)
            .field("sandbox", &self.config.sandbox)
            .finish()
    }
}

impl ZenodoDepositor {
    /// Create a depositor for the configured instance
    pub fn new(config: ZenodoConfig, credentials: Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("dataset-archiver/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Other(format!("failed to create HTTP client: {e}")))?;

        for (dataset, doi) in &config.concept_dois {
            concept_record_id(doi).map_err(|_| {
                Error::config(
                    format!("invalid concept DOI {doi} for dataset {dataset}"),
                    "concept_dois",
                )
            })?;
        }

        Ok(Self {
            client,
            api_root: config.api_root(),
            config,
            credentials,
            concepts: Mutex::new(HashMap::new()),
            drafts: Mutex::new(HashMap::new()),
        })
    }

    fn known_concept_doi(&self, dataset: &str) -> Option<String> {
        let learned = self
            .concepts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(dataset)
            .cloned();
        learned.or_else(|| self.config.concept_dois.get(dataset).cloned())
    }

    fn title_for(dataset: &str) -> String {
        format!("{dataset} archive")
    }

    /// Send a request built by `make` with retries and decode the JSON body
    async fn request_json<T, F>(&self, label: &str, make: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        debug!(label, "zenodo request");
        let make = &make;
        with_retry(&self.config.retry, move || async move {
            let response = check_status(make().send().await?).await?;
            Ok::<T, Error>(response.json::<T>().await?)
        })
        .await
        .map_err(|exhausted| exhausted.error)
    }

    /// Send a request with retries, discarding the body
    async fn request_empty<F>(&self, label: &str, make: F) -> Result<()>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        debug!(label, "zenodo request");
        let make = &make;
        with_retry(&self.config.retry, move || async move {
            check_status(make().send().await?).await?;
            Ok::<(), Error>(())
        })
        .await
        .map_err(|exhausted| exhausted.error)
    }

    async fn request_bytes<F>(&self, label: &str, make: F) -> Result<Vec<u8>>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        debug!(label, "zenodo request");
        let make = &make;
        with_retry(&self.config.retry, move || async move {
            let response = check_status(make().send().await?).await?;
            Ok::<Vec<u8>, Error>(response.bytes().await?.to_vec())
        })
        .await
        .map_err(|exhausted| exhausted.error)
    }

    async fn deposition(&self, id: &str) -> Result<Deposition> {
        let url = format!("{}/deposit/depositions/{id}", self.api_root);
        self.request_json("get deposition", || {
            self.client
                .get(&url)
                .bearer_auth(&self.credentials.upload_token)
        })
        .await
    }

    /// Fetch a deposition and make sure it is still an open draft
    async fn open_deposition(&self, draft: &DraftHandle) -> Result<Deposition> {
        let deposition = self.deposition(&draft.id).await?;
        if deposition.submitted && deposition.links.bucket.is_none() {
            return Err(DepositorError::DraftNotOpen {
                draft: draft.id.clone(),
            }
            .into());
        }
        Ok(deposition)
    }

    fn bucket_of(deposition: &Deposition) -> Result<&str> {
        deposition.links.bucket.as_deref().ok_or_else(|| {
            DepositorError::MalformedResponse(format!(
                "deposition {} has no bucket link",
                deposition.id
            ))
            .into()
        })
    }

    async fn put_object(&self, bucket: &str, filename: &str, body: Vec<u8>) -> Result<()> {
        let url = format!("{bucket}/{}", urlencoding::encode(filename));
        self.request_empty("upload to bucket", || {
            self.client
                .put(&url)
                .bearer_auth(&self.credentials.upload_token)
                .timeout(self.config.upload_timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body.clone())
        })
        .await
    }

    /// Stream a staged file into the bucket
    ///
    /// The file is reopened on every attempt, so a retry never holds the payload in
    /// memory.
    async fn put_file(&self, bucket: &str, filename: &str, path: &Path) -> Result<()> {
        let url = format!("{bucket}/{}", urlencoding::encode(filename));
        debug!(filename, "zenodo streamed upload");
        let url = &url;
        with_retry(&self.config.retry, move || async move {
            let file = tokio::fs::File::open(path).await?;
            let length = file.metadata().await?.len();
            let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
            let request = self
                .client
                .put(url)
                .bearer_auth(&self.credentials.upload_token)
                .timeout(self.config.upload_timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .header(reqwest::header::CONTENT_LENGTH, length)
                .body(body);
            check_status(request.send().await?).await?;
            Ok::<(), Error>(())
        })
        .await
        .map_err(|exhausted| exhausted.error)
    }

    /// Open (or find) the draft of a new version of a published record and bump its
    /// major version
    async fn new_version_draft(&self, published: &PublishedVersionId) -> Result<Deposition> {
        let url = format!("{}/records/{}/versions", self.api_root, published.0);
        let record: Record = self
            .request_json("open new version", || {
                self.client
                    .post(&url)
                    .bearer_auth(&self.credentials.upload_token)
            })
            .await?;
        let draft = self.deposition(&record.id).await?;

        let base = self.deposition(&published.0).await?;
        let base_version = base.version();
        let draft_version = draft.version();
        if draft_version.is_some() && draft_version != base_version {
            // Already bumped by an earlier call
            return Ok(draft);
        }

        let mut metadata = match (&base.metadata, &draft.metadata) {
            (serde_json::Value::Object(b), serde_json::Value::Object(d)) => {
                let mut merged = b.clone();
                merged.extend(d.clone());
                merged
            }
            (serde_json::Value::Object(b), _) => b.clone(),
            _ => serde_json::Map::new(),
        };
        for key in ["doi", "prereserve_doi", "publication_date"] {
            metadata.remove(key);
        }
        let new_version = next_major_version(base_version.as_deref());
        metadata.insert("version".into(), serde_json::Value::String(new_version.clone()));

        let target = draft
            .links
            .latest_draft
            .clone()
            .or_else(|| draft.links.this.clone())
            .unwrap_or_else(|| format!("{}/deposit/depositions/{}", self.api_root, draft.id));
        let body = serde_json::json!({ "metadata": metadata });
        info!(
            record = %published,
            draft = %draft.id,
            from = ?base_version,
            to = %new_version,
            "bumping draft version"
        );
        self.request_json("update draft version", || {
            self.client
                .put(&target)
                .bearer_auth(&self.credentials.upload_token)
                .json(&body)
        })
        .await
    }

    /// Find an unpublished deposition for a dataset that was never published, or
    /// create one
    async fn first_version_draft(&self, dataset: &str) -> Result<Deposition> {
        let title = Self::title_for(dataset);
        let list_url = format!("{}/deposit/depositions", self.api_root);
        let drafts: Vec<Deposition> = self
            .request_json("list drafts", || {
                self.client
                    .get(&list_url)
                    .bearer_auth(&self.credentials.upload_token)
                    .query(&[("status", "draft"), ("size", "100")])
            })
            .await?;
        if let Some(existing) = drafts
            .into_iter()
            .find(|d| !d.submitted && d.title() == Some(title.as_str()))
        {
            debug!(dataset, draft = %existing.id, "reusing unpublished deposition");
            return self.deposition(&existing.id).await;
        }

        let body = serde_json::json!({
            "metadata": {
                "title": title,
                "upload_type": "dataset",
                "description": format!("Archived snapshots of the {dataset} dataset."),
                "access_right": "open",
                "version": "1.0.0",
            }
        });
        info!(dataset, "creating new deposition");
        self.request_json("create deposition", || {
            self.client
                .post(&list_url)
                .bearer_auth(&self.credentials.upload_token)
                .json(&body)
        })
        .await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(DepositorError::Api {
        status: status.as_u16(),
        message: error_message(&text),
    }
    .into())
}

/// Pull `message` (and `errors`) out of a JSON error body, else keep the raw text
fn error_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body)
        && let Some(message) = json.get("message").and_then(|m| m.as_str())
    {
        return match json.get("errors") {
            Some(errors) if !errors.is_null() => format!("{message}: {errors}"),
            _ => message.to_string(),
        };
    }
    body.chars().take(MAX_ERROR_BODY).collect()
}

#[async_trait]
impl Depositor for ZenodoDepositor {
    fn backend_name(&self) -> &'static str {
        "zenodo"
    }

    fn concept_doi(&self, dataset: &str) -> Option<String> {
        self.known_concept_doi(dataset)
    }

    async fn open_draft(&self, dataset: &str) -> Result<DraftHandle> {
        let known = self
            .drafts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(dataset)
            .cloned();
        if let Some(id) = known {
            let deposition = self.deposition(&id).await?;
            if !deposition.submitted {
                let base_version = self.latest_published(dataset).await?;
                return Ok(DraftHandle {
                    dataset: dataset.to_string(),
                    id,
                    base_version,
                    link: deposition.links.html,
                });
            }
        }

        let base_version = self.latest_published(dataset).await?;
        let deposition = match &base_version {
            Some(published) => self.new_version_draft(published).await?,
            None => self.first_version_draft(dataset).await?,
        };

        self.drafts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(dataset.to_string(), deposition.id.clone());
        info!(dataset, draft = %deposition.id, "draft open");

        Ok(DraftHandle {
            dataset: dataset.to_string(),
            id: deposition.id,
            base_version,
            link: deposition.links.html,
        })
    }

    async fn latest_published(&self, dataset: &str) -> Result<Option<PublishedVersionId>> {
        let Some(doi) = self.known_concept_doi(dataset) else {
            return Ok(None);
        };
        let concept_id = concept_record_id(&doi)?;
        let url = format!("{}/records/{concept_id}", self.api_root);
        let record: Record = self
            .request_json("resolve concept DOI", || {
                self.client
                    .get(&url)
                    .bearer_auth(&self.credentials.upload_token)
            })
            .await?;
        Ok(Some(PublishedVersionId(record.id)))
    }

    async fn manifest_of(&self, target: ManifestTarget<'_>) -> Result<DepositionManifest> {
        let (dataset, id) = match target {
            ManifestTarget::Draft(draft) => (draft.dataset.as_str(), draft.id.as_str()),
            ManifestTarget::Published { dataset, version } => (dataset, version.0.as_str()),
        };
        let deposition = self.deposition(id).await?;

        let document = match deposition.file(MANIFEST_FILENAME) {
            Some(file) => {
                let url = file
                    .links
                    .download
                    .clone()
                    .or_else(|| file.links.this.clone())
                    .ok_or_else(|| {
                        DepositorError::MalformedResponse(format!(
                            "file {} has no download link",
                            file.id
                        ))
                    })?;
                let bytes = self
                    .request_bytes("download manifest", || {
                        self.client
                            .get(&url)
                            .bearer_auth(&self.credentials.upload_token)
                    })
                    .await?;
                parse_manifest_document(&bytes)
            }
            None => None,
        };

        Ok(merge_listing(
            dataset,
            deposition.version(),
            deposition.listing(),
            document.as_ref(),
        ))
    }

    async fn upload(&self, draft: &DraftHandle, resource: &ResourceInfo) -> Result<RemoteFileId> {
        let deposition = self.open_deposition(draft).await?;
        let bucket = Self::bucket_of(&deposition)?;
        self.put_file(bucket, &resource.filename, &resource.local_path)
            .await?;
        debug!(draft = %draft.id, filename = %resource.filename, "uploaded");
        Ok(RemoteFileId(resource.filename.clone()))
    }

    async fn remove(&self, draft: &DraftHandle, file: &RemoteFileId) -> Result<()> {
        let deposition = self.open_deposition(draft).await?;
        let listed = deposition
            .file(&file.0)
            .ok_or_else(|| DepositorError::FileNotFound {
                draft: draft.id.clone(),
                filename: file.0.clone(),
            })?;
        let url = listed.links.this.clone().unwrap_or_else(|| {
            format!(
                "{}/deposit/depositions/{}/files/{}",
                self.api_root, deposition.id, listed.id
            )
        });
        self.request_empty("delete file", || {
            self.client
                .delete(&url)
                .bearer_auth(&self.credentials.upload_token)
        })
        .await?;
        debug!(draft = %draft.id, filename = %file, "removed");
        Ok(())
    }

    async fn write_manifest(
        &self,
        draft: &DraftHandle,
        manifest: &DepositionManifest,
    ) -> Result<()> {
        let deposition = self.open_deposition(draft).await?;
        let bucket = Self::bucket_of(&deposition)?;
        self.put_object(bucket, MANIFEST_FILENAME, manifest_document(manifest)?)
            .await
    }

    async fn publish(&self, draft: &DraftHandle) -> Result<PublishedVersionId> {
        let deposition = self.open_deposition(draft).await?;
        let url = deposition
            .links
            .publish
            .clone()
            .ok_or_else(|| PublishError::MissingPublishLink {
                draft: draft.id.clone(),
            })?;

        // Single attempt with the publish-scoped token
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.credentials.publish_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(draft = %draft.id, status = status.as_u16(), "publish rejected");
            return Err(PublishError::Rejected {
                draft: draft.id.clone(),
                message: format!("HTTP {}: {}", status.as_u16(), error_message(&text)),
            }
            .into());
        }
        let published: Deposition = response.json().await?;

        if let Some(concept) = &published.conceptrecid {
            let prefix = if self.config.sandbox {
                SANDBOX_DOI_PREFIX
            } else {
                PRODUCTION_DOI_PREFIX
            };
            let doi = format!("{prefix}/zenodo.{concept}");
            if self.config.concept_dois.get(&draft.dataset) != Some(&doi) {
                warn!(
                    dataset = %draft.dataset,
                    concept_doi = %doi,
                    config_key = %format!("depositor.concept_dois.{}", draft.dataset),
                    "concept DOI is not configured; later processes will open a new record unless it is set"
                );
            }
            self.concepts
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(draft.dataset.clone(), doi);
        }
        self.drafts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&draft.dataset);

        info!(dataset = %draft.dataset, version = %published.id, "published");
        Ok(PublishedVersionId(published.id))
    }

    async fn discard(&self, draft: &DraftHandle) -> Result<()> {
        let deposition = self.open_deposition(draft).await?;
        let url = deposition.links.discard.clone().ok_or_else(|| {
            DepositorError::MalformedResponse(format!(
                "draft {} has no discard link",
                draft.id
            ))
        })?;
        self.request_empty("discard draft", || {
            self.client
                .post(&url)
                .bearer_auth(&self.credentials.upload_token)
        })
        .await?;
        self.drafts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&draft.dataset);
        info!(dataset = %draft.dataset, draft = %draft.id, "draft discarded");
        Ok(())
    }
}
