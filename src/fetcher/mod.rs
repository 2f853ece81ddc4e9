//! Resource fetching: download, package, verify and fingerprint
//!
//! [`ResourceFetcher::fetch`] turns one [`FetchTask`] into one staged
//! [`ResourceInfo`]. Each attempt streams the payload to a partial file, packages it
//! when the task asks for a zip, checks archive structure, hashes the result and only
//! then promotes it into the run's staging directory. Transient failures (5xx,
//! timeouts, truncated archives, HTML error pages) are retried with backoff; a task
//! that runs out of attempts leaves nothing behind in staging.

pub mod archive;
pub mod staging;

pub use staging::StagingArea;

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{Config, RetryConfig};
use crate::error::{Error, FetchError, Result};
use crate::retry::{Exhausted, with_retry};
use crate::types::{FetchPayload, FetchRequest, FetchTask, ResourceInfo};
use crate::utils::{ensure_free_space, entry_name_from_url, hash_file, looks_like_html};

/// Bytes kept from the start of a payload for HTML sniffing
const SNIFF_BYTES: usize = 1024;

/// Downloads fetch tasks into a run's staging area
#[derive(Clone, Debug)]
pub struct ResourceFetcher {
    client: reqwest::Client,
    dataset: String,
    staging: StagingArea,
    retry: RetryConfig,
    min_free_space: u64,
}

impl ResourceFetcher {
    /// Create a fetcher for the configured dataset staging into `staging`
    pub fn new(config: &Config, staging: StagingArea) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("dataset-archiver/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Other(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            dataset: config.dataset.clone(),
            staging,
            retry: config.retry.clone(),
            min_free_space: config.min_free_space,
        })
    }

    /// Staging area this fetcher writes into
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Fetch one task, retrying transient failures
    ///
    /// On permanent failure every partial or scratch file of the task is removed
    /// and the returned [`FetchError`] records the final cause and attempt count.
    pub async fn fetch(&self, task: &FetchTask) -> std::result::Result<ResourceInfo, FetchError> {
        let filename = task.filename(&self.dataset);
        let policy = task.retry.as_ref().unwrap_or(&self.retry);
        debug!(partition = %task.partition, %filename, "fetching");

        match with_retry(policy, || self.attempt(task, &filename)).await {
            Ok(resource) => {
                info!(
                    partition = %resource.partition,
                    filename = %resource.filename,
                    size = resource.size,
                    fingerprint = %resource.fingerprint,
                    "resource staged"
                );
                Ok(resource)
            }
            Err(Exhausted { error, attempts }) => {
                self.staging.discard(&filename).await;
                warn!(
                    partition = %task.partition,
                    %filename,
                    attempts,
                    error = %error,
                    "fetch failed permanently"
                );
                Err(FetchError {
                    partition: task.partition.clone(),
                    cause: error.to_string(),
                    code: error.error_code().to_string(),
                    attempts,
                })
            }
        }
    }

    async fn attempt(&self, task: &FetchTask, filename: &str) -> Result<ResourceInfo> {
        let partial = self.staging.partial_path(filename);

        match &task.payload {
            FetchPayload::File { request, extension } => {
                self.download_to(request, &partial).await?;
                if extension.eq_ignore_ascii_case("zip") {
                    let path = partial.clone();
                    run_blocking(move || archive::verify_zip(&path).map(|_| ())).await?;
                }
            }
            FetchPayload::Zipped {
                request,
                entry_name,
            } => {
                let scratch = self.staging.scratch_path(filename, 0);
                self.download_to(request, &scratch).await?;
                let name = if entry_name.is_empty() {
                    entry_name_from_url(&request.url)
                } else {
                    entry_name.clone()
                };
                package(vec![(name, scratch)], partial.clone()).await?;
                self.staging.clear_scratch(filename, 1).await;
            }
            FetchPayload::Bundle { parts } => {
                if parts.is_empty() {
                    return Err(Error::Other(format!(
                        "bundle task for {} has no parts",
                        task.partition
                    )));
                }
                let mut entries = Vec::with_capacity(parts.len());
                for (index, part) in parts.iter().enumerate() {
                    let scratch = self.staging.scratch_path(filename, index);
                    self.download_to(&part.request, &scratch).await?;
                    let name = if part.entry_name.is_empty() {
                        entry_name_from_url(&part.request.url)
                    } else {
                        part.entry_name.clone()
                    };
                    entries.push((name, scratch));
                }
                // Completion order of parts must not leak into the archive bytes
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                if let Some(pair) = entries.windows(2).find(|w| w[0].0 == w[1].0) {
                    return Err(Error::Other(format!(
                        "bundle task for {} has duplicate entry {}",
                        task.partition, pair[0].0
                    )));
                }
                package(entries, partial.clone()).await?;
                self.staging.clear_scratch(filename, parts.len()).await;
            }
        }

        let path = partial.clone();
        let (fingerprint, size) = run_blocking(move || Ok(hash_file(&path)?)).await?;

        let final_path = self.staging.final_path(filename);
        tokio::fs::rename(&partial, &final_path).await?;

        Ok(ResourceInfo {
            partition: task.partition.clone(),
            filename: filename.to_string(),
            local_path: final_path,
            size,
            fingerprint,
        })
    }

    /// Stream one request into `dest`, returning the number of bytes written
    async fn download_to(&self, request: &FetchRequest, dest: &Path) -> Result<u64> {
        let mut builder = self.client.get(&request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let mut response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                url: request.url.clone(),
            });
        }

        ensure_free_space(
            self.staging.dir(),
            response.content_length().unwrap_or(0),
            self.min_free_space,
        )?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut head: Vec<u8> = Vec::new();
        let mut sniffed = request.allow_html;
        let mut written = 0u64;

        while let Some(chunk) = response.chunk().await? {
            if !sniffed {
                let take = (SNIFF_BYTES - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
                if head.len() >= SNIFF_BYTES {
                    reject_html(&head, &request.url)?;
                    sniffed = true;
                }
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        if !sniffed {
            reject_html(&head, &request.url)?;
        }
        file.flush().await?;

        debug!(url = %request.url, bytes = written, "download complete");
        Ok(written)
    }
}

fn reject_html(head: &[u8], url: &str) -> Result<()> {
    if looks_like_html(head) {
        return Err(Error::UnexpectedHtml {
            url: url.to_string(),
        });
    }
    Ok(())
}

async fn package(entries: Vec<(String, PathBuf)>, dest: PathBuf) -> Result<()> {
    run_blocking(move || {
        archive::write_deterministic_zip(&entries, &dest)?;
        archive::verify_zip(&dest).map(|_| ())
    })
    .await
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("blocking task failed: {e}")))?
}
