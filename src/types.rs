//! Core types for dataset-archiver
//!
//! Partition keys, fetch tasks, staged resources and deposition manifests. These are
//! the records that flow between the fetcher, change detector, validation engine and
//! depositor, and they are all serde-serializable so a run summary can carry them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::RetryConfig;

/// Name of the manifest document stored next to the data files of a deposition
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Value of a single partition dimension (e.g. `2021` for `year`)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartitionValue {
    /// Integer value such as a year
    Int(i64),
    /// Free-form value such as `2021-03` or a form name
    Text(String),
}

impl std::fmt::Display for PartitionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionValue::Int(v) => write!(f, "{v}"),
            PartitionValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for PartitionValue {
    fn from(v: i64) -> Self {
        PartitionValue::Int(v)
    }
}

impl From<i32> for PartitionValue {
    fn from(v: i32) -> Self {
        PartitionValue::Int(i64::from(v))
    }
}

impl From<&str> for PartitionValue {
    fn from(v: &str) -> Self {
        PartitionValue::Text(v.to_string())
    }
}

impl From<String> for PartitionValue {
    fn from(v: String) -> Self {
        PartitionValue::Text(v)
    }
}

/// Identifies one partition of a dataset, e.g. `{year: 2021}`
///
/// Dimensions are kept sorted by name, so two keys built in a different order
/// compare equal and derive the same filename.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(BTreeMap<String, PartitionValue>);

impl PartitionKey {
    /// Key with no dimensions (a dataset archived as a single resource)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Key with a single dimension
    pub fn single(name: impl Into<String>, value: impl Into<PartitionValue>) -> Self {
        Self::empty().with(name, value)
    }

    /// Add (or replace) a dimension
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PartitionValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Value of a dimension, if present
    pub fn get(&self, name: &str) -> Option<&PartitionValue> {
        self.0.get(name)
    }

    /// Iterate over `(dimension, value)` pairs in dimension order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PartitionValue)> {
        self.0.iter()
    }

    /// Whether the key has no dimensions
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Derive the deposition filename for this partition
    ///
    /// The name is `<dataset>-<name>=<value>-<name>=<value>.<extension>` with
    /// dimensions in name order. Names and values keep their case; `-`, `=`, `.` and
    /// anything outside `[A-Za-z0-9_]` are percent-encoded, so two keys that differ in
    /// any dimension name or value never share a filename. The dataset is lowercased
    /// the same way for every partition.
    ///
    /// ```
    /// use dataset_archiver::types::PartitionKey;
    ///
    /// let key = PartitionKey::single("year", 2021).with("form", "Schedule A");
    /// assert_eq!(key.filename("eia860", "zip"), "eia860-form=Schedule%20A-year=2021.zip");
    /// assert_eq!(PartitionKey::empty().filename("censusdp1", "zip"), "censusdp1.zip");
    /// ```
    pub fn filename(&self, dataset: &str, extension: &str) -> String {
        let mut stem = sanitize_dataset(dataset);
        for (name, value) in &self.0 {
            stem.push('-');
            stem.push_str(&escape_segment(name));
            stem.push('=');
            stem.push_str(&escape_segment(&value.to_string()));
        }
        format!("{stem}.{}", sanitize_dataset(extension.trim_start_matches('.')))
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{{}}");
        }
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", parts.join(","))
    }
}

fn sanitize_dataset(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Percent-encode every byte outside `[A-Za-z0-9_]`
fn escape_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// A single HTTP request issued by the fetcher
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// URL to download
    pub url: String,

    /// Query parameters (for API-style sources)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query: Vec<(String, String)>,

    /// Extra request headers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,

    /// Accept a payload that looks like an HTML page (default: false)
    #[serde(default)]
    pub allow_html: bool,
}

impl FetchRequest {
    /// Plain GET request for a URL
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            allow_html: false,
        }
    }

    /// Add a query parameter
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Add a request header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// One raw file that becomes an entry in a bundled archive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlePart {
    /// Request producing the entry's bytes
    pub request: FetchRequest,
    /// Name of the entry inside the archive
    pub entry_name: String,
}

/// What a fetch task downloads and how it is staged
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchPayload {
    /// Stage the downloaded bytes unchanged
    File {
        /// Request to issue
        request: FetchRequest,
        /// Extension of the staged file (e.g. "zip", "csv")
        extension: String,
    },
    /// Wrap the downloaded bytes into a deterministic single-entry zip
    Zipped {
        /// Request to issue
        request: FetchRequest,
        /// Name of the entry inside the archive
        entry_name: String,
    },
    /// Aggregate several downloads into one deterministic zip
    Bundle {
        /// Parts making up the archive
        parts: Vec<BundlePart>,
    },
}

/// Opaque unit of work produced by a [`TaskSource`](crate::source::TaskSource)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchTask {
    /// Partition this task produces
    pub partition: PartitionKey,

    /// What to download
    pub payload: FetchPayload,

    /// Per-task retry policy (falls back to the run's policy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl FetchTask {
    /// Task staging a single file as downloaded
    pub fn file(partition: PartitionKey, url: impl Into<String>, extension: &str) -> Self {
        Self {
            partition,
            payload: FetchPayload::File {
                request: FetchRequest::get(url),
                extension: extension.trim_start_matches('.').to_string(),
            },
            retry: None,
        }
    }

    /// Task wrapping a single download into a zip
    pub fn zipped(
        partition: PartitionKey,
        url: impl Into<String>,
        entry_name: impl Into<String>,
    ) -> Self {
        Self {
            partition,
            payload: FetchPayload::Zipped {
                request: FetchRequest::get(url),
                entry_name: entry_name.into(),
            },
            retry: None,
        }
    }

    /// Task aggregating several downloads into one zip
    pub fn bundle(partition: PartitionKey, parts: Vec<BundlePart>) -> Self {
        Self {
            partition,
            payload: FetchPayload::Bundle { parts },
            retry: None,
        }
    }

    /// Override the retry policy for this task
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Extension of the staged resource
    pub fn extension(&self) -> &str {
        match &self.payload {
            FetchPayload::File { extension, .. } => extension,
            FetchPayload::Zipped { .. } | FetchPayload::Bundle { .. } => "zip",
        }
    }

    /// Deposition filename this task produces for `dataset`
    pub fn filename(&self, dataset: &str) -> String {
        self.partition.filename(dataset, self.extension())
    }
}

/// Stable content hash (lowercase hex MD5) used to detect byte-level change
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of an in-memory buffer
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("{:x}", md5::compute(bytes)))
    }

    /// Fingerprint from an incrementally computed digest
    pub fn from_digest(digest: md5::Digest) -> Self {
        Self(format!("{digest:x}"))
    }

    /// Normalize a checksum reported by a backend (`md5:ABC…` or bare hex)
    pub fn from_checksum(raw: &str) -> Self {
        let trimmed = raw.strip_prefix("md5:").unwrap_or(raw);
        Self(trimmed.to_ascii_lowercase())
    }

    /// Hex representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of a successful fetch: a staged file ready for upload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Partition the resource belongs to
    pub partition: PartitionKey,
    /// Deposition filename derived from dataset + partition
    pub filename: String,
    /// Where the bytes are staged locally
    pub local_path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Content fingerprint
    pub fingerprint: Fingerprint,
}

/// Backend-assigned identifier of a file inside a deposition
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteFileId(pub String);

impl std::fmt::Display for RemoteFileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an immutable published version
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublishedVersionId(pub String);

impl std::fmt::Display for PublishedVersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to an open draft owned by one run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftHandle {
    /// Dataset the draft belongs to
    pub dataset: String,
    /// Backend-specific draft identifier
    pub id: String,
    /// Published version the draft was opened from (None for a new deposition)
    pub base_version: Option<PublishedVersionId>,
    /// Human-facing link to the draft, when the backend has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// One file of a deposition version
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Partition the file holds
    pub partition: PartitionKey,
    /// Content fingerprint
    pub fingerprint: Fingerprint,
    /// Size in bytes
    pub size: u64,
    /// Backend file id (absent until uploaded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteFileId>,
}

/// Authoritative record of one deposition version: filename → entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositionManifest {
    /// Dataset the manifest describes
    pub dataset: String,
    /// Version label, when the backend assigns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Files keyed by derived filename
    #[serde(default)]
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl DepositionManifest {
    /// Empty manifest for a dataset
    pub fn empty(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            version: None,
            entries: BTreeMap::new(),
        }
    }

    /// Sum of all file sizes
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Entry for a filename
    pub fn get(&self, filename: &str) -> Option<&ManifestEntry> {
        self.entries.get(filename)
    }

    /// Number of files
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest lists no files
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// SHA-256 over the file set (filename, fingerprint, size)
    ///
    /// Remote ids and the version label are excluded, so the digest only changes
    /// when the content of the deposition changes.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, entry) in &self.entries {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(entry.fingerprint.as_str().as_bytes());
            hasher.update([0u8]);
            hasher.update(entry.size.to_le_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Build a manifest for a set of freshly staged resources
    pub fn from_resources<'a>(
        dataset: &str,
        resources: impl IntoIterator<Item = &'a ResourceInfo>,
    ) -> Self {
        let entries = resources
            .into_iter()
            .map(|r| {
                (
                    r.filename.clone(),
                    ManifestEntry {
                        partition: r.partition.clone(),
                        fingerprint: r.fingerprint.clone(),
                        size: r.size,
                        remote_id: None,
                    },
                )
            })
            .collect();
        Self {
            dataset: dataset.to_string(),
            version: None,
            entries,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_key_ignores_insertion_order() {
        let a = PartitionKey::single("year", 2021).with("month", 3);
        let b = PartitionKey::single("month", 3).with("year", 2021);
        assert_eq!(a, b);
        assert_eq!(a.filename("ds", "zip"), b.filename("ds", "zip"));
    }

    #[test]
    fn filename_escapes_text_values() {
        let key = PartitionKey::single("form", "Form 860/A");
        assert_eq!(key.filename("EIA860", ".zip"), "eia860-form=Form%20860%2FA.zip");
    }

    #[test]
    fn distinct_keys_never_share_a_filename() {
        let keys = [
            PartitionKey::single("form", "Form A"),
            PartitionKey::single("form", "form-a"),
            PartitionKey::single("form", "form a"),
            PartitionKey::single("form", "form=a"),
            PartitionKey::single("year", 2020),
            PartitionKey::single("month", 2020),
            PartitionKey::single("year", 2020).with("month", 1),
            PartitionKey::single("year", "2020-month=1"),
            PartitionKey::empty(),
        ];
        let names: std::collections::BTreeSet<String> =
            keys.iter().map(|k| k.filename("ds", "csv")).collect();
        assert_eq!(names.len(), keys.len());
    }

    #[test]
    fn partition_key_serializes_as_plain_map() {
        let key = PartitionKey::single("year", 2020).with("form", "a");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"{"form":"a","year":2020}"#);
        let back: PartitionKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn fingerprint_normalizes_backend_checksums() {
        let bare = Fingerprint::from_checksum("ABCDEF0123");
        let prefixed = Fingerprint::from_checksum("md5:abcdef0123");
        assert_eq!(bare, prefixed);
        assert_eq!(bare.as_str(), "abcdef0123");
    }

    #[test]
    fn fingerprint_of_bytes_is_md5_hex() {
        assert_eq!(
            Fingerprint::of_bytes(b"").as_str(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn manifest_digest_ignores_remote_ids() {
        let mut a = DepositionManifest::empty("ds");
        a.entries.insert(
            "ds-2020.zip".into(),
            ManifestEntry {
                partition: PartitionKey::single("year", 2020),
                fingerprint: Fingerprint::from_checksum("aa"),
                size: 10,
                remote_id: None,
            },
        );
        let mut b = a.clone();
        b.entries.get_mut("ds-2020.zip").unwrap().remote_id = Some(RemoteFileId("f-1".into()));
        assert_eq!(a.digest(), b.digest());

        b.entries.get_mut("ds-2020.zip").unwrap().fingerprint = Fingerprint::from_checksum("bb");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn task_filename_uses_zip_for_packaged_payloads() {
        let task = FetchTask::zipped(PartitionKey::single("year", 2019), "http://x/a.csv", "a.csv");
        assert_eq!(task.filename("ds"), "ds-year=2019.zip");
        let task = FetchTask::file(PartitionKey::single("year", 2019), "http://x/a.csv", "csv");
        assert_eq!(task.filename("ds"), "ds-year=2019.csv");
    }
}
