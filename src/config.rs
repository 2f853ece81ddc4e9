//! Configuration types for dataset-archiver
//!
//! Everything a run needs is passed in through [`Config`]: there is no ambient global
//! state, so several runs can execute side by side in one process (or one test binary)
//! without sharing staging directories or credentials.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::PathBuf,
    time::Duration,
};

use crate::error::{Error, Result};
use crate::types::{PartitionKey, PartitionValue};

/// Environment variable holding the production upload-scoped token
pub const ENV_TOKEN_UPLOAD: &str = "ZENODO_TOKEN_UPLOAD";
/// Environment variable holding the production publish-scoped token
pub const ENV_TOKEN_PUBLISH: &str = "ZENODO_TOKEN_PUBLISH";
/// Environment variable holding the sandbox upload-scoped token
pub const ENV_SANDBOX_TOKEN_UPLOAD: &str = "ZENODO_SANDBOX_TOKEN_UPLOAD";
/// Environment variable holding the sandbox publish-scoped token
pub const ENV_SANDBOX_TOKEN_PUBLISH: &str = "ZENODO_SANDBOX_TOKEN_PUBLISH";

/// Upper bound on concurrent fetches per dataset run
pub const MAX_CONCURRENT_FETCHES: usize = 10;

/// Main configuration for an archive run
///
/// Fields are organized into logical sub-configs:
/// - [`retry`](RetryConfig): fetch retry budget and backoff
/// - [`validation`](ValidationConfig): thresholds for the validation checks
/// - [`run`](RunSettings): publish/override/prune/resume decisions
/// - [`depositor`](DepositorConfig): which storage backend to archive into
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Dataset identifier (e.g. "eia860")
    pub dataset: String,

    /// Root of the staging area; each run stages under `<root>/<dataset>/<run id>`
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Maximum concurrent fetches (default: 3, at most 10)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_fetches: usize,

    /// Timeout for a single HTTP request issued by the fetcher (default: 600 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Retry policy for fetch tasks that do not carry their own
    #[serde(default)]
    pub retry: RetryConfig,

    /// Minimum free space in bytes the staging volume must keep (default: 512 MiB)
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,

    /// Validation thresholds
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Publish/prune/resume settings
    #[serde(default)]
    pub run: RunSettings,

    /// Storage backend selection
    #[serde(default)]
    pub depositor: DepositorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset: String::new(),
            staging_dir: default_staging_dir(),
            max_concurrent_fetches: default_max_concurrent(),
            request_timeout: default_request_timeout(),
            retry: RetryConfig::default(),
            min_free_space: default_min_free_space(),
            validation: ValidationConfig::default(),
            run: RunSettings::default(),
            depositor: DepositorConfig::default(),
        }
    }
}

impl Config {
    /// Configuration for a dataset with every other setting at its default
    pub fn for_dataset(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            ..Default::default()
        }
    }

    /// Check the configuration for values the orchestrator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.dataset.trim().is_empty() {
            return Err(Error::config("dataset id must not be empty", "dataset"));
        }
        if self.max_concurrent_fetches == 0 || self.max_concurrent_fetches > MAX_CONCURRENT_FETCHES
        {
            return Err(Error::config(
                format!(
                    "must be between 1 and {MAX_CONCURRENT_FETCHES}, got {}",
                    self.max_concurrent_fetches
                ),
                "max_concurrent_fetches",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "backoff multiplier must be at least 1.0",
                "retry.backoff_multiplier",
            ));
        }
        let v = &self.validation;
        if !(0.0..=1.0).contains(&v.max_shrink_fraction) {
            return Err(Error::config(
                "shrink tolerance must be a fraction between 0 and 1",
                "validation.max_shrink_fraction",
            ));
        }
        if v.max_growth_multiple < 1.0 {
            return Err(Error::config(
                "growth multiple must be at least 1.0",
                "validation.max_growth_multiple",
            ));
        }
        if v.max_file_size_change < 0.0 {
            return Err(Error::config(
                "per-file size tolerance must not be negative",
                "validation.max_file_size_change",
            ));
        }
        Ok(())
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Thresholds used by the validation checks
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Partitions the task source is expected to produce (empty = not checked)
    #[serde(default)]
    pub expected_partitions: Vec<PartitionKey>,

    /// Partitions that may be absent without failing completeness or removal checks
    #[serde(default)]
    pub allowed_absent: Vec<PartitionKey>,

    /// Largest tolerated shrink of the aggregate deposition size, as a fraction
    /// of the previous size (default: 0.25)
    #[serde(default = "default_max_shrink_fraction")]
    pub max_shrink_fraction: f64,

    /// Largest tolerated growth of the aggregate deposition size, as a multiple
    /// of the previous size (default: 2.0)
    #[serde(default = "default_max_growth_multiple")]
    pub max_growth_multiple: f64,

    /// Largest tolerated relative size change of a single updated file (default: 0.5)
    #[serde(default = "default_max_file_size_change")]
    pub max_file_size_change: f64,

    /// Entry names every staged zip archive of the dataset must hold exactly
    #[serde(default)]
    pub zip_layout: Option<ZipLayout>,
}

/// Expected contents of a zip archive
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZipLayout {
    /// Entry paths, relative to the archive root
    pub file_paths: BTreeSet<String>,
}

impl ZipLayout {
    /// Layout expecting exactly the given entries
    pub fn new<S: Into<String>>(paths: impl IntoIterator<Item = S>) -> Self {
        Self {
            file_paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            expected_partitions: Vec::new(),
            allowed_absent: Vec::new(),
            max_shrink_fraction: default_max_shrink_fraction(),
            max_growth_multiple: default_max_growth_multiple(),
            max_file_size_change: default_max_file_size_change(),
            zip_layout: None,
        }
    }
}

/// What happens to partitions that exist in the previous version but were not
/// produced by this run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovedPolicy {
    /// Keep them in the new version (default)
    #[default]
    Retain,
    /// Delete them from the new version
    Prune,
}

/// Restricts a run to partitions whose dimension values are allow-listed
///
/// A key passes when, for every filtered dimension it carries, its value is in the
/// allow-list. Dimensions absent from the key are not filtered.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionFilter(pub BTreeMap<String, Vec<PartitionValue>>);

impl PartitionFilter {
    /// Filter allowing only the listed values of one dimension
    pub fn only<V: Into<PartitionValue>>(
        dimension: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let mut map = BTreeMap::new();
        map.insert(
            dimension.into(),
            values.into_iter().map(Into::into).collect(),
        );
        Self(map)
    }

    /// Whether a partition passes the filter
    pub fn allows(&self, key: &PartitionKey) -> bool {
        self.0.iter().all(|(dimension, allowed)| match key.get(dimension) {
            Some(value) => allowed.contains(value),
            None => true,
        })
    }
}

/// Run-level decisions passed in by the caller (CLI parsing is out of scope)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunSettings {
    /// Publish automatically when validation allows it
    #[serde(default)]
    pub auto_publish: bool,

    /// Let warning-level validation results through to publication
    #[serde(default)]
    pub override_warnings: bool,

    /// Retain or prune partitions missing from this run
    #[serde(default)]
    pub removed_policy: RemovedPolicy,

    /// Only archive partitions passing this filter
    #[serde(default)]
    pub partition_filter: Option<PartitionFilter>,

    /// Summary of a failed run to resume
    #[serde(default)]
    pub resume_from: Option<PathBuf>,

    /// Where to write the summary of this run
    #[serde(default)]
    pub summary_path: Option<PathBuf>,

    /// Keep the staging directory after the run (default: false)
    #[serde(default)]
    pub keep_staging: bool,
}

/// Storage backend selection
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum DepositorConfig {
    /// Research-data-repository REST API
    Zenodo(ZenodoConfig),
    /// Local filesystem (or any mounted key-prefixed store)
    Storage(StorageConfig),
}

impl Default for DepositorConfig {
    fn default() -> Self {
        DepositorConfig::Zenodo(ZenodoConfig::default())
    }
}

/// REST depositor settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZenodoConfig {
    /// Use the sandbox instance (default: true)
    #[serde(default = "default_true")]
    pub sandbox: bool,

    /// Override the API root (e.g. for a self-hosted instance or tests)
    #[serde(default)]
    pub api_root: Option<String>,

    /// Concept DOI per dataset; datasets without one get a brand new deposition
    #[serde(default)]
    pub concept_dois: HashMap<String, String>,

    /// Timeout for metadata requests (default: 60 seconds)
    #[serde(default = "default_api_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Timeout for file uploads (default: 3600 seconds)
    #[serde(default = "default_upload_timeout", with = "duration_serde")]
    pub upload_timeout: Duration,

    /// Retry policy for non-publish API requests
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ZenodoConfig {
    fn default() -> Self {
        Self {
            sandbox: true,
            api_root: None,
            concept_dois: HashMap::new(),
            request_timeout: default_api_timeout(),
            upload_timeout: default_upload_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl ZenodoConfig {
    /// Base URL of the API
    pub fn api_root(&self) -> String {
        match &self.api_root {
            Some(root) => root.trim_end_matches('/').to_string(),
            None if self.sandbox => "https://sandbox.zenodo.org/api".to_string(),
            None => "https://zenodo.org/api".to_string(),
        }
    }
}

/// Storage depositor settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root under which `<dataset>/draft` and `<dataset>/published/v<N>` live
    pub root: PathBuf,
}

/// Bearer tokens for the REST depositor
///
/// Uploads and publication use separate credentials because publishing is the
/// higher-privilege, irreversible action. Never serialized.
#[derive(Clone)]
pub struct Credentials {
    /// Token for draft creation, uploads and deletions
    pub upload_token: String,
    /// Token for publication
    pub publish_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("upload_token", &"<redacted>")
            .field("publish_token", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Explicit credentials
    pub fn new(upload_token: impl Into<String>, publish_token: impl Into<String>) -> Self {
        Self {
            upload_token: upload_token.into(),
            publish_token: publish_token.into(),
        }
    }

    /// Read the credential pair for the sandbox or production instance from the environment
    pub fn from_env(sandbox: bool) -> Result<Self> {
        let (upload_var, publish_var) = if sandbox {
            (ENV_SANDBOX_TOKEN_UPLOAD, ENV_SANDBOX_TOKEN_PUBLISH)
        } else {
            (ENV_TOKEN_UPLOAD, ENV_TOKEN_PUBLISH)
        };
        let read = |var: &str| {
            std::env::var(var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::config(format!("environment variable {var} is not set"), var))
        };
        Ok(Self {
            upload_token: read(upload_var)?,
            publish_token: read(publish_var)?,
        })
    }
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("./staging")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_min_free_space() -> u64 {
    512 * 1024 * 1024
}

fn default_max_shrink_fraction() -> f64 {
    0.25
}

fn default_max_growth_multiple() -> f64 {
    2.0
}

fn default_max_file_size_change() -> f64 {
    0.5
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_upload_timeout() -> Duration {
    Duration::from_secs(3600)
}

// Duration serialization helper (whole seconds)
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn minimal_json_fills_in_defaults() {
        let config: Config = serde_json::from_str(r#"{"dataset": "eia860"}"#).unwrap();

        assert_eq!(config.dataset, "eia860");
        assert_eq!(config.max_concurrent_fetches, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.run.removed_policy, RemovedPolicy::Retain);
        assert!(!config.run.auto_publish);
        assert!(config.validation.zip_layout.is_none());
        assert!(matches!(config.depositor, DepositorConfig::Zenodo(ref z) if z.sandbox));
        config.validate().unwrap();
    }

    #[test]
    fn zip_layout_is_read_from_validation_settings() {
        let config: Config = serde_json::from_str(
            r#"{
                "dataset": "eia176",
                "validation": {"zip_layout": {"file_paths": ["data.csv", "README.txt"]}}
            }"#,
        )
        .unwrap();

        let layout = config.validation.zip_layout.unwrap();
        assert_eq!(layout, ZipLayout::new(["README.txt", "data.csv"]));
    }

    #[test]
    fn storage_backend_is_selected_by_tag() {
        let config: Config = serde_json::from_str(
            r#"{
                "dataset": "ferc714",
                "run": {"removed_policy": "prune", "auto_publish": true},
                "depositor": {"backend": "storage", "root": "/srv/archive"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.run.removed_policy, RemovedPolicy::Prune);
        match config.depositor {
            DepositorConfig::Storage(s) => assert_eq!(s.root, PathBuf::from("/srv/archive")),
            other => panic!("expected storage backend, got {other:?}"),
        }
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let json = serde_json::to_value(RetryConfig::default()).unwrap();
        assert_eq!(json["initial_delay"], 2);
        assert_eq!(json["max_delay"], 60);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::for_dataset("eia860");
        config.max_concurrent_fetches = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::Config { key: Some(ref k), .. }) if k == "max_concurrent_fetches"
        ));

        let mut config = Config::for_dataset("eia860");
        config.max_concurrent_fetches = MAX_CONCURRENT_FETCHES + 1;
        assert!(config.validate().is_err());

        let mut config = Config::for_dataset("eia860");
        config.validation.max_shrink_fraction = 1.5;
        assert!(config.validate().is_err());

        assert!(Config::for_dataset("  ").validate().is_err());
    }

    #[test]
    fn partition_filter_only_constrains_listed_dimensions() {
        let filter = PartitionFilter::only("year", [2020, 2021]);

        assert!(filter.allows(&PartitionKey::single("year", 2021)));
        assert!(!filter.allows(&PartitionKey::single("year", 2019)));
        assert!(filter.allows(&PartitionKey::single("form", "a")));
        assert!(filter.allows(&PartitionKey::single("year", 2020).with("form", "b")));
    }

    #[test]
    fn zenodo_api_root_follows_sandbox_flag() {
        let mut z = ZenodoConfig::default();
        assert_eq!(z.api_root(), "https://sandbox.zenodo.org/api");
        z.sandbox = false;
        assert_eq!(z.api_root(), "https://zenodo.org/api");
        z.api_root = Some("http://127.0.0.1:9000/api/".into());
        assert_eq!(z.api_root(), "http://127.0.0.1:9000/api");
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::new("secret-upload", "secret-publish");
        let text = format!("{creds:?}");
        assert!(!text.contains("secret"));
    }

    #[test]
    #[serial]
    fn credentials_from_env_reads_sandbox_pair() {
        // SAFETY: serialized by #[serial]; no other thread reads these variables
        unsafe {
            std::env::set_var(ENV_SANDBOX_TOKEN_UPLOAD, "up");
            std::env::set_var(ENV_SANDBOX_TOKEN_PUBLISH, "pub");
        }
        let creds = Credentials::from_env(true).unwrap();
        assert_eq!(creds.upload_token, "up");
        assert_eq!(creds.publish_token, "pub");
        unsafe {
            std::env::remove_var(ENV_SANDBOX_TOKEN_UPLOAD);
            std::env::remove_var(ENV_SANDBOX_TOKEN_PUBLISH);
        }
    }

    #[test]
    #[serial]
    fn credentials_from_env_reports_missing_variable() {
        unsafe {
            std::env::remove_var(ENV_TOKEN_UPLOAD);
            std::env::remove_var(ENV_TOKEN_PUBLISH);
        }
        match Credentials::from_env(false) {
            Err(Error::Config { key: Some(key), .. }) => assert_eq!(key, ENV_TOKEN_UPLOAD),
            other => panic!("expected config error, got {other:?}"),
        }
    }
}
