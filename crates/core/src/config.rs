//! Configuration types shared across crates.

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment variable overrides (`FERRY_LOCK__WAIT_TIMEOUT_MS=...`).
pub const ENV_PREFIX: &str = "FERRY_";

/// Storage backend configuration. Selected once at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Chunks appended to files under a local root directory.
    Local {
        /// Root directory for in-progress and published objects.
        root: PathBuf,
    },
    /// S3-compatible multipart upload API.
    RemoteMultipart {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key.
        secret_access_key: Option<String>,
        /// Force path-style URLs. Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
        /// Size of every non-final part, in bytes.
        #[serde(default = "default_part_size_bytes")]
        part_size_bytes: u64,
        /// Upper bound on part uploads in flight in this process.
        #[serde(default = "default_max_concurrent_parts")]
        max_concurrent_parts: usize,
        /// Seconds an untouched upload stays resumable before it is eligible for cleanup.
        #[serde(default = "default_expiry_secs")]
        expiry_secs: u64,
    },
}

fn default_part_size_bytes() -> u64 {
    crate::DEFAULT_PART_SIZE
}

fn default_max_concurrent_parts() -> usize {
    100
}

fn default_expiry_secs() -> u64 {
    86400 // 24 hours
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            root: PathBuf::from("./data/uploads"),
        }
    }
}

impl StorageConfig {
    /// Name of the selected backend kind as it appears in configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::RemoteMultipart { .. } => "remote-multipart",
        }
    }

    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Local { root } => {
                if root.as_os_str().is_empty() {
                    return Err("local storage requires a non-empty root".to_string());
                }
                Ok(())
            }
            Self::RemoteMultipart {
                bucket,
                access_key_id,
                secret_access_key,
                part_size_bytes,
                max_concurrent_parts,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("remote-multipart storage requires a bucket".to_string());
                }
                if access_key_id.is_some() != secret_access_key.is_some() {
                    return Err(
                        "remote-multipart config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    );
                }
                if *part_size_bytes < crate::MIN_PART_SIZE {
                    return Err(format!(
                        "part_size_bytes {part_size_bytes} is below the multipart minimum of {}",
                        crate::MIN_PART_SIZE
                    ));
                }
                if *max_concurrent_parts == 0 {
                    return Err("max_concurrent_parts must be at least 1".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single process deployments and tests).
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
    /// PostgreSQL database. Required when several processes share uploads.
    Postgres {
        /// Connection URL.
        url: String,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default)]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
        }
    }
}

/// Distributed lock configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long an operation waits for a held lock before giving up.
    #[serde(default = "default_lock_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    /// Age after which a lock row is reported as stale to the reaper.
    #[serde(default = "default_lock_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_lock_wait_timeout_ms() -> u64 {
    10_000
}

fn default_lock_stale_after_secs() -> u64 {
    600 // 10 minutes
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: default_lock_wait_timeout_ms(),
            stale_after_secs: default_lock_stale_after_secs(),
        }
    }
}

impl LockConfig {
    /// Lock wait timeout as a Duration.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Staleness threshold as a Duration.
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Upload size limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Ceiling applied when neither tenant nor bucket sets a tighter limit.
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
}

fn default_max_file_size_bytes() -> u64 {
    crate::DEFAULT_MAX_FILE_SIZE
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size_bytes(),
        }
    }
}

/// Retry policy for transient backend failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// Complete configuration for the upload core.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Lock configuration.
    #[serde(default)]
    pub lock: LockConfig,
    /// Size limit configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl AppConfig {
    /// Load configuration from an optional TOML file, overridden by `FERRY_*` env vars.
    ///
    /// Nested keys use `__` as separator, e.g. `FERRY_STORAGE__TYPE=local`.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                return Err(crate::Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> crate::Result<()> {
        self.storage.validate().map_err(crate::Error::Config)?;
        if self.lock.wait_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "lock.wait_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
