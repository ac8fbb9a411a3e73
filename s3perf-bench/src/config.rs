//! Configuration for the benchmark and scanner.
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Command line flags
//! 2. Environment variables (prefixed with `S3PERF__`)
//! 3. YAML configuration file (specified via `-c` or `--config` flag)
//! 4. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `S3PERF__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `S3PERF__BUCKET=my-bucket` sets the bucket
//! - `S3PERF__STORAGE__TYPE=filesystem` sets the storage type
//! - `S3PERF__STORAGE__PATH=/data` sets the directory
//! - `S3PERF__BENCHMARK__WRITES=500` sets the number of writes per tier
//!
//! # YAML Configuration File
//!
//! ```yaml
//! bucket: my-bucket
//!
//! storage:
//!   type: s3compatible
//!   region: eu-central-1
//!
//! benchmark:
//!   rounds: 3
//!   tier_step: 64 KiB
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use s3perf_service::StorageConfig;
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::benchmark::{BenchmarkOptions, available_parallelism};
use crate::scanner::ScanOptions;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "S3PERF__";

/// Region used when none is configured.
pub const DEFAULT_REGION: &str = "us-west-2";

/// Newtype around `String` that protects against accidental logging of secrets in the
/// configuration. Use with [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// Returns the secret value.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Wraps a plain string into a secret.
pub fn secret(value: &str) -> SecretBox<ConfigSecret> {
    SecretBox::new(Box::new(ConfigSecret::from(value)))
}

fn default_region() -> String {
    DEFAULT_REGION.to_owned()
}

/// Storage backend configuration.
///
/// The `type` field in YAML or `__TYPE` in environment variables determines which variant is used.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Storage {
    /// Local filesystem storage (type `"filesystem"`).
    ///
    /// Each bucket is a subdirectory of `path`, and keys are relative paths within it.
    FileSystem {
        /// The directory containing the buckets.
        path: PathBuf,
    },

    /// S3-compatible storage (type `"s3compatible"`).
    ///
    /// ```yaml
    /// storage:
    ///   type: s3compatible
    ///   endpoint: http://localhost:9000
    ///   path_style: true
    /// ```
    S3Compatible {
        /// The bucket region.
        ///
        /// Defaults to `us-west-2`.
        #[serde(default = "default_region")]
        region: String,

        /// Endpoint URL for services other than AWS, such as MinIO or SeaweedFS.
        #[serde(default)]
        endpoint: Option<String>,

        /// Address buckets by path instead of by subdomain.
        #[serde(default)]
        path_style: bool,

        /// Timeout for each request, for example `30s`.
        #[serde(default, with = "humantime_serde::option")]
        request_timeout: Option<Duration>,

        /// Access key. Falls back to the AWS environment and profile when unset.
        #[serde(default)]
        access_key: Option<SecretBox<ConfigSecret>>,

        /// Secret key. Falls back to the AWS environment and profile when unset.
        #[serde(default)]
        secret_key: Option<SecretBox<ConfigSecret>>,
    },
}

impl Default for Storage {
    fn default() -> Self {
        Storage::S3Compatible {
            region: default_region(),
            endpoint: None,
            path_style: false,
            request_timeout: None,
            access_key: None,
            secret_key: None,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty for a TTY, simplified otherwise.
    Auto,
    /// Pretty printing with colors.
    Pretty,
    /// Simplified plain text output.
    Simplified,
    /// JSON lines.
    Json,
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr. Progress reports go to stdout and are not affected.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level. `RUST_LOG` takes precedence when set.
    ///
    /// Defaults to `INFO`.
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Datadog API key. Metrics are only pushed when this is set.
    pub datadog_key: Option<SecretBox<ConfigSecret>>,

    /// Global tags applied to all pushed metrics.
    ///
    /// Each tag is set individually, for example `S3PERF__METRICS__TAGS__ENV=staging`.
    pub tags: BTreeMap<String, String>,

    /// Interval of the periodic metrics report.
    ///
    /// Defaults to 60 seconds for the benchmark and 5 seconds for the scanner.
    #[serde(with = "humantime_serde::option")]
    pub report_interval: Option<Duration>,
}

/// Runtime configuration for the Tokio async runtime.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Number of runtime worker threads.
    ///
    /// Defaults to the number of available CPUs. Concurrency is limited by the admission gate, not
    /// by this setting.
    pub worker_threads: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: available_parallelism(),
        }
    }
}

/// Settings of the write-then-read benchmark.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Benchmark {
    /// Base concurrency per available CPU.
    pub multiplier: usize,
    /// Number of rounds.
    pub rounds: usize,
    /// Objects written per size tier.
    pub writes: usize,
    /// Concurrency added per round.
    pub concurrency_step: usize,
    /// Number of payload size tiers.
    pub tier_count: usize,
    /// Size difference between consecutive tiers.
    pub tier_step: ByteSize,
    /// Prefix for all written keys.
    pub key_prefix: String,
}

impl Default for Benchmark {
    fn default() -> Self {
        let options = BenchmarkOptions::default();
        Self {
            multiplier: options.multiplier,
            rounds: options.rounds,
            writes: options.writes,
            concurrency_step: options.concurrency_step,
            tier_count: options.tier_count,
            tier_step: ByteSize::b(options.tier_step),
            key_prefix: options.key_prefix,
        }
    }
}

impl Benchmark {
    /// Driver options for this configuration.
    pub fn options(&self) -> BenchmarkOptions {
        BenchmarkOptions {
            multiplier: self.multiplier,
            rounds: self.rounds,
            writes: self.writes,
            concurrency_step: self.concurrency_step,
            tier_count: self.tier_count,
            tier_step: self.tier_step.as_u64(),
            key_prefix: self.key_prefix.clone(),
            parallelism: available_parallelism(),
        }
    }
}

/// Settings of the scanner.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Scanner {
    /// Concurrency per available CPU.
    pub multiplier: usize,
    /// Only objects below this prefix are scanned.
    pub prefix: String,
    /// Objects per listing page for backends that support it.
    pub page_size: Option<usize>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            multiplier: 60,
            prefix: String::new(),
            page_size: None,
        }
    }
}

impl Scanner {
    /// Driver options for this configuration.
    ///
    /// The scan path is required, an empty prefix would scan the whole bucket.
    pub fn options(&self) -> Result<ScanOptions> {
        anyhow::ensure!(!self.prefix.is_empty(), "no scan path configured");

        Ok(ScanOptions {
            prefix: self.prefix.clone(),
            concurrency: available_parallelism().saturating_mul(self.multiplier),
        })
    }
}

/// Main configuration struct for both tools.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The bucket to operate on. Required, either here or on the command line.
    pub bucket: String,
    /// Storage backend.
    pub storage: Storage,
    /// Logging.
    pub logging: Logging,
    /// Metrics reporting.
    pub metrics: Metrics,
    /// Async runtime.
    pub runtime: Runtime,
    /// The benchmark tool.
    pub benchmark: Benchmark,
    /// The scanner tool.
    pub scanner: Scanner,
}

impl Config {
    /// Loads configuration from defaults, an optional YAML file and the environment.
    ///
    /// Later sources override earlier ones. Command line flags are applied by the caller.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("failed to load configuration")?;

        Ok(config)
    }

    /// Overrides the configured credentials, if the storage supports them.
    pub fn set_credentials(&mut self, access: Option<&str>, secret: Option<&str>) {
        if let Storage::S3Compatible {
            access_key,
            secret_key,
            ..
        } = &mut self.storage
        {
            if let Some(access) = access {
                *access_key = Some(self::secret(access));
            }
            if let Some(secret) = secret {
                *secret_key = Some(self::secret(secret));
            }
        }
    }

    /// Overrides the configured region, if the storage has one.
    pub fn set_region(&mut self, value: &str) {
        if let Storage::S3Compatible { region, .. } = &mut self.storage {
            *region = value.to_owned();
        }
    }

    /// Backend configuration for [`StorageService::new`](s3perf_service::StorageService::new).
    pub fn storage_config(&self) -> Result<StorageConfig<'_>> {
        anyhow::ensure!(!self.bucket.is_empty(), "no bucket configured");

        let config = match &self.storage {
            Storage::FileSystem { path } => StorageConfig::FileSystem {
                path,
                bucket: &self.bucket,
                page_size: self.scanner.page_size,
            },
            Storage::S3Compatible {
                region,
                endpoint,
                path_style,
                request_timeout,
                access_key,
                secret_key,
            } => StorageConfig::S3Compatible {
                bucket: &self.bucket,
                region,
                endpoint: endpoint.as_deref(),
                path_style: *path_style,
                request_timeout: *request_timeout,
                access_key: access_key.as_ref().map(|key| key.expose_secret().as_str()),
                secret_key: secret_key.as_ref().map(|key| key.expose_secret().as_str()),
                page_size: self.scanner.page_size,
            },
        };

        Ok(config)
    }
}
