use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use beacon_common::RetryPolicy;
use beacon_log::LogConfig;
use beacon_sampling::{SamplingConfig, SamplingMode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::byte_size::ByteSize;
use crate::overrides::OverridableConfig;

/// Default ingestion endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://dc.services.visualstudio.com/v2/track";

/// Namespace for deriving the default storage folder from the endpoint URL.
const STORAGE_NAMESPACE: uuid::Uuid = uuid::Uuid::from_u128(0x6f1c_2a8e_54b7_4d3c_9a0e_b3f5_2c71_d804);

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
        }
    }
}

/// The kind of a [`ConfigError`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to serialize the configuration.
    #[error("could not write config")]
    CouldNotWrite,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            cause: Some(Box::new(cause)),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn for_field<E>(cause: E, field: &str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(path.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

trait ConfigObject: DeserializeOwned + Serialize {
    /// The basename of the config file, without the `.yml` extension.
    fn name() -> &'static str;

    /// The full filename of the config file, including the file extension.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.yml", Self::name()))
    }

    /// Loads the config file from a file within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        serde_yaml::from_reader(io::BufReader::new(f))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path))
    }
}

/// Where and how telemetry is submitted.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Endpoint {
    /// The ingestion URL receiving batches.
    url: Url,
    /// The key identifying the application, written into every envelope.
    instrumentation_key: Option<String>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            url: default_endpoint(),
            instrumentation_key: None,
        }
    }
}

fn default_endpoint() -> Url {
    match Url::parse(DEFAULT_ENDPOINT) {
        Ok(url) => url,
        Err(_) => unreachable!("the default endpoint is a valid URL"),
    }
}

/// Controls when the item buffer is turned into a batch.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Buffer {
    /// Number of items after which a batch is created.
    max_items: usize,
    /// Estimated serialized size after which a batch is created.
    max_size: ByteSize,
    /// Interval in seconds at which the buffer is flushed regardless of its size.
    flush_interval: u64,
    /// Number of full batches that may wait for the scheduler before items are dropped.
    max_pending_batches: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self {
            max_items: 500,
            max_size: ByteSize::mebibytes(5),
            flush_interval: 30,
            max_pending_batches: 10,
        }
    }
}

/// The compression applied to outgoing payloads.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpEncoding {
    /// No compression.
    Identity,
    /// Gzip compression.
    #[default]
    Gzip,
}

impl HttpEncoding {
    /// Returns the value of the `Content-Encoding` header, if any.
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::Identity => None,
            Self::Gzip => Some("gzip"),
        }
    }
}

/// Controls the HTTP client.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Http {
    /// Timeout for a complete request in seconds.
    timeout: u64,
    /// Timeout for establishing connections in seconds.
    connection_timeout: u64,
    /// Maximum number of transmissions in flight at the same time.
    max_concurrent_requests: usize,
    /// Compression of request bodies.
    encoding: HttpEncoding,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            timeout: 30,
            connection_timeout: 5,
            max_concurrent_requests: 3,
            encoding: HttpEncoding::Gzip,
        }
    }
}

/// Controls retries of failed transmissions.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Retry {
    /// Number of failed attempts after which a transmission is dropped.
    max_attempts: u32,
    /// Delay after the first failure in milliseconds.
    initial_interval: u64,
    /// Upper bound of the delay in seconds.
    max_interval: u64,
    /// Relative randomization of retry delays.
    jitter: f64,
    /// Pause in seconds after a throttling response without `Retry-After`.
    throttle_default: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_interval: 10_000,
            max_interval: 600,
            jitter: 0.1,
            throttle_default: 60,
        }
    }
}

/// Controls the persistent overflow store.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Storage {
    /// Folder holding the records. Defaults to a folder per endpoint in the temp directory.
    path: Option<PathBuf>,
    /// Quota for the total size of all records.
    max_size: ByteSize,
    /// Timeout for a single disk operation in seconds.
    io_timeout: u64,
    /// Interval in seconds at which stored records are retried.
    drain_interval: u64,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            path: None,
            max_size: ByteSize::mebibytes(50),
            io_timeout: 5,
            drain_interval: 15,
        }
    }
}

/// Process level limits.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Limits {
    /// Time in seconds the channel may take to flush on shutdown.
    shutdown_timeout: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            shutdown_timeout: 10,
        }
    }
}

/// Controls internal metrics.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Metrics {
    /// Host and port of the StatsD server. Metrics are disabled if not set.
    statsd: Option<String>,
    /// Prefix for all metric names.
    prefix: String,
    /// Tags added to all metrics.
    default_tags: BTreeMap<String, String>,
    /// Fraction of metrics that is sent, between `0.0` and `1.0`.
    sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "beacon".to_owned(),
            default_tags: BTreeMap::new(),
            sample_rate: 1.0,
        }
    }
}

/// Controls developer facing diagnostics.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
struct Diagnostics {
    /// Mirrors pipeline diagnostics to the platform's debug output.
    debug_output: bool,
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
struct ConfigValues {
    endpoint: Endpoint,
    buffer: Buffer,
    sampling: SamplingConfig,
    http: Http,
    retry: Retry,
    storage: Storage,
    limits: Limits,
    logging: LogConfig,
    metrics: Metrics,
    diagnostics: Diagnostics,
}

impl ConfigObject for ConfigValues {
    fn name() -> &'static str {
        "config"
    }
}

/// The configuration of the telemetry channel.
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            values: ConfigValues::default(),
            path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// A missing `config.yml` yields the default configuration.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = std::env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let values = if Self::config_exists(&path) {
            ConfigValues::load(&path)?
        } else {
            ConfigValues::default()
        };

        let config = Config { values, path };
        config.validate().map_err(|e| e.file(ConfigValues::path(&config.path)))?;
        Ok(config)
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        let config = Config {
            values: serde_json::from_value(value)
                .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(endpoint) = overrides.endpoint {
            self.values.endpoint.url =
                Url::parse(&endpoint).map_err(|err| ConfigError::for_field(err, "endpoint"))?;
        }

        if let Some(instrumentation_key) = overrides.instrumentation_key {
            self.values.endpoint.instrumentation_key =
                Some(instrumentation_key).filter(|key| !key.is_empty());
        }

        if let Some(storage_path) = overrides.storage_path {
            self.values.storage.path = Some(PathBuf::from(storage_path));
        }

        if let Some(percentage) = overrides.sampling_percentage {
            let percentage = percentage
                .parse::<f64>()
                .map_err(|err| ConfigError::for_field(err, "sampling_percentage"))?;

            let sampling = &mut self.values.sampling;
            sampling.percentage = percentage;
            if sampling.mode == SamplingMode::Disabled {
                sampling.mode = SamplingMode::Fixed;
            }
        }

        if let Some(shutdown_timeout) = overrides.shutdown_timeout {
            self.values.limits.shutdown_timeout = shutdown_timeout
                .parse()
                .map_err(|err| ConfigError::for_field(err, "shutdown_timeout"))?;
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str| ConfigError::new(ConfigErrorKind::InvalidValue).field(field);

        if self.values.buffer.max_items == 0 {
            return Err(invalid("buffer.max_items"));
        }
        if self.values.http.max_concurrent_requests == 0 {
            return Err(invalid("http.max_concurrent_requests"));
        }
        if !(0.0..=100.0).contains(&self.values.sampling.percentage) {
            return Err(invalid("sampling.percentage"));
        }

        let adaptive = &self.values.sampling.adaptive;
        if !(adaptive.min_percentage > 0.0
            && adaptive.min_percentage <= adaptive.max_percentage
            && adaptive.max_percentage <= 100.0)
        {
            return Err(invalid("sampling.adaptive"));
        }

        Ok(())
    }

    /// Checks if a config file exists in the given folder.
    pub fn config_exists<P: AsRef<Path>>(path: P) -> bool {
        fs::metadata(ConfigValues::path(path.as_ref())).is_ok()
    }

    /// Returns the folder the config was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::CouldNotWrite))
    }

    /// Returns the ingestion URL.
    pub fn endpoint(&self) -> &Url {
        &self.values.endpoint.url
    }

    /// Returns the instrumentation key added to every envelope.
    pub fn instrumentation_key(&self) -> Option<&str> {
        self.values.endpoint.instrumentation_key.as_deref()
    }

    /// Returns the number of items after which the buffer creates a batch.
    pub fn buffer_max_items(&self) -> usize {
        self.values.buffer.max_items
    }

    /// Returns the estimated batch size in bytes after which the buffer creates a batch.
    pub fn buffer_max_size(&self) -> usize {
        self.values.buffer.max_size.as_bytes().try_into().unwrap_or(usize::MAX)
    }

    /// Returns the interval at which the buffer is flushed.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.values.buffer.flush_interval)
    }

    /// Returns the number of full batches that may be held in memory.
    pub fn max_pending_batches(&self) -> usize {
        self.values.buffer.max_pending_batches.max(1)
    }

    /// Returns the sampling configuration.
    pub fn sampling(&self) -> &SamplingConfig {
        &self.values.sampling
    }

    /// Returns the timeout for a single request.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.timeout)
    }

    /// Returns the connection timeout.
    pub fn http_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.connection_timeout)
    }

    /// Returns the maximum number of concurrent transmissions.
    pub fn max_concurrent_requests(&self) -> usize {
        self.values.http.max_concurrent_requests
    }

    /// Returns the compression applied to request bodies.
    pub fn http_encoding(&self) -> HttpEncoding {
        self.values.http.encoding
    }

    /// Returns the retry policy for failed transmissions.
    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.values.retry;
        RetryPolicy {
            initial_interval: Duration::from_millis(retry.initial_interval),
            max_interval: Duration::from_secs(retry.max_interval),
            jitter: retry.jitter,
            max_attempts: retry.max_attempts,
        }
    }

    /// Returns the pause after a throttling response without a `Retry-After` header.
    pub fn throttle_default(&self) -> Duration {
        Duration::from_secs(self.values.retry.throttle_default)
    }

    /// Returns the upper bound for throttling pauses without a `Retry-After` header.
    pub fn throttle_max(&self) -> Duration {
        Duration::from_secs(self.values.retry.max_interval)
    }

    /// Returns the folder of the overflow store.
    ///
    /// Unless configured explicitly, every endpoint gets its own folder in the temp directory so
    /// that records are never delivered to the wrong endpoint.
    pub fn storage_path(&self) -> PathBuf {
        if let Some(ref path) = self.values.storage.path {
            return self.path.join(path);
        }

        let endpoint = self.values.endpoint.url.as_str();
        let hash = uuid::Uuid::new_v5(&STORAGE_NAMESPACE, endpoint.as_bytes());
        std::env::temp_dir()
            .join("beacon")
            .join(hash.simple().to_string())
    }

    /// Returns the quota of the overflow store in bytes.
    pub fn storage_max_size(&self) -> u64 {
        self.values.storage.max_size.as_bytes()
    }

    /// Returns the timeout for a single disk operation.
    pub fn storage_io_timeout(&self) -> Duration {
        Duration::from_secs(self.values.storage.io_timeout)
    }

    /// Returns the interval at which stored records are retried.
    pub fn storage_drain_interval(&self) -> Duration {
        Duration::from_secs(self.values.storage.drain_interval)
    }

    /// Returns the time the channel may take to flush on shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.shutdown_timeout)
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the StatsD server address, if metrics are enabled.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Returns the prefix for metric names.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the tags added to all metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the sample rate of internal metrics.
    pub fn metrics_sample_rate(&self) -> f64 {
        self.values.metrics.sample_rate
    }

    /// Returns `true` if diagnostics are mirrored to the debug output.
    pub fn debug_output(&self) -> bool {
        self.values.diagnostics.debug_output
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use beacon_common::TelemetryKind;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.endpoint().as_str(), DEFAULT_ENDPOINT);
        assert_eq!(config.buffer_max_items(), 500);
        assert_eq!(config.buffer_max_size(), 5 * 1024 * 1024);
        assert_eq!(config.flush_interval(), Duration::from_secs(30));
        assert_eq!(config.max_concurrent_requests(), 3);
        assert_eq!(config.http_encoding(), HttpEncoding::Gzip);
        assert_eq!(config.storage_max_size(), 50 * 1024 * 1024);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.sampling().mode, SamplingMode::Disabled);
    }

    #[test]
    fn test_from_json_value() {
        let config = Config::from_json_value(json!({
            "endpoint": {
                "url": "http://localhost:8080/v2/track",
                "instrumentation_key": "abc",
            },
            "buffer": {"max_items": 10, "max_size": "1KiB"},
            "sampling": {
                "mode": "fixed",
                "percentage": 25.0,
                "excluded_kinds": ["exception"],
            },
            "http": {"encoding": "identity"},
        }))
        .unwrap();

        assert_eq!(config.endpoint().as_str(), "http://localhost:8080/v2/track");
        assert_eq!(config.instrumentation_key(), Some("abc"));
        assert_eq!(config.buffer_max_items(), 10);
        assert_eq!(config.buffer_max_size(), 1024);
        assert_eq!(config.http_encoding(), HttpEncoding::Identity);
        assert_eq!(config.sampling().mode, SamplingMode::Fixed);
        assert_eq!(config.sampling().excluded_kinds, [TelemetryKind::Exception]);
    }

    #[test]
    fn test_invalid_values() {
        let error = Config::from_json_value(json!({"http": {"max_concurrent_requests": 0}}))
            .unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
        assert_eq!(
            error.to_string(),
            "invalid config value (field http.max_concurrent_requests)"
        );

        let error = Config::from_json_value(json!({"buffer": {"max_items": "ten"}})).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadJson);
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("config.yml")).unwrap();
        writeln!(file, "storage:\n  path: records\n  max_size: 1MiB").unwrap();
        writeln!(file, "limits:\n  shutdown_timeout: 3").unwrap();

        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.storage_path(), dir.path().join("records"));
        assert_eq!(config.storage_max_size(), 1024 * 1024);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_from_path_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.buffer_max_items(), 500);
    }

    #[test]
    fn test_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yml"), "buffer: [").unwrap();

        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
        assert!(error.source().is_some());
    }

    #[test]
    fn test_default_storage_path_per_endpoint() {
        let first = Config::default();
        let mut second = Config::default();
        second
            .apply_override(OverridableConfig {
                endpoint: Some("http://localhost:1234/".to_owned()),
                ..Default::default()
            })
            .unwrap();

        assert_ne!(first.storage_path(), second.storage_path());
        assert_eq!(first.storage_path(), Config::default().storage_path());
        assert!(first.storage_path().starts_with(std::env::temp_dir()));
    }

    #[test]
    fn test_apply_override() {
        let mut config = Config::default();
        config
            .apply_override(OverridableConfig {
                instrumentation_key: Some("key".to_owned()),
                sampling_percentage: Some("20".to_owned()),
                shutdown_timeout: Some("1".to_owned()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(config.instrumentation_key(), Some("key"));
        assert_eq!(config.sampling().mode, SamplingMode::Fixed);
        assert_eq!(config.sampling().percentage, 20.0);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(1));

        let error = config
            .apply_override(OverridableConfig {
                endpoint: Some("not a url".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(error.to_string(), "invalid config value (field endpoint)");
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = config.to_yaml_string().unwrap();
        similar_asserts::assert_eq!(
            serde_yaml::from_str::<serde_yaml::Value>(&yaml).unwrap()["buffer"]["max_size"],
            serde_yaml::Value::String("5MiB".to_owned())
        );
    }
}
