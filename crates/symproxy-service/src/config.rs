use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the proxy.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "symproxy".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// An upstream symbol server.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Base URL; keys are appended as `module/identifier/file`.
    pub url: Url,
    /// Upstreams with a lower priority are asked first.
    #[serde(default)]
    pub priority: u32,
}

fn default_upstreams() -> Vec<UpstreamConfig> {
    [
        "http://msdl.microsoft.com/download/symbols",
        "http://chromium-browser-symsrv.commondatastorage.googleapis.com",
        "http://symbols.mozilla.org",
        "http://symbols.mozilla.org/try",
    ]
    .into_iter()
    .zip(0..)
    .filter_map(|(url, priority)| {
        Some(UpstreamConfig {
            url: url.parse().ok()?,
            priority,
        })
    })
    .collect()
}

/// Tuning of upstream downloads.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Size of the chunks written to disk while streaming.
    pub chunk_size: usize,

    /// Ceiling on the bytes of a single transfer that are buffered but not yet written, in MB.
    pub max_memory_mb: u64,

    /// Maximum number of attempts per fetch. Every attempt asks all upstreams once.
    pub max_retries: u32,

    /// Backoff factor between attempts, in seconds.
    ///
    /// After attempt `n` failed, the next one starts `retry_backoff * 2^(n - 1)` seconds later.
    pub retry_backoff: f64,

    /// The timeout for establishing a connection to an upstream.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for receiving the response head from an upstream.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,

    /// The timeout for downloading from a single upstream, including the body.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,
}

impl DownloadConfig {
    /// The memory ceiling in bytes.
    pub fn max_buffered_bytes(&self) -> usize {
        let bytes = self.max_memory_mb.saturating_mul(1024 * 1024);
        usize::try_from(bytes).unwrap_or(usize::MAX)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2 * 1024 * 1024,
            max_memory_mb: 100,
            max_retries: 3,
            retry_backoff: 0.3,
            connect_timeout: Duration::from_secs(1),
            head_timeout: Duration::from_secs(30),
            // Allows a 4MB/s connection to download ~1.2GB.
            max_download_timeout: Duration::from_secs(315),
        }
    }
}

/// Configuration of the proxy, usually loaded from a YAML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory of the symbol store.
    pub cache_dir: PathBuf,

    /// Location of the tracking database. Defaults to `.tracking.db` inside `cache_dir`.
    pub database: Option<PathBuf>,

    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Upstream symbol servers.
    pub upstreams: Vec<UpstreamConfig>,

    /// Download tuning.
    pub downloads: DownloadConfig,
}

impl Config {
    /// Location of the tracking database.
    pub fn database_path(&self) -> PathBuf {
        match self.database {
            Some(ref path) => path.clone(),
            None => self.cache_dir.join(".tracking.db"),
        }
    }

    /// Upstreams in the order they are asked.
    pub fn sorted_upstreams(&self) -> Vec<UpstreamConfig> {
        let mut upstreams = self.upstreams.clone();
        // stable, so equal priorities keep their configured order
        upstreams.sort_by_key(|upstream| upstream.priority);
        upstreams
    }
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:3021".to_owned()
    } else {
        "127.0.0.1:3021".to_owned()
    }
}

/// Default value for the "cache_dir" configuration.
fn default_cache_dir() -> PathBuf {
    if is_docker() {
        PathBuf::from("/data")
    } else {
        PathBuf::from("symbols")
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            database: None,
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            upstreams: default_upstreams(),
            downloads: DownloadConfig::default(),
        }
    }
}

fn parse_env<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .map(|value| {
            value
                .trim()
                .parse()
                .with_context(|| format!("invalid value for {name}: {value:?}"))
        })
        .transpose()
}

impl Config {
    /// Loads the configuration from an optional YAML file and the environment.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            )?,
            None => Config::default(),
        };
        config.apply_env(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Applies the `SYMPROXY_*` overrides, looking up variables through `var`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        const CHUNK_SIZE: &str = "SYMPROXY_CHUNK_SIZE";
        const MAX_MEMORY_MB: &str = "SYMPROXY_MAX_MEMORY_MB";
        const MAX_RETRIES: &str = "SYMPROXY_MAX_RETRIES";
        const RETRY_BACKOFF: &str = "SYMPROXY_RETRY_BACKOFF";

        let downloads = &mut self.downloads;
        if let Some(value) = parse_env(CHUNK_SIZE, var(CHUNK_SIZE))? {
            downloads.chunk_size = value;
        }
        if let Some(value) = parse_env(MAX_MEMORY_MB, var(MAX_MEMORY_MB))? {
            downloads.max_memory_mb = value;
        }
        if let Some(value) = parse_env(MAX_RETRIES, var(MAX_RETRIES))? {
            downloads.max_retries = value;
        }
        if let Some(value) = parse_env(RETRY_BACKOFF, var(RETRY_BACKOFF))? {
            downloads.retry_backoff = value;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let downloads = &self.downloads;
        if downloads.chunk_size == 0 {
            anyhow::bail!("downloads.chunk_size must be positive");
        }
        if downloads.max_retries == 0 {
            anyhow::bail!("downloads.max_retries must be at least 1");
        }
        if !downloads.retry_backoff.is_finite() || downloads.retry_backoff < 0.0 {
            anyhow::bail!("downloads.retry_backoff must be a non-negative number");
        }
        if self.upstreams.is_empty() {
            anyhow::bail!("at least one upstream must be configured");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
