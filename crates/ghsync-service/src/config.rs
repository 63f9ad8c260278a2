use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
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
    /// The default log level, used when `RUST_LOG` is not set.
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
    /// A tag name to report the environment to, for each metric. Defaults to not sending such a tag.
    pub environment_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "ghsync".into(),
            hostname_tag: None,
            environment_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Freshness and sizing of a single entity cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum age of an entry before it is considered stale and re-fetched.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum number of entries held by the in-memory backend.
    ///
    /// This has no effect when a `cache_dir` is configured.
    pub in_memory_capacity: u64,
}

impl CacheConfig {
    fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            in_memory_capacity: 10_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(3600 * 24))
    }
}

/// Per entity kind cache configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// User profiles.
    pub users: CacheConfig,
    /// Repository lists.
    pub repos: CacheConfig,
    /// Technology statistics derived from repository lists.
    pub tech_stats: CacheConfig,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            users: CacheConfig::with_ttl(Duration::from_secs(3600 * 24)),
            repos: CacheConfig::with_ttl(Duration::from_secs(3600 * 6)),
            tech_stats: CacheConfig::with_ttl(Duration::from_secs(3600 * 6)),
        }
    }
}

/// Access to the GitHub REST API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct GitHubConfig {
    /// Base URL of the API. Must end with a `/`.
    pub api_url: Url,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for a whole request, including the response body.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum number of repository pages (100 repositories each) fetched per user.
    pub max_repo_pages: usize,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: Url::parse("https://api.github.com/").expect("valid static URL"),
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
            max_repo_pages: 10,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for persisting cache entries.
    ///
    /// Caches are held in memory when this is not set.
    pub cache_dir: Option<PathBuf>,

    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune cache freshness.
    pub caches: CacheConfigs,

    /// Age after which an in-flight fetch no longer blocks a new fetch for the same key.
    #[serde(with = "humantime_serde")]
    pub pending_timeout: Duration,

    /// Maximum entry age kept by the `cleanup` command.
    #[serde(with = "humantime_serde")]
    pub cleanup_older_than: Duration,

    /// Serve stale cached or persisted data when a fetch fails.
    pub serve_stale_on_error: bool,

    /// Bearer token required by the administrative endpoints.
    ///
    /// Administrative endpoints reject all requests when this is not set.
    pub admin_token: Option<String>,

    /// Access to the GitHub API.
    pub github: GitHubConfig,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this returns `None`.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
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
        "0.0.0.0:3030".to_owned()
    } else {
        "127.0.0.1:3030".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            pending_timeout: Duration::from_secs(5 * 60),
            cleanup_older_than: Duration::from_secs(3600 * 24 * 30),
            serve_stale_on_error: true,
            admin_token: None,
            github: GitHubConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
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
