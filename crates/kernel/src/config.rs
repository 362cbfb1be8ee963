//! Configuration loaded from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Which search-backend driver to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Probe the cluster and pick the driver from its version info.
    Auto,
    Elasticsearch,
    OpenSearch,
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(EngineKind::Auto),
            "elasticsearch" | "elastic" => Ok(EngineKind::Elasticsearch),
            "opensearch" => Ok(EngineKind::OpenSearch),
            other => anyhow::bail!("unknown engine kind: {other}"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// Search backend base URL.
    pub engine_url: url::Url,

    /// Driver selection (default: auto).
    pub engine_kind: EngineKind,

    /// Basic-auth username for the backend.
    pub engine_username: Option<String>,

    /// Basic-auth password for the backend.
    pub engine_password: Option<String>,

    /// API key, sent instead of basic auth when present.
    pub engine_api_key: Option<String>,

    /// Allowed CORS origins; `*` allows any (default: *).
    pub cors_allowed_origins: Vec<String>,

    /// Engine tuning knobs.
    pub engine: EngineConfig,
}

/// Read-only knobs consumed by the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix for every index name (default: kestrel).
    pub index_prefix: String,

    /// Largest page a caller may request (default: 5000).
    pub max_page_size: usize,

    /// Maximum terms in one "in" clause; larger id sets are split (default: 5000).
    pub max_terms: usize,

    /// Timeout for search and count calls (default: 60s).
    pub request_timeout: Duration,

    /// Timeout for bulk calls (default: 120s).
    pub bulk_timeout: Duration,

    /// Operations per bulk call (default: 5000).
    pub bulk_batch_size: usize,

    /// Retry-on-conflict count attached to scripted updates (default: 30).
    pub retry_on_conflict: u32,

    /// Failed shards tolerated before a search is rejected (default: 0).
    pub max_shards_failure: u64,

    /// Maximum buckets returned by a terms aggregation (default: 100).
    pub max_aggregation_size: usize,

    /// Concurrent discovery groups during cascade delete (default: 4).
    pub cascade_concurrency: usize,

    /// How long the platform settings stay cached (default: 30s).
    pub settings_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            index_prefix: "kestrel".to_string(),
            max_page_size: 5000,
            max_terms: 5000,
            request_timeout: Duration::from_secs(60),
            bulk_timeout: Duration::from_secs(120),
            bulk_batch_size: 5000,
            retry_on_conflict: 30,
            max_shards_failure: 0,
            max_aggregation_size: 100,
            cascade_concurrency: 4,
            settings_ttl: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Indices searched when a caller does not name any.
    pub fn read_indices(&self) -> Vec<String> {
        vec![format!("{}_*", self.index_prefix)]
    }

    /// Index holding platform-level internal objects such as settings.
    pub fn internal_objects_index(&self) -> String {
        format!("{}_internal_objects", self.index_prefix)
    }

    /// Load engine knobs from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let index_prefix =
            env::var("ENGINE_INDEX_PREFIX").unwrap_or_else(|_| defaults.index_prefix.clone());

        Ok(Self {
            index_prefix,
            max_page_size: env_parse("ENGINE_MAX_PAGINATION", defaults.max_page_size)?,
            max_terms: env_parse("ENGINE_MAX_TERMS", defaults.max_terms)?,
            request_timeout: Duration::from_secs(env_parse(
                "ENGINE_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            bulk_timeout: Duration::from_secs(env_parse(
                "ENGINE_BULK_TIMEOUT_SECS",
                defaults.bulk_timeout.as_secs(),
            )?),
            bulk_batch_size: env_parse("ENGINE_BULK_BATCH_SIZE", defaults.bulk_batch_size)?,
            retry_on_conflict: env_parse("ENGINE_RETRY_ON_CONFLICT", defaults.retry_on_conflict)?,
            max_shards_failure: env_parse(
                "ENGINE_MAX_SHARDS_FAILURE",
                defaults.max_shards_failure,
            )?,
            max_aggregation_size: env_parse(
                "ENGINE_MAX_AGGREGATION_SIZE",
                defaults.max_aggregation_size,
            )?,
            cascade_concurrency: env_parse(
                "ENGINE_CASCADE_CONCURRENCY",
                defaults.cascade_concurrency,
            )?
            .max(1),
            settings_ttl: Duration::from_secs(env_parse(
                "ENGINE_SETTINGS_TTL_SECS",
                defaults.settings_ttl.as_secs(),
            )?),
        })
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("PORT must be a valid u16")?;

        let engine_url = env::var("ENGINE_URL")
            .context("ENGINE_URL environment variable is required")?
            .parse()
            .context("ENGINE_URL must be a valid URL")?;

        let engine_kind = env::var("ENGINE_KIND")
            .unwrap_or_else(|_| "auto".to_string())
            .parse()
            .context("ENGINE_KIND must be auto, elasticsearch or opensearch")?;

        let engine_username = env::var("ENGINE_USERNAME").ok();
        let engine_password = env::var("ENGINE_PASSWORD").ok();
        let engine_api_key = env::var("ENGINE_API_KEY").ok().filter(|k| !k.is_empty());

        let cors_allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        let engine = EngineConfig::from_env().context("invalid engine settings")?;

        Ok(Self {
            port,
            engine_url,
            engine_kind,
            engine_username,
            engine_password,
            engine_api_key,
            cors_allowed_origins,
            engine,
        })
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}
