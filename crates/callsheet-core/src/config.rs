//! Typed environment configuration.
//!
//! Every recognized option has a default suitable for local development, so
//! `AppConfig::from_env()` only fails on values that parse but are invalid.
//! Secrets are kept out of `Debug` output.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default timeouts for external calls (spec'd per call site, collected here
/// so every component agrees on the budget).
pub mod timeouts {
    use std::time::Duration;

    pub const GRAPH_QUERY: Duration = Duration::from_secs(2);
    pub const GRAPH_VECTOR: Duration = Duration::from_secs(5);
    pub const CACHE_OP: Duration = Duration::from_millis(500);
    pub const LLM_CALL: Duration = Duration::from_secs(30);
    pub const LLM_STREAM: Duration = Duration::from_secs(120);
    pub const TOOL_CALL: Duration = Duration::from_secs(10);
    pub const HEALTH_PROBE: Duration = Duration::from_secs(1);
}

/// Read an env var, falling back to a default when unset or empty.
pub fn env_string_or_default(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

/// Read and parse an env var, falling back to a default when unset; a set
/// but unparseable value is an error rather than a silent fallback.
pub fn env_parse_or_default<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|_| Error::validation(format!("invalid value for {name}: {v:?}"))),
        _ => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(Error::validation(format!(
                "invalid boolean for {name}: {other:?}"
            ))),
        },
        _ => Ok(default),
    }
}

/// Knowledge-graph store connection settings.
#[derive(Clone)]
pub struct GraphConfig {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub pool_max: usize,
    pub connection_timeout: Duration,
    pub encrypted: bool,
}

impl GraphConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            uri: env_string_or_default("CALLSHEET_NEO4J_URI", "bolt://localhost:7687"),
            username: env_string_or_default("CALLSHEET_NEO4J_USERNAME", "neo4j"),
            password: env_string_or_default("CALLSHEET_NEO4J_PASSWORD", ""),
            database: env_string_or_default("CALLSHEET_NEO4J_DATABASE", "neo4j"),
            pool_max: env_parse_or_default("CALLSHEET_NEO4J_POOL_MAX", 100)?,
            connection_timeout: Duration::from_secs(env_parse_or_default(
                "CALLSHEET_NEO4J_CONNECTION_TIMEOUT_S",
                30u64,
            )?),
            encrypted: env_bool("CALLSHEET_NEO4J_ENCRYPTED", false)?,
        })
    }
}

impl std::fmt::Debug for GraphConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphConfig")
            .field("uri", &self.uri)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("pool_max", &self.pool_max)
            .field("connection_timeout", &self.connection_timeout)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

/// Key-value cache connection settings.
#[derive(Clone)]
pub struct CacheConfig {
    pub url: String,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_string_or_default("CALLSHEET_REDIS_URL", "redis://localhost:6379/0"),
        }
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the URL may embed credentials; mask everything after the scheme
        let scheme = self.url.split("://").next().unwrap_or("redis");
        f.debug_struct("CacheConfig")
            .field("url", &format!("{scheme}://[REDACTED]"))
            .finish()
    }
}

/// Settings for one LLM provider.
#[derive(Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub default_model: String,
    pub base_url: String,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &"[REDACTED]")
            .field("default_model", &self.default_model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// LLM router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub together: ProviderConfig,
    pub openai: ProviderConfig,
    /// Providers eligible for principals above the sensitivity floor.
    pub trusted_providers: Vec<String>,
    /// Principals with `data_access_level` above this are restricted to the
    /// trusted set.
    pub sensitivity_floor: u8,
    /// How long a failed health probe keeps a provider out of rotation.
    pub health_cooldown: Duration,
}

impl RouterConfig {
    pub fn from_env() -> Result<Self> {
        let trusted = env_string_or_default("CALLSHEET_TRUSTED_PROVIDERS", "openai");
        Ok(Self {
            together: ProviderConfig {
                api_key: env_string_or_default("TOGETHER_API_KEY", ""),
                default_model: env_string_or_default(
                    "CALLSHEET_TOGETHER_MODEL",
                    "meta-llama/Meta-Llama-3.1-70B-Instruct-Turbo",
                ),
                base_url: env_string_or_default(
                    "CALLSHEET_TOGETHER_BASE_URL",
                    "https://api.together.xyz/v1",
                ),
            },
            openai: ProviderConfig {
                api_key: env_string_or_default("OPENAI_API_KEY", ""),
                default_model: env_string_or_default("CALLSHEET_OPENAI_MODEL", "gpt-4o"),
                base_url: env_string_or_default(
                    "CALLSHEET_OPENAI_BASE_URL",
                    "https://api.openai.com/v1",
                ),
            },
            trusted_providers: trusted
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            sensitivity_floor: env_parse_or_default("CALLSHEET_SENSITIVITY_FLOOR", 4u8)?,
            health_cooldown: Duration::from_secs(env_parse_or_default(
                "CALLSHEET_PROVIDER_HEALTH_COOLDOWN_S",
                60u64,
            )?),
        })
    }
}

/// Memory subsystem settings.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub workers: usize,
    pub extraction_retries: u32,
    pub consolidation_interval: Duration,
    /// Cosine similarity at or above which two items of the same type are
    /// considered duplicates.
    pub dedup_similarity: f32,
    /// Mean pairwise cosine a cluster must reach before consolidation.
    pub consolidation_cohesion: f32,
    pub min_cluster_size: usize,
}

impl MemoryConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            workers: env_parse_or_default("CALLSHEET_MEMORY_WORKERS", 4usize)?,
            extraction_retries: env_parse_or_default("CALLSHEET_MEMORY_EXTRACTION_RETRIES", 3u32)?,
            consolidation_interval: Duration::from_secs(env_parse_or_default(
                "CALLSHEET_MEMORY_CONSOLIDATION_INTERVAL_S",
                3600u64,
            )?),
            dedup_similarity: env_parse_or_default("CALLSHEET_MEMORY_DEDUP_SIMILARITY", 0.92f32)?,
            consolidation_cohesion: env_parse_or_default(
                "CALLSHEET_MEMORY_CONSOLIDATION_COHESION",
                0.85f32,
            )?,
            min_cluster_size: env_parse_or_default("CALLSHEET_MEMORY_MIN_CLUSTER_SIZE", 3usize)?,
        })
    }
}

/// RBAC settings.
#[derive(Debug, Clone)]
pub struct RbacConfig {
    pub permission_cache_ttl_secs: u64,
    /// Kept for configuration surface completeness; the gate always fails
    /// closed and this flag may only make that stricter, never looser.
    pub fail_closed: bool,
}

impl RbacConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            permission_cache_ttl_secs: env_parse_or_default(
                "CALLSHEET_PERMISSION_CACHE_TTL_S",
                900u64,
            )?,
            fail_closed: true,
        })
    }
}

/// Server runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    pub websocket_buffer_frames: usize,
    pub log_level: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env_string_or_default("CALLSHEET_HOST", "127.0.0.1"),
            port: env_parse_or_default("CALLSHEET_PORT", 8000u16)?,
            websocket_buffer_frames: env_parse_or_default(
                "CALLSHEET_WEBSOCKET_BUFFER_FRAMES",
                256usize,
            )?,
            log_level: env_string_or_default("CALLSHEET_LOG_LEVEL", "info"),
        })
    }
}

/// Complete application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub graph: GraphConfig,
    pub cache: CacheConfig,
    pub router: RouterConfig,
    pub memory: MemoryConfig,
    pub rbac: RbacConfig,
    pub runtime: RuntimeConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            graph: GraphConfig::from_env()?,
            cache: CacheConfig::from_env(),
            router: RouterConfig::from_env()?,
            memory: MemoryConfig::from_env()?,
            rbac: RbacConfig::from_env()?,
            runtime: RuntimeConfig::from_env()?,
        })
    }
}
