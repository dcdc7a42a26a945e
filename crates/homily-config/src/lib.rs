//! Layered configuration for homily.
//!
//! Sources are merged in order, later ones winning:
//! 1. Built-in defaults ([`DEFAULT_CONFIG`])
//! 2. A TOML file: an explicit path, else `<config dir>/homily/config.toml`
//! 3. Environment variables `HOMILY__<SECTION>__<KEY>`
//!
//! Credentials are resolved after merging. A missing credential is not an
//! error here; the provider reports it the first time it is used.

use std::path::{Path, PathBuf};

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Built-in defaults, the lowest-priority source.
pub const DEFAULT_CONFIG: &str = r#"
[database]
path = ""
read_connections = 4

[embeddings]
base_url = "https://api.openai.com/v1/embeddings"
model = "text-embedding-3-small"
timeout_secs = 30

[vector]
collection = "sermon_blocks"
vector_field = "embedding"
metric = "COSINE"
candidate_limit = 200
nprobe = 64
ef_cap = 2000
timeout_secs = 30

[retry]
max_attempts = 3
base_delay_ms = 1000
max_delay_ms = 8000

[fusion]
preset = "weighted_rrf"
alpha = 0.95
beta = 0.02
rrf_k = 60.0
hybrid = true

[cache]
ttl_ms = 4000
"#;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "HOMILY";

/// Fallback variable for the embeddings credential.
pub const EMBEDDINGS_KEY_VAR: &str = "OPENAI_API_KEY";

/// Fallback variable for the vector-store credential.
pub const VECTOR_KEY_VAR: &str = "ZILLIZ_API_KEY";

const REDACTED: &str = "***";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("no database path configured and no data directory available")]
    NoDatabase,

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub embeddings: EmbeddingsConfig,
    pub vector: VectorConfig,
    pub retry: RetryConfig,
    pub fusion: FusionConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite corpus; empty means `<data dir>/homily/sermons.db`.
    pub path: String,
    pub read_connections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Base URL of the ANN service. Semantic search is off without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub collection: String,
    pub vector_field: String,
    pub metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub candidate_limit: usize,
    pub nprobe: u32,
    pub ef_cap: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    pub preset: String,
    pub alpha: f64,
    pub beta: f64,
    pub rrf_k: f64,
    /// Fuse semantic results into general searches.
    pub hybrid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_ms: u64,
}

/// Default location of the user configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("homily").join("config.toml"))
}

fn env_layer() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

impl Config {
    /// Load configuration from defaults, `path` (or the default file if it
    /// exists) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, env_layer(), |name| std::env::var(name).ok())
    }

    /// Load with an explicit environment layer and variable lookup.
    fn load_with<L>(path: Option<&Path>, env: Environment, lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut builder =
            config::Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));

        match path {
            // An explicit file must exist.
            Some(path) => builder = builder.add_source(File::from(path).format(FileFormat::Toml)),
            None => {
                if let Some(default) = default_config_path() {
                    builder = builder.add_source(File::from(default).format(FileFormat::Toml).required(false));
                }
            }
        }

        let mut config: Config = builder.add_source(env).build()?.try_deserialize()?;
        config.embeddings.api_key = resolve_secret(config.embeddings.api_key.take(), EMBEDDINGS_KEY_VAR, &lookup);
        config.vector.api_key = resolve_secret(config.vector.api_key.take(), VECTOR_KEY_VAR, &lookup);
        config.vector.url = config.vector.url.take().filter(|u| !u.trim().is_empty());
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.database.read_connections == 0 {
            return invalid("database.read_connections must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.fusion.alpha) {
            return invalid("fusion.alpha must be between 0 and 1");
        }
        if self.fusion.beta < 0.0 || !self.fusion.beta.is_finite() {
            return invalid("fusion.beta must be a non-negative number");
        }
        if self.fusion.rrf_k <= 0.0 || !self.fusion.rrf_k.is_finite() {
            return invalid("fusion.rrf_k must be positive");
        }
        if self.vector.candidate_limit == 0 {
            return invalid("vector.candidate_limit must be at least 1");
        }
        Ok(())
    }

    /// Path of the SQLite corpus with `~` and `$VARS` expanded.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        let raw = self.database.path.trim();
        if raw.is_empty() {
            return dirs::data_dir()
                .map(|dir| dir.join("homily").join("sermons.db"))
                .ok_or(ConfigError::NoDatabase);
        }
        let expanded = shellexpand::full(raw)
            .map_err(|e| ConfigError::Invalid(format!("database.path: {e}")))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    /// Whether both credentials and an ANN endpoint are present.
    pub fn semantic_configured(&self) -> bool {
        self.vector.url.is_some() && self.embeddings.api_key.is_some() && self.vector.api_key.is_some()
    }

    /// A copy safe to print: credentials are masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.embeddings.api_key.is_some() {
            copy.embeddings.api_key = Some(REDACTED.to_string());
        }
        if copy.vector.api_key.is_some() {
            copy.vector.api_key = Some(REDACTED.to_string());
        }
        copy
    }

    /// Redacted TOML rendering.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&self.redacted())?)
    }
}

/// Expand `${VAR}` references in a configured secret, falling back to the
/// conventional variable when nothing usable is configured.
fn resolve_secret<L>(configured: Option<String>, fallback_var: &str, lookup: &L) -> Option<String>
where
    L: Fn(&str) -> Option<String>,
{
    let from_config = configured.and_then(|raw| {
        shellexpand::env_with_context(&raw, |name| {
            lookup(name).map(Some).ok_or(std::env::VarError::NotPresent)
        })
        .ok()
            .map(|s| s.into_owned())
    });
    from_config
        .or_else(|| lookup(fallback_var))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
