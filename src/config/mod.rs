//! Configuration for bizlens.
//!
//! Loaded from `~/.bizlens/config.json` (or `--config` / `BIZLENS_CONFIG`),
//! every section optional, then overridden by environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LensError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub analysis: AnalysisConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1:8787).
    pub bind: String,
    /// Origins allowed to call the API from a browser.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            cors_origins: vec!["http://localhost:5173".to_string()],
        }
    }
}

/// Row-store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection URL. Required for `serve` and `query`.
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Per-statement timeout applied to each connection (0 disables).
    pub statement_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_secs: 10,
            statement_timeout_secs: 30,
        }
    }
}

/// Query result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default entry lifetime in seconds.
    pub ttl_secs: u64,
    /// Background sweep period in seconds; 0 disables the sweep.
    pub sweep_interval_secs: u64,
    /// Coalesce concurrent identical cache misses and enrichments.
    pub coalesce: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            sweep_interval_secs: 600,
            coalesce: true,
        }
    }
}

/// Analysis workflow service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Base URL of the workflow API, e.g. `https://api.dify.ai/v1`.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Overall request timeout, streamed body included.
    pub timeout_secs: u64,
    /// User identifier sent with each workflow run.
    pub user: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: 120,
            user: "bizlens".to_string(),
        }
    }
}

impl AnalysisConfig {
    /// True when both endpoint and key are present and non-empty.
    pub fn is_configured(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.endpoint) && present(&self.api_key)
    }
}

/// Query registry location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: Config::dir().join("queries.toml"),
        }
    }
}

/// Log output settings. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Configuration directory (`~/.bizlens`).
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bizlens")
    }

    /// Default config file path, honouring `BIZLENS_CONFIG`.
    pub fn path() -> PathBuf {
        std::env::var("BIZLENS_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::dir().join("config.json"))
    }

    /// Parse a config file without applying environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            LensError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&data)
            .map_err(|e| LensError::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Load config from `path` (or the default path), falling back to
    /// defaults when the file does not exist, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::path);
        let mut config = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env_overrides_from(|k| std::env::var(k).ok());
        Ok(config)
    }

    /// Apply environment overrides using `lookup` for variable access.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("BIZLENS_DATABASE_URL").or_else(|| get("DATABASE_URL")) {
            self.database.url = Some(url);
        }
        if let Some(endpoint) = get("BIZLENS_ANALYSIS_ENDPOINT") {
            self.analysis.endpoint = Some(endpoint);
        }
        if let Some(key) = get("BIZLENS_ANALYSIS_API_KEY") {
            self.analysis.api_key = Some(key);
        }
        if let Some(bind) = get("BIZLENS_BIND") {
            self.server.bind = bind;
        }
        if let Some(path) = get("BIZLENS_REGISTRY") {
            self.registry.path = PathBuf::from(path);
        }
        if let Some(ttl) = get("BIZLENS_CACHE_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.cache.ttl_secs = ttl;
        }
    }
}
