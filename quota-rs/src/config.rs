use crate::error::{QuotaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Prefix for environment overrides, e.g. `QUOTA__DATABASE__URL`.
pub const ENV_PREFIX: &str = "QUOTA";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub quota: QuotaConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Allocation handed to a ledger at first initialization
    pub default_allocated_bytes: i64,
    /// Per-user allocations from account settings, keyed by user id
    pub allocations: HashMap<String, i64>,
    /// Attempts of the check-mutate-commit sequence before giving up
    pub max_retries: u32,
    /// Delay before the first retry; later delays grow by `retry_multiplier`
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_multiplier: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://quota.db".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_allocated_bytes: 100 * 1024 * 1024, // 100MB
            allocations: HashMap::new(),
            max_retries: 3,
            retry_initial_backoff_ms: 10,
            retry_max_backoff_ms: 500,
            retry_multiplier: 2.0,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8088".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| QuotaError::Config(e.to_string()))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| QuotaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional TOML file under `QUOTA__*` environment variables.
    ///
    /// Keys of `[quota.allocations]` are user ids and keep the case they have
    /// in the file.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let path: Option<&Path> = path.as_ref().map(|p| p.as_ref());
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let mut config: Config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        if let Some(path) = path.filter(|p| p.exists()) {
            config.restore_allocation_keys(&std::fs::read_to_string(path)?)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// The `config` crate lowercases map keys; put the file's user ids back,
    /// keeping any value an environment variable layered over them.
    fn restore_allocation_keys(&mut self, content: &str) -> Result<()> {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct RawFile {
            quota: RawQuota,
        }

        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct RawQuota {
            allocations: HashMap<String, toml::Value>,
        }

        let raw: RawFile = toml::from_str(content).map_err(|e| QuotaError::Config(e.to_string()))?;
        for user in raw.quota.allocations.into_keys() {
            let folded = user.to_lowercase();
            if folded == user {
                continue;
            }
            if let Some(bytes) = self.quota.allocations.remove(&folded) {
                self.quota.allocations.insert(user, bytes);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.quota.default_allocated_bytes <= 0 {
            return Err(QuotaError::Config(
                "quota.default_allocated_bytes must be positive".to_string(),
            ));
        }
        if let Some((user, bytes)) = self.quota.allocations.iter().find(|(_, b)| **b <= 0) {
            return Err(QuotaError::Config(format!(
                "quota.allocations.{} must be positive, got {}",
                user, bytes
            )));
        }
        if self.quota.max_retries == 0 {
            return Err(QuotaError::Config("quota.max_retries must be at least 1".to_string()));
        }
        if self.quota.retry_initial_backoff_ms > self.quota.retry_max_backoff_ms {
            return Err(QuotaError::Config(
                "quota.retry_initial_backoff_ms must not exceed quota.retry_max_backoff_ms".to_string(),
            ));
        }
        if self.quota.retry_multiplier.is_nan() || self.quota.retry_multiplier < 1.0 {
            return Err(QuotaError::Config(format!(
                "quota.retry_multiplier must be at least 1.0, got {}",
                self.quota.retry_multiplier
            )));
        }
        if self.database.max_connections == 0 {
            return Err(QuotaError::Config(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
