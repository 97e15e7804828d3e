/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * DbKeeper - Database lifecycle orchestration for document stores
 * Built with Rust for superior performance and reliability
 *
 * @file config.rs
 * @brief DbKeeper configuration management
 */

use crate::error::{DbKeeperError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Deployment environment discriminator gating destructive operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Environment {
    Development,
    Test,
    Staging,
    Production,
    Other(String),
}

impl Environment {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Staging => "staging",
            Self::Production => "production",
            Self::Other(name) => name,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = DbKeeperError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        Ok(match normalized.as_str() {
            "development" | "dev" => Self::Development,
            "test" | "testing" => Self::Test,
            "staging" | "stage" => Self::Staging,
            "production" | "prod" => Self::Production,
            "" => return Err(DbKeeperError::Config("Environment name cannot be empty".to_string())),
            _ => Self::Other(normalized),
        })
    }
}

impl TryFrom<String> for Environment {
    type Error = DbKeeperError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Environment> for String {
    fn from(env: Environment) -> Self {
        env.as_str().to_string()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::Development
    }
}

/// How the delay between connection attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    Fixed,
    Linear,
    Exponential,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), capped at `max`.
    pub fn delay_for(&self, base: Duration, attempt: u32, max: Duration) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self {
            Self::Fixed => base,
            Self::Linear => base.saturating_mul(attempt),
            Self::Exponential => base.saturating_mul(2u32.saturating_pow(attempt - 1)),
        };
        delay.min(max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub backup: BackupConfig,
    pub migrations: MigrationConfig,
    pub logging: LoggingConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub uri: String,
    pub name: String,
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub connect_backoff: BackoffPolicy,
    pub reconnect_backoff: BackoffPolicy,
    pub health_check_interval_ms: u64,
    pub slow_query_threshold_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
    pub key_prefix: String,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub health_check_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub directory: PathBuf,
    pub dump_tool: String,
    pub restore_tool: String,
    pub tool_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub directory: PathBuf,
    pub tracking_collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub detailed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub keep_backups: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            backup: BackupConfig::default(),
            migrations: MigrationConfig::default(),
            logging: LoggingConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: "postgresql://localhost:5432/tripplanner".to_string(),
            name: "tripplanner".to_string(),
            max_connections: 10,
            connect_timeout_ms: 10_000,
            max_retries: 5,
            retry_delay_ms: 5_000,
            max_retry_delay_ms: 60_000,
            connect_backoff: BackoffPolicy::Fixed,
            reconnect_backoff: BackoffPolicy::Linear,
            health_check_interval_ms: 30_000,
            slow_query_threshold_ms: 100,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            key_prefix: String::new(),
            connect_timeout_ms: 5_000,
            command_timeout_ms: 2_000,
            health_check_interval_ms: 30_000,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("backups"),
            dump_tool: "pg_dump".to_string(),
            restore_tool: "pg_restore".to_string(),
            tool_timeout_secs: 3_600,
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("src/migrations"),
            tracking_collection: "migrations".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            detailed: false,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { keep_backups: 5 }
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl CacheConfig {
    /// Connection target, `REDIS_URL` style when set, otherwise host/port.
    pub fn address(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

impl BackupConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

impl Config {
    /// Load configuration from `path` (toml, yaml or json by extension),
    /// falling back to defaults when the file does not exist, then apply
    /// process environment overrides.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load_file(path).await?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;

        let config: Config = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| DbKeeperError::Config(format!("Invalid YAML in {}: {}", path.display(), e)))?,
            _ => toml::from_str(&content)
                .map_err(|e| DbKeeperError::Config(format!("Invalid TOML in {}: {}", path.display(), e)))?,
        };

        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)
                .map_err(|e| DbKeeperError::Config(e.to_string()))?,
            _ => toml::to_string_pretty(self).map_err(|e| DbKeeperError::Config(e.to_string()))?,
        };

        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Apply the well-known environment variables through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env) = lookup("APP_ENV").or_else(|| lookup("NODE_ENV")) {
            self.environment = env.parse()?;
        }

        if let Some(uri) = lookup("DATABASE_URI")
            .or_else(|| lookup("DATABASE_URL"))
            .or_else(|| lookup("MONGODB_URI"))
        {
            self.database.uri = uri;
        }
        if let Some(name) = lookup("DATABASE_NAME") {
            self.database.name = name;
        }

        if let Some(url) = lookup("REDIS_URL") {
            self.cache.url = Some(url);
        }
        if let Some(host) = lookup("REDIS_HOST") {
            self.cache.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT") {
            self.cache.port = port
                .parse()
                .map_err(|e| DbKeeperError::Config(format!("Invalid REDIS_PORT '{}': {}", port, e)))?;
        }
        if let Some(username) = lookup("REDIS_USERNAME") {
            self.cache.username = Some(username);
        }
        if let Some(password) = lookup("REDIS_PASSWORD") {
            self.cache.password = Some(password);
        }

        if let Some(dir) = lookup("BACKUP_DIR") {
            self.backup.directory = PathBuf::from(dir);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.uri.trim().is_empty() {
            return Err(DbKeeperError::Config("database uri must not be empty".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(DbKeeperError::Config("database max_connections must be greater than 0".to_string()));
        }
        if self.database.max_retries == 0 {
            return Err(DbKeeperError::Config("database max_retries must be greater than 0".to_string()));
        }
        if self.database.health_check_interval_ms == 0 || self.cache.health_check_interval_ms == 0 {
            return Err(DbKeeperError::Config("health check intervals must be greater than 0".to_string()));
        }
        if self.backup.tool_timeout_secs == 0 {
            return Err(DbKeeperError::Config("backup tool_timeout_secs must be greater than 0".to_string()));
        }
        if self.migrations.tracking_collection.trim().is_empty() {
            return Err(DbKeeperError::Config("migrations tracking_collection must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_environment_parsing() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("Development".parse::<Environment>().unwrap(), Environment::Development);
        assert_eq!("qa".parse::<Environment>().unwrap(), Environment::Other("qa".to_string()));
        assert!("  ".parse::<Environment>().is_err());
        assert!(Environment::Production.is_production());
    }

    #[test]
    fn test_backoff_policies() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(350);
        assert_eq!(BackoffPolicy::Fixed.delay_for(base, 3, max), base);
        assert_eq!(BackoffPolicy::Linear.delay_for(base, 3, max), Duration::from_millis(300));
        assert_eq!(BackoffPolicy::Exponential.delay_for(base, 2, max), Duration::from_millis(200));
        assert_eq!(BackoffPolicy::Exponential.delay_for(base, 5, max), max);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("NODE_ENV", "production"),
            ("MONGODB_URI", "postgresql://app:secret@db:5432/trips"),
            ("REDIS_HOST", "cache"),
            ("REDIS_PORT", "6380"),
            ("REDIS_PASSWORD", "hunter2"),
        ]);
        let mut config = Config::default();
        config
            .apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert!(config.environment.is_production());
        assert_eq!(config.database.uri, "postgresql://app:secret@db:5432/trips");
        assert_eq!(config.cache.address(), "redis://cache:6380/0");
        assert_eq!(config.cache.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_invalid_redis_port_rejected() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(|key| (key == "REDIS_PORT").then(|| "nope".to_string()));
        assert!(matches!(result, Err(DbKeeperError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.database.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbkeeper.toml");

        let mut config = Config::default();
        config.environment = Environment::Test;
        config.maintenance.keep_backups = 2;
        config.save(&path).await.unwrap();

        let loaded = Config::load_file(&path).await.unwrap();
        assert_eq!(loaded.environment, Environment::Test);
        assert_eq!(loaded.maintenance.keep_backups, 2);
    }
}
