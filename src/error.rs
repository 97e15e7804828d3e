/*!
 * @file error.rs
 * @brief DbKeeper error handling
 */

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbKeeperError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration {version} failed: {message}")]
    Migration { version: i64, message: String },

    #[error("Index already exists: {0}")]
    IndexConflict(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Seed '{name}' failed: {message}")]
    Seed { name: String, message: String },

    #[error("{tool} failed (exit code {code:?}): {stderr}")]
    BackupTool {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Refusing to {0} in production")]
    ProductionGuard(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("BSON error: {0}")]
    Bson(#[from] bson::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbKeeperError {
    pub fn production_guard(operation: impl Into<String>) -> Self {
        Self::ProductionGuard(operation.into())
    }

    pub fn is_production_guard(&self) -> bool {
        matches!(self, Self::ProductionGuard(_))
    }

    pub fn is_index_conflict(&self) -> bool {
        matches!(self, Self::IndexConflict(_))
    }
}

impl From<bson::ser::Error> for DbKeeperError {
    fn from(e: bson::ser::Error) -> Self {
        Self::Internal(format!("BSON serialization error: {}", e))
    }
}

impl From<bson::extjson::de::Error> for DbKeeperError {
    fn from(e: bson::extjson::de::Error) -> Self {
        Self::Validation(format!("Invalid extended JSON: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, DbKeeperError>;
