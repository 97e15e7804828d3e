/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * DbKeeper - Database lifecycle orchestration for document stores
 * Built with Rust for superior performance and reliability
 *
 * @file lib.rs
 * @brief DbKeeper library entry point
 */

pub mod error;
pub mod config;
pub mod logger;
pub mod store;

// Lifecycle managers
pub mod connection;
pub mod migration;
pub mod migrations;
pub mod indexes;
pub mod seeds;
pub mod backup;
pub mod cache;
pub mod orchestrator;

// Re-export main types for external use
pub use error::{DbKeeperError, Result};
pub use config::{BackoffPolicy, Config, Environment};
pub use logger::{init_tracing_logger, LogLevel};
pub use store::{DocumentStore, IndexDefinition, MemoryStore, PostgresStore, StoreConnector};
pub use connection::{ConnectionManager, ConnectionState, HealthReport};
pub use migration::{Migration, MigrationManager, MigrationStatus};
pub use indexes::IndexManager;
pub use seeds::{Seed, SeedManager};
pub use backup::{BackupManager, BackupMetadata};
pub use cache::{CacheBackend, CacheLayer, MemoryBackend, RedisBackend};
pub use orchestrator::{InitOptions, InitReport, InitStep, Orchestrator, ResetOptions};
