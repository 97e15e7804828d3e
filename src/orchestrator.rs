/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * DbKeeper - Database lifecycle orchestration for document stores
 * Built with Rust for superior performance and reliability
 *
 * @file orchestrator.rs
 * @brief Ordered bring-up, reset, status and maintenance entry points
 */

use crate::backup::{BackupManager, BackupOptions, BackupSummary};
use crate::cache::{CacheBackend, CacheHealth, CacheLayer};
use crate::config::Config;
use crate::connection::{ConnectionManager, HealthReport};
use crate::error::{DbKeeperError, Result};
use crate::indexes::{CollectionIndexResult, CollectionIndexStats, IndexManager};
use crate::migration::{Migration, MigrationManager, MigrationRun, MigrationStatus};
use crate::seeds::{ClearReport, Seed, SeedManager, SeedRun};
use crate::store::{IndexUsage, PostgresConnector, StoreConnector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Bring-up steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStep {
    Connect,
    Migrate,
    Index,
    BackupInit,
    Seed,
}

impl InitStep {
    pub const ALL: [InitStep; 5] = [
        InitStep::Connect,
        InitStep::Migrate,
        InitStep::Index,
        InitStep::BackupInit,
        InitStep::Seed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Migrate => "migrate",
            Self::Index => "index",
            Self::BackupInit => "backup_init",
            Self::Seed => "seed",
        }
    }
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub continue_on_error: bool,
    pub run_seeds: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            run_seeds: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub step: InitStep,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitReport {
    pub connected: bool,
    pub migrated: bool,
    pub indexed: bool,
    pub backup_initialized: bool,
    pub seeded: bool,
    /// Steps deliberately not run (disabled, or refused by the environment).
    pub skipped: Vec<InitStep>,
    pub errors: Vec<StepError>,
}

impl InitReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn completed(&self, step: InitStep) -> bool {
        match step {
            InitStep::Connect => self.connected,
            InitStep::Migrate => self.migrated,
            InitStep::Index => self.indexed,
            InitStep::BackupInit => self.backup_initialized,
            InitStep::Seed => self.seeded,
        }
    }

    fn mark(&mut self, step: InitStep) {
        match step {
            InitStep::Connect => self.connected = true,
            InitStep::Migrate => self.migrated = true,
            InitStep::Index => self.indexed = true,
            InitStep::BackupInit => self.backup_initialized = true,
            InitStep::Seed => self.seeded = true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResetOptions {
    pub backup_first: bool,
    pub reseed: bool,
}

impl Default for ResetOptions {
    fn default() -> Self {
        Self {
            backup_first: true,
            reseed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub backup: Option<String>,
    pub cleared: ClearReport,
    pub reindexed: Vec<CollectionIndexResult>,
    pub migrations: MigrationRun,
    pub seeds: Option<SeedRun>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionError {
    pub section: String,
    pub error: String,
}

/// Aggregated view; a failing section leaves the others intact.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub environment: String,
    pub health: HealthReport,
    pub cache: CacheHealth,
    pub migrations: Option<MigrationStatus>,
    pub indexes: Option<BTreeMap<String, CollectionIndexStats>>,
    pub backups: Option<Vec<BackupSummary>>,
    pub errors: Vec<SectionError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    /// Declared indexes that have never served a query.
    pub unused_indexes: Vec<IndexUsage>,
    pub pruned_backups: Vec<String>,
    pub health: HealthReport,
    pub errors: Vec<SectionError>,
}

fn section<T>(errors: &mut Vec<SectionError>, name: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{} unavailable: {}", name, e);
            errors.push(SectionError {
                section: name.to_string(),
                error: e.to_string(),
            });
            None
        }
    }
}

/// The only component that sequences the other managers.
pub struct Orchestrator {
    config: Config,
    connection: Arc<ConnectionManager>,
    migrations: MigrationManager,
    indexes: IndexManager,
    seeds: SeedManager,
    backups: BackupManager,
    cache: Arc<CacheLayer>,
}

impl Orchestrator {
    /// PostgreSQL store and, when enabled, Redis cache.
    pub fn new(config: Config) -> Result<Self> {
        let cache = CacheLayer::from_config(&config.cache)?;
        let connection = ConnectionManager::new(config.database.clone(), Arc::new(PostgresConnector::default()));
        Self::assemble(
            config,
            connection,
            cache,
            crate::migrations::registry(),
            crate::seeds::registry(),
        )
    }

    pub fn with_components(
        config: Config,
        connector: Arc<dyn StoreConnector>,
        cache_backend: Arc<dyn CacheBackend>,
        migrations: Vec<Arc<dyn Migration>>,
        seeds: Vec<Arc<dyn Seed>>,
    ) -> Result<Self> {
        let cache = CacheLayer::new(cache_backend, &config.cache);
        let connection = ConnectionManager::new(config.database.clone(), connector);
        Self::assemble(config, connection, cache, migrations, seeds)
    }

    fn assemble(
        config: Config,
        connection: Arc<ConnectionManager>,
        cache: Arc<CacheLayer>,
        migrations: Vec<Arc<dyn Migration>>,
        seeds: Vec<Arc<dyn Seed>>,
    ) -> Result<Self> {
        let migration_manager =
            MigrationManager::with_migrations(Arc::clone(&connection), config.migrations.clone(), migrations)?;
        let indexes = IndexManager::new(Arc::clone(&connection))?;
        let seeds = SeedManager::with_seeds(
            Arc::clone(&connection),
            config.environment.clone(),
            &config.migrations.tracking_collection,
            seeds,
        )?;
        let backups = BackupManager::new(
            Arc::clone(&connection),
            config.backup.clone(),
            config.environment.clone(),
        );

        Ok(Self {
            config,
            connection,
            migrations: migration_manager,
            indexes,
            seeds,
            backups,
            cache,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn migrations(&self) -> &MigrationManager {
        &self.migrations
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    pub fn seeds(&self) -> &SeedManager {
        &self.seeds
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    /// `Ok(true)` when the step did its work, `Ok(false)` when it was skipped.
    async fn run_step(&self, step: InitStep) -> Result<bool> {
        match step {
            InitStep::Connect => {
                self.connection.connect().await?;
                Ok(true)
            }
            InitStep::Migrate => {
                let run = self.migrations.run_migrations().await?;
                info!("Applied {} migration(s), now at version {}", run.applied.len(), run.current_version);
                Ok(true)
            }
            InitStep::Index => {
                let failed: Vec<String> = self
                    .indexes
                    .create_all_indexes()
                    .await?
                    .into_iter()
                    .filter(|r| !r.success)
                    .map(|r| r.collection)
                    .collect();
                if failed.is_empty() {
                    Ok(true)
                } else {
                    Err(DbKeeperError::Index(format!("index creation failed on {}", failed.join(", "))))
                }
            }
            InitStep::BackupInit => {
                self.backups.initialize().await?;
                Ok(true)
            }
            InitStep::Seed => {
                let run = self.seeds.run_seeds(&self.config.environment).await?;
                if !run.failed.is_empty() {
                    warn!("{} optional seed(s) failed", run.failed.len());
                }
                Ok(!run.refused)
            }
        }
    }

    async fn run_steps(&self, steps: &[InitStep], options: &InitOptions) -> Result<InitReport> {
        let mut report = InitReport::default();

        for &step in steps {
            if step == InitStep::Seed && !options.run_seeds {
                report.skipped.push(step);
                continue;
            }

            info!("Step '{}' starting", step);
            match self.run_step(step).await {
                Ok(true) => report.mark(step),
                Ok(false) => {
                    info!("Step '{}' skipped", step);
                    report.skipped.push(step);
                }
                Err(e) if options.continue_on_error => {
                    error!("Step '{}' failed, continuing: {}", step, e);
                    report.errors.push(StepError {
                        step,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    error!("Step '{}' failed: {}", step, e);
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    /// connect, migrate, index, backup-init, seed. The first failure aborts
    /// unless `continue_on_error` is set.
    pub async fn initialize(&self, options: InitOptions) -> Result<InitReport> {
        info!("Initializing database for environment '{}'", self.config.environment);
        self.cache.start_health_checks();

        let report = self.run_steps(&InitStep::ALL, &options).await?;
        if report.success() {
            info!("Database initialization complete");
        } else {
            warn!("Database initialization finished with {} error(s)", report.errors.len());
        }
        Ok(report)
    }

    /// connect, index, migrate. No seeds, no backup directory.
    pub async fn quick_setup(&self) -> Result<InitReport> {
        info!("Running quick setup");
        self.run_steps(
            &[InitStep::Connect, InitStep::Index, InitStep::Migrate],
            &InitOptions::default(),
        )
        .await
    }

    /// Refused in production before anything is touched.
    pub async fn reset_database(&self, options: ResetOptions) -> Result<ResetReport> {
        if self.config.environment.is_production() {
            return Err(DbKeeperError::production_guard("reset the database"));
        }

        warn!("Resetting database '{}'", self.config.database.name);
        self.connection.connect().await?;

        let backup = if options.backup_first {
            let result = self
                .backups
                .create_backup(BackupOptions {
                    name: Some("pre-reset".to_string()),
                    allow_production: false,
                })
                .await?;
            Some(result.name)
        } else {
            None
        };

        let cleared = self.seeds.clear_database().await?;

        let mut reindexed = Vec::new();
        let collections: Vec<String> = self.indexes.collections().map(str::to_string).collect();
        for collection in collections {
            reindexed.push(self.indexes.rebuild_collection_indexes(&collection).await?);
        }

        let migrations = self.migrations.run_migrations().await?;

        let seeds = if options.reseed {
            Some(self.seeds.run_seeds(&self.config.environment).await?)
        } else {
            None
        };

        info!("Database reset complete");
        Ok(ResetReport {
            backup,
            cleared,
            reindexed,
            migrations,
            seeds,
        })
    }

    pub async fn get_status(&self) -> StatusReport {
        let mut errors = Vec::new();

        let health = self.connection.perform_health_check().await;
        let cache = self.cache.health_check().await;
        let migrations = section(&mut errors, "migrations", self.migrations.get_migration_status().await);
        let indexes = section(&mut errors, "indexes", self.indexes.get_index_stats().await);
        let backups = section(&mut errors, "backups", self.backups.list_backups().await);

        StatusReport {
            environment: self.config.environment.to_string(),
            health,
            cache,
            migrations,
            indexes,
            backups,
            errors,
        }
    }

    /// Unused index audit, backup retention (development only) and a health pass.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        info!("Running maintenance");
        let mut errors = Vec::new();

        let unused_indexes: Vec<IndexUsage> =
            section(&mut errors, "index usage", self.indexes.get_index_usage_stats().await)
                .unwrap_or_default()
                .into_iter()
                .filter(|usage| usage.accesses == 0)
                .collect();
        for usage in &unused_indexes {
            warn!("Index {} on {} has never been used", usage.name, usage.collection);
        }

        let pruned_backups = if self.config.environment.is_development() {
            let keep = self.config.maintenance.keep_backups;
            section(&mut errors, "backup retention", self.backups.cleanup_old_backups(keep).await)
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let health = self.connection.perform_health_check().await;
        if let Some(error) = &health.error {
            errors.push(SectionError {
                section: "health".to_string(),
                error: error.clone(),
            });
        }

        MaintenanceReport {
            unused_indexes,
            pruned_backups,
            health,
            errors,
        }
    }

    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
        self.connection.graceful_shutdown().await;
        info!("Orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use crate::config::Environment;
    use crate::store::{MemoryConnector, MemoryStore};

    fn orchestrator(environment: Environment, store: Arc<MemoryStore>) -> (tempfile::TempDir, Orchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.environment = environment;
        config.backup.directory = dir.path().to_path_buf();
        config.backup.dump_tool = "dbkeeper-missing-dump-tool".to_string();
        config.database.max_retries = 1;

        let orchestrator = Orchestrator::with_components(
            config,
            Arc::new(MemoryConnector::new(store)),
            Arc::new(MemoryBackend::new()),
            crate::migrations::registry(),
            crate::seeds::registry(),
        )
        .unwrap();
        (dir, orchestrator)
    }

    #[tokio::test]
    async fn test_initialize_runs_every_step() {
        let store = Arc::new(MemoryStore::new("trips"));
        let (_dir, orchestrator) = orchestrator(Environment::Test, store);

        let report = orchestrator.initialize(InitOptions::default()).await.unwrap();
        assert!(report.success(), "{:?}", report.errors);
        for step in InitStep::ALL {
            assert!(report.completed(step), "{} did not complete", step);
        }
        assert_eq!(orchestrator.migrations().get_current_version().await.unwrap(), 3);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_seeds_skipped_in_production() {
        let store = Arc::new(MemoryStore::new("trips"));
        let (_dir, orchestrator) = orchestrator(Environment::Production, store);

        let report = orchestrator.initialize(InitOptions::default()).await.unwrap();
        assert!(report.success());
        assert!(!report.seeded);
        assert_eq!(report.skipped, vec![InitStep::Seed]);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_continue_on_error_records_each_failure() {
        let store = Arc::new(MemoryStore::new("trips"));
        store.set_available(false);
        let (_dir, orchestrator) = orchestrator(Environment::Test, store);

        let options = InitOptions {
            continue_on_error: true,
            ..Default::default()
        };
        let report = orchestrator.initialize(options).await.unwrap();
        let failed: Vec<InitStep> = report.errors.iter().map(|e| e.step).collect();
        assert_eq!(
            failed,
            vec![InitStep::Connect, InitStep::Migrate, InitStep::Index, InitStep::Seed]
        );
        assert!(report.backup_initialized);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_sections_fail_independently() {
        let store = Arc::new(MemoryStore::new("trips"));
        let (_dir, orchestrator) = orchestrator(Environment::Development, store);

        let status = orchestrator.get_status().await;
        assert!(!status.health.connected);
        assert!(status.migrations.is_none());
        assert!(status.backups.is_some());
        assert!(status.errors.iter().any(|e| e.section == "migrations"));
    }
}
