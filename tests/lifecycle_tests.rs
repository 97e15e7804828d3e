/*!
 * Lifecycle tests for DbKeeper
 * Migrations, indexes, seeds, backups and guards against the in-memory store
 */

use anyhow::Result;
use async_trait::async_trait;
use bson::doc;
use dbkeeper::backup::{BackupManager, ExportEnvelope, ExportOptions, ImportOptions};
use dbkeeper::config::{BackupConfig, Config, DatabaseConfig, Environment, MigrationConfig};
use dbkeeper::indexes::{IndexManager, IndexStatus};
use dbkeeper::migration::{Migration, MigrationManager};
use dbkeeper::seeds::{Seed, SeedManager};
use dbkeeper::store::{DocumentStore, FindOptions, MemoryConnector, MemoryStore};
use dbkeeper::{ConnectionManager, DbKeeperError, MemoryBackend, Orchestrator, ResetOptions};
use std::sync::Arc;

async fn connected() -> Result<(Arc<MemoryStore>, Arc<ConnectionManager>)> {
    let store = Arc::new(MemoryStore::new("trips"));
    let connection = ConnectionManager::new(
        DatabaseConfig {
            health_check_interval_ms: 60_000,
            ..Default::default()
        },
        Arc::new(MemoryConnector::new(store.clone())),
    );
    connection.connect().await?;
    Ok((store, connection))
}

/// Appends its filename to `schema_log` on up, removes it on down.
struct LoggedStep {
    filename: &'static str,
    reversible: bool,
}

#[async_trait]
impl Migration for LoggedStep {
    fn filename(&self) -> &'static str {
        self.filename
    }

    fn source(&self) -> &'static str {
        self.filename
    }

    async fn up(&self, db: &dyn DocumentStore) -> dbkeeper::Result<()> {
        db.insert_one("schema_log", doc! { "unit": self.filename }).await
    }

    async fn down(&self, db: &dyn DocumentStore) -> dbkeeper::Result<()> {
        db.delete_many("schema_log", &doc! { "unit": self.filename }).await?;
        Ok(())
    }

    fn reversible(&self) -> bool {
        self.reversible
    }
}

const STEP_FILES: [&str; 5] = ["001_alpha", "002_beta", "003_gamma", "004_delta", "005_epsilon"];

fn steps(count: usize, irreversible: Option<usize>) -> Vec<Arc<dyn Migration>> {
    STEP_FILES
        .iter()
        .take(count)
        .enumerate()
        .map(|(i, filename)| {
            Arc::new(LoggedStep {
                filename: *filename,
                reversible: irreversible != Some(i + 1),
            }) as Arc<dyn Migration>
        })
        .collect()
}

async fn schema_log(store: &MemoryStore) -> Result<Vec<String>> {
    let mut units: Vec<String> = store
        .find("schema_log", &doc! {}, &FindOptions::default())
        .await?
        .iter()
        .filter_map(|d| d.get_str("unit").ok().map(str::to_string))
        .collect();
    units.sort();
    Ok(units)
}

#[tokio::test]
async fn test_migrations_apply_once_in_order() -> Result<()> {
    let (store, connection) = connected().await?;

    let manager = MigrationManager::with_migrations(connection.clone(), MigrationConfig::default(), steps(3, None))?;
    let first = manager.run_migrations().await?;
    assert_eq!(first.applied, vec![1, 2, 3]);
    assert_eq!(first.current_version, 3);

    let second = manager.run_migrations().await?;
    assert!(second.applied.is_empty());
    assert_eq!(second.current_version, 3);

    // A newly registered unit is the only one applied.
    let grown = MigrationManager::with_migrations(connection, MigrationConfig::default(), steps(5, None))?;
    let third = grown.run_migrations().await?;
    assert_eq!(third.applied, vec![4, 5]);

    let status = grown.get_migration_status().await?;
    let versions: Vec<i64> = status.applied.iter().map(|r| r.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    assert!(status.pending.is_empty());
    assert_eq!(schema_log(&store).await?.len(), 5);

    Ok(())
}

#[tokio::test]
async fn test_rollback_restores_earlier_state() -> Result<()> {
    let (store, connection) = connected().await?;
    let manager = MigrationManager::with_migrations(connection.clone(), MigrationConfig::default(), steps(5, None))?;

    manager.run_migrations().await?;
    let run = manager.rollback_to_version(2).await?;
    assert_eq!(run.rolled_back, vec![5, 4, 3]);
    assert!(run.skipped.is_empty());
    assert_eq!(run.current_version, 2);
    assert_eq!(schema_log(&store).await?, vec!["001_alpha", "002_beta"]);

    // Rolled back versions are pending again.
    let status = manager.get_migration_status().await?;
    let pending: Vec<i64> = status.pending.iter().map(|p| p.version).collect();
    assert_eq!(pending, vec![3, 4, 5]);

    Ok(())
}

#[tokio::test]
async fn test_rollback_reports_irreversible_units() -> Result<()> {
    let (store, connection) = connected().await?;
    let manager = MigrationManager::with_migrations(connection, MigrationConfig::default(), steps(5, Some(3)))?;

    manager.run_migrations().await?;
    let run = manager.rollback_to_version(2).await?;
    assert_eq!(run.rolled_back, vec![5, 4]);
    assert_eq!(run.skipped, vec![3]);
    assert_eq!(run.current_version, 3);
    assert_eq!(schema_log(&store).await?, vec!["001_alpha", "002_beta", "003_gamma"]);

    Ok(())
}

#[tokio::test]
async fn test_irreversible_top_unit_blocks_rollback() -> Result<()> {
    let (store, connection) = connected().await?;
    let manager = MigrationManager::with_migrations(connection, MigrationConfig::default(), steps(5, Some(5)))?;

    manager.run_migrations().await?;
    let run = manager.rollback_to_version(2).await?;
    assert!(run.rolled_back.is_empty());
    assert_eq!(run.skipped, vec![5, 4, 3]);
    assert_eq!(run.current_version, 5);
    assert_eq!(schema_log(&store).await?.len(), 5);

    // Nothing is left stranded between recorded versions.
    let status = manager.get_migration_status().await?;
    let applied: Vec<i64> = status.applied.iter().map(|r| r.version).collect();
    assert_eq!(applied, vec![1, 2, 3, 4, 5]);
    assert!(status.pending.is_empty());

    Ok(())
}

/// Implements `up` only.
struct UpOnly(&'static str);

#[async_trait]
impl Migration for UpOnly {
    fn filename(&self) -> &'static str {
        self.0
    }

    fn source(&self) -> &'static str {
        self.0
    }

    async fn up(&self, db: &dyn DocumentStore) -> dbkeeper::Result<()> {
        db.insert_one("schema_log", doc! { "unit": self.0 }).await
    }
}

#[tokio::test]
async fn test_unit_without_down_is_skipped() -> Result<()> {
    let (store, connection) = connected().await?;
    let units: Vec<Arc<dyn Migration>> = vec![Arc::new(UpOnly("001_a")), Arc::new(UpOnly("002_b"))];
    let manager = MigrationManager::with_migrations(connection, MigrationConfig::default(), units)?;

    manager.run_migrations().await?;
    let run = manager.rollback_to_version(0).await?;
    assert!(run.rolled_back.is_empty());
    assert_eq!(run.skipped, vec![2, 1]);
    assert_eq!(run.current_version, 2);
    assert_eq!(schema_log(&store).await?, vec!["001_a", "002_b"]);

    Ok(())
}

#[tokio::test]
async fn test_checksum_drift_detected() -> Result<()> {
    let (_store, connection) = connected().await?;
    let manager = MigrationManager::with_migrations(connection.clone(), MigrationConfig::default(), steps(2, None))?;
    manager.run_migrations().await?;
    assert!(manager.verify_checksums().await?.is_empty());

    // Same versions, one unit missing from the registry.
    let shrunk = MigrationManager::with_migrations(connection, MigrationConfig::default(), steps(1, None))?;
    let drift = shrunk.verify_checksums().await?;
    assert_eq!(drift.len(), 1);
    assert_eq!(drift[0].version, 2);
    assert!(drift[0].current.is_none());

    Ok(())
}

#[tokio::test]
async fn test_index_creation_is_idempotent() -> Result<()> {
    let (store, connection) = connected().await?;
    let manager = IndexManager::new(connection)?;

    let first = manager.create_all_indexes().await?;
    assert!(first.iter().all(|r| r.success));
    let before = store.list_indexes("users").await?.len();

    let second = manager.create_all_indexes().await?;
    assert!(second.iter().all(|r| r.success));
    assert!(second
        .iter()
        .flat_map(|r| r.indexes.iter())
        .all(|i| i.status == IndexStatus::AlreadyExists));
    assert_eq!(store.list_indexes("users").await?.len(), before);

    Ok(())
}

struct BrokenRequiredSeed;

#[async_trait]
impl Seed for BrokenRequiredSeed {
    fn filename(&self) -> &'static str {
        "001_broken"
    }

    fn environments(&self) -> &'static [&'static str] {
        &["test"]
    }

    fn required(&self) -> bool {
        true
    }

    async fn seed(&self, _db: &dyn DocumentStore) -> dbkeeper::Result<()> {
        Err(DbKeeperError::Validation("fixture generation failed".to_string()))
    }
}

struct BrokenOptionalSeed;

#[async_trait]
impl Seed for BrokenOptionalSeed {
    fn filename(&self) -> &'static str {
        "001_flaky"
    }

    fn environments(&self) -> &'static [&'static str] {
        &["test"]
    }

    async fn seed(&self, _db: &dyn DocumentStore) -> dbkeeper::Result<()> {
        Err(DbKeeperError::Validation("optional data unavailable".to_string()))
    }
}

struct RecordingSeed;

#[async_trait]
impl Seed for RecordingSeed {
    fn filename(&self) -> &'static str {
        "002_after"
    }

    fn environments(&self) -> &'static [&'static str] {
        &["test"]
    }

    async fn seed(&self, db: &dyn DocumentStore) -> dbkeeper::Result<()> {
        db.insert_one("seed_log", doc! { "seed": "002_after" }).await
    }
}

#[tokio::test]
async fn test_required_seed_failure_stops_the_run() -> Result<()> {
    let (store, connection) = connected().await?;
    let seeds: Vec<Arc<dyn Seed>> = vec![Arc::new(RecordingSeed), Arc::new(BrokenRequiredSeed)];
    let manager = SeedManager::with_seeds(connection, Environment::Test, "migrations", seeds)?;

    match manager.run_seeds(&Environment::Test).await {
        Err(DbKeeperError::Seed { name, .. }) => assert_eq!(name, "001_broken"),
        other => panic!("expected a seed error, got {:?}", other.map(|r| r.executed)),
    }
    assert_eq!(store.count_documents("seed_log", &doc! {}).await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_optional_seed_failure_is_recorded() -> Result<()> {
    let (store, connection) = connected().await?;
    let seeds: Vec<Arc<dyn Seed>> = vec![Arc::new(BrokenOptionalSeed), Arc::new(RecordingSeed)];
    let manager = SeedManager::with_seeds(connection, Environment::Test, "migrations", seeds)?;

    let run = manager.run_seeds(&Environment::Test).await?;
    assert!(run.success);
    assert_eq!(run.executed, vec!["002_after"]);
    assert_eq!(run.failed.len(), 1);
    assert_eq!(run.failed[0].seed, "001_flaky");
    assert_eq!(store.count_documents("seed_log", &doc! {}).await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_production_guard_blocks_destructive_operations() -> Result<()> {
    let (store, connection) = connected().await?;
    store.insert_one("trips", doc! { "name": "Kyoto" }).await?;

    let seeds = SeedManager::with_seeds(
        connection.clone(),
        Environment::Production,
        "migrations",
        vec![Arc::new(RecordingSeed) as Arc<dyn Seed>],
    )?;
    assert!(seeds.clear_database().await.unwrap_err().is_production_guard());
    let run = seeds.run_seeds(&Environment::Production).await?;
    assert!(run.refused);
    assert!(run.executed.is_empty());

    let dir = tempfile::tempdir()?;
    tokio::fs::create_dir_all(dir.path().join("nightly")).await?;
    let backups = BackupManager::new(
        connection,
        BackupConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        },
        Environment::Production,
    );
    assert!(backups.delete_backup("nightly").await.unwrap_err().is_production_guard());
    assert!(dir.path().join("nightly").exists());

    assert_eq!(store.count_documents("trips", &doc! {}).await?, 1);
    assert_eq!(store.count_documents("seed_log", &doc! {}).await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_reset_refused_in_production_before_connecting() -> Result<()> {
    let store = Arc::new(MemoryStore::new("trips"));
    let connector = Arc::new(MemoryConnector::new(store));
    let mut config = Config::default();
    config.environment = Environment::Production;

    let orchestrator = Orchestrator::with_components(
        config,
        connector.clone(),
        Arc::new(MemoryBackend::new()),
        Vec::new(),
        Vec::new(),
    )?;
    let err = orchestrator.reset_database(ResetOptions::default()).await.unwrap_err();
    assert!(err.is_production_guard());
    assert_eq!(connector.attempts(), 0);

    Ok(())
}

#[tokio::test]
async fn test_export_respects_limit_and_import_is_unordered() -> Result<()> {
    let (store, connection) = connected().await?;
    for i in 0..5 {
        store.insert_one("expenses", doc! { "_id": format!("e{}", i), "amount": i * 10 }).await?;
    }

    let dir = tempfile::tempdir()?;
    let backups = BackupManager::new(
        connection,
        BackupConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        },
        Environment::Test,
    );

    let export = backups
        .export_collection(
            "expenses",
            ExportOptions {
                limit: Some(2),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(export.count, 2);

    let envelope: ExportEnvelope = serde_json::from_str(&tokio::fs::read_to_string(&export.path).await?)?;
    assert_eq!(envelope.collection, "expenses");
    assert_eq!(envelope.count, 2);
    assert_eq!(envelope.documents.len(), 2);

    let imported = backups
        .import_collection(
            &export.path,
            ImportOptions {
                collection: Some("expenses_copy".to_string()),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!((imported.inserted, imported.total), (2, 2));

    // Existing ids are rejected one by one without aborting the batch.
    let again = backups.import_collection(&export.path, ImportOptions::default()).await?;
    assert_eq!((again.inserted, again.total), (0, 2));
    assert_eq!(again.errors.len(), 2);

    let cleared = backups
        .import_collection(
            &export.path,
            ImportOptions {
                clear_existing: true,
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(cleared.inserted, 2);
    assert_eq!(store.count_documents("expenses", &doc! {}).await?, 2);

    Ok(())
}
