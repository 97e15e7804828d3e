/*!
 * Schema migration tracking for DbKeeper
 * Versioned forward/backward units applied strictly in order
 */

use crate::config::MigrationConfig;
use crate::connection::ConnectionManager;
use crate::error::{DbKeeperError, Result};
use crate::store::{DocumentStore, FindOptions, IndexDefinition};
use async_trait::async_trait;
use bson::doc;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// One versioned schema change, registered in `migrations::registry()`.
#[async_trait]
pub trait Migration: Send + Sync {
    /// `<version>_<name>`, e.g. `001_core_collections`.
    fn filename(&self) -> &'static str;

    /// Text the checksum is computed from, normally the unit's own source.
    fn source(&self) -> &'static str;

    async fn up(&self, db: &dyn DocumentStore) -> Result<()>;

    /// Only called when [`reversible`](Migration::reversible) returns `true`.
    async fn down(&self, _db: &dyn DocumentStore) -> Result<()> {
        Err(DbKeeperError::Validation(format!(
            "{} cannot be rolled back",
            self.filename()
        )))
    }

    /// Units that implement `down` opt in here.
    fn reversible(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct MigrationUnit {
    pub version: i64,
    pub name: String,
    pub filename: String,
    pub checksum: String,
    pub migration: Arc<dyn Migration>,
}

impl std::fmt::Debug for MigrationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationUnit")
            .field("version", &self.version)
            .field("filename", &self.filename)
            .finish()
    }
}

fn filename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)_([A-Za-z0-9_]+)$").unwrap_or_else(|_| unreachable!()))
}

/// Split `<version>_<name>`; the version never comes from anywhere else.
pub fn parse_unit_filename(filename: &str) -> Result<(i64, String)> {
    let captures = filename_regex().captures(filename).ok_or_else(|| {
        DbKeeperError::Validation(format!(
            "'{}' does not follow the <version>_<name> convention",
            filename
        ))
    })?;
    let version = captures[1]
        .parse::<i64>()
        .map_err(|e| DbKeeperError::Validation(format!("bad version in '{}': {}", filename, e)))?;
    Ok((version, captures[2].to_string()))
}

pub fn checksum(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

impl MigrationUnit {
    pub fn from_migration(migration: Arc<dyn Migration>) -> Result<Self> {
        let filename = migration.filename().to_string();
        let (version, name) = parse_unit_filename(&filename)?;
        if version <= 0 {
            return Err(DbKeeperError::Validation(format!(
                "migration '{}' must have a positive version",
                filename
            )));
        }
        Ok(Self {
            version,
            name,
            checksum: checksum(migration.source()),
            filename,
            migration,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    pub filename: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMigration {
    pub version: i64,
    pub name: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub current_version: i64,
    pub applied: Vec<MigrationRecord>,
    pub pending: Vec<PendingMigration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationRun {
    pub applied: Vec<i64>,
    pub current_version: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackRun {
    pub rolled_back: Vec<i64>,
    /// Versions left recorded: the first unit that cannot be reversed and
    /// everything below it in range, highest first.
    pub skipped: Vec<i64>,
    pub current_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDraft {
    pub version: i64,
    pub name: String,
    pub filename: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumDrift {
    pub version: i64,
    pub filename: String,
    pub recorded: String,
    /// `None` when the unit is no longer compiled in.
    pub current: Option<String>,
}

pub struct MigrationManager {
    connection: Arc<ConnectionManager>,
    config: MigrationConfig,
    units: Vec<MigrationUnit>,
}

impl MigrationManager {
    /// Manager over the compiled-in registry.
    pub fn new(connection: Arc<ConnectionManager>, config: MigrationConfig) -> Result<Self> {
        Self::with_migrations(connection, config, crate::migrations::registry())
    }

    /// Rejects malformed filenames and duplicate versions.
    pub fn with_migrations(
        connection: Arc<ConnectionManager>,
        config: MigrationConfig,
        migrations: Vec<Arc<dyn Migration>>,
    ) -> Result<Self> {
        let mut units = migrations
            .into_iter()
            .map(MigrationUnit::from_migration)
            .collect::<Result<Vec<_>>>()?;
        units.sort_by_key(|unit| unit.version);

        for pair in units.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(DbKeeperError::Validation(format!(
                    "duplicate migration version {} ({} and {})",
                    pair[0].version, pair[0].filename, pair[1].filename
                )));
            }
        }

        Ok(Self { connection, config, units })
    }

    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    fn tracking(&self) -> &str {
        &self.config.tracking_collection
    }

    async fn ensure_tracking(&self, db: &dyn DocumentStore) -> Result<()> {
        db.create_collection(self.tracking()).await?;
        let index = IndexDefinition::new(self.tracking(), doc! { "version": 1 })
            .unique()
            .named(&format!("{}_version_unique", self.tracking()));
        match db.create_index(&index).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_index_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn applied_records(&self, db: &dyn DocumentStore) -> Result<Vec<MigrationRecord>> {
        let options = FindOptions {
            sort: Some(doc! { "version": 1 }),
            ..Default::default()
        };
        db.find(self.tracking(), &doc! {}, &options)
            .await?
            .into_iter()
            .map(|document| bson::from_document(document).map_err(DbKeeperError::from))
            .collect()
    }

    fn current_from(records: &[MigrationRecord]) -> i64 {
        records.iter().map(|r| r.version).max().unwrap_or(0)
    }

    pub async fn get_current_version(&self) -> Result<i64> {
        let db = self.connection.store()?;
        Ok(Self::current_from(&self.applied_records(db.as_ref()).await?))
    }

    /// Apply every unit above the current version, ascending. Stops at the
    /// first failure; nothing already applied is undone.
    pub async fn run_migrations(&self) -> Result<MigrationRun> {
        let db = self.connection.store()?;
        self.ensure_tracking(db.as_ref()).await?;

        let current = Self::current_from(&self.applied_records(db.as_ref()).await?);
        let pending: Vec<&MigrationUnit> = self.units.iter().filter(|u| u.version > current).collect();

        if pending.is_empty() {
            info!("Database schema is up to date at version {}", current);
            return Ok(MigrationRun { applied: Vec::new(), current_version: current });
        }

        info!("Applying {} pending migration(s) from version {}", pending.len(), current);
        let mut run = MigrationRun { applied: Vec::new(), current_version: current };

        for unit in pending {
            info!("Applying migration {}", unit.filename);
            unit.migration.up(db.as_ref()).await.map_err(|e| DbKeeperError::Migration {
                version: unit.version,
                message: e.to_string(),
            })?;

            let record = MigrationRecord {
                version: unit.version,
                name: unit.name.clone(),
                filename: unit.filename.clone(),
                applied_at: Utc::now(),
                checksum: unit.checksum.clone(),
            };
            db.insert_one(self.tracking(), bson::to_document(&record)?)
                .await
                .map_err(|e| DbKeeperError::Migration {
                    version: unit.version,
                    message: format!("applied but not recorded: {}", e),
                })?;

            run.applied.push(unit.version);
            run.current_version = unit.version;
        }

        info!("Migrations complete, schema at version {}", run.current_version);
        Ok(run)
    }

    /// Undo recorded units above `target`, descending. The first unit that
    /// cannot be undone stops the descent: it and every lower version in range
    /// are reported as skipped and stay recorded, so the recorded versions
    /// remain a contiguous prefix.
    pub async fn rollback_to_version(&self, target: i64) -> Result<RollbackRun> {
        if target < 0 {
            return Err(DbKeeperError::Validation(format!(
                "rollback target must be >= 0, got {}",
                target
            )));
        }

        let db = self.connection.store()?;
        self.ensure_tracking(db.as_ref()).await?;

        let mut records = self.applied_records(db.as_ref()).await?;
        let current = Self::current_from(&records);
        if target >= current {
            info!("Nothing to roll back: version {} <= target {}", current, target);
            return Ok(RollbackRun { current_version: current, ..Default::default() });
        }

        records.retain(|r| r.version > target);
        records.sort_by(|a, b| b.version.cmp(&a.version));

        let mut run = RollbackRun::default();
        let mut remaining = records.into_iter();
        while let Some(record) = remaining.next() {
            let unit = match self.units.iter().find(|u| u.version == record.version) {
                Some(unit) if unit.migration.reversible() => unit,
                blocked => {
                    match blocked {
                        Some(unit) => warn!("Stopping rollback at {}: no down migration", unit.filename),
                        None => warn!("Stopping rollback at {}: unit is not registered", record.filename),
                    }
                    run.skipped.push(record.version);
                    run.skipped.extend(remaining.by_ref().map(|r| r.version));
                    break;
                }
            };

            info!("Rolling back migration {}", unit.filename);
            unit.migration.down(db.as_ref()).await.map_err(|e| DbKeeperError::Migration {
                version: unit.version,
                message: format!("rollback failed: {}", e),
            })?;
            db.delete_many(self.tracking(), &doc! { "version": unit.version }).await?;
            run.rolled_back.push(unit.version);
        }

        run.current_version = Self::current_from(&self.applied_records(db.as_ref()).await?);
        if !run.skipped.is_empty() {
            warn!("Rollback incomplete, skipped versions {:?}", run.skipped);
        }
        Ok(run)
    }

    pub async fn get_migration_status(&self) -> Result<MigrationStatus> {
        let db = self.connection.store()?;
        let applied = self.applied_records(db.as_ref()).await?;
        let current_version = Self::current_from(&applied);
        let pending = self
            .units
            .iter()
            .filter(|u| u.version > current_version)
            .map(|u| PendingMigration {
                version: u.version,
                name: u.name.clone(),
                filename: u.filename.clone(),
            })
            .collect();

        Ok(MigrationStatus { current_version, applied, pending })
    }

    /// Recorded checksums that no longer match the compiled-in units.
    pub async fn verify_checksums(&self) -> Result<Vec<ChecksumDrift>> {
        let db = self.connection.store()?;
        let mut drift = Vec::new();
        for record in self.applied_records(db.as_ref()).await? {
            let current = self
                .units
                .iter()
                .find(|u| u.version == record.version)
                .map(|u| u.checksum.clone());
            if current.as_deref() != Some(record.checksum.as_str()) {
                warn!("Checksum drift for migration {}", record.filename);
                drift.push(ChecksumDrift {
                    version: record.version,
                    filename: record.filename,
                    recorded: record.checksum,
                    current,
                });
            }
        }
        Ok(drift)
    }

    /// Write a template unit `m<NNN>_<name>.rs` into the migrations directory.
    pub async fn create_migration(&self, name: &str) -> Result<MigrationDraft> {
        let name = normalize_name(name)?;
        let mut known: BTreeSet<i64> = self.units.iter().map(|u| u.version).collect();
        known.extend(versions_on_disk(&self.config.directory).await?);
        let version = known.iter().next_back().copied().unwrap_or(0) + 1;

        let filename = format!("{:03}_{}", version, name);
        tokio::fs::create_dir_all(&self.config.directory).await?;
        let path = self.config.directory.join(format!("m{}.rs", filename));
        if tokio::fs::try_exists(&path).await? {
            return Err(DbKeeperError::Validation(format!("{} already exists", path.display())));
        }
        tokio::fs::write(&path, migration_template(&filename, &name)).await?;

        info!("Created migration {} at {}", filename, path.display());
        Ok(MigrationDraft { version, name, filename, path })
    }
}

fn normalize_name(name: &str) -> Result<String> {
    let normalized: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let normalized = normalized.trim_matches('_').to_string();
    if normalized.is_empty() {
        return Err(DbKeeperError::Validation(format!("invalid migration name '{}'", name)));
    }
    Ok(normalized)
}

async fn versions_on_disk(directory: &Path) -> Result<Vec<i64>> {
    let mut versions = Vec::new();
    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let stem = file_name
            .to_str()
            .and_then(|n| n.strip_suffix(".rs"))
            .map(|n| n.trim_start_matches('m'));
        if let Some(Ok((version, _))) = stem.map(parse_unit_filename) {
            versions.push(version);
        }
    }
    Ok(versions)
}

fn migration_template(filename: &str, name: &str) -> String {
    let type_name: String = name
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();

    format!(
        r#"use crate::error::Result;
use crate::migration::Migration;
use crate::store::DocumentStore;
use async_trait::async_trait;

pub struct {type_name};

#[async_trait]
impl Migration for {type_name} {{
    fn filename(&self) -> &'static str {{
        "{filename}"
    }}

    fn source(&self) -> &'static str {{
        include_str!("m{filename}.rs")
    }}

    async fn up(&self, _db: &dyn DocumentStore) -> Result<()> {{
        Ok(())
    }}

    async fn down(&self, _db: &dyn DocumentStore) -> Result<()> {{
        Ok(())
    }}

    fn reversible(&self) -> bool {{
        true
    }}
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit_filename() {
        assert_eq!(parse_unit_filename("007_add_trip_tags").unwrap(), (7, "add_trip_tags".to_string()));
        assert!(parse_unit_filename("add_trip_tags").is_err());
        assert!(parse_unit_filename("7-add").is_err());
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let a = checksum("up();");
        assert_eq!(a.len(), 64);
        assert_eq!(a, checksum("up();"));
        assert_ne!(a, checksum("up(); "));
    }

    #[test]
    fn test_normalize_name_and_template() {
        assert_eq!(normalize_name(" Add Trip-Tags ").unwrap(), "add_trip_tags");
        assert!(normalize_name("--").is_err());

        let template = migration_template("004_add_trip_tags", "add_trip_tags");
        assert!(template.contains("pub struct AddTripTags;"));
        assert!(template.contains("\"004_add_trip_tags\""));
        assert!(template.contains("include_str!(\"m004_add_trip_tags.rs\")"));
    }
}
