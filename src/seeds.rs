/*!
 * Environment-scoped seed data for DbKeeper
 * Never runs against production
 */

pub mod fixtures;
mod s001_users;
mod s002_trips;
mod s003_demo_showcase;

pub use fixtures::{generate_test_trips, generate_test_users};

use crate::config::Environment;
use crate::connection::ConnectionManager;
use crate::error::{DbKeeperError, Result};
use crate::store::DocumentStore;
use async_trait::async_trait;
use bson::doc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// A data-population routine scoped to some environments.
#[async_trait]
pub trait Seed: Send + Sync {
    /// `<order>_<name>`, e.g. `002_trips`.
    fn filename(&self) -> &'static str;

    fn environments(&self) -> &'static [&'static str];

    /// A failing required seed aborts the whole run.
    fn required(&self) -> bool {
        false
    }

    /// Explicit order; the filename prefix is used when absent.
    fn order(&self) -> Option<i64> {
        None
    }

    async fn seed(&self, db: &dyn DocumentStore) -> Result<()>;
}

pub fn registry() -> Vec<Arc<dyn Seed>> {
    vec![
        Arc::new(s001_users::Users),
        Arc::new(s002_trips::Trips),
        Arc::new(s003_demo_showcase::DemoShowcase),
    ]
}

#[derive(Clone)]
pub struct SeedUnit {
    pub order: i64,
    pub file_order: i64,
    pub name: String,
    pub filename: String,
    pub environments: Vec<String>,
    pub required: bool,
    pub seed: Arc<dyn Seed>,
}

impl SeedUnit {
    pub fn from_seed(seed: Arc<dyn Seed>) -> Result<Self> {
        let filename = seed.filename().to_string();
        let (file_order, name) = crate::migration::parse_unit_filename(&filename)?;
        Ok(Self {
            order: seed.order().unwrap_or(file_order),
            file_order,
            name,
            environments: seed.environments().iter().map(|e| e.to_string()).collect(),
            required: seed.required(),
            filename,
            seed,
        })
    }

    pub fn applies_to(&self, environment: &Environment) -> bool {
        self.environments.iter().any(|e| e.eq_ignore_ascii_case(environment.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedRun {
    pub environment: String,
    /// Set when the environment forbids seeding; nothing was touched.
    pub refused: bool,
    pub success: bool,
    pub executed: Vec<String>,
    pub failed: Vec<SeedFailure>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearReport {
    pub collections: Vec<String>,
    pub documents_deleted: u64,
}

pub struct SeedManager {
    connection: Arc<ConnectionManager>,
    environment: Environment,
    preserved: Vec<String>,
    units: Vec<SeedUnit>,
}

impl SeedManager {
    /// `tracking_collection` survives [`clear_database`](Self::clear_database).
    pub fn new(connection: Arc<ConnectionManager>, environment: Environment, tracking_collection: &str) -> Result<Self> {
        Self::with_seeds(connection, environment, tracking_collection, registry())
    }

    pub fn with_seeds(
        connection: Arc<ConnectionManager>,
        environment: Environment,
        tracking_collection: &str,
        seeds: Vec<Arc<dyn Seed>>,
    ) -> Result<Self> {
        let mut units = seeds.into_iter().map(SeedUnit::from_seed).collect::<Result<Vec<_>>>()?;
        units.sort_by(|a, b| {
            (a.order, a.file_order, &a.filename).cmp(&(b.order, b.file_order, &b.filename))
        });

        Ok(Self {
            connection,
            environment,
            preserved: vec![tracking_collection.to_string()],
            units,
        })
    }

    pub fn units(&self) -> &[SeedUnit] {
        &self.units
    }

    pub async fn run_seeds(&self, environment: &Environment) -> Result<SeedRun> {
        let mut run = SeedRun {
            environment: environment.to_string(),
            ..Default::default()
        };

        if environment.is_production() || self.environment.is_production() {
            warn!("Refusing to run seeds in production");
            run.refused = true;
            return Ok(run);
        }

        let db = self.connection.store()?;
        let selected: Vec<&SeedUnit> = self.units.iter().filter(|u| u.applies_to(environment)).collect();
        info!("Running {} seed(s) for environment '{}'", selected.len(), environment);

        for unit in selected {
            info!("Seeding {}", unit.filename);
            match unit.seed.seed(db.as_ref()).await {
                Ok(()) => run.executed.push(unit.filename.clone()),
                Err(e) if unit.required => {
                    error!("Required seed {} failed: {}", unit.filename, e);
                    return Err(DbKeeperError::Seed {
                        name: unit.filename.clone(),
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!("Seed {} failed, continuing: {}", unit.filename, e);
                    run.failed.push(SeedFailure {
                        seed: unit.filename.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        run.success = true;
        Ok(run)
    }

    /// Delete every document outside the preserved collections.
    pub async fn clear_database(&self) -> Result<ClearReport> {
        if self.environment.is_production() {
            return Err(DbKeeperError::production_guard("clear the database"));
        }

        let db = self.connection.store()?;
        let mut report = ClearReport::default();
        for collection in db.list_collections().await? {
            if self.preserved.contains(&collection) {
                continue;
            }
            report.documents_deleted += db.delete_many(&collection, &doc! {}).await?;
            report.collections.push(collection);
        }

        info!(
            "Cleared {} document(s) from {} collection(s)",
            report.documents_deleted,
            report.collections.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order_and_scopes() {
        let units: Vec<SeedUnit> = registry().into_iter().map(|s| SeedUnit::from_seed(s).unwrap()).collect();
        let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["users", "trips", "demo_showcase"]);

        assert!(units[0].required);
        assert!(units[0].applies_to(&Environment::Test));
        assert!(!units[2].applies_to(&Environment::Test));
        assert!(units.iter().all(|u| !u.applies_to(&Environment::Production)));
    }
}
