/*!
 * Index lifecycle for DbKeeper
 * Converges live indexes with the declared table and reports on their use
 */

use crate::connection::ConnectionManager;
use crate::error::{DbKeeperError, Result};
use crate::store::{
    DocumentStore, FindOptions, IndexCreation, IndexDefinition, IndexInfo, IndexUsage, FULL_SCAN,
};
use bson::{doc, Document};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Examined/returned ratio above which a query is flagged.
const EXAMINED_RATIO_LIMIT: u64 = 10;

/// Every index the application relies on, grouped by collection.
pub fn index_definitions() -> Vec<IndexDefinition> {
    vec![
        // users
        IndexDefinition::new("users", doc! { "email": 1 }).unique(),
        IndexDefinition::new("users", doc! { "username": 1 }).unique().sparse(),
        IndexDefinition::new("users", doc! { "createdAt": -1 }),
        // trips
        IndexDefinition::new("trips", doc! { "ownerId": 1, "startDate": -1 }),
        IndexDefinition::new("trips", doc! { "collaborators": 1 }),
        IndexDefinition::new("trips", doc! { "status": 1, "startDate": 1 }),
        IndexDefinition::new("trips", doc! { "name": "text", "destination": "text" })
            .named("trips_text_search"),
        // itineraries
        IndexDefinition::new("itineraries", doc! { "tripId": 1, "day": 1 }),
        // expenses
        IndexDefinition::new("expenses", doc! { "tripId": 1, "date": -1 }),
        IndexDefinition::new("expenses", doc! { "paidBy": 1 }),
        // invitations
        IndexDefinition::new("invitations", doc! { "token": 1 }).unique(),
        IndexDefinition::new("invitations", doc! { "tripId": 1, "status": 1 }),
        IndexDefinition::new("invitations", doc! { "email": 1 }),
        // notifications
        IndexDefinition::new("notifications", doc! { "userId": 1, "read": 1, "createdAt": -1 })
            .named("notifications_inbox"),
        // activities
        IndexDefinition::new("activities", doc! { "tripId": 1, "createdAt": -1 }),
        // comments
        IndexDefinition::new("comments", doc! { "tripId": 1, "createdAt": 1 }),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Created,
    AlreadyExists,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexResult {
    pub name: String,
    pub status: IndexStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionIndexResult {
    pub collection: String,
    pub success: bool,
    pub indexes: Vec<IndexResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionIndexStats {
    pub exists: bool,
    pub total_indexes: usize,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    pub sort: Option<Document>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub collection: String,
    pub index_used: String,
    pub documents_examined: u64,
    pub documents_returned: u64,
    pub execution_time_ms: f64,
    pub suggestions: Vec<String>,
}

impl QueryAnalysis {
    pub fn is_full_scan(&self) -> bool {
        self.index_used == FULL_SCAN
    }
}

pub struct IndexManager {
    connection: Arc<ConnectionManager>,
    definitions: BTreeMap<String, Vec<IndexDefinition>>,
    slow_query_threshold_ms: u64,
}

impl IndexManager {
    pub fn new(connection: Arc<ConnectionManager>) -> Result<Self> {
        Self::with_definitions(connection, index_definitions())
    }

    /// The table is validated once here and never changes afterwards.
    pub fn with_definitions(connection: Arc<ConnectionManager>, definitions: Vec<IndexDefinition>) -> Result<Self> {
        let mut grouped: BTreeMap<String, Vec<IndexDefinition>> = BTreeMap::new();
        for definition in definitions {
            definition.validate()?;
            let entry = grouped.entry(definition.collection.clone()).or_default();
            if entry.iter().any(|d| d.index_name() == definition.index_name()) {
                return Err(DbKeeperError::Index(format!(
                    "index '{}' is declared twice",
                    definition.index_name()
                )));
            }
            entry.push(definition);
        }

        let slow_query_threshold_ms = connection.config().slow_query_threshold_ms;
        Ok(Self { connection, definitions: grouped, slow_query_threshold_ms })
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn definitions_for(&self, collection: &str) -> Option<&[IndexDefinition]> {
        self.definitions.get(collection).map(Vec::as_slice)
    }

    pub async fn create_all_indexes(&self) -> Result<Vec<CollectionIndexResult>> {
        let db = self.connection.store()?;
        let mut results = Vec::with_capacity(self.definitions.len());
        for (collection, definitions) in &self.definitions {
            results.push(Self::create_indexes(db.as_ref(), collection, definitions).await);
        }

        let failed = results.iter().filter(|r| !r.success).count();
        if failed == 0 {
            info!("Indexes ready on {} collection(s)", results.len());
        } else {
            warn!("Index creation failed on {} collection(s)", failed);
        }
        Ok(results)
    }

    pub async fn create_collection_indexes(&self, collection: &str) -> Result<CollectionIndexResult> {
        let definitions = self.declared(collection)?;
        let db = self.connection.store()?;
        Ok(Self::create_indexes(db.as_ref(), collection, definitions).await)
    }

    async fn create_indexes(
        db: &dyn DocumentStore,
        collection: &str,
        definitions: &[IndexDefinition],
    ) -> CollectionIndexResult {
        let mut indexes = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let name = definition.index_name();
            let (status, error) = match db.create_index(definition).await {
                Ok(IndexCreation::Created) => (IndexStatus::Created, None),
                Ok(IndexCreation::AlreadyExists) => (IndexStatus::AlreadyExists, None),
                Err(e) if e.is_index_conflict() => (IndexStatus::AlreadyExists, None),
                Err(e) => {
                    warn!("Failed to create index {} on {}: {}", name, collection, e);
                    (IndexStatus::Failed, Some(e.to_string()))
                }
            };
            debug!("Index {} on {}: {:?}", name, collection, status);
            indexes.push(IndexResult { name, status, error });
        }

        CollectionIndexResult {
            collection: collection.to_string(),
            success: indexes.iter().all(|i| i.status != IndexStatus::Failed),
            indexes,
        }
    }

    /// Drop everything except the primary index. Returns the dropped names.
    pub async fn drop_collection_indexes(&self, collection: &str) -> Result<Vec<String>> {
        let db = self.connection.store()?;
        let indexes = match db.list_indexes(collection).await {
            Ok(indexes) => indexes,
            Err(DbKeeperError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut dropped = Vec::new();
        for index in indexes.into_iter().filter(|i| !i.primary) {
            db.drop_index(collection, &index.name).await?;
            dropped.push(index.name);
        }
        info!("Dropped {} index(es) on {}", dropped.len(), collection);
        Ok(dropped)
    }

    pub async fn rebuild_collection_indexes(&self, collection: &str) -> Result<CollectionIndexResult> {
        self.declared(collection)?;
        self.drop_collection_indexes(collection).await?;
        self.create_collection_indexes(collection).await
    }

    pub async fn get_index_stats(&self) -> Result<BTreeMap<String, CollectionIndexStats>> {
        let db = self.connection.store()?;
        let mut stats = BTreeMap::new();
        for collection in self.definitions.keys() {
            let entry = if db.collection_exists(collection).await? {
                let indexes = db.list_indexes(collection).await?;
                CollectionIndexStats { exists: true, total_indexes: indexes.len(), indexes }
            } else {
                CollectionIndexStats { exists: false, total_indexes: 0, indexes: Vec::new() }
            };
            stats.insert(collection.clone(), entry);
        }
        Ok(stats)
    }

    /// Explain `filter` and derive advice. Read-only.
    pub async fn analyze_query_performance(
        &self,
        collection: &str,
        filter: &Document,
        options: &QueryOptions,
    ) -> Result<QueryAnalysis> {
        let db = self.connection.store()?;
        let find_options = FindOptions {
            projection: None,
            sort: options.sort.clone(),
            limit: options.limit,
        };
        let plan = db.explain(collection, filter, &find_options).await?;

        let mut suggestions = Vec::new();
        if plan.index_used == FULL_SCAN {
            let fields: Vec<&str> = filter.keys().map(String::as_str).collect();
            if fields.is_empty() {
                suggestions.push("Query scans the whole collection; add a filter or a limit".to_string());
            } else {
                suggestions.push(format!(
                    "Query performs a full collection scan; consider an index on {{{}}}",
                    fields.join(", ")
                ));
            }
        }
        if plan.documents_examined > plan.documents_returned.max(1) * EXAMINED_RATIO_LIMIT {
            suggestions.push(format!(
                "Query examined {} documents to return {}; the index is not selective enough",
                plan.documents_examined, plan.documents_returned
            ));
        }
        if plan.execution_time_ms > self.slow_query_threshold_ms as f64 {
            suggestions.push(format!(
                "Execution took {:.1}ms, above the {}ms slow query threshold",
                plan.execution_time_ms, self.slow_query_threshold_ms
            ));
        }

        Ok(QueryAnalysis {
            collection: collection.to_string(),
            index_used: plan.index_used,
            documents_examined: plan.documents_examined,
            documents_returned: plan.documents_returned,
            execution_time_ms: plan.execution_time_ms,
            suggestions,
        })
    }

    /// Access counters for every declared collection that exists.
    pub async fn get_index_usage_stats(&self) -> Result<Vec<IndexUsage>> {
        let db = self.connection.store()?;
        let mut usage = Vec::new();
        for collection in self.definitions.keys() {
            match db.index_usage(collection).await {
                Ok(entries) => usage.extend(entries),
                Err(DbKeeperError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(usage)
    }

    fn declared(&self, collection: &str) -> Result<&[IndexDefinition]> {
        self.definitions_for(collection)
            .ok_or_else(|| DbKeeperError::NotFound(format!("no indexes declared for '{}'", collection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::store::{MemoryConnector, MemoryStore};

    async fn connected() -> (Arc<MemoryStore>, Arc<ConnectionManager>) {
        let store = Arc::new(MemoryStore::new("trips"));
        let manager = ConnectionManager::new(
            DatabaseConfig { health_check_interval_ms: 60_000, ..Default::default() },
            Arc::new(MemoryConnector::new(store.clone())),
        );
        manager.connect().await.unwrap();
        (store, manager)
    }

    #[test]
    fn test_declared_definitions_are_valid() {
        for definition in index_definitions() {
            definition.validate().unwrap();
            assert!(definition.index_name().len() <= 63, "{}", definition.index_name());
        }
    }

    #[tokio::test]
    async fn test_duplicate_declaration_rejected() {
        let (_store, connection) = connected().await;
        let definitions = vec![
            IndexDefinition::new("users", doc! { "email": 1 }),
            IndexDefinition::new("users", doc! { "email": 1 }).unique(),
        ];
        assert!(IndexManager::with_definitions(connection, definitions).is_err());
    }

    #[tokio::test]
    async fn test_rebuild_keeps_primary_index() {
        let (store, connection) = connected().await;
        let manager = IndexManager::new(connection).unwrap();
        manager.create_all_indexes().await.unwrap();

        let result = manager.rebuild_collection_indexes("users").await.unwrap();
        assert!(result.success);
        assert!(result.indexes.iter().all(|i| i.status == IndexStatus::Created));

        let indexes = store.list_indexes("users").await.unwrap();
        assert_eq!(indexes.len(), 4);
        assert_eq!(indexes.iter().filter(|i| i.primary).count(), 1);
    }

    #[tokio::test]
    async fn test_analysis_flags_full_scan() {
        let (store, connection) = connected().await;
        let documents = (0..30).map(|i| doc! { "status": if i % 10 == 0 { "active" } else { "draft" } }).collect();
        store.insert_many("notes", documents).await.unwrap();

        let manager = IndexManager::new(connection).unwrap();
        let analysis = manager
            .analyze_query_performance("notes", &doc! { "status": "active" }, &QueryOptions::default())
            .await
            .unwrap();

        assert!(analysis.is_full_scan());
        assert_eq!(analysis.documents_examined, 30);
        assert_eq!(analysis.documents_returned, 3);
        assert!(analysis.suggestions.iter().any(|s| s.contains("full collection scan")));
    }
}
