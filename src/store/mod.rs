/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * DbKeeper - Database lifecycle orchestration for document stores
 * Built with Rust for superior performance and reliability
 *
 * @file store/mod.rs
 * @brief Document store abstraction shared by every manager
 */

pub mod memory;
pub mod postgres;

use crate::config::DatabaseConfig;
use crate::error::{DbKeeperError, Result};
use async_trait::async_trait;
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use memory::{MemoryConnector, MemoryStore};
pub use postgres::{PostgresConnector, PostgresStore};

/// Sentinel reported by explain when no index was used.
pub const FULL_SCAN: &str = "COLLSCAN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexOptions {
    pub unique: Option<bool>,
    pub sparse: Option<bool>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub collection: String,
    /// Ordered field -> direction (`1`, `-1` or `"text"`).
    pub fields: Document,
    pub options: IndexOptions,
}

impl IndexDefinition {
    pub fn new(collection: &str, fields: Document) -> Self {
        Self {
            collection: collection.to_string(),
            fields,
            options: IndexOptions::default(),
        }
    }

    pub fn unique(mut self) -> Self {
        self.options.unique = Some(true);
        self
    }

    pub fn sparse(mut self) -> Self {
        self.options.sparse = Some(true);
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.options.name = Some(name.to_string());
        self
    }

    pub fn is_unique(&self) -> bool {
        self.options.unique.unwrap_or(false)
    }

    pub fn is_sparse(&self) -> bool {
        self.options.sparse.unwrap_or(false)
    }

    /// Explicit name, or `<collection>_<field>_<dir>...` when none is given.
    pub fn index_name(&self) -> String {
        if let Some(name) = &self.options.name {
            return name.clone();
        }

        let mut name_parts = Vec::new();
        for (field, direction) in &self.fields {
            let direction_str = match direction {
                Bson::Int32(-1) | Bson::Int64(-1) => "-1".to_string(),
                Bson::String(kind) => kind.clone(),
                _ => "1".to_string(),
            };
            name_parts.push(format!("{}_{}", field.replace('.', "_"), direction_str));
        }

        format!("{}_{}", self.collection, name_parts.join("_"))
    }

    pub fn validate(&self) -> Result<()> {
        validate_collection_name(&self.collection)?;

        if self.fields.is_empty() {
            return Err(DbKeeperError::Index(format!(
                "Index on '{}' has no key fields",
                self.collection
            )));
        }

        for (field, direction) in &self.fields {
            if field.is_empty() || field.starts_with('$') {
                return Err(DbKeeperError::Index(format!(
                    "Invalid index field '{}' on '{}'",
                    field, self.collection
                )));
            }

            match direction {
                Bson::Int32(1) | Bson::Int32(-1) | Bson::Int64(1) | Bson::Int64(-1) => {}
                Bson::String(kind) if kind == "text" => {}
                _ => {
                    return Err(DbKeeperError::Index(format!(
                        "Invalid index direction for field {}: {:?}",
                        field, direction
                    )))
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexCreation {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub keys: Document,
    pub unique: bool,
    pub sparse: bool,
    pub primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexUsage {
    pub collection: String,
    pub name: String,
    pub accesses: u64,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainPlan {
    /// Index name, or [`FULL_SCAN`].
    pub index_used: String,
    pub documents_examined: u64,
    pub documents_returned: u64,
    pub execution_time_ms: f64,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindOptions {
    pub projection: Option<Document>,
    /// Single field sort, `1` ascending, `-1` descending.
    pub sort: Option<Document>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStats {
    pub database: String,
    pub server_version: String,
    pub collections: u64,
    pub objects: u64,
    pub data_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub name: String,
    pub count: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertManyOutcome {
    pub inserted: u64,
    pub errors: Vec<String>,
}

/// A document database as seen by the lifecycle managers.
///
/// Handles are cheap to clone behind `Arc` and are re-fetched from the
/// connection manager for every operation.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<()>;

    async fn server_stats(&self) -> Result<ServerStats>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn collection_exists(&self, collection: &str) -> Result<bool>;

    /// Idempotent.
    async fn create_collection(&self, collection: &str) -> Result<()>;

    async fn drop_collection(&self, collection: &str) -> Result<()>;

    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats>;

    async fn find(&self, collection: &str, filter: &Document, options: &FindOptions) -> Result<Vec<Document>>;

    async fn count_documents(&self, collection: &str, filter: &Document) -> Result<u64>;

    async fn insert_one(&self, collection: &str, document: Document) -> Result<()>;

    /// Unordered: a failing document does not stop the rest of the batch.
    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<InsertManyOutcome>;

    /// Shallow `$set` of `update` onto every matching document.
    async fn update_many(&self, collection: &str, filter: &Document, update: &Document) -> Result<u64>;

    async fn delete_many(&self, collection: &str, filter: &Document) -> Result<u64>;

    /// Drop every collection in the database.
    async fn drop_database(&self) -> Result<()>;

    /// Fails with [`DbKeeperError::IndexConflict`] when the name is taken.
    async fn create_index(&self, definition: &IndexDefinition) -> Result<IndexCreation>;

    async fn drop_index(&self, collection: &str, name: &str) -> Result<()>;

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>>;

    async fn index_usage(&self, collection: &str) -> Result<Vec<IndexUsage>>;

    async fn explain(&self, collection: &str, filter: &Document, options: &FindOptions) -> Result<ExplainPlan>;
}

/// Produces a live store handle; one attempt per call.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn DocumentStore>>;
}

/// Collection names end up inside SQL identifiers.
pub fn validate_collection_name(collection: &str) -> Result<()> {
    if collection.is_empty()
        || collection.len() > 63
        || !collection.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        || collection.starts_with(|c: char| c.is_ascii_digit())
    {
        return Err(DbKeeperError::Validation(format!(
            "Invalid collection name '{}'",
            collection
        )));
    }
    Ok(())
}

/// Resolve a dotted path (`budget.total`) inside a document.
pub fn lookup_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = document.get(first)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Keep only the projected fields (inclusion projection, `_id` kept unless excluded).
pub fn apply_projection(document: Document, projection: Option<&Document>) -> Document {
    let projection = match projection {
        Some(p) if !p.is_empty() => p,
        _ => return document,
    };

    let include_id = !matches!(
        projection.get("_id"),
        Some(Bson::Int32(0)) | Some(Bson::Int64(0)) | Some(Bson::Boolean(false))
    );
    let included: Vec<&str> = projection
        .iter()
        .filter(|(key, value)| {
            key.as_str() != "_id"
                && !matches!(value, Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false))
        })
        .map(|(key, _)| key.as_str())
        .collect();

    if included.is_empty() {
        // Exclusion projection.
        let mut document = document;
        for (key, value) in projection {
            if matches!(value, Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false)) {
                document.remove(key);
            }
        }
        return document;
    }

    let mut projected = Document::new();
    if include_id {
        if let Some(id) = document.get("_id") {
            projected.insert("_id", id.clone());
        }
    }
    for field in included {
        if let Some(value) = document.get(field) {
            projected.insert(field, value.clone());
        }
    }
    projected
}

/// Render a document as relaxed extended JSON.
pub fn document_to_json(document: Document) -> serde_json::Value {
    Bson::Document(document).into_relaxed_extjson()
}

/// Parse an extended JSON object back into a document.
pub fn json_to_document(value: serde_json::Value) -> Result<Document> {
    match Bson::try_from(value)? {
        Bson::Document(document) => Ok(document),
        other => Err(DbKeeperError::Validation(format!(
            "Expected a JSON object, found {:?}",
            other.element_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_generated_index_name() {
        let def = IndexDefinition::new("trips", doc! { "ownerId": 1, "startDate": -1 });
        assert_eq!(def.index_name(), "trips_ownerId_1_startDate_-1");
        assert_eq!(def.clone().named("custom").index_name(), "custom");
    }

    #[test]
    fn test_index_validation() {
        assert!(IndexDefinition::new("users", doc! { "email": 1 }).validate().is_ok());
        assert!(IndexDefinition::new("users", doc! {}).validate().is_err());
        assert!(IndexDefinition::new("users", doc! { "$where": 1 }).validate().is_err());
        assert!(IndexDefinition::new("users", doc! { "email": 2 }).validate().is_err());
        assert!(IndexDefinition::new("bad-name", doc! { "email": 1 }).validate().is_err());
    }

    #[test]
    fn test_lookup_path_and_projection() {
        let document = doc! { "_id": 1, "name": "Lisbon", "budget": { "total": 1200 } };
        assert_eq!(lookup_path(&document, "budget.total"), Some(&Bson::Int32(1200)));
        assert_eq!(lookup_path(&document, "budget.missing"), None);

        let projected = apply_projection(document.clone(), Some(&doc! { "name": 1 }));
        assert_eq!(projected, doc! { "_id": 1, "name": "Lisbon" });

        let excluded = apply_projection(document, Some(&doc! { "budget": 0 }));
        assert_eq!(excluded, doc! { "_id": 1, "name": "Lisbon" });
    }
}
