/*!
 * In-process document store
 * Backs the test-suite and dry runs with the same semantics as the PostgreSQL driver
 */

use super::{
    apply_projection, lookup_path, validate_collection_name, CollectionStats, DocumentStore,
    ExplainPlan, FindOptions, IndexCreation, IndexDefinition, IndexInfo, IndexUsage,
    InsertManyOutcome, ServerStats, StoreConnector, FULL_SCAN,
};
use crate::config::DatabaseConfig;
use crate::error::{DbKeeperError, Result};
use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

const PRIMARY_INDEX: &str = "_id_";

#[derive(Debug)]
struct MemIndex {
    info: IndexInfo,
    accesses: u64,
}

#[derive(Debug)]
struct MemCollection {
    documents: Vec<Document>,
    indexes: Vec<MemIndex>,
}

impl MemCollection {
    fn new() -> Self {
        Self {
            documents: Vec::new(),
            indexes: vec![MemIndex {
                info: IndexInfo {
                    name: PRIMARY_INDEX.to_string(),
                    keys: doc! { "_id": 1 },
                    unique: true,
                    sparse: false,
                    primary: true,
                },
                accesses: 0,
            }],
        }
    }

    /// Pick the index a query would use: first index whose leading key is filtered on.
    fn choose_index(&self, filter: &Document) -> Option<usize> {
        self.indexes.iter().position(|index| {
            index
                .info
                .keys
                .keys()
                .next()
                .map(|leading| filter.contains_key(leading))
                .unwrap_or(false)
        })
    }

    fn check_unique(&self, candidate: &Document, skip: Option<usize>) -> Result<()> {
        for index in self.indexes.iter().filter(|i| i.info.unique) {
            let key = index_key(&index.info.keys, candidate);
            if index.info.sparse && key.iter().all(Option::is_none) {
                continue;
            }
            let clash = self
                .documents
                .iter()
                .enumerate()
                .filter(|(pos, _)| Some(*pos) != skip)
                .any(|(_, existing)| index_key(&index.info.keys, existing) == key);
            if clash {
                return Err(DbKeeperError::Database(format!(
                    "E11000 duplicate key error index: {}",
                    index.info.name
                )));
            }
        }
        Ok(())
    }
}

fn index_key(keys: &Document, document: &Document) -> Vec<Option<Bson>> {
    keys.keys()
        .map(|field| lookup_path(document, field).cloned())
        .collect()
}

/// Document store held entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    collections: RwLock<BTreeMap<String, MemCollection>>,
    available: AtomicBool,
    started_at: DateTime<Utc>,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            collections: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            started_at: Utc::now(),
        }
    }

    /// Simulate the server going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(AtomicOrdering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(DbKeeperError::Connection(format!("server for '{}' is unreachable", self.name)))
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.ensure_available()
    }

    async fn server_stats(&self) -> Result<ServerStats> {
        self.ensure_available()?;
        let collections = self.collections.read();
        let objects: usize = collections.values().map(|c| c.documents.len()).sum();
        let data_size: u64 = collections
            .values()
            .flat_map(|c| c.documents.iter())
            .map(document_size)
            .sum();

        Ok(ServerStats {
            database: self.name.clone(),
            server_version: format!("memory-{}", env!("CARGO_PKG_VERSION")),
            collections: collections.len() as u64,
            objects: objects as u64,
            data_size_bytes: data_size,
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.ensure_available()?;
        Ok(self.collections.read().keys().cloned().collect())
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.collections.read().contains_key(collection))
    }

    async fn create_collection(&self, collection: &str) -> Result<()> {
        self.ensure_available()?;
        validate_collection_name(collection)?;
        self.collections
            .write()
            .entry(collection.to_string())
            .or_insert_with(MemCollection::new);
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.ensure_available()?;
        self.collections.write().remove(collection);
        Ok(())
    }

    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats> {
        self.ensure_available()?;
        let collections = self.collections.read();
        let coll = collections
            .get(collection)
            .ok_or_else(|| DbKeeperError::NotFound(format!("collection '{}'", collection)))?;

        Ok(CollectionStats {
            name: collection.to_string(),
            count: coll.documents.len() as u64,
            size: coll.documents.iter().map(document_size).sum(),
        })
    }

    async fn find(&self, collection: &str, filter: &Document, options: &FindOptions) -> Result<Vec<Document>> {
        self.ensure_available()?;
        let mut collections = self.collections.write();
        let coll = match collections.get_mut(collection) {
            Some(coll) => coll,
            None => return Ok(Vec::new()),
        };

        if let Some(pos) = coll.choose_index(filter) {
            coll.indexes[pos].accesses += 1;
        }

        let mut matched: Vec<Document> = coll
            .documents
            .iter()
            .filter(|d| matches_filter(d, filter))
            .cloned()
            .collect();

        if let Some(sort) = &options.sort {
            sort_documents(&mut matched, sort);
        }
        if let Some(limit) = options.limit.filter(|l| *l > 0) {
            matched.truncate(limit as usize);
        }

        Ok(matched
            .into_iter()
            .map(|d| apply_projection(d, options.projection.as_ref()))
            .collect())
    }

    async fn count_documents(&self, collection: &str, filter: &Document) -> Result<u64> {
        self.ensure_available()?;
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .map(|c| c.documents.iter().filter(|d| matches_filter(d, filter)).count() as u64)
            .unwrap_or(0))
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<()> {
        let outcome = self.insert_many(collection, vec![document]).await?;
        match outcome.errors.into_iter().next() {
            Some(error) => Err(DbKeeperError::Database(error)),
            None => Ok(()),
        }
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<InsertManyOutcome> {
        self.ensure_available()?;
        validate_collection_name(collection)?;
        let mut collections = self.collections.write();
        let coll = collections
            .entry(collection.to_string())
            .or_insert_with(MemCollection::new);

        let mut outcome = InsertManyOutcome::default();
        for mut document in documents {
            if !document.contains_key("_id") {
                document.insert("_id", ObjectId::new());
            }
            match coll.check_unique(&document, None) {
                Ok(()) => {
                    coll.documents.push(document);
                    outcome.inserted += 1;
                }
                Err(e) => outcome.errors.push(e.to_string()),
            }
        }
        Ok(outcome)
    }

    async fn update_many(&self, collection: &str, filter: &Document, update: &Document) -> Result<u64> {
        self.ensure_available()?;
        let mut collections = self.collections.write();
        let coll = match collections.get_mut(collection) {
            Some(coll) => coll,
            None => return Ok(0),
        };

        let positions: Vec<usize> = coll
            .documents
            .iter()
            .enumerate()
            .filter(|(_, d)| matches_filter(d, filter))
            .map(|(pos, _)| pos)
            .collect();

        for &pos in &positions {
            let mut updated = coll.documents[pos].clone();
            for (key, value) in update {
                updated.insert(key.clone(), value.clone());
            }
            coll.check_unique(&updated, Some(pos))?;
            coll.documents[pos] = updated;
        }
        Ok(positions.len() as u64)
    }

    async fn delete_many(&self, collection: &str, filter: &Document) -> Result<u64> {
        self.ensure_available()?;
        let mut collections = self.collections.write();
        let coll = match collections.get_mut(collection) {
            Some(coll) => coll,
            None => return Ok(0),
        };
        let before = coll.documents.len();
        coll.documents.retain(|d| !matches_filter(d, filter));
        Ok((before - coll.documents.len()) as u64)
    }

    async fn drop_database(&self) -> Result<()> {
        self.ensure_available()?;
        self.collections.write().clear();
        Ok(())
    }

    async fn create_index(&self, definition: &IndexDefinition) -> Result<IndexCreation> {
        self.ensure_available()?;
        definition.validate()?;
        let name = definition.index_name();

        let mut collections = self.collections.write();
        let coll = collections
            .entry(definition.collection.clone())
            .or_insert_with(MemCollection::new);

        if coll.indexes.iter().any(|i| i.info.name == name) {
            return Err(DbKeeperError::IndexConflict(name));
        }

        coll.indexes.push(MemIndex {
            info: IndexInfo {
                name,
                keys: definition.fields.clone(),
                unique: definition.is_unique(),
                sparse: definition.is_sparse(),
                primary: false,
            },
            accesses: 0,
        });
        Ok(IndexCreation::Created)
    }

    async fn drop_index(&self, collection: &str, name: &str) -> Result<()> {
        self.ensure_available()?;
        if name == PRIMARY_INDEX {
            return Err(DbKeeperError::Index("cannot drop the primary index".to_string()));
        }
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| DbKeeperError::NotFound(format!("collection '{}'", collection)))?;
        let before = coll.indexes.len();
        coll.indexes.retain(|i| i.info.name != name);
        if coll.indexes.len() == before {
            return Err(DbKeeperError::NotFound(format!("index '{}' on '{}'", name, collection)));
        }
        Ok(())
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>> {
        self.ensure_available()?;
        let collections = self.collections.read();
        let coll = collections
            .get(collection)
            .ok_or_else(|| DbKeeperError::NotFound(format!("collection '{}'", collection)))?;
        Ok(coll.indexes.iter().map(|i| i.info.clone()).collect())
    }

    async fn index_usage(&self, collection: &str) -> Result<Vec<IndexUsage>> {
        self.ensure_available()?;
        let collections = self.collections.read();
        let coll = collections
            .get(collection)
            .ok_or_else(|| DbKeeperError::NotFound(format!("collection '{}'", collection)))?;
        Ok(coll
            .indexes
            .iter()
            .map(|i| IndexUsage {
                collection: collection.to_string(),
                name: i.info.name.clone(),
                accesses: i.accesses,
                since: Some(self.started_at),
            })
            .collect())
    }

    async fn explain(&self, collection: &str, filter: &Document, options: &FindOptions) -> Result<ExplainPlan> {
        self.ensure_available()?;
        let started = Instant::now();
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| DbKeeperError::NotFound(format!("collection '{}'", collection)))?;

        let matched = coll.documents.iter().filter(|d| matches_filter(d, filter)).count() as u64;
        let returned = match options.limit.filter(|l| *l > 0) {
            Some(limit) => matched.min(limit as u64),
            None => matched,
        };

        let (index_used, examined) = match coll.choose_index(filter) {
            Some(pos) => {
                coll.indexes[pos].accesses += 1;
                (coll.indexes[pos].info.name.clone(), matched)
            }
            None => (FULL_SCAN.to_string(), coll.documents.len() as u64),
        };

        Ok(ExplainPlan {
            raw: serde_json::json!({
                "stage": if index_used == FULL_SCAN { "COLLSCAN" } else { "IXSCAN" },
                "indexName": index_used,
                "docsExamined": examined,
                "nReturned": returned,
            }),
            index_used,
            documents_examined: examined,
            documents_returned: returned,
            execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

fn document_size(document: &Document) -> u64 {
    bson::to_vec(document).map(|b| b.len() as u64).unwrap_or(0)
}

/// Equality on (dotted) fields plus `$exists`, `$in`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`.
pub(crate) fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(field, condition)| {
        let value = lookup_path(document, field);
        match condition {
            Bson::Document(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => {
                ops.iter().all(|(op, operand)| matches_operator(value, op, operand))
            }
            expected => value.map(|v| value_equals(v, expected)).unwrap_or(false),
        }
    })
}

fn matches_operator(value: Option<&Bson>, op: &str, operand: &Bson) -> bool {
    match op {
        "$exists" => {
            let wanted = match operand {
                Bson::Boolean(b) => *b,
                Bson::Int32(n) => *n != 0,
                Bson::Int64(n) => *n != 0,
                _ => true,
            };
            value.is_some() == wanted
        }
        "$in" => match (value, operand) {
            (Some(v), Bson::Array(candidates)) => candidates.iter().any(|c| value_equals(v, c)),
            _ => false,
        },
        "$ne" => value.map(|v| !value_equals(v, operand)).unwrap_or(true),
        "$gt" | "$gte" | "$lt" | "$lte" => match value.and_then(|v| compare_bson(v, operand)) {
            Some(ordering) => match op {
                "$gt" => ordering == Ordering::Greater,
                "$gte" => ordering != Ordering::Less,
                "$lt" => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            },
            None => false,
        },
        _ => false,
    }
}

/// Equality with numeric widening; an array matches when any element matches.
fn value_equals(value: &Bson, expected: &Bson) -> bool {
    if let Some(Ordering::Equal) = compare_bson(value, expected) {
        return true;
    }
    match value {
        Bson::Array(items) if !matches!(expected, Bson::Array(_)) => {
            items.iter().any(|item| value_equals(item, expected))
        }
        _ => value == expected,
    }
}

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn compare_bson(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn sort_documents(documents: &mut [Document], sort: &Document) {
    documents.sort_by(|a, b| {
        for (field, direction) in sort {
            let descending = matches!(direction, Bson::Int32(-1) | Bson::Int64(-1));
            let ordering = match (lookup_path(a, field), lookup_path(b, field)) {
                (Some(x), Some(y)) => compare_bson(x, y).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Hands out one shared [`MemoryStore`], optionally failing the first attempts.
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            failures_remaining: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn failing_first(store: Arc<MemoryStore>, failures: u32) -> Self {
        let connector = Self::new(store);
        connector.failures_remaining.store(failures, AtomicOrdering::SeqCst);
        connector
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(AtomicOrdering::SeqCst)
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, _config: &DatabaseConfig) -> Result<Arc<dyn DocumentStore>> {
        self.attempts.fetch_add(1, AtomicOrdering::SeqCst);

        let remaining = self.failures_remaining.load(AtomicOrdering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, AtomicOrdering::SeqCst);
            return Err(DbKeeperError::Connection("connection refused".to_string()));
        }

        self.store.ping().await?;
        Ok(self.store.clone() as Arc<dyn DocumentStore>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filters_and_sorting() {
        let store = MemoryStore::new("test");
        store
            .insert_many(
                "trips",
                vec![
                    doc! { "name": "Porto", "days": 3, "collaborators": ["u1", "u2"] },
                    doc! { "name": "Kyoto", "days": 10, "collaborators": ["u3"] },
                    doc! { "name": "Oslo", "days": 5 },
                ],
            )
            .await
            .unwrap();

        let long = store
            .find("trips", &doc! { "days": { "$gte": 5 } }, &FindOptions {
                sort: Some(doc! { "days": -1 }),
                ..Default::default()
            })
            .await
            .unwrap();
        let names: Vec<&str> = long.iter().map(|d| d.get_str("name").unwrap()).collect();
        assert_eq!(names, vec!["Kyoto", "Oslo"]);

        assert_eq!(store.count_documents("trips", &doc! { "collaborators": "u2" }).await.unwrap(), 1);
        assert_eq!(
            store.count_documents("trips", &doc! { "collaborators": { "$exists": false } }).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_unique_index_rejects_duplicates_but_keeps_batch() {
        let store = MemoryStore::new("test");
        store
            .create_index(&IndexDefinition::new("users", doc! { "email": 1 }).unique())
            .await
            .unwrap();

        let outcome = store
            .insert_many(
                "users",
                vec![
                    doc! { "email": "a@example.com" },
                    doc! { "email": "a@example.com" },
                    doc! { "email": "b@example.com" },
                ],
            )
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_index_name_is_conflict() {
        let store = MemoryStore::new("test");
        let def = IndexDefinition::new("users", doc! { "email": 1 });
        assert_eq!(store.create_index(&def).await.unwrap(), IndexCreation::Created);
        assert!(store.create_index(&def).await.unwrap_err().is_index_conflict());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new("test");
        store.set_available(false);
        assert!(store.ping().await.is_err());
        assert!(store.list_collections().await.is_err());
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
