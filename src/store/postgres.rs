/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * DbKeeper - Database lifecycle orchestration for document stores
 * Built with Rust for superior performance and reliability
 *
 * @file store/postgres.rs
 * @brief PostgreSQL JSONB document store
 *
 * Every collection is a table `(id BIGSERIAL PRIMARY KEY, data JSONB, created_at)`.
 */

use super::{
    apply_projection, document_to_json, json_to_document, validate_collection_name,
    CollectionStats, DocumentStore, ExplainPlan, FindOptions, IndexCreation, IndexDefinition,
    IndexInfo, IndexUsage, InsertManyOutcome, ServerStats, StoreConnector, FULL_SCAN,
};
use crate::config::DatabaseConfig;
use crate::error::{DbKeeperError, Result};
use async_trait::async_trait;
use bson::{oid::ObjectId, Bson, Document};
use chrono::{TimeZone, Utc};
use deadpool_postgres::{Config, Object, Pool, PoolConfig, Runtime};
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tokio::time::timeout;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tracing::{debug, info};

type SqlParam = Box<dyn ToSql + Sync + Send>;

pub struct PostgresStore {
    pool: Pool,
    database: String,
}

impl PostgresStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut pg_config = Config::new();
        pg_config.url = Some(config.uri.clone());
        pg_config.pool = Some(PoolConfig::new(config.max_connections as usize));

        let pool = pg_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DbKeeperError::Connection(format!("Failed to create connection pool: {}", e)))?;

        let client = timeout(config.connect_timeout(), pool.get())
            .await
            .map_err(|_| DbKeeperError::Timeout(format!("connect after {:?}", config.connect_timeout())))?
            .map_err(|e| DbKeeperError::Connection(format!("Failed to get database connection: {}", e)))?;

        let row = client
            .query_one("SELECT current_database()", &[])
            .await
            .map_err(|e| DbKeeperError::Connection(format!("Failed to execute test query: {}", e)))?;
        let database: String = row.get(0);

        info!("Connection pool initialized for '{}' with {} max connections", database, config.max_connections);
        Ok(Self { pool, database })
    }

    async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| DbKeeperError::Connection(format!("Failed to get database connection: {}", e)))
    }

    async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<tokio_postgres::Row>> {
        debug!("SQL: {}", sql);
        let client = self.client().await?;
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        client.query(sql, &refs).await.map_err(db_error)
    }

    async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64> {
        debug!("SQL: {}", sql);
        let client = self.client().await?;
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        client.execute(sql, &refs).await.map_err(db_error)
    }

    fn select_sql(&self, collection: &str, filter: &Document, options: &FindOptions) -> Result<(String, Vec<SqlParam>)> {
        validate_collection_name(collection)?;
        let where_clause = SqlFilter::build(filter)?;
        let mut sql = format!("SELECT data FROM {}{}", quote_ident(collection), where_clause.sql());

        if let Some(sort) = &options.sort {
            let mut order = Vec::new();
            for (field, direction) in sort {
                let dir = if matches!(direction, Bson::Int32(-1) | Bson::Int64(-1)) { "DESC" } else { "ASC" };
                order.push(format!("{} {}", json_path(field, false)?, dir));
            }
            if !order.is_empty() {
                sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
            }
        }
        if let Some(limit) = options.limit.filter(|l| *l > 0) {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        Ok((sql, where_clause.params))
    }
}

fn db_error(e: tokio_postgres::Error) -> DbKeeperError {
    if e.is_closed() {
        return DbKeeperError::Connection(format!("connection closed: {}", e));
    }
    match e.as_db_error() {
        Some(db) => DbKeeperError::Database(format!("{} ({})", db.message(), db.code().code())),
        None => DbKeeperError::Database(e.to_string()),
    }
}

fn is_sql_state(error: &DbKeeperError, state: &SqlState) -> bool {
    matches!(error, DbKeeperError::Database(message) if message.ends_with(&format!("({})", state.code())))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `data #>> '{a,b}'` (text) or `data #> '{a,b}'` (jsonb) for a dotted field path.
fn json_path(field: &str, as_text: bool) -> Result<String> {
    if field.is_empty()
        || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(DbKeeperError::Validation(format!("Invalid field path '{}'", field)));
    }
    let op = if as_text { "#>>" } else { "#>" };
    Ok(format!("(data {} '{{{}}}')", op, field.replace('.', ",")))
}

fn scalar_text(value: &Bson) -> Option<String> {
    match value {
        Bson::String(s) => Some(s.clone()),
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        Bson::Double(n) => Some(n.to_string()),
        Bson::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Translates an equality/operator filter into a WHERE clause.
struct SqlFilter {
    clauses: Vec<String>,
    params: Vec<SqlParam>,
}

impl SqlFilter {
    fn build(filter: &Document) -> Result<Self> {
        let mut sql_filter = Self { clauses: Vec::new(), params: Vec::new() };
        for (field, condition) in filter {
            match condition {
                Bson::Document(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
                    for (op, operand) in ops {
                        sql_filter.push_operator(field, op, operand)?;
                    }
                }
                value => sql_filter.push_equality(field, value)?,
            }
        }
        Ok(sql_filter)
    }

    fn next_param(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    fn push_equality(&mut self, field: &str, value: &Bson) -> Result<()> {
        match scalar_text(value) {
            Some(text) => {
                let text_ref = self.next_param(Box::new(text));
                let array_ref = self.next_param(Box::new(Value::Array(vec![value.clone().into_relaxed_extjson()])));
                self.clauses.push(format!(
                    "({} = {} OR {} @> {})",
                    json_path(field, true)?,
                    text_ref,
                    json_path(field, false)?,
                    array_ref
                ));
            }
            None => {
                let mut containment = Document::new();
                insert_path(&mut containment, field, value.clone());
                let param = self.next_param(Box::new(document_to_json(containment)));
                self.clauses.push(format!("data @> {}", param));
            }
        }
        Ok(())
    }

    fn push_operator(&mut self, field: &str, op: &str, operand: &Bson) -> Result<()> {
        let clause = match op {
            "$exists" => {
                let wanted = !matches!(operand, Bson::Boolean(false) | Bson::Int32(0) | Bson::Int64(0));
                format!("{} IS {}NULL", json_path(field, false)?, if wanted { "NOT " } else { "" })
            }
            "$in" => {
                let values = match operand {
                    Bson::Array(items) => items.iter().filter_map(scalar_text).map(Value::String).collect(),
                    _ => return Err(DbKeeperError::Validation("$in expects an array".to_string())),
                };
                let param = self.next_param(Box::new(Value::Array(values)));
                format!("{} IN (SELECT jsonb_array_elements_text({}))", json_path(field, true)?, param)
            }
            "$ne" => {
                let text = scalar_text(operand)
                    .ok_or_else(|| DbKeeperError::Validation("$ne expects a scalar".to_string()))?;
                let param = self.next_param(Box::new(text));
                format!("{} IS DISTINCT FROM {}", json_path(field, true)?, param)
            }
            "$gt" | "$gte" | "$lt" | "$lte" => {
                let sql_op = match op {
                    "$gt" => ">",
                    "$gte" => ">=",
                    "$lt" => "<",
                    _ => "<=",
                };
                let param = self.next_param(Box::new(operand.clone().into_relaxed_extjson()));
                format!("{} {} {}", json_path(field, false)?, sql_op, param)
            }
            other => {
                return Err(DbKeeperError::Validation(format!("Unsupported query operator '{}'", other)))
            }
        };
        self.clauses.push(clause);
        Ok(())
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn insert_path(target: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        Some((head, rest)) => {
            let mut inner = match target.remove(head) {
                Some(Bson::Document(existing)) => existing,
                _ => Document::new(),
            };
            insert_path(&mut inner, rest, value);
            target.insert(head, inner);
        }
        None => {
            target.insert(path, value);
        }
    }
}

fn index_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"#>>? '\{([^}]*)\}'(?:::text\[\])?\)+\s*(DESC)?").unwrap_or_else(|_| unreachable!())
    })
}

/// Recover the key document from `pg_get_indexdef` output.
fn parse_index_keys(indexdef: &str) -> Document {
    let mut keys = Document::new();
    let is_text = indexdef.contains("to_tsvector");
    for capture in index_key_regex().captures_iter(indexdef) {
        let field = capture[1].replace(',', ".");
        let direction: Bson = if is_text {
            Bson::String("text".to_string())
        } else if capture.get(2).is_some() {
            Bson::Int32(-1)
        } else {
            Bson::Int32(1)
        };
        keys.insert(field, direction);
    }
    if keys.is_empty() {
        keys.insert("_id", 1);
    }
    keys
}

/// Index ids the collection owns itself: the surrogate key and the `_id` index.
fn is_primary_index(collection: &str, name: &str) -> bool {
    name == format!("{}_pkey", collection) || name == format!("{}__id_", collection)
}

fn walk_plan(node: &Value, index: &mut Option<String>, examined: &mut u64) {
    let node_type = node.get("Node Type").and_then(Value::as_str).unwrap_or_default();
    if index.is_none() {
        if let Some(name) = node.get("Index Name").and_then(Value::as_str) {
            *index = Some(name.to_string());
        }
    }
    if node_type.ends_with("Scan") && !node_type.starts_with("Bitmap Index") {
        let loops = node.get("Actual Loops").and_then(Value::as_u64).unwrap_or(1).max(1);
        let rows = node.get("Actual Rows").and_then(Value::as_u64).unwrap_or(0);
        let removed = node.get("Rows Removed by Filter").and_then(Value::as_u64).unwrap_or(0);
        *examined += (rows + removed) * loops;
    }
    if let Some(children) = node.get("Plans").and_then(Value::as_array) {
        for child in children {
            walk_plan(child, index, examined);
        }
    }
}

fn document_from_row(row: &tokio_postgres::Row) -> Result<Document> {
    let value: Value = row.try_get(0).map_err(db_error)?;
    json_to_document(value)
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn ping(&self) -> Result<()> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }

    async fn server_stats(&self) -> Result<ServerStats> {
        let rows = self
            .query(
                "SELECT current_setting('server_version'), pg_database_size(current_database()), \
                 (SELECT COALESCE(SUM(n_live_tup), 0)::bigint FROM pg_stat_user_tables)",
                &[],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| DbKeeperError::Database("empty stats result".to_string()))?;
        let collections = self.list_collections().await?;

        Ok(ServerStats {
            database: self.database.clone(),
            server_version: row.get(0),
            data_size_bytes: row.get::<_, i64>(1).max(0) as u64,
            objects: row.get::<_, i64>(2).max(0) as u64,
            collections: collections.len() as u64,
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let rows = self
            .query(
                "SELECT table_name::text FROM information_schema.columns \
                 WHERE table_schema = 'public' AND column_name = 'data' AND data_type = 'jsonb' \
                 ORDER BY table_name",
                &[],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        validate_collection_name(collection)?;
        let rows = self
            .query(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_name = $1)",
                &[Box::new(collection.to_string())],
            )
            .await?;
        Ok(rows.first().map(|row| row.get::<_, bool>(0)).unwrap_or(false))
    }

    async fn create_collection(&self, collection: &str) -> Result<()> {
        validate_collection_name(collection)?;
        let table = quote_ident(collection);
        self.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    data JSONB NOT NULL,
                    created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
                )",
                table
            ),
            &[],
        )
        .await?;
        self.execute(
            &format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ((data #>> '{{_id}}'))",
                quote_ident(&format!("{}__id_", collection)),
                table
            ),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        validate_collection_name(collection)?;
        self.execute(&format!("DROP TABLE IF EXISTS {} CASCADE", quote_ident(collection)), &[])
            .await
            .map(|_| ())
    }

    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats> {
        validate_collection_name(collection)?;
        let rows = self
            .query(
                &format!(
                    "SELECT COUNT(*), pg_total_relation_size($1::text::regclass) FROM {}",
                    quote_ident(collection)
                ),
                &[Box::new(format!("public.{}", quote_ident(collection)))],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| DbKeeperError::NotFound(format!("collection '{}'", collection)))?;
        Ok(CollectionStats {
            name: collection.to_string(),
            count: row.get::<_, i64>(0).max(0) as u64,
            size: row.get::<_, i64>(1).max(0) as u64,
        })
    }

    async fn find(&self, collection: &str, filter: &Document, options: &FindOptions) -> Result<Vec<Document>> {
        let (sql, params) = self.select_sql(collection, filter, options)?;
        let rows = match self.query(&sql, &params).await {
            Ok(rows) => rows,
            Err(e) if is_sql_state(&e, &SqlState::UNDEFINED_TABLE) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        rows.iter()
            .map(|row| document_from_row(row).map(|d| apply_projection(d, options.projection.as_ref())))
            .collect()
    }

    async fn count_documents(&self, collection: &str, filter: &Document) -> Result<u64> {
        validate_collection_name(collection)?;
        let where_clause = SqlFilter::build(filter)?;
        let sql = format!("SELECT COUNT(*) FROM {}{}", quote_ident(collection), where_clause.sql());
        match self.query(&sql, &where_clause.params).await {
            Ok(rows) => Ok(rows.first().map(|row| row.get::<_, i64>(0).max(0) as u64).unwrap_or(0)),
            Err(e) if is_sql_state(&e, &SqlState::UNDEFINED_TABLE) => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<()> {
        let outcome = self.insert_many(collection, vec![document]).await?;
        match outcome.errors.into_iter().next() {
            Some(error) => Err(DbKeeperError::Database(error)),
            None => Ok(()),
        }
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<InsertManyOutcome> {
        self.create_collection(collection).await?;
        let sql = format!("INSERT INTO {} (data) VALUES ($1)", quote_ident(collection));

        let mut outcome = InsertManyOutcome::default();
        for mut document in documents {
            if !document.contains_key("_id") {
                document.insert("_id", ObjectId::new());
            }
            match self.execute(&sql, &[Box::new(document_to_json(document))]).await {
                Ok(_) => outcome.inserted += 1,
                Err(e @ DbKeeperError::Connection(_)) => return Err(e),
                Err(e) => outcome.errors.push(e.to_string()),
            }
        }
        Ok(outcome)
    }

    async fn update_many(&self, collection: &str, filter: &Document, update: &Document) -> Result<u64> {
        validate_collection_name(collection)?;
        let mut where_clause = SqlFilter::build(filter)?;
        let update_ref = where_clause.next_param(Box::new(document_to_json(update.clone())));
        let sql = format!(
            "UPDATE {} SET data = data || {}{}",
            quote_ident(collection),
            update_ref,
            where_clause.sql()
        );
        match self.execute(&sql, &where_clause.params).await {
            Err(e) if is_sql_state(&e, &SqlState::UNDEFINED_TABLE) => Ok(0),
            other => other,
        }
    }

    async fn delete_many(&self, collection: &str, filter: &Document) -> Result<u64> {
        validate_collection_name(collection)?;
        let where_clause = SqlFilter::build(filter)?;
        let sql = format!("DELETE FROM {}{}", quote_ident(collection), where_clause.sql());
        match self.execute(&sql, &where_clause.params).await {
            Err(e) if is_sql_state(&e, &SqlState::UNDEFINED_TABLE) => Ok(0),
            other => other,
        }
    }

    async fn drop_database(&self) -> Result<()> {
        for collection in self.list_collections().await? {
            self.drop_collection(&collection).await?;
        }
        Ok(())
    }

    async fn create_index(&self, definition: &IndexDefinition) -> Result<IndexCreation> {
        definition.validate()?;
        self.create_collection(&definition.collection).await?;

        let name = definition.index_name();
        if name.len() > 63 {
            return Err(DbKeeperError::Index(format!("Index name '{}' exceeds 63 characters", name)));
        }

        let is_text = definition
            .fields
            .iter()
            .any(|(_, direction)| matches!(direction, Bson::String(kind) if kind == "text"));

        let mut columns = Vec::new();
        for (field, direction) in &definition.fields {
            let dir = if matches!(direction, Bson::Int32(-1) | Bson::Int64(-1)) { " DESC" } else { "" };
            columns.push(format!("{}{}", json_path(field, true)?, if is_text { "" } else { dir }));
        }

        let (method, key_sql) = if is_text {
            let concatenated = columns
                .iter()
                .map(|c| format!("coalesce({}, '')", c))
                .collect::<Vec<_>>()
                .join(" || ' ' || ");
            (" USING GIN", format!("(to_tsvector('simple', {}))", concatenated))
        } else {
            ("", columns.join(", "))
        };

        let predicate = if definition.is_sparse() {
            let conditions: Vec<String> = definition
                .fields
                .keys()
                .map(|field| json_path(field, false).map(|p| format!("{} IS NOT NULL", p)))
                .collect::<Result<_>>()?;
            format!(" WHERE {}", conditions.join(" AND "))
        } else {
            String::new()
        };

        let sql = format!(
            "CREATE {}INDEX {} ON {}{} ({}){}",
            if definition.is_unique() { "UNIQUE " } else { "" },
            quote_ident(&name),
            quote_ident(&definition.collection),
            method,
            key_sql,
            predicate
        );

        match self.execute(&sql, &[]).await {
            Ok(_) => Ok(IndexCreation::Created),
            Err(e) if is_sql_state(&e, &SqlState::DUPLICATE_TABLE) => Err(DbKeeperError::IndexConflict(name)),
            Err(e) => Err(e),
        }
    }

    async fn drop_index(&self, collection: &str, name: &str) -> Result<()> {
        validate_collection_name(collection)?;
        if is_primary_index(collection, name) {
            return Err(DbKeeperError::Index("cannot drop the primary index".to_string()));
        }
        self.execute(&format!("DROP INDEX IF EXISTS {}", quote_ident(name)), &[])
            .await
            .map(|_| ())
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>> {
        if !self.collection_exists(collection).await? {
            return Err(DbKeeperError::NotFound(format!("collection '{}'", collection)));
        }
        let rows = self
            .query(
                "SELECT i.relname::text, ix.indisunique, ix.indisprimary, \
                        pg_get_indexdef(ix.indexrelid), ix.indpred IS NOT NULL \
                 FROM pg_index ix \
                 JOIN pg_class i ON i.oid = ix.indexrelid \
                 JOIN pg_class t ON t.oid = ix.indrelid \
                 JOIN pg_namespace n ON n.oid = t.relnamespace \
                 WHERE t.relname = $1 AND n.nspname = 'public' \
                 ORDER BY i.relname",
                &[Box::new(collection.to_string())],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let indexdef: String = row.get(3);
                IndexInfo {
                    primary: row.get::<_, bool>(2) || is_primary_index(collection, &name),
                    keys: parse_index_keys(&indexdef),
                    unique: row.get(1),
                    sparse: row.get(4),
                    name,
                }
            })
            .collect())
    }

    async fn index_usage(&self, collection: &str) -> Result<Vec<IndexUsage>> {
        validate_collection_name(collection)?;
        let rows = self
            .query(
                "SELECT indexrelname::text, idx_scan, \
                        extract(epoch FROM pg_postmaster_start_time())::float8 \
                 FROM pg_stat_user_indexes WHERE relname = $1 ORDER BY indexrelname",
                &[Box::new(collection.to_string())],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let since: Option<f64> = row.get(2);
                IndexUsage {
                    collection: collection.to_string(),
                    name: row.get(0),
                    accesses: row.get::<_, Option<i64>>(1).unwrap_or(0).max(0) as u64,
                    since: since.and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
                }
            })
            .collect())
    }

    async fn explain(&self, collection: &str, filter: &Document, options: &FindOptions) -> Result<ExplainPlan> {
        if !self.collection_exists(collection).await? {
            return Err(DbKeeperError::NotFound(format!("collection '{}'", collection)));
        }
        let (sql, params) = self.select_sql(collection, filter, options)?;
        let rows = self
            .query(&format!("EXPLAIN (ANALYZE, FORMAT JSON) {}", sql), &params)
            .await?;
        let raw: Value = rows
            .first()
            .map(|row| row.try_get(0))
            .transpose()
            .map_err(db_error)?
            .unwrap_or(Value::Null);

        let root = raw.get(0).cloned().unwrap_or(Value::Null);
        let plan = root.get("Plan").cloned().unwrap_or(Value::Null);

        let mut index = None;
        let mut examined = 0;
        walk_plan(&plan, &mut index, &mut examined);

        Ok(ExplainPlan {
            index_used: index.unwrap_or_else(|| FULL_SCAN.to_string()),
            documents_examined: examined,
            documents_returned: plan.get("Actual Rows").and_then(Value::as_u64).unwrap_or(0),
            execution_time_ms: root.get("Execution Time").and_then(Value::as_f64).unwrap_or(0.0),
            raw,
        })
    }
}

/// Opens a [`PostgresStore`] per attempt.
#[derive(Debug, Default)]
pub struct PostgresConnector;

#[async_trait]
impl StoreConnector for PostgresConnector {
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn DocumentStore>> {
        let store = PostgresStore::connect(config).await?;
        Ok(Arc::new(store))
    }
}
