//! Milvus vector store backend.
//!
//! Talks to the Milvus RESTful API v2 (`/v2/vectordb/...`). Every collection
//! has a fixed schema:
//!
//! | field         | type                 |
//! |---------------|----------------------|
//! | `chunk_id`    | `VarChar` primary key|
//! | `embedding`   | `FloatVector(dim)`   |
//! | `text`        | `VarChar`            |
//! | `document_id` | `VarChar`            |
//! | `metadata`    | `JSON`               |
//!
//! Filters on fields other than `chunk_id`, `document_id` and `text` are
//! evaluated against the JSON `metadata` column.
//!
//! This module is only available when the `milvus` feature is enabled.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::backend::{VectorStoreBackend, batch_chunks, require_batch_size, require_vector};
use crate::collection::{CollectionConfig, CollectionStats, CollectionStatus, IndexType, MetricType};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::document::{ChunkMetadata, ChunkWithScore, DocumentChunk, EmbeddedChunk, QueryResult};
use crate::error::{CollectionErrorKind, Result, StoreError};
use crate::filter::{DocumentMetadataFilter, FilterOperator};
use crate::http::HttpTransport;
use crate::request::SearchRequest;
use crate::response::DeletionReport;

const BACKEND: &str = "milvus";

/// Milvus reports a missing collection with this error code.
const COLLECTION_NOT_FOUND_CODE: i64 = 100;

const MAX_ID_LENGTH: usize = 512;
const MAX_TEXT_LENGTH: usize = 65_535;

/// Upper bound on rows a single `entities/query` call may return.
const QUERY_LIMIT: usize = 16_384;

const OUTPUT_FIELDS: [&str; 4] = ["chunk_id", "text", "document_id", "metadata"];

/// Connection settings for [`MilvusBackend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MilvusConfig {
    pub url: String,
    /// `user:password` or an API key, sent as a bearer token.
    pub token: Option<String>,
    pub database: Option<String>,
    pub timeout_secs: u64,
    pub batch_size: usize,
    /// Rows looked up per round when deleting by ID. Capped at the server's
    /// query limit.
    pub page_size: usize,
}

impl Default for MilvusConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:19530".into(),
            token: None,
            database: None,
            timeout_secs: 30,
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: QUERY_LIMIT,
        }
    }
}

impl MilvusConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    /// Read `MILVUS_URL`, `MILVUS_TOKEN` and `MILVUS_DATABASE`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("MILVUS_URL").unwrap_or(defaults.url),
            token: std::env::var("MILVUS_TOKEN").ok(),
            database: std::env::var("MILVUS_DATABASE").ok(),
            ..defaults
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }
}

/// A [`VectorStoreBackend`] backed by [Milvus](https://milvus.io/).
pub struct MilvusBackend {
    http: HttpTransport,
    database: Option<String>,
    batch_size: usize,
    page_size: usize,
    metrics: DashMap<String, MetricType>,
}

/// Failure reported in a Milvus response envelope.
struct MilvusFailure {
    code: i64,
    message: String,
}

impl MilvusFailure {
    fn is_not_found(&self) -> bool {
        let message = self.message.to_lowercase();
        self.code == COLLECTION_NOT_FOUND_CODE
            || message.contains("collection not found")
            || message.contains("can't find collection")
    }

    fn into_error(self, collection: &str, operation: &str) -> StoreError {
        if self.is_not_found() {
            return StoreError::collection_not_found(BACKEND, collection);
        }
        StoreError::document(
            BACKEND,
            format!("{operation} on '{collection}' failed (code {}): {}", self.code, self.message),
        )
    }
}

impl MilvusBackend {
    pub fn new(config: MilvusConfig) -> Result<Self> {
        let batch_size = require_batch_size(BACKEND, config.batch_size)?;
        if config.page_size == 0 {
            return Err(StoreError::Config("milvus page_size must be greater than zero".into()));
        }
        let mut headers = Vec::new();
        if let Some(token) = &config.token {
            headers.push(("authorization", format!("Bearer {token}")));
        }
        let http = HttpTransport::new(
            BACKEND,
            &config.url,
            &headers,
            Duration::from_secs(config.timeout_secs),
        )?;
        Ok(Self {
            http,
            database: config.database,
            batch_size,
            page_size: config.page_size.min(QUERY_LIMIT),
            metrics: DashMap::new(),
        })
    }

    /// POST to a v2 endpoint and unwrap the `{code, data, message}` envelope.
    async fn call(
        &self,
        endpoint: &str,
        mut body: Value,
    ) -> Result<std::result::Result<Value, MilvusFailure>> {
        if let (Some(db), Some(object)) = (&self.database, body.as_object_mut()) {
            object.insert("dbName".into(), json!(db));
        }
        let reply = self.http.post(&format!("/v2/vectordb/{endpoint}"), &body).await?;
        if !reply.is_success() {
            return Err(StoreError::store(
                BACKEND,
                format!("{endpoint} failed: {}", reply.error_message()),
            ));
        }
        let code = reply.body.get("code").and_then(Value::as_i64).unwrap_or(0);
        if code != 0 {
            let message =
                reply.body.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
            return Ok(Err(MilvusFailure { code, message }));
        }
        Ok(Ok(reply.body.get("data").cloned().unwrap_or(Value::Null)))
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        match self.call("collections/has", json!({ "collectionName": name })).await? {
            Ok(data) => Ok(data.get("has").and_then(Value::as_bool).unwrap_or(false)),
            Err(failure) => Err(StoreError::collection(
                BACKEND,
                CollectionErrorKind::Invalid,
                format!("existence check for '{name}' failed: {}", failure.message),
            )),
        }
    }

    /// Metric and dimension from `collections/describe`.
    async fn describe(&self, name: &str) -> Result<(MetricType, Option<usize>)> {
        let data = self
            .call("collections/describe", json!({ "collectionName": name }))
            .await?
            .map_err(|f| f.into_error(name, "describe"))?;

        let metric = data
            .get("indexes")
            .and_then(Value::as_array)
            .and_then(|indexes| {
                indexes.iter().find_map(|i| i.get("metricType").and_then(Value::as_str))
            })
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let dimension = data
            .get("fields")
            .and_then(Value::as_array)
            .and_then(|fields| {
                fields.iter().find(|f| f.get("name").and_then(Value::as_str) == Some("embedding"))
            })
            .and_then(|field| field.get("params"))
            .and_then(Value::as_array)
            .and_then(|params| {
                params.iter().find(|p| p.get("key").and_then(Value::as_str) == Some("dim"))
            })
            .and_then(|p| p.get("value"))
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_u64()))
            .map(|d| d as usize);

        self.metrics.insert(name.to_string(), metric);
        Ok((metric, dimension))
    }

    async fn metric_for(&self, name: &str) -> Result<MetricType> {
        if let Some(metric) = self.metrics.get(name) {
            return Ok(*metric);
        }
        Ok(self.describe(name).await?.0)
    }

    fn index_params(config: &CollectionConfig) -> Value {
        let params = match config.index_params() {
            Some(params) => Value::Object(params.clone()),
            None => match config.index_type() {
                IndexType::Hnsw => json!({ "M": 16, "efConstruction": 200 }),
                IndexType::IvfFlat => json!({ "nlist": 128 }),
                IndexType::IvfPq => json!({ "nlist": 128, "m": 8 }),
                IndexType::Flat | IndexType::Auto => json!({}),
            },
        };
        json!([{
            "fieldName": "embedding",
            "indexName": "embedding_index",
            "metricType": config.metric_type().as_str(),
            "indexType": config.index_type().as_str(),
            "params": params,
        }])
    }

    fn schema(dimension: usize) -> Value {
        json!({
            "autoId": false,
            "enableDynamicField": false,
            "fields": [
                {
                    "fieldName": "chunk_id",
                    "dataType": "VarChar",
                    "isPrimary": true,
                    "elementTypeParams": { "max_length": MAX_ID_LENGTH }
                },
                {
                    "fieldName": "embedding",
                    "dataType": "FloatVector",
                    "elementTypeParams": { "dim": dimension }
                },
                {
                    "fieldName": "text",
                    "dataType": "VarChar",
                    "elementTypeParams": { "max_length": MAX_TEXT_LENGTH }
                },
                {
                    "fieldName": "document_id",
                    "dataType": "VarChar",
                    "elementTypeParams": { "max_length": MAX_ID_LENGTH }
                },
                { "fieldName": "metadata", "dataType": "JSON" }
            ]
        })
    }

    fn field_expr(field: &str) -> String {
        match field {
            "chunk_id" | "document_id" | "text" => field.to_string(),
            other => format!("metadata[{}]", json!(other)),
        }
    }

    /// Translate a filter into a Milvus boolean expression.
    pub(crate) fn filter_expr(filter: &DocumentMetadataFilter) -> String {
        let field = Self::field_expr(&filter.field_name);
        let value = &filter.value;
        match filter.operator {
            FilterOperator::Eq => format!("{field} == {value}"),
            FilterOperator::Ne => format!("{field} != {value}"),
            FilterOperator::Gt => format!("{field} > {value}"),
            FilterOperator::Gte => format!("{field} >= {value}"),
            FilterOperator::Lt => format!("{field} < {value}"),
            FilterOperator::Lte => format!("{field} <= {value}"),
            FilterOperator::In => format!("{field} in {value}"),
            FilterOperator::NotIn => format!("{field} not in {value}"),
        }
    }

    /// Up to one page of primary keys matching `filter`.
    ///
    /// Reads at strong consistency so rows deleted in an earlier round are
    /// already gone.
    async fn matching_keys(&self, collection: &str, filter: &str) -> Result<Vec<String>> {
        let rows = self
            .call(
                "entities/query",
                json!({
                    "collectionName": collection,
                    "filter": filter,
                    "outputFields": ["chunk_id"],
                    "limit": self.page_size,
                    "consistencyLevel": "Strong",
                }),
            )
            .await?
            .map_err(|f| f.into_error(collection, "query"))?;
        Ok(rows
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| r.get("chunk_id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn keys_expr(keys: &[String]) -> String {
        format!("chunk_id in {}", json!(keys))
    }

    fn ids_expr(ids: &[String]) -> String {
        let list = json!(ids);
        format!("chunk_id in {list} or document_id in {list}")
    }

    fn score(metric: MetricType, distance: f32) -> f32 {
        match metric {
            // Milvus already reports similarities for these.
            MetricType::Cosine | MetricType::IP => distance,
            MetricType::L2 => metric.similarity_from_distance(distance),
        }
    }

    fn row_to_chunk(row: &Value, metric: MetricType) -> Option<ChunkWithScore> {
        let entity = row.get("entity").unwrap_or(row);
        let chunk_id = entity.get("chunk_id").and_then(Value::as_str)?.to_string();
        let text = entity.get("text").and_then(Value::as_str).unwrap_or_default().to_string();
        let document_id =
            entity.get("document_id").and_then(Value::as_str).unwrap_or_default().to_string();
        let metadata = match entity.get("metadata") {
            Some(Value::Object(map)) => map.clone(),
            // Older servers return JSON columns as strings.
            Some(Value::String(raw)) => serde_json::from_str::<Map<String, Value>>(raw)
                .unwrap_or_default(),
            _ => Map::new(),
        };
        let distance = row.get("distance").and_then(Value::as_f64).unwrap_or(0.0) as f32;
        Some(ChunkWithScore {
            chunk: DocumentChunk {
                chunk_id,
                text,
                embeddings: None,
                metadata: Some(ChunkMetadata::from_flat_map(metadata)),
                document_id,
            },
            score: Self::score(metric, distance),
        })
    }
}

#[async_trait]
impl VectorStoreBackend for MilvusBackend {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn connect(&self) -> Result<()> {
        self.health_check().await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        self.metrics.clear();
        Ok(())
    }

    async fn health_check(&self) -> Result<Value> {
        let data = self.call("collections/list", json!({})).await?.map_err(|f| {
            StoreError::store(
                BACKEND,
                format!("health probe failed (code {}): {}", f.code, f.message),
            )
        })?;
        Ok(json!({ "collections": data }))
    }

    async fn collection_stats(&self, name: &str) -> Result<CollectionStats> {
        let data = self
            .call("collections/get_stats", json!({ "collectionName": name }))
            .await?
            .map_err(|f| f.into_error(name, "get_stats"))?;
        let count = data
            .get("rowCount")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(0);
        let (metric, dimension) = self.describe(name).await?;
        let mut stats = CollectionStats::new(name, count);
        stats.metric_type = Some(metric);
        stats.dimension = dimension;
        Ok(stats)
    }

    async fn create_collection(&self, config: &CollectionConfig) -> Result<CollectionStatus> {
        let name = config.name();
        if self.has_collection(name).await? {
            self.metrics.remove(name);
            debug!(collection = name, "milvus collection already exists, skipping creation");
            return Ok(CollectionStatus::Exists);
        }

        let mut body = json!({
            "collectionName": name,
            "schema": Self::schema(config.dimension()),
            "indexParams": Self::index_params(config),
        });
        if let Some(description) = config.description() {
            body["description"] = json!(description);
        }
        self.call("collections/create", body).await?.map_err(|f| {
            StoreError::collection(
                BACKEND,
                CollectionErrorKind::Invalid,
                format!("failed to create '{name}' (code {}): {}", f.code, f.message),
            )
        })?;
        self.metrics.insert(name.to_string(), config.metric_type());
        debug!(collection = name, dimension = config.dimension(), "created milvus collection");
        Ok(CollectionStatus::Created)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.metrics.remove(name);
        if !self.has_collection(name).await? {
            return Err(StoreError::collection_not_found(BACKEND, name));
        }
        self.call("collections/drop", json!({ "collectionName": name }))
            .await?
            .map_err(|f| f.into_error(name, "drop"))?;
        debug!(collection = name, "dropped milvus collection");
        Ok(())
    }

    async fn add_documents(
        &self,
        collection: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(chunks.len());
        for batch in batch_chunks(chunks, self.batch_size)? {
            let rows: Vec<Value> = batch
                .iter()
                .map(|chunk| {
                    json!({
                        "chunk_id": chunk.chunk_id(),
                        "embedding": chunk.embeddings(),
                        "text": chunk.text(),
                        "document_id": chunk.document_id(),
                        "metadata": chunk.metadata().to_flat_map(),
                    })
                })
                .collect();
            self.call("entities/upsert", json!({ "collectionName": collection, "data": rows }))
                .await?
                .map_err(|f| f.into_error(collection, "upsert"))?;
            ids.extend(batch.iter().map(|c| c.chunk_id().to_string()));
            debug!(collection, count = batch.len(), "upserted batch to milvus");
        }
        Ok(ids)
    }

    fn insert_batch_limit(&self) -> Option<usize> {
        Some(self.batch_size)
    }

    async fn search(&self, request: &SearchRequest) -> Result<QueryResult> {
        let vector = require_vector(BACKEND, request)?;
        let name = request.collection_name();
        let metric = self.metric_for(name).await?;

        let mut body = json!({
            "collectionName": name,
            "data": [vector],
            "annsField": "embedding",
            "limit": request.top_k(),
            "outputFields": OUTPUT_FIELDS,
            "searchParams": {
                "metricType": metric.as_str(),
                "params": { "ef": request.top_k().max(64) }
            },
        });
        if let Some(filter) = request.metadata_filter() {
            body["filter"] = json!(Self::filter_expr(filter));
        }

        let data = self
            .call("entities/search", body)
            .await?
            .map_err(|f| f.into_error(name, "search"))?;
        let hits = data
            .as_array()
            .map(|rows| rows.iter().filter_map(|row| Self::row_to_chunk(row, metric)).collect())
            .unwrap_or_default();
        Ok(QueryResult::from_scored(hits))
    }

    async fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<DeletionReport> {
        let filter = Self::ids_expr(ids);
        let mut seen = HashSet::new();
        let mut report = DeletionReport::default();

        // Delete by primary key one page at a time so the count covers every
        // removed row, not just the first page.
        loop {
            let page = match self.matching_keys(collection, &filter).await {
                Ok(page) => page,
                Err(e) if report.deleted_count > 0 => {
                    report.error = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            };
            let full = page.len() >= self.page_size;
            let fresh: Vec<String> =
                page.into_iter().filter(|id| seen.insert(id.clone())).collect();
            if !fresh.is_empty() {
                let body =
                    json!({ "collectionName": collection, "filter": Self::keys_expr(&fresh) });
                let outcome = match self.call("entities/delete", body).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(failure)) => Err(failure.into_error(collection, "delete")),
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    report.error = Some(e.to_string());
                    break;
                }
                report.deleted_count += fresh.len() as u64;
                report.deleted_ids.extend(fresh.iter().cloned());
            }
            if !full {
                break;
            }
            if fresh.is_empty() {
                report.error = Some(format!(
                    "'{collection}' still returns {} rows that were already deleted",
                    self.page_size
                ));
                break;
            }
        }

        if let Some(error) = &report.error {
            warn!(
                collection,
                deleted = report.deleted_count,
                error = %error,
                "milvus delete stopped part-way"
            );
        } else {
            debug!(collection, count = report.deleted_count, "deleted entities from milvus");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_filters_use_json_path() {
        let filter = DocumentMetadataFilter::new("page_number", FilterOperator::Gte, json!(3))
            .unwrap();
        assert_eq!(MilvusBackend::filter_expr(&filter), r#"metadata["page_number"] >= 3"#);

        let filter = DocumentMetadataFilter::new(
            "document_id",
            FilterOperator::In,
            json!(["a", "b"]),
        )
        .unwrap();
        assert_eq!(MilvusBackend::filter_expr(&filter), r#"document_id in ["a","b"]"#);
    }

    #[test]
    fn id_expression_matches_chunks_and_documents() {
        let expr = MilvusBackend::ids_expr(&["c1".to_string()]);
        assert_eq!(expr, r#"chunk_id in ["c1"] or document_id in ["c1"]"#);
    }
}
