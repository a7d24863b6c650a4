//! Chroma vector store backend.
//!
//! Provides [`ChromaBackend`] which implements [`VectorStoreBackend`] against
//! the Chroma v2 HTTP API. A collection maps to a Chroma collection whose
//! metadata records the distance space (`hnsw:space`) and dimension; chunks
//! are upserted as `ids` / `embeddings` / `documents` / `metadatas` columns.
//!
//! This module is only available when the `chroma` feature is enabled.
//!
//! # Example
//!
//! ```rust,ignore
//! use adk_vectorstore::chroma::{ChromaBackend, ChromaConfig};
//!
//! let backend = ChromaBackend::new(ChromaConfig::new("http://localhost:8000"))?;
//! ```

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::backend::{VectorStoreBackend, batch_chunks, require_batch_size, require_vector};
use crate::collection::{CollectionConfig, CollectionStats, CollectionStatus, MetricType};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::document::{ChunkMetadata, ChunkWithScore, DocumentChunk, EmbeddedChunk, QueryResult};
use crate::error::{CollectionErrorKind, Result, StoreError};
use crate::filter::{DocumentMetadataFilter, FilterOperator};
use crate::http::{HttpReply, HttpTransport, encode_segment};
use crate::request::SearchRequest;
use crate::response::DeletionReport;

const BACKEND: &str = "chroma";

/// Connection settings for [`ChromaBackend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromaConfig {
    pub url: String,
    pub tenant: String,
    pub database: String,
    /// Sent as `x-chroma-token` when set.
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
    pub batch_size: usize,
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".into(),
            tenant: "default_tenant".into(),
            database: "default_database".into(),
            auth_token: None,
            timeout_secs: 30,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ChromaConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    /// Read `CHROMA_URL`, `CHROMA_TENANT`, `CHROMA_DATABASE` and
    /// `CHROMA_AUTH_TOKEN`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("CHROMA_URL").unwrap_or(defaults.url),
            tenant: std::env::var("CHROMA_TENANT").unwrap_or(defaults.tenant),
            database: std::env::var("CHROMA_DATABASE").unwrap_or(defaults.database),
            auth_token: std::env::var("CHROMA_AUTH_TOKEN").ok(),
            ..defaults
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>, database: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self.database = database.into();
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

#[derive(Debug, Clone)]
struct ChromaCollection {
    id: String,
    metric: MetricType,
    dimension: Option<usize>,
}

/// A [`VectorStoreBackend`] backed by [Chroma](https://www.trychroma.com/).
///
/// Collection IDs are cached by name after the first lookup and evicted when
/// the collection is deleted or reported missing.
pub struct ChromaBackend {
    http: HttpTransport,
    collections_path: String,
    batch_size: usize,
    ids: DashMap<String, ChromaCollection>,
}

impl ChromaBackend {
    pub fn new(config: ChromaConfig) -> Result<Self> {
        let batch_size = require_batch_size(BACKEND, config.batch_size)?;
        let mut headers = Vec::new();
        if let Some(token) = &config.auth_token {
            headers.push(("x-chroma-token", token.clone()));
        }
        let http = HttpTransport::new(
            BACKEND,
            &config.url,
            &headers,
            Duration::from_secs(config.timeout_secs),
        )?;
        let collections_path = format!(
            "/api/v2/tenants/{}/databases/{}/collections",
            encode_segment(&config.tenant),
            encode_segment(&config.database)
        );
        Ok(Self { http, collections_path, batch_size, ids: DashMap::new() })
    }

    fn is_missing(reply: &HttpReply) -> bool {
        reply.is_not_found() || reply.error_message().contains("does not exist")
    }

    async fn resolve(&self, name: &str) -> Result<ChromaCollection> {
        if let Some(found) = self.ids.get(name) {
            return Ok(found.clone());
        }
        let reply =
            self.http.get(&format!("{}/{}", self.collections_path, encode_segment(name))).await?;
        if Self::is_missing(&reply) {
            return Err(StoreError::collection_not_found(BACKEND, name));
        }
        if !reply.is_success() {
            return Err(StoreError::collection(
                BACKEND,
                CollectionErrorKind::Invalid,
                format!("failed to look up collection '{name}': {}", reply.error_message()),
            ));
        }
        let id = reply.body.get("id").and_then(Value::as_str).ok_or_else(|| {
            StoreError::store(BACKEND, format!("collection '{name}' lookup returned no id"))
        })?;
        let metadata = reply.body.get("metadata");
        let metric = metadata
            .and_then(|m| m.get("hnsw:space"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let dimension = reply
            .body
            .get("dimension")
            .and_then(Value::as_u64)
            .or_else(|| metadata.and_then(|m| m.get("dimension")).and_then(Value::as_u64))
            .map(|d| d as usize);
        let collection = ChromaCollection { id: id.to_string(), metric, dimension };
        self.ids.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    /// Check a reply from a per-collection call and return its body.
    fn check(&self, name: &str, operation: &str, reply: HttpReply) -> Result<Value> {
        if reply.is_success() {
            return Ok(reply.body);
        }
        if Self::is_missing(&reply) {
            self.ids.remove(name);
            return Err(StoreError::collection_not_found(BACKEND, name));
        }
        Err(StoreError::document(
            BACKEND,
            format!("{operation} on '{name}' failed: {}", reply.error_message()),
        ))
    }

    fn space(metric: MetricType) -> &'static str {
        match metric {
            MetricType::Cosine => "cosine",
            MetricType::L2 => "l2",
            MetricType::IP => "ip",
        }
    }

    fn metadata_for(chunk: &EmbeddedChunk) -> Map<String, Value> {
        let mut metadata = chunk.metadata().to_flat_map();
        metadata.insert("chunk_id".into(), json!(chunk.chunk_id()));
        metadata.insert("document_id".into(), json!(chunk.document_id()));
        metadata
    }

    fn where_clause(filter: &DocumentMetadataFilter) -> Value {
        let op = match filter.operator {
            FilterOperator::Eq => "$eq",
            FilterOperator::Ne => "$ne",
            FilterOperator::Gt => "$gt",
            FilterOperator::Gte => "$gte",
            FilterOperator::Lt => "$lt",
            FilterOperator::Lte => "$lte",
            FilterOperator::In => "$in",
            FilterOperator::NotIn => "$nin",
        };
        let mut condition = Map::new();
        condition.insert(op.to_string(), filter.value.clone());
        let mut clause = Map::new();
        clause.insert(filter.field_name.clone(), Value::Object(condition));
        Value::Object(clause)
    }

    async fn matching_ids(&self, name: &str, id: &str, body: Value) -> Result<Vec<String>> {
        let reply =
            self.http.post(&format!("{}/{id}/get", self.collections_path), &body).await?;
        let body = self.check(name, "get", reply)?;
        Ok(string_list(body.get("ids")))
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// First row of a column in a Chroma query response (one row per query).
fn first_row<'a>(body: &'a Value, column: &str) -> &'a [Value] {
    body.get(column)
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

#[async_trait]
impl VectorStoreBackend for ChromaBackend {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn connect(&self) -> Result<()> {
        self.health_check().await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        self.ids.clear();
        Ok(())
    }

    async fn health_check(&self) -> Result<Value> {
        let reply = self.http.get("/api/v2/heartbeat").await?;
        if !reply.is_success() {
            return Err(StoreError::store(
                BACKEND,
                format!("heartbeat failed: {}", reply.error_message()),
            ));
        }
        Ok(reply.body)
    }

    async fn collection_stats(&self, name: &str) -> Result<CollectionStats> {
        let collection = self.resolve(name).await?;
        let reply = self
            .http
            .get(&format!("{}/{}/count", self.collections_path, collection.id))
            .await?;
        let body = self.check(name, "count", reply)?;
        let mut stats = CollectionStats::new(name, body.as_u64().unwrap_or(0));
        stats.dimension = collection.dimension;
        stats.metric_type = Some(collection.metric);
        stats.details.insert("collection_id".into(), json!(collection.id));
        Ok(stats)
    }

    async fn create_collection(&self, config: &CollectionConfig) -> Result<CollectionStatus> {
        match self.resolve(config.name()).await {
            Ok(_) => {
                debug!(
                    collection = config.name(),
                    "chroma collection already exists, skipping creation"
                );
                return Ok(CollectionStatus::Exists);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut metadata = Map::new();
        metadata.insert("hnsw:space".into(), json!(Self::space(config.metric_type())));
        metadata.insert("dimension".into(), json!(config.dimension()));
        metadata.insert("index_type".into(), json!(config.index_type().as_str()));
        if let Some(description) = config.description() {
            metadata.insert("description".into(), json!(description));
        }
        let body = json!({ "name": config.name(), "metadata": metadata, "get_or_create": false });
        let reply = self.http.post(&self.collections_path, &body).await?;

        if reply.status.as_u16() == 409 {
            return Ok(CollectionStatus::Exists);
        }
        if !reply.is_success() {
            return Err(StoreError::collection(
                BACKEND,
                CollectionErrorKind::Invalid,
                format!("failed to create '{}': {}", config.name(), reply.error_message()),
            ));
        }
        if let Some(id) = reply.body.get("id").and_then(Value::as_str) {
            self.ids.insert(
                config.name().to_string(),
                ChromaCollection {
                    id: id.to_string(),
                    metric: config.metric_type(),
                    dimension: Some(config.dimension()),
                },
            );
        }
        debug!(
            collection = config.name(),
            dimension = config.dimension(),
            "created chroma collection"
        );
        Ok(CollectionStatus::Created)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let reply = self
            .http
            .delete(&format!("{}/{}", self.collections_path, encode_segment(name)))
            .await?;
        self.ids.remove(name);
        if Self::is_missing(&reply) {
            return Err(StoreError::collection_not_found(BACKEND, name));
        }
        if !reply.is_success() {
            return Err(StoreError::collection(
                BACKEND,
                CollectionErrorKind::Invalid,
                format!("failed to delete '{name}': {}", reply.error_message()),
            ));
        }
        debug!(collection = name, "deleted chroma collection");
        Ok(())
    }

    async fn add_documents(
        &self,
        collection: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<Vec<String>> {
        let target = self.resolve(collection).await?;
        let path = format!("{}/{}/upsert", self.collections_path, target.id);
        let mut ids = Vec::with_capacity(chunks.len());

        for batch in batch_chunks(chunks, self.batch_size)? {
            let batch_ids: Vec<&str> = batch.iter().map(EmbeddedChunk::chunk_id).collect();
            let body = json!({
                "ids": batch_ids,
                "embeddings": batch.iter().map(EmbeddedChunk::embeddings).collect::<Vec<_>>(),
                "documents": batch.iter().map(EmbeddedChunk::text).collect::<Vec<_>>(),
                "metadatas": batch.iter().map(Self::metadata_for).collect::<Vec<_>>(),
            });
            let reply = self.http.post(&path, &body).await?;
            self.check(collection, "upsert", reply)?;
            ids.extend(batch_ids.into_iter().map(str::to_string));
            debug!(collection, count = batch.len(), "upserted batch to chroma");
        }
        Ok(ids)
    }

    fn insert_batch_limit(&self) -> Option<usize> {
        Some(self.batch_size)
    }

    async fn search(&self, request: &SearchRequest) -> Result<QueryResult> {
        let vector = require_vector(BACKEND, request)?;
        let name = request.collection_name();
        let target = self.resolve(name).await?;

        let mut body = json!({
            "query_embeddings": [vector],
            "n_results": request.top_k(),
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(filter) = request.metadata_filter() {
            body["where"] = Self::where_clause(filter);
        }
        let reply =
            self.http.post(&format!("{}/{}/query", self.collections_path, target.id), &body).await?;
        let body = self.check(name, "query", reply)?;

        let ids = first_row(&body, "ids");
        let documents = first_row(&body, "documents");
        let metadatas = first_row(&body, "metadatas");
        let distances = first_row(&body, "distances");

        let hits = ids
            .iter()
            .enumerate()
            .filter_map(|(i, id)| {
                let chunk_id = id.as_str()?.to_string();
                let text = documents.get(i).and_then(Value::as_str).unwrap_or_default().to_string();
                let mut fields = metadatas
                    .get(i)
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                fields.remove("chunk_id");
                let document_id = fields
                    .remove("document_id")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                let distance = distances.get(i).and_then(Value::as_f64).unwrap_or(0.0) as f32;
                Some(ChunkWithScore {
                    chunk: DocumentChunk {
                        chunk_id,
                        text,
                        embeddings: None,
                        metadata: Some(ChunkMetadata::from_flat_map(fields)),
                        document_id,
                    },
                    score: target.metric.similarity_from_distance(distance),
                })
            })
            .collect();

        Ok(QueryResult::from_scored(hits))
    }

    async fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<DeletionReport> {
        let target = self.resolve(collection).await?;

        let by_chunk = self
            .matching_ids(collection, &target.id, json!({ "ids": ids, "include": [] }))
            .await?;
        let by_document = self
            .matching_ids(
                collection,
                &target.id,
                json!({ "where": { "document_id": { "$in": ids } }, "include": [] }),
            )
            .await?;

        let mut seen = HashSet::new();
        let doomed: Vec<String> =
            by_chunk.into_iter().chain(by_document).filter(|id| seen.insert(id.clone())).collect();
        if doomed.is_empty() {
            debug!(collection, "no chroma records matched, nothing to delete");
            return Ok(DeletionReport::count(0));
        }

        let reply = self
            .http
            .post(
                &format!("{}/{}/delete", self.collections_path, target.id),
                &json!({ "ids": doomed }),
            )
            .await?;
        self.check(collection, "delete", reply)?;
        debug!(collection, count = doomed.len(), "deleted records from chroma");
        Ok(DeletionReport::deleted(doomed))
    }
}
