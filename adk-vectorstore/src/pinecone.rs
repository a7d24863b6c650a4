//! Pinecone vector store backend.
//!
//! A collection is a serverless Pinecone index. Index management goes
//! through the control plane (`api.pinecone.io`); reads and writes go to the
//! per-index data-plane host, which is looked up once and cached.
//!
//! Pinecone stores only vectors and flat metadata, so the chunk text,
//! `chunk_id` and `document_id` travel inside each vector's metadata.
//! Index names must be lower-case alphanumerics and hyphens; collection
//! names are lower-cased and `_` is replaced with `-`.
//!
//! This module is only available when the `pinecone` feature is enabled.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::backend::{VectorStoreBackend, batch_chunks, require_batch_size, require_vector};
use crate::collection::{CollectionConfig, CollectionStats, CollectionStatus, MetricType};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::document::{ChunkMetadata, ChunkWithScore, DocumentChunk, EmbeddedChunk, QueryResult};
use crate::error::{CollectionErrorKind, Result, StoreError};
use crate::filter::{DocumentMetadataFilter, FilterOperator};
use crate::http::{HttpReply, HttpTransport, encode_segment};
use crate::request::SearchRequest;
use crate::response::DeletionReport;

const BACKEND: &str = "pinecone";

/// Pinecone caps `topK` at this value.
const MAX_TOP_K: usize = 10_000;

/// Pinecone accepts at most this many IDs per delete call.
const DELETE_BATCH: usize = 1_000;

/// Connection settings for [`PineconeBackend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PineconeConfig {
    pub api_key: String,
    pub cloud: String,
    pub region: String,
    /// Namespace used for every data-plane call. Empty means the default.
    pub namespace: String,
    pub controller_url: String,
    pub api_version: String,
    pub timeout_secs: u64,
    /// How long `create_collection` waits for a new index to become ready.
    pub ready_timeout_secs: u64,
    pub batch_size: usize,
    /// Matches requested per round when deleting by document ID. Capped at
    /// Pinecone's `topK` limit.
    pub page_size: usize,
}

impl Default for PineconeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            cloud: "aws".into(),
            region: "us-east-1".into(),
            namespace: String::new(),
            controller_url: "https://api.pinecone.io".into(),
            api_version: "2024-10".into(),
            timeout_secs: 30,
            ready_timeout_secs: 60,
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: MAX_TOP_K,
        }
    }
}

impl PineconeConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), ..Self::default() }
    }

    /// Read `PINECONE_API_KEY` (required) plus the optional
    /// `PINECONE_CLOUD`, `PINECONE_REGION`, `PINECONE_NAMESPACE` and
    /// `PINECONE_CONTROLLER_URL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("PINECONE_API_KEY")
            .map_err(|_| StoreError::Config("PINECONE_API_KEY is not set".into()))?;
        let defaults = Self::default();
        Ok(Self {
            api_key,
            cloud: std::env::var("PINECONE_CLOUD").unwrap_or(defaults.cloud),
            region: std::env::var("PINECONE_REGION").unwrap_or(defaults.region),
            namespace: std::env::var("PINECONE_NAMESPACE").unwrap_or(defaults.namespace),
            controller_url: std::env::var("PINECONE_CONTROLLER_URL")
                .unwrap_or(defaults.controller_url),
            ..defaults
        })
    }

    pub fn with_serverless(mut self, cloud: impl Into<String>, region: impl Into<String>) -> Self {
        self.cloud = cloud.into();
        self.region = region.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_controller_url(mut self, url: impl Into<String>) -> Self {
        self.controller_url = url.into();
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout_secs = timeout.as_secs();
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

#[derive(Debug, Clone)]
struct PineconeIndex {
    host: String,
    metric: MetricType,
    dimension: usize,
}

/// A [`VectorStoreBackend`] backed by [Pinecone](https://www.pinecone.io/).
pub struct PineconeBackend {
    http: HttpTransport,
    config: PineconeConfig,
    indexes: DashMap<String, PineconeIndex>,
}

impl PineconeBackend {
    pub fn new(config: PineconeConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(StoreError::Config("pinecone api_key must not be empty".into()));
        }
        require_batch_size(BACKEND, config.batch_size)?;
        if config.page_size == 0 {
            return Err(StoreError::Config("pinecone page_size must be greater than zero".into()));
        }
        let headers = [
            ("api-key", config.api_key.clone()),
            ("x-pinecone-api-version", config.api_version.clone()),
        ];
        let http = HttpTransport::new(
            BACKEND,
            &config.controller_url,
            &headers,
            Duration::from_secs(config.timeout_secs),
        )?;
        Ok(Self { http, config, indexes: DashMap::new() })
    }

    pub(crate) fn index_name(name: &str) -> String {
        name.to_lowercase().replace('_', "-")
    }

    fn metric_name(metric: MetricType) -> &'static str {
        match metric {
            MetricType::Cosine => "cosine",
            MetricType::L2 => "euclidean",
            MetricType::IP => "dotproduct",
        }
    }

    fn host_url(host: &str) -> String {
        if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        }
    }

    fn parse_index(body: &Value) -> Option<PineconeIndex> {
        let host = body.get("host").and_then(Value::as_str).filter(|h| !h.is_empty())?;
        let metric = body
            .get("metric")
            .and_then(Value::as_str)
            .and_then(|m| m.parse().ok())
            .unwrap_or_default();
        let dimension = body.get("dimension").and_then(Value::as_u64).unwrap_or(0) as usize;
        Some(PineconeIndex { host: Self::host_url(host), metric, dimension })
    }

    /// Describe an index on the control plane. `Ok(None)` means it does not
    /// exist.
    async fn describe(&self, name: &str) -> Result<Option<Value>> {
        let reply =
            self.http.get(&format!("/indexes/{}", encode_segment(&Self::index_name(name)))).await?;
        if reply.is_not_found() {
            return Ok(None);
        }
        if !reply.is_success() {
            return Err(StoreError::collection(
                BACKEND,
                CollectionErrorKind::Invalid,
                format!("failed to describe index for '{name}': {}", reply.error_message()),
            ));
        }
        Ok(Some(reply.body))
    }

    async fn resolve(&self, name: &str) -> Result<PineconeIndex> {
        if let Some(index) = self.indexes.get(name) {
            return Ok(index.clone());
        }
        let body = self
            .describe(name)
            .await?
            .ok_or_else(|| StoreError::collection_not_found(BACKEND, name))?;
        let index = Self::parse_index(&body).ok_or_else(|| {
            StoreError::store(BACKEND, format!("index for '{name}' has no host yet"))
        })?;
        self.indexes.insert(name.to_string(), index.clone());
        Ok(index)
    }

    fn is_ready(body: &Value) -> bool {
        body.pointer("/status/ready").and_then(Value::as_bool).unwrap_or(false)
    }

    async fn wait_until_ready(&self, name: &str) -> Result<Value> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.ready_timeout_secs);
        loop {
            if let Some(body) = self.describe(name).await? {
                if Self::is_ready(&body) {
                    return Ok(body);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StoreError::collection(
                    BACKEND,
                    CollectionErrorKind::Invalid,
                    format!(
                        "index for '{name}' was not ready after {}s",
                        self.config.ready_timeout_secs
                    ),
                ));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Check a data-plane reply, evicting the cached host on 404.
    fn check(&self, name: &str, operation: &str, reply: HttpReply) -> Result<Value> {
        if reply.is_success() {
            return Ok(reply.body);
        }
        if reply.is_not_found() {
            self.indexes.remove(name);
            return Err(StoreError::collection_not_found(BACKEND, name));
        }
        Err(StoreError::document(
            BACKEND,
            format!("{operation} on '{name}' failed: {}", reply.error_message()),
        ))
    }

    /// Pinecone metadata values must be scalars or lists of strings.
    fn vector_metadata(chunk: &EmbeddedChunk) -> Map<String, Value> {
        let mut metadata: Map<String, Value> = chunk
            .metadata()
            .to_flat_map()
            .into_iter()
            .map(|(k, v)| match v {
                Value::Object(_) => (k, Value::String(v.to_string())),
                Value::Array(ref items) if !items.iter().all(Value::is_string) => {
                    (k, Value::String(v.to_string()))
                }
                other => (k, other),
            })
            .collect();
        metadata.insert("chunk_id".into(), json!(chunk.chunk_id()));
        metadata.insert("document_id".into(), json!(chunk.document_id()));
        metadata.insert("text".into(), json!(chunk.text()));
        metadata
    }

    pub(crate) fn filter_clause(filter: &DocumentMetadataFilter) -> Value {
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

    fn match_to_chunk(hit: &Value, metric: MetricType) -> Option<ChunkWithScore> {
        let id = hit.get("id").and_then(Value::as_str)?.to_string();
        let mut fields =
            hit.get("metadata").and_then(Value::as_object).cloned().unwrap_or_default();
        let text = fields
            .remove("text")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let document_id = fields
            .remove("document_id")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let chunk_id = fields
            .remove("chunk_id")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or(id);
        let raw = hit.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
        let score = match metric {
            MetricType::L2 => metric.similarity_from_distance(raw),
            MetricType::Cosine | MetricType::IP => raw,
        };
        Some(ChunkWithScore {
            chunk: DocumentChunk {
                chunk_id,
                text,
                embeddings: None,
                metadata: Some(ChunkMetadata::from_flat_map(fields)),
                document_id,
            },
            score,
        })
    }

    /// IDs among `ids` that exist as vector IDs.
    async fn fetch_existing(
        &self,
        name: &str,
        index: &PineconeIndex,
        ids: &[String],
    ) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for batch in batch_chunks(ids, self.config.batch_size)? {
            let mut url = format!("{}/vectors/fetch?", index.host);
            let query: Vec<String> =
                batch.iter().map(|id| format!("ids={}", encode_segment(id))).collect();
            url.push_str(&query.join("&"));
            if !self.config.namespace.is_empty() {
                url.push_str(&format!("&namespace={}", encode_segment(&self.config.namespace)));
            }
            let body = self.check(name, "fetch", self.http.get(&url).await?)?;
            if let Some(vectors) = body.get("vectors").and_then(Value::as_object) {
                found.extend(batch.iter().filter(|id| vectors.contains_key(id.as_str())).cloned());
            }
        }
        Ok(found)
    }

    /// Delete `doomed` in batches, recording each completed batch in `report`.
    async fn delete_vectors(
        &self,
        collection: &str,
        index: &PineconeIndex,
        doomed: &[String],
        report: &mut DeletionReport,
    ) -> Result<()> {
        let url = format!("{}/vectors/delete", index.host);
        for batch in batch_chunks(doomed, DELETE_BATCH)? {
            let body = json!({ "ids": batch, "namespace": self.config.namespace });
            let reply = self.http.post(&url, &body).await?;
            self.check(collection, "delete", reply)?;
            report.deleted_count += batch.len() as u64;
            report.deleted_ids.extend(batch.iter().cloned());
        }
        Ok(())
    }

    /// Vector IDs whose `document_id` metadata is in `ids`.
    async fn ids_for_documents(
        &self,
        name: &str,
        index: &PineconeIndex,
        ids: &[String],
    ) -> Result<Vec<String>> {
        if index.dimension == 0 {
            return Ok(Vec::new());
        }
        // Any non-zero vector works; the filter does the selection.
        let mut anchor = vec![0.0_f32; index.dimension];
        anchor[0] = 1.0;
        let body = json!({
            "vector": anchor,
            "topK": self.config.page_size.min(MAX_TOP_K),
            "includeMetadata": false,
            "includeValues": false,
            "namespace": self.config.namespace,
            "filter": { "document_id": { "$in": ids } },
        });
        let reply = self.http.post(&format!("{}/query", index.host), &body).await?;
        let body = self.check(name, "query", reply)?;
        Ok(body
            .get("matches")
            .and_then(Value::as_array)
            .map(|matches| {
                matches
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl VectorStoreBackend for PineconeBackend {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn connect(&self) -> Result<()> {
        self.health_check().await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        self.indexes.clear();
        Ok(())
    }

    async fn health_check(&self) -> Result<Value> {
        let reply = self.http.get("/indexes").await?;
        if !reply.is_success() {
            return Err(StoreError::store(
                BACKEND,
                format!("listing indexes failed: {}", reply.error_message()),
            ));
        }
        let count = reply.body.get("indexes").and_then(Value::as_array).map_or(0, Vec::len);
        Ok(json!({ "indexes": count }))
    }

    async fn collection_stats(&self, name: &str) -> Result<CollectionStats> {
        let index = self.resolve(name).await?;
        let reply =
            self.http.post(&format!("{}/describe_index_stats", index.host), &json!({})).await?;
        let body = self.check(name, "describe_index_stats", reply)?;
        let count = if self.config.namespace.is_empty() {
            body.get("totalVectorCount").and_then(Value::as_u64)
        } else {
            body.get("namespaces")
                .and_then(|ns| ns.get(&self.config.namespace))
                .and_then(|ns| ns.get("vectorCount"))
                .and_then(Value::as_u64)
        }
        .unwrap_or(0);

        let mut stats = CollectionStats::new(name, count);
        stats.dimension = Some(index.dimension);
        stats.metric_type = Some(index.metric);
        stats.details.insert("index".into(), json!(Self::index_name(name)));
        if let Some(fullness) = body.get("indexFullness") {
            stats.details.insert("index_fullness".into(), fullness.clone());
        }
        Ok(stats)
    }

    async fn create_collection(&self, config: &CollectionConfig) -> Result<CollectionStatus> {
        let name = config.name();
        if self.describe(name).await?.is_some() {
            debug!(collection = name, "pinecone index already exists, skipping creation");
            return Ok(CollectionStatus::Exists);
        }

        let body = json!({
            "name": Self::index_name(name),
            "dimension": config.dimension(),
            "metric": Self::metric_name(config.metric_type()),
            "spec": { "serverless": { "cloud": self.config.cloud, "region": self.config.region } },
            "deletion_protection": "disabled",
        });
        let reply = self.http.post("/indexes", &body).await?;
        if reply.status.as_u16() == 409 {
            return Ok(CollectionStatus::Exists);
        }
        if !reply.is_success() {
            return Err(StoreError::collection(
                BACKEND,
                CollectionErrorKind::Invalid,
                format!("failed to create index for '{name}': {}", reply.error_message()),
            ));
        }

        let ready = if Self::is_ready(&reply.body) {
            reply.body
        } else {
            debug!(collection = name, "waiting for pinecone index to become ready");
            self.wait_until_ready(name).await?
        };
        if let Some(index) = Self::parse_index(&ready) {
            self.indexes.insert(name.to_string(), index);
        }
        debug!(collection = name, dimension = config.dimension(), "created pinecone index");
        Ok(CollectionStatus::Created)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let reply = self
            .http
            .delete(&format!("/indexes/{}", encode_segment(&Self::index_name(name))))
            .await?;
        self.indexes.remove(name);
        if reply.is_not_found() {
            return Err(StoreError::collection_not_found(BACKEND, name));
        }
        if !reply.is_success() {
            return Err(StoreError::collection(
                BACKEND,
                CollectionErrorKind::Invalid,
                format!("failed to delete index for '{name}': {}", reply.error_message()),
            ));
        }
        debug!(collection = name, "deleted pinecone index");
        Ok(())
    }

    async fn add_documents(
        &self,
        collection: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<Vec<String>> {
        let index = self.resolve(collection).await?;
        let url = format!("{}/vectors/upsert", index.host);
        let mut ids = Vec::with_capacity(chunks.len());

        for batch in batch_chunks(chunks, self.config.batch_size)? {
            let vectors: Vec<Value> = batch
                .iter()
                .map(|chunk| {
                    json!({
                        "id": chunk.chunk_id(),
                        "values": chunk.embeddings(),
                        "metadata": Self::vector_metadata(chunk),
                    })
                })
                .collect();
            let body = json!({ "vectors": vectors, "namespace": self.config.namespace });
            let reply = self.http.post(&url, &body).await?;
            self.check(collection, "upsert", reply)?;
            ids.extend(batch.iter().map(|c| c.chunk_id().to_string()));
            debug!(collection, count = batch.len(), "upserted batch to pinecone");
        }
        Ok(ids)
    }

    fn insert_batch_limit(&self) -> Option<usize> {
        Some(self.config.batch_size)
    }

    async fn search(&self, request: &SearchRequest) -> Result<QueryResult> {
        let vector = require_vector(BACKEND, request)?;
        let name = request.collection_name();
        let index = self.resolve(name).await?;

        let mut body = json!({
            "vector": vector,
            "topK": request.top_k().min(MAX_TOP_K),
            "includeMetadata": true,
            "includeValues": false,
            "namespace": self.config.namespace,
        });
        if let Some(filter) = request.metadata_filter() {
            body["filter"] = Self::filter_clause(filter);
        }
        let reply = self.http.post(&format!("{}/query", index.host), &body).await?;
        let body = self.check(name, "query", reply)?;

        let hits = body
            .get("matches")
            .and_then(Value::as_array)
            .map(|matches| {
                matches.iter().filter_map(|m| Self::match_to_chunk(m, index.metric)).collect()
            })
            .unwrap_or_default();
        Ok(QueryResult::from_scored(hits))
    }

    async fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<DeletionReport> {
        let index = self.resolve(collection).await?;
        let page_size = self.config.page_size.min(MAX_TOP_K);
        let mut seen = HashSet::new();
        let mut report = DeletionReport::default();

        let by_chunk: Vec<String> = self
            .fetch_existing(collection, &index, ids)
            .await?
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if let Err(e) = self.delete_vectors(collection, &index, &by_chunk, &mut report).await {
            report.error = Some(e.to_string());
            return Ok(report);
        }

        // A filtered query returns at most one page, so query again until a
        // page comes back short.
        loop {
            let page = match self.ids_for_documents(collection, &index, ids).await {
                Ok(page) => page,
                Err(e) if report.deleted_count > 0 => {
                    report.error = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            };
            let full = page.len() >= page_size;
            let fresh: Vec<String> =
                page.into_iter().filter(|id| seen.insert(id.clone())).collect();
            if let Err(e) = self.delete_vectors(collection, &index, &fresh, &mut report).await {
                report.error = Some(e.to_string());
                break;
            }
            if !full {
                break;
            }
            if fresh.is_empty() {
                report.error = Some(format!(
                    "index for '{collection}' still returns {page_size} deleted vectors; \
                     retry once it catches up"
                ));
                break;
            }
        }

        if let Some(error) = &report.error {
            warn!(
                collection,
                deleted = report.deleted_count,
                error = %error,
                "pinecone delete stopped part-way"
            );
        } else {
            debug!(collection, count = report.deleted_count, "deleted vectors from pinecone");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_names_are_normalized() {
        assert_eq!(PineconeBackend::index_name("My_Docs"), "my-docs");
    }

    #[test]
    fn bare_hosts_get_https() {
        assert_eq!(
            PineconeBackend::host_url("idx-abc.svc.pinecone.io"),
            "https://idx-abc.svc.pinecone.io"
        );
        assert_eq!(PineconeBackend::host_url("http://127.0.0.1:5080/"), "http://127.0.0.1:5080");
    }

    #[test]
    fn nested_metadata_is_stringified() {
        let mut metadata = ChunkMetadata::default();
        metadata.extra.insert("tags".into(), json!(["a", "b"]));
        metadata.extra.insert("layout".into(), json!({ "col": 2 }));
        let chunk = EmbeddedChunk::new("c1", "hello", vec![0.1, 0.2], "d1")
            .unwrap()
            .with_metadata(metadata);

        let stored = PineconeBackend::vector_metadata(&chunk);
        assert_eq!(stored["tags"], json!(["a", "b"]));
        assert_eq!(stored["layout"], json!(r#"{"col":2}"#));
        assert_eq!(stored["text"], json!("hello"));
        assert_eq!(stored["document_id"], json!("d1"));
    }
}
