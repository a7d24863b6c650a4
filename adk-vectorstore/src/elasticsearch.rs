//! Elasticsearch vector store backend.
//!
//! Each collection is an index with a `dense_vector` field named `embedding`.
//! Vector search uses a `script_score` query so results are exact and
//! filters apply before scoring; text-only requests fall back to a `match`
//! query on the chunk text.
//!
//! Index names are lower-cased, since Elasticsearch rejects upper-case index
//! names.
//!
//! This module is only available when the `elasticsearch` feature is enabled.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::backend::{VectorStoreBackend, batch_chunks, require_batch_size};
use crate::collection::{CollectionConfig, CollectionStats, CollectionStatus, MetricType};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::document::{ChunkMetadata, ChunkWithScore, DocumentChunk, EmbeddedChunk, QueryResult};
use crate::error::{CollectionErrorKind, Result, StoreError};
use crate::filter::{DocumentMetadataFilter, FilterOperator};
use crate::http::{HttpReply, HttpTransport, encode_segment};
use crate::request::SearchRequest;
use crate::response::DeletionReport;

const BACKEND: &str = "elasticsearch";

/// Fields stored at the top level of each index document rather than under
/// `metadata`.
const TOP_LEVEL_FIELDS: &[&str] = &["chunk_id", "document_id", "text"];

/// Connection settings for [`ElasticsearchBackend`].
///
/// `api_key` takes precedence over `username`/`password` when both are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub batch_size: usize,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".into(),
            username: None,
            password: None,
            api_key: None,
            timeout_secs: 30,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ElasticsearchConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    /// Read `ELASTICSEARCH_URL`, `ELASTICSEARCH_USERNAME`,
    /// `ELASTICSEARCH_PASSWORD` and `ELASTICSEARCH_API_KEY`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("ELASTICSEARCH_URL").unwrap_or(defaults.url),
            username: std::env::var("ELASTICSEARCH_USERNAME").ok(),
            password: std::env::var("ELASTICSEARCH_PASSWORD").ok(),
            api_key: std::env::var("ELASTICSEARCH_API_KEY").ok(),
            ..defaults
        }
    }

    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// A [`VectorStoreBackend`] backed by an Elasticsearch cluster.
pub struct ElasticsearchBackend {
    http: HttpTransport,
    batch_size: usize,
}

impl ElasticsearchBackend {
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        let batch_size = require_batch_size(BACKEND, config.batch_size)?;
        let mut headers = Vec::new();
        if let Some(key) = &config.api_key {
            headers.push(("authorization", format!("ApiKey {key}")));
        }
        let mut http = HttpTransport::new(
            BACKEND,
            &config.url,
            &headers,
            Duration::from_secs(config.timeout_secs),
        )?;
        if config.api_key.is_none() {
            if let Some(username) = config.username {
                http = http.with_basic_auth(username, config.password);
            }
        }
        Ok(Self { http, batch_size })
    }

    fn index(name: &str) -> String {
        encode_segment(&name.to_lowercase())
    }

    fn similarity(metric: MetricType) -> &'static str {
        match metric {
            MetricType::Cosine => "cosine",
            MetricType::L2 => "l2_norm",
            MetricType::IP => "dot_product",
        }
    }

    /// Painless source for `script_score`. Scores must be non-negative, so
    /// each metric is shifted and [`Self::unshift`] undoes it.
    fn script(metric: MetricType) -> &'static str {
        match metric {
            MetricType::Cosine => "cosineSimilarity(params.query_vector, 'embedding') + 1.0",
            MetricType::L2 => "1.0 / (1.0 + l2norm(params.query_vector, 'embedding'))",
            MetricType::IP => {
                "double v = dotProduct(params.query_vector, 'embedding'); \
                 return v < 0 ? 1.0 / (1.0 - v) : v + 1.0;"
            }
        }
    }

    fn unshift(metric: MetricType, score: f32) -> f32 {
        match metric {
            MetricType::Cosine => score - 1.0,
            MetricType::L2 => score,
            MetricType::IP if score >= 1.0 => score - 1.0,
            MetricType::IP if score > 0.0 => 1.0 - 1.0 / score,
            MetricType::IP => f32::MIN,
        }
    }

    fn field_path(field: &str) -> String {
        if TOP_LEVEL_FIELDS.contains(&field) {
            field.to_string()
        } else {
            format!("metadata.{field}")
        }
    }

    pub(crate) fn filter_clause(filter: &DocumentMetadataFilter) -> Value {
        let path = Self::field_path(&filter.field_name);
        let value = filter.value.clone();
        match filter.operator {
            FilterOperator::Eq => json!({ "term": { path: value } }),
            FilterOperator::Ne => json!({ "bool": { "must_not": [{ "term": { path: value } }] } }),
            FilterOperator::In => json!({ "terms": { path: value } }),
            FilterOperator::NotIn => {
                json!({ "bool": { "must_not": [{ "terms": { path: value } }] } })
            }
            FilterOperator::Gt => json!({ "range": { path: { "gt": value } } }),
            FilterOperator::Gte => json!({ "range": { path: { "gte": value } } }),
            FilterOperator::Lt => json!({ "range": { path: { "lt": value } } }),
            FilterOperator::Lte => json!({ "range": { path: { "lte": value } } }),
        }
    }

    fn not_found_or(
        name: &str,
        reply: &HttpReply,
        kind: CollectionErrorKind,
        operation: &str,
    ) -> StoreError {
        if reply.is_not_found() {
            StoreError::collection_not_found(BACKEND, name)
        } else {
            StoreError::collection(
                BACKEND,
                kind,
                format!("{operation} '{name}' failed: {}", reply.error_message()),
            )
        }
    }

    /// Read the metric recorded in the index mapping, defaulting to cosine.
    async fn index_metric(&self, name: &str) -> Result<(MetricType, Option<usize>)> {
        let reply = self.http.get(&format!("/{}/_mapping", Self::index(name))).await?;
        if !reply.is_success() {
            return Err(Self::not_found_or(
                name,
                &reply,
                CollectionErrorKind::Invalid,
                "reading mapping of",
            ));
        }
        let mappings = reply
            .body
            .as_object()
            .and_then(|indices| indices.values().next())
            .and_then(|index| index.get("mappings"));
        let meta = mappings.and_then(|m| m.get("_meta"));
        let metric = meta
            .and_then(|m| m.get("metric_type"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let dimension = mappings
            .and_then(|m| m.pointer("/properties/embedding/dims"))
            .and_then(Value::as_u64)
            .map(|d| d as usize);
        Ok((metric, dimension))
    }

    fn hit_to_chunk(hit: &Value, score: f32) -> Option<ChunkWithScore> {
        let source = hit.get("_source")?;
        let chunk_id = source
            .get("chunk_id")
            .and_then(Value::as_str)
            .or_else(|| hit.get("_id").and_then(Value::as_str))?
            .to_string();
        let text = source.get("text").and_then(Value::as_str).unwrap_or_default().to_string();
        let document_id =
            source.get("document_id").and_then(Value::as_str).unwrap_or_default().to_string();
        let metadata =
            source.get("metadata").and_then(Value::as_object).cloned().unwrap_or_default();
        Some(ChunkWithScore {
            chunk: DocumentChunk {
                chunk_id,
                text,
                embeddings: None,
                metadata: Some(ChunkMetadata::from_flat_map(metadata)),
                document_id,
            },
            score,
        })
    }
}

#[async_trait]
impl VectorStoreBackend for ElasticsearchBackend {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn connect(&self) -> Result<()> {
        self.health_check().await.map(|_| ())
    }

    async fn health_check(&self) -> Result<Value> {
        let reply = self.http.get("/_cluster/health").await?;
        if !reply.is_success() {
            return Err(StoreError::store(
                BACKEND,
                format!("cluster health failed: {}", reply.error_message()),
            ));
        }
        let status = reply.body.get("status").and_then(Value::as_str).unwrap_or("unknown");
        if status == "red" {
            return Err(StoreError::store(BACKEND, "cluster status is red"));
        }
        Ok(reply.body)
    }

    async fn collection_stats(&self, name: &str) -> Result<CollectionStats> {
        let reply = self.http.get(&format!("/{}/_count", Self::index(name))).await?;
        if !reply.is_success() {
            return Err(Self::not_found_or(name, &reply, CollectionErrorKind::Invalid, "counting"));
        }
        let count = reply.body.get("count").and_then(Value::as_u64).unwrap_or(0);
        let (metric, dimension) = self.index_metric(name).await?;
        let mut stats = CollectionStats::new(name, count);
        stats.metric_type = Some(metric);
        stats.dimension = dimension;
        stats.details.insert("index".into(), json!(name.to_lowercase()));
        Ok(stats)
    }

    async fn create_collection(&self, config: &CollectionConfig) -> Result<CollectionStatus> {
        let index = Self::index(config.name());
        let exists = self.http.head(&format!("/{index}")).await?;
        if exists.is_success() {
            debug!(index = %index, "elasticsearch index already exists, skipping creation");
            return Ok(CollectionStatus::Exists);
        }

        let mut meta = Map::new();
        meta.insert("dimension".into(), json!(config.dimension()));
        meta.insert("metric_type".into(), json!(config.metric_type().as_str()));
        meta.insert("index_type".into(), json!(config.index_type().as_str()));
        if let Some(description) = config.description() {
            meta.insert("description".into(), json!(description));
        }
        let mut embedding = json!({
            "type": "dense_vector",
            "dims": config.dimension(),
            "index": true,
            "similarity": Self::similarity(config.metric_type()),
        });
        if let Some(params) = config.index_params() {
            embedding["index_options"] = Value::Object(params.clone());
        }
        let body = json!({
            "mappings": {
                "_meta": meta,
                "dynamic_templates": [{
                    "metadata_strings": {
                        "path_match": "metadata.*",
                        "match_mapping_type": "string",
                        "mapping": { "type": "keyword" }
                    }
                }],
                "properties": {
                    "chunk_id": { "type": "keyword" },
                    "document_id": { "type": "keyword" },
                    "text": { "type": "text" },
                    "metadata": { "type": "object" },
                    "embedding": embedding,
                }
            }
        });

        let reply = self.http.put(&format!("/{index}"), &body).await?;
        if reply.is_success() {
            debug!(index = %index, dimension = config.dimension(), "created elasticsearch index");
            return Ok(CollectionStatus::Created);
        }
        if reply.error_message().contains("resource_already_exists_exception") {
            return Ok(CollectionStatus::Exists);
        }
        Err(StoreError::collection(
            BACKEND,
            CollectionErrorKind::Invalid,
            format!("failed to create index '{index}': {}", reply.error_message()),
        ))
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let reply = self.http.delete(&format!("/{}", Self::index(name))).await?;
        if !reply.is_success() {
            return Err(Self::not_found_or(name, &reply, CollectionErrorKind::Invalid, "deleting"));
        }
        debug!(collection = name, "deleted elasticsearch index");
        Ok(())
    }

    async fn add_documents(
        &self,
        collection: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<Vec<String>> {
        let index = Self::index(collection);
        let exists = self.http.head(&format!("/{index}")).await?;
        if exists.is_not_found() {
            return Err(StoreError::collection_not_found(BACKEND, collection));
        }

        let mut ids = Vec::with_capacity(chunks.len());
        for batch in batch_chunks(chunks, self.batch_size)? {
            let mut lines = Vec::with_capacity(batch.len() * 2);
            for chunk in batch {
                lines.push(json!({ "index": { "_id": chunk.chunk_id() } }));
                lines.push(json!({
                    "chunk_id": chunk.chunk_id(),
                    "document_id": chunk.document_id(),
                    "text": chunk.text(),
                    "metadata": chunk.metadata().to_flat_map(),
                    "embedding": chunk.embeddings(),
                }));
            }
            let reply = self.http.post_ndjson(&format!("/{index}/_bulk"), &lines).await?;
            if !reply.is_success() {
                return Err(StoreError::document(
                    BACKEND,
                    format!("bulk insert into '{collection}' failed: {}", reply.error_message()),
                ));
            }
            if reply.body.get("errors").and_then(Value::as_bool).unwrap_or(false) {
                let reason = reply
                    .body
                    .get("items")
                    .and_then(Value::as_array)
                    .and_then(|items| {
                        items.iter().find_map(|item| item.pointer("/index/error/reason"))
                    })
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(StoreError::document(
                    BACKEND,
                    format!("bulk insert into '{collection}' rejected documents: {reason}"),
                ));
            }
            ids.extend(batch.iter().map(|c| c.chunk_id().to_string()));
            debug!(collection, count = batch.len(), "indexed batch into elasticsearch");
        }

        let refresh = self.http.post(&format!("/{index}/_refresh"), &json!({})).await?;
        if !refresh.is_success() {
            warn!(collection, error = %refresh.error_message(), "index refresh failed");
        }
        Ok(ids)
    }

    fn insert_batch_limit(&self) -> Option<usize> {
        Some(self.batch_size)
    }

    async fn search(&self, request: &SearchRequest) -> Result<QueryResult> {
        let name = request.collection_name();
        let filter = request.metadata_filter().map(Self::filter_clause);

        let (body, metric) = match request.query_vector() {
            Some(vector) => {
                let (metric, _) = self.index_metric(name).await?;
                let base = match &filter {
                    Some(clause) => json!({ "bool": { "filter": [clause] } }),
                    None => json!({ "match_all": {} }),
                };
                let body = json!({
                    "size": request.top_k(),
                    "_source": { "excludes": ["embedding"] },
                    "query": {
                        "script_score": {
                            "query": base,
                            "script": {
                                "source": Self::script(metric),
                                "params": { "query_vector": vector }
                            }
                        }
                    }
                });
                (body, Some(metric))
            }
            None => {
                let text = request.query_text().unwrap_or_default();
                let mut query = json!({ "bool": { "must": [{ "match": { "text": text } }] } });
                if let Some(clause) = &filter {
                    query["bool"]["filter"] = json!([clause]);
                }
                let body = json!({
                    "size": request.top_k(),
                    "_source": { "excludes": ["embedding"] },
                    "query": query,
                });
                (body, None)
            }
        };

        let reply = self.http.post(&format!("/{}/_search", Self::index(name)), &body).await?;
        if !reply.is_success() {
            if reply.is_not_found() {
                return Err(StoreError::collection_not_found(BACKEND, name));
            }
            return Err(StoreError::document(
                BACKEND,
                format!("search on '{name}' failed: {}", reply.error_message()),
            ));
        }

        let hits = reply
            .body
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let scored = hits
            .iter()
            .filter_map(|hit| {
                let raw = hit.get("_score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                let score = metric.map_or(raw, |m| Self::unshift(m, raw));
                Self::hit_to_chunk(hit, score)
            })
            .collect();
        Ok(QueryResult::from_scored(scored))
    }

    async fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<DeletionReport> {
        let body = json!({
            "query": {
                "bool": {
                    "should": [
                        { "terms": { "_id": ids } },
                        { "terms": { "document_id": ids } }
                    ],
                    "minimum_should_match": 1
                }
            }
        });
        let reply = self
            .http
            .post(&format!("/{}/_delete_by_query?refresh=true", Self::index(collection)), &body)
            .await?;
        if !reply.is_success() {
            if reply.is_not_found() {
                return Err(StoreError::collection_not_found(BACKEND, collection));
            }
            return Err(StoreError::document(
                BACKEND,
                format!("delete from '{collection}' failed: {}", reply.error_message()),
            ));
        }
        let deleted = reply.body.get("deleted").and_then(Value::as_u64).unwrap_or(0);
        let mut report = DeletionReport::count(deleted);
        if let Some(failures) = reply.body.get("failures").and_then(Value::as_array) {
            if !failures.is_empty() {
                report.error = Some(format!("{} documents failed to delete", failures.len()));
            }
        }
        debug!(collection, deleted, "deleted documents from elasticsearch");
        Ok(report)
    }

    fn supports_lexical_search(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_target_metadata_unless_top_level() {
        let clause =
            ElasticsearchBackend::filter_clause(&DocumentMetadataFilter::eq("author", "ann"));
        assert_eq!(clause, json!({ "term": { "metadata.author": "ann" } }));

        let clause =
            ElasticsearchBackend::filter_clause(&DocumentMetadataFilter::eq("document_id", "d1"));
        assert_eq!(clause, json!({ "term": { "document_id": "d1" } }));
    }

    #[test]
    fn shifted_scores_are_restored() {
        for v in [-3.0_f32, -0.5, 0.0, 0.25, 4.0] {
            let shifted = if v < 0.0 { 1.0 / (1.0 - v) } else { v + 1.0 };
            let restored = ElasticsearchBackend::unshift(MetricType::IP, shifted);
            assert!((restored - v).abs() < 1e-5, "{v} -> {restored}");
        }
        assert!((ElasticsearchBackend::unshift(MetricType::Cosine, 1.8) - 0.8).abs() < 1e-6);
    }
}
