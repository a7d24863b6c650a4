//! Weaviate vector store backend.
//!
//! A collection is a Weaviate class with `vectorizer: none`; vectors are
//! always supplied by the caller. The class name is the collection name with
//! its first letter upper-cased, as Weaviate requires, so collection names
//! that differ only there (`docs` and `Docs`) share one class. Object IDs are
//! UUIDv5 values derived from the chunk ID, so re-inserting a chunk
//! overwrites it.
//!
//! Known metadata fields become typed class properties and can be filtered
//! on. Caller-defined fields are stored together in `metadata_json` and are
//! returned intact but cannot be filtered on.
//!
//! This module is only available when the `weaviate` feature is enabled.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{VectorStoreBackend, batch_chunks, require_batch_size};
use crate::collection::{CollectionConfig, CollectionStats, CollectionStatus, IndexType, MetricType};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::document::{ChunkMetadata, ChunkWithScore, DocumentChunk, EmbeddedChunk, QueryResult};
use crate::error::{CollectionErrorKind, Result, StoreError};
use crate::filter::{DocumentMetadataFilter, FilterOperator};
use crate::http::{HttpReply, HttpTransport, encode_segment};
use crate::request::SearchRequest;
use crate::response::DeletionReport;

const BACKEND: &str = "weaviate";

/// Weaviate's default `QUERY_MAXIMUM_RESULTS`; no `Get` returns more.
const QUERY_LIMIT: usize = 10_000;

/// Class properties and their Weaviate data types.
const PROPERTIES: &[(&str, &str)] = &[
    ("chunk_id", "text"),
    ("text", "text"),
    ("document_id", "text"),
    ("source", "text"),
    ("source_id", "text"),
    ("url", "text"),
    ("created_at", "date"),
    ("author", "text"),
    ("page_number", "int"),
    ("chunk_number", "int"),
    ("table_index", "int"),
    ("image_index", "int"),
    ("content_type", "text"),
    ("metadata_json", "text"),
];

/// Connection settings for [`WeaviateBackend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaviateConfig {
    pub url: String,
    /// Sent as a bearer token when set.
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub batch_size: usize,
    /// Objects looked up per round when deleting by ID. Capped at the
    /// server's query maximum.
    pub page_size: usize,
}

impl Default for WeaviateConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".into(),
            api_key: None,
            timeout_secs: 30,
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: QUERY_LIMIT,
        }
    }
}

impl WeaviateConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    /// Read `WEAVIATE_URL` and `WEAVIATE_API_KEY`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("WEAVIATE_URL").unwrap_or(defaults.url),
            api_key: std::env::var("WEAVIATE_API_KEY").ok(),
            ..defaults
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
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

/// A [`VectorStoreBackend`] backed by [Weaviate](https://weaviate.io/).
pub struct WeaviateBackend {
    http: HttpTransport,
    batch_size: usize,
    page_size: usize,
    metrics: DashMap<String, MetricType>,
}

impl WeaviateBackend {
    pub fn new(config: WeaviateConfig) -> Result<Self> {
        let batch_size = require_batch_size(BACKEND, config.batch_size)?;
        if config.page_size == 0 {
            return Err(StoreError::Config("weaviate page_size must be greater than zero".into()));
        }
        let mut headers = Vec::new();
        if let Some(key) = &config.api_key {
            headers.push(("authorization", format!("Bearer {key}")));
        }
        let http = HttpTransport::new(
            BACKEND,
            &config.url,
            &headers,
            Duration::from_secs(config.timeout_secs),
        )?;
        Ok(Self {
            http,
            batch_size,
            page_size: config.page_size.min(QUERY_LIMIT),
            metrics: DashMap::new(),
        })
    }

    /// Weaviate class name for a collection.
    ///
    /// Characters outside `[A-Za-z0-9]` become `_` and the first letter is
    /// upper-cased, so `my-docs`, `my_docs` and `My_docs` all name the same
    /// class.
    pub fn class_name(collection: &str) -> String {
        let cleaned: String = collection
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let mut chars = cleaned.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() => {
                first.to_ascii_uppercase().to_string() + chars.as_str()
            }
            Some(_) => format!("C{cleaned}"),
            None => String::new(),
        }
    }

    /// Deterministic object ID for a chunk.
    pub fn object_id(chunk_id: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes())
    }

    fn distance(metric: MetricType) -> &'static str {
        match metric {
            MetricType::Cosine => "cosine",
            MetricType::L2 => "l2-squared",
            MetricType::IP => "dot",
        }
    }

    fn score(metric: MetricType, distance: f32) -> f32 {
        match metric {
            MetricType::Cosine | MetricType::L2 => metric.similarity_from_distance(distance),
            // Weaviate's dot distance is the negated inner product.
            MetricType::IP => -distance,
        }
    }

    fn property_type(field: &str) -> Option<&'static str> {
        PROPERTIES.iter().find(|(name, _)| *name == field).map(|(_, ty)| *ty)
    }

    /// The class schema, or `None` if the class does not exist.
    async fn schema(&self, collection: &str) -> Result<Option<Value>> {
        let class = Self::class_name(collection);
        let reply = self.http.get(&format!("/v1/schema/{}", encode_segment(&class))).await?;
        if reply.is_not_found() {
            return Ok(None);
        }
        if !reply.is_success() {
            return Err(StoreError::collection(
                BACKEND,
                CollectionErrorKind::Invalid,
                format!("failed to read schema of '{class}': {}", reply.error_message()),
            ));
        }
        Ok(Some(reply.body))
    }

    async fn metric_for(&self, collection: &str) -> Result<MetricType> {
        if let Some(metric) = self.metrics.get(collection) {
            return Ok(*metric);
        }
        let schema = self
            .schema(collection)
            .await?
            .ok_or_else(|| StoreError::collection_not_found(BACKEND, collection))?;
        let metric = match schema.pointer("/vectorIndexConfig/distance").and_then(Value::as_str) {
            Some("l2-squared") => MetricType::L2,
            Some("dot") => MetricType::IP,
            _ => MetricType::Cosine,
        };
        self.metrics.insert(collection.to_string(), metric);
        Ok(metric)
    }

    /// Run a GraphQL query and return its `data`.
    async fn graphql(&self, collection: &str, query: String) -> Result<Value> {
        let reply = self.http.post("/v1/graphql", &json!({ "query": query })).await?;
        if !reply.is_success() {
            return Err(StoreError::document(
                BACKEND,
                format!("graphql query on '{collection}' failed: {}", reply.error_message()),
            ));
        }
        if let Some(errors) = reply.body.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                let message = first.get("message").and_then(Value::as_str).unwrap_or_default();
                if message.contains("Cannot query field") {
                    self.metrics.remove(collection);
                    return Err(StoreError::collection_not_found(BACKEND, collection));
                }
                return Err(StoreError::document(
                    BACKEND,
                    format!("graphql query on '{collection}' failed: {message}"),
                ));
            }
        }
        Ok(reply.body.get("data").cloned().unwrap_or(Value::Null))
    }

    fn properties_for(chunk: &EmbeddedChunk) -> Map<String, Value> {
        let mut properties = Map::new();
        let mut extra = Map::new();
        for (key, value) in chunk.metadata().to_flat_map() {
            if Self::property_type(&key).is_some() {
                properties.insert(key, value);
            } else {
                extra.insert(key, value);
            }
        }
        properties.insert("chunk_id".into(), json!(chunk.chunk_id()));
        properties.insert("text".into(), json!(chunk.text()));
        properties.insert("document_id".into(), json!(chunk.document_id()));
        if !extra.is_empty() {
            properties.insert("metadata_json".into(), json!(Value::Object(extra).to_string()));
        }
        properties
    }

    fn object_to_chunk(object: &Value, metric: Option<MetricType>) -> Option<ChunkWithScore> {
        let mut fields = object.as_object()?.clone();
        let additional = fields.remove("_additional").unwrap_or(Value::Null);
        let chunk_id = fields.remove("chunk_id")?.as_str()?.to_string();
        let text = fields
            .remove("text")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let document_id = fields
            .remove("document_id")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        if let Some(Value::String(raw)) = fields.remove("metadata_json") {
            match serde_json::from_str::<Map<String, Value>>(&raw) {
                Ok(extra) => fields.extend(extra),
                Err(e) => {
                    warn!(chunk_id = %chunk_id, error = %e, "ignoring unreadable metadata_json");
                }
            }
        }
        fields.retain(|_, v| !v.is_null());

        let score = match metric {
            Some(metric) => {
                let distance =
                    additional.get("distance").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                Self::score(metric, distance)
            }
            // bm25 scores come back as strings.
            None => additional
                .get("score")
                .and_then(|s| s.as_str().and_then(|s| s.parse().ok()).or_else(|| s.as_f64()))
                .unwrap_or(0.0) as f32,
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

    fn value_key(field_type: &str, value: &Value) -> &'static str {
        match (field_type, value) {
            ("date", _) => "valueDate",
            ("int", _) => "valueInt",
            (_, Value::Bool(_)) => "valueBoolean",
            (_, Value::Number(n)) if n.is_f64() => "valueNumber",
            (_, Value::Number(_)) => "valueInt",
            _ => "valueText",
        }
    }

    fn condition(field: &str, field_type: &str, operator: &str, value: &Value) -> String {
        format!(
            "{{path: [{}], operator: {operator}, {}: {value}}}",
            json!(field),
            Self::value_key(field_type, value)
        )
    }

    /// Translate a filter into a GraphQL `where` argument.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] for fields that are not class
    /// properties.
    pub(crate) fn where_clause(filter: &DocumentMetadataFilter) -> Result<String> {
        let field = filter.field_name.as_str();
        let field_type = Self::property_type(field).filter(|_| field != "metadata_json").ok_or_else(
            || {
                StoreError::InvalidInput(format!(
                    "weaviate can only filter on built-in metadata fields, not '{field}'"
                ))
            },
        )?;
        let single = |operator: &str| Self::condition(field, field_type, operator, &filter.value);
        let combined = |operator: &str, combinator: &str| {
            let operands: Vec<String> = filter
                .values()
                .iter()
                .map(|v| Self::condition(field, field_type, operator, v))
                .collect();
            format!("{{operator: {combinator}, operands: [{}]}}", operands.join(", "))
        };
        Ok(match filter.operator {
            FilterOperator::Eq => single("Equal"),
            FilterOperator::Ne => single("NotEqual"),
            FilterOperator::Gt => single("GreaterThan"),
            FilterOperator::Gte => single("GreaterThanEqual"),
            FilterOperator::Lt => single("LessThan"),
            FilterOperator::Lte => single("LessThanEqual"),
            FilterOperator::In => combined("Equal", "Or"),
            FilterOperator::NotIn => combined("NotEqual", "And"),
        })
    }

    fn selection() -> String {
        PROPERTIES.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(" ")
    }

    /// Weaviate object IDs of chunks matching `ids` by chunk or document ID.
    async fn matching_objects(&self, collection: &str, ids: &[String]) -> Result<Vec<String>> {
        let class = Self::class_name(collection);
        let list = json!(ids);
        let query = format!(
            "{{ Get {{ {class}(limit: {}, where: {{operator: Or, operands: [\
             {{path: [\"chunk_id\"], operator: ContainsAny, valueTextArray: {list}}}, \
             {{path: [\"document_id\"], operator: ContainsAny, valueTextArray: {list}}}]}}) \
             {{ _additional {{ id }} }} }} }}",
            self.page_size
        );
        let data = self.graphql(collection, query).await?;
        Ok(data
            .pointer(&format!("/Get/{class}"))
            .and_then(Value::as_array)
            .map(|objects| {
                objects
                    .iter()
                    .filter_map(|o| o.pointer("/_additional/id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Delete `objects` one by one, stopping at the first failure.
    async fn delete_objects(&self, class: &str, objects: &[String], report: &mut DeletionReport) {
        for object in objects {
            let path = format!("/v1/objects/{}/{}", encode_segment(class), encode_segment(object));
            match self.http.delete(&path).await {
                Ok(reply) if reply.is_success() => {
                    report.deleted_count += 1;
                    report.deleted_ids.push(object.clone());
                }
                // Removed concurrently; nothing left to delete.
                Ok(reply) if reply.is_not_found() => {}
                Ok(reply) => {
                    report.error = Some(format!(
                        "failed to delete object {object}: {}",
                        reply.error_message()
                    ));
                    return;
                }
                Err(e) => {
                    report.error = Some(e.to_string());
                    return;
                }
            }
        }
    }

    fn batch_errors(reply: &HttpReply) -> Option<String> {
        reply.body.as_array()?.iter().find_map(|object| {
            object
                .pointer("/result/errors/error")
                .and_then(Value::as_array)
                .and_then(|errors| errors.first())
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }
}

#[async_trait]
impl VectorStoreBackend for WeaviateBackend {
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
        let ready = self.http.get("/v1/.well-known/ready").await?;
        if !ready.is_success() {
            return Err(StoreError::store(
                BACKEND,
                format!("readiness probe failed: {}", ready.error_message()),
            ));
        }
        let meta = self.http.get("/v1/meta").await?;
        Ok(json!({
            "ready": true,
            "version": meta.body.get("version").cloned().unwrap_or(Value::Null),
        }))
    }

    async fn collection_stats(&self, name: &str) -> Result<CollectionStats> {
        let metric = self.metric_for(name).await?;
        let class = Self::class_name(name);
        let query = format!("{{ Aggregate {{ {class} {{ meta {{ count }} }} }} }}");
        let data = self.graphql(name, query).await?;
        let count = data
            .pointer(&format!("/Aggregate/{class}/0/meta/count"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let mut stats = CollectionStats::new(name, count);
        stats.metric_type = Some(metric);
        stats.details.insert("class".into(), json!(class));
        Ok(stats)
    }

    async fn create_collection(&self, config: &CollectionConfig) -> Result<CollectionStatus> {
        let name = config.name();
        let class = Self::class_name(name);
        if self.schema(name).await?.is_some() {
            self.metrics.remove(name);
            debug!(class = %class, "weaviate class already exists, skipping creation");
            return Ok(CollectionStatus::Exists);
        }

        let properties: Vec<Value> = PROPERTIES
            .iter()
            .map(|(property, ty)| json!({ "name": property, "dataType": [ty] }))
            .collect();
        let index_type = match config.index_type() {
            IndexType::Flat => "flat",
            _ => "hnsw",
        };
        let mut vector_index_config = json!({ "distance": Self::distance(config.metric_type()) });
        if let Some(params) = config.index_params() {
            for (key, value) in params {
                vector_index_config[key.as_str()] = value.clone();
            }
        }
        let mut body = json!({
            "class": class,
            "vectorizer": "none",
            "vectorIndexType": index_type,
            "vectorIndexConfig": vector_index_config,
            "properties": properties,
        });
        if let Some(description) = config.description() {
            body["description"] = json!(description);
        }

        let reply = self.http.post("/v1/schema", &body).await?;
        if !reply.is_success() {
            if reply.error_message().contains("already exists") {
                return Ok(CollectionStatus::Exists);
            }
            return Err(StoreError::collection(
                BACKEND,
                CollectionErrorKind::Invalid,
                format!("failed to create class '{class}': {}", reply.error_message()),
            ));
        }
        self.metrics.insert(name.to_string(), config.metric_type());
        debug!(class = %class, dimension = config.dimension(), "created weaviate class");
        Ok(CollectionStatus::Created)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.metrics.remove(name);
        if self.schema(name).await?.is_none() {
            return Err(StoreError::collection_not_found(BACKEND, name));
        }
        let class = Self::class_name(name);
        let reply = self.http.delete(&format!("/v1/schema/{}", encode_segment(&class))).await?;
        if !reply.is_success() {
            return Err(StoreError::collection(
                BACKEND,
                CollectionErrorKind::Invalid,
                format!("failed to delete class '{class}': {}", reply.error_message()),
            ));
        }
        debug!(class = %class, "deleted weaviate class");
        Ok(())
    }

    async fn add_documents(
        &self,
        collection: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<Vec<String>> {
        if self.schema(collection).await?.is_none() {
            return Err(StoreError::collection_not_found(BACKEND, collection));
        }
        let class = Self::class_name(collection);
        let mut ids = Vec::with_capacity(chunks.len());

        for batch in batch_chunks(chunks, self.batch_size)? {
            let objects: Vec<Value> = batch
                .iter()
                .map(|chunk| {
                    json!({
                        "class": class,
                        "id": Self::object_id(chunk.chunk_id()).to_string(),
                        "properties": Self::properties_for(chunk),
                        "vector": chunk.embeddings(),
                    })
                })
                .collect();
            let reply = self.http.post("/v1/batch/objects", &json!({ "objects": objects })).await?;
            if !reply.is_success() {
                return Err(StoreError::document(
                    BACKEND,
                    format!("batch insert into '{class}' failed: {}", reply.error_message()),
                ));
            }
            if let Some(message) = Self::batch_errors(&reply) {
                return Err(StoreError::document(
                    BACKEND,
                    format!("batch insert into '{class}' rejected objects: {message}"),
                ));
            }
            ids.extend(batch.iter().map(|c| c.chunk_id().to_string()));
            debug!(class = %class, count = batch.len(), "inserted batch into weaviate");
        }
        Ok(ids)
    }

    fn insert_batch_limit(&self) -> Option<usize> {
        Some(self.batch_size)
    }

    async fn search(&self, request: &SearchRequest) -> Result<QueryResult> {
        let name = request.collection_name();
        let class = Self::class_name(name);

        let clause = request.metadata_filter().map(Self::where_clause).transpose()?;

        let mut arguments = vec![format!("limit: {}", request.top_k())];
        let metric = match request.query_vector() {
            Some(vector) => {
                let metric = self.metric_for(name).await?;
                arguments.push(format!("nearVector: {{vector: {}}}", json!(vector)));
                Some(metric)
            }
            None => {
                let text = request.query_text().unwrap_or_default();
                arguments.push(format!("bm25: {{query: {}, properties: [\"text\"]}}", json!(text)));
                None
            }
        };
        if let Some(clause) = clause {
            arguments.push(format!("where: {clause}"));
        }

        let query = format!(
            "{{ Get {{ {class}({}) {{ {} _additional {{ id distance score }} }} }} }}",
            arguments.join(", "),
            Self::selection()
        );
        let data = self.graphql(name, query).await?;
        let hits = data
            .pointer(&format!("/Get/{class}"))
            .and_then(Value::as_array)
            .map(|objects| {
                objects.iter().filter_map(|o| Self::object_to_chunk(o, metric)).collect()
            })
            .unwrap_or_default();
        Ok(QueryResult::from_scored(hits))
    }

    async fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<DeletionReport> {
        if self.schema(collection).await?.is_none() {
            return Err(StoreError::collection_not_found(BACKEND, collection));
        }
        let class = Self::class_name(collection);
        let mut seen = HashSet::new();
        let mut report = DeletionReport::default();

        // Deleted objects drop out of the next lookup, so repeat until a
        // page comes back short.
        loop {
            let page = match self.matching_objects(collection, ids).await {
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
            self.delete_objects(&class, &fresh, &mut report).await;
            if report.error.is_some() || !full {
                break;
            }
            if fresh.is_empty() {
                report.error = Some(format!(
                    "'{class}' still lists {} objects that were already deleted",
                    self.page_size
                ));
                break;
            }
        }

        if let Some(error) = &report.error {
            warn!(
                class = %class,
                deleted = report.deleted_count,
                error = %error,
                "weaviate delete stopped part-way"
            );
        } else {
            debug!(class = %class, deleted = report.deleted_count, "deleted objects from weaviate");
        }
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
    fn class_names_are_capitalized() {
        assert_eq!(WeaviateBackend::class_name("docs"), "Docs");
        assert_eq!(WeaviateBackend::class_name("my-docs"), "My_docs");
        assert_eq!(WeaviateBackend::class_name("1docs"), "C1docs");
    }

    #[test]
    fn names_differing_in_first_letter_case_or_punctuation_share_a_class() {
        assert_eq!(WeaviateBackend::class_name("docs"), WeaviateBackend::class_name("Docs"));
        assert_eq!(WeaviateBackend::class_name("my-docs"), WeaviateBackend::class_name("my_docs"));
        assert_ne!(WeaviateBackend::class_name("docs"), WeaviateBackend::class_name("dOcs"));
    }

    #[test]
    fn object_ids_are_stable() {
        assert_eq!(WeaviateBackend::object_id("c1"), WeaviateBackend::object_id("c1"));
        assert_ne!(WeaviateBackend::object_id("c1"), WeaviateBackend::object_id("c2"));
    }

    #[test]
    fn where_clause_uses_typed_values() {
        let filter =
            DocumentMetadataFilter::new("page_number", FilterOperator::Gt, json!(2)).unwrap();
        assert_eq!(
            WeaviateBackend::where_clause(&filter).unwrap(),
            r#"{path: ["page_number"], operator: GreaterThan, valueInt: 2}"#
        );

        let filter =
            DocumentMetadataFilter::new("author", FilterOperator::In, json!(["a", "b"])).unwrap();
        assert_eq!(
            WeaviateBackend::where_clause(&filter).unwrap(),
            concat!(
                r#"{operator: Or, operands: ["#,
                r#"{path: ["author"], operator: Equal, valueText: "a"}, "#,
                r#"{path: ["author"], operator: Equal, valueText: "b"}]}"#
            )
        );
    }

    #[test]
    fn custom_fields_cannot_be_filtered() {
        let filter = DocumentMetadataFilter::eq("tenant", "acme");
        assert!(WeaviateBackend::where_clause(&filter).unwrap_err().is_precondition());
    }

    #[test]
    fn custom_fields_round_trip_through_metadata_json() {
        let mut metadata = ChunkMetadata::default();
        metadata.author = Some("ann".into());
        metadata.extra.insert("tenant".into(), json!("acme"));
        let chunk =
            EmbeddedChunk::new("c1", "hi", vec![1.0], "d1").unwrap().with_metadata(metadata);

        let mut object = Value::Object(WeaviateBackend::properties_for(&chunk));
        object["_additional"] = json!({ "distance": 0.25 });
        let hit = WeaviateBackend::object_to_chunk(&object, Some(MetricType::Cosine)).unwrap();

        let metadata = hit.chunk.metadata.unwrap();
        assert_eq!(metadata.author.as_deref(), Some("ann"));
        assert_eq!(metadata.extra.get("tenant"), Some(&json!("acme")));
        assert!((hit.score - 0.75).abs() < 1e-6);
    }
}
