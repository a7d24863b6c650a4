//! In-memory vector store backend.
//!
//! This module provides [`InMemoryBackend`], a zero-dependency backend
//! backed by a `HashMap` protected by a `tokio::sync::RwLock`. It is suitable
//! for development, testing, and small-scale use cases.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;

use crate::backend::VectorStoreBackend;
use crate::collection::{CollectionConfig, CollectionStats, CollectionStatus, MetricType};
use crate::document::{ChunkWithScore, DocumentChunk, EmbeddedChunk, QueryResult};
use crate::error::{Result, StoreError};
use crate::request::SearchRequest;
use crate::response::DeletionReport;

const BACKEND: &str = "memory";

#[derive(Debug)]
struct MemoryCollection {
    config: CollectionConfig,
    /// Insertion order, so listings and ties are deterministic.
    order: Vec<String>,
    chunks: HashMap<String, EmbeddedChunk>,
}

/// An in-memory backend scoring with the collection's metric.
///
/// Collections are stored as nested maps: collection name → chunk ID → chunk.
/// All operations are async-safe via `tokio::sync::RwLock`. Text-only
/// searches fall back to case-insensitive substring matching.
///
/// # Example
///
/// ```rust,ignore
/// use adk_vectorstore::InMemoryBackend;
///
/// let backend = InMemoryBackend::new();
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl InMemoryBackend {
    /// Create a new empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has zero magnitude.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot = dot_product(a, b);
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

fn score(metric: MetricType, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        MetricType::Cosine => cosine_similarity(a, b),
        MetricType::IP => dot_product(a, b),
        MetricType::L2 => MetricType::L2.similarity_from_distance(l2_distance(a, b)),
    }
}

/// Flat view of a chunk used for filter evaluation.
fn filter_fields(chunk: &EmbeddedChunk) -> Map<String, Value> {
    let mut fields = chunk.metadata().to_flat_map();
    fields.insert("chunk_id".into(), json!(chunk.chunk_id()));
    fields.insert("document_id".into(), json!(chunk.document_id()));
    fields
}

fn to_hit(chunk: &EmbeddedChunk, score: f32) -> ChunkWithScore {
    let mut plain = DocumentChunk::from(chunk.clone());
    plain.embeddings = None;
    ChunkWithScore { chunk: plain, score }
}

#[async_trait]
impl VectorStoreBackend for InMemoryBackend {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn health_check(&self) -> Result<Value> {
        let collections = self.collections.read().await;
        Ok(json!({ "collections": collections.len() }))
    }

    async fn collection_stats(&self, name: &str) -> Result<CollectionStats> {
        let collections = self.collections.read().await;
        let collection =
            collections.get(name).ok_or_else(|| StoreError::collection_not_found(BACKEND, name))?;
        let mut stats = CollectionStats::new(name, collection.chunks.len() as u64);
        stats.dimension = Some(collection.config.dimension());
        stats.metric_type = Some(collection.config.metric_type());
        Ok(stats)
    }

    async fn create_collection(&self, config: &CollectionConfig) -> Result<CollectionStatus> {
        let mut collections = self.collections.write().await;
        if collections.contains_key(config.name()) {
            return Ok(CollectionStatus::Exists);
        }
        collections.insert(
            config.name().to_string(),
            MemoryCollection { config: config.clone(), order: Vec::new(), chunks: HashMap::new() },
        );
        Ok(CollectionStatus::Created)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let mut collections = self.collections.write().await;
        collections
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::collection_not_found(BACKEND, name))
    }

    async fn add_documents(
        &self,
        collection: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<Vec<String>> {
        let mut collections = self.collections.write().await;
        let store = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::collection_not_found(BACKEND, collection))?;
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let id = chunk.chunk_id().to_string();
            if store.chunks.insert(id.clone(), chunk.clone()).is_none() {
                store.order.push(id.clone());
            }
            ids.push(id);
        }
        Ok(ids)
    }

    async fn search(&self, request: &SearchRequest) -> Result<QueryResult> {
        let collections = self.collections.read().await;
        let name = request.collection_name();
        let store =
            collections.get(name).ok_or_else(|| StoreError::collection_not_found(BACKEND, name))?;
        let metric = store.config.metric_type();
        let filter = request.metadata_filter();

        let candidates = store
            .order
            .iter()
            .filter_map(|id| store.chunks.get(id))
            .filter(|chunk| filter.is_none_or(|f| f.matches(&filter_fields(chunk))));

        let hits: Vec<ChunkWithScore> = match request.query_vector() {
            Some(vector) => {
                candidates.map(|c| to_hit(c, score(metric, c.embeddings(), vector))).collect()
            }
            None => {
                let needle = request.query_text().unwrap_or_default().to_lowercase();
                candidates
                    .filter(|c| c.text().to_lowercase().contains(&needle))
                    .map(|c| to_hit(c, 1.0))
                    .collect()
            }
        };

        let mut result = QueryResult::from_scored(hits);
        result.truncate(request.top_k());
        Ok(result)
    }

    async fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<DeletionReport> {
        let mut collections = self.collections.write().await;
        let store = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::collection_not_found(BACKEND, collection))?;
        let doomed: Vec<String> = store
            .order
            .iter()
            .filter(|id| {
                store.chunks.get(*id).is_some_and(|c| {
                    ids.iter().any(|target| target == c.chunk_id() || target == c.document_id())
                })
            })
            .cloned()
            .collect();
        for id in &doomed {
            store.chunks.remove(id);
        }
        store.order.retain(|id| store.chunks.contains_key(id));
        Ok(DeletionReport::deleted(doomed))
    }

    fn supports_lexical_search(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        assert!((cosine_similarity(&[0.1, 0.2, 0.3], &[0.1, 0.2, 0.3]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn l2_score_prefers_closer_vectors() {
        let near = score(MetricType::L2, &[1.0, 0.0], &[1.0, 0.1]);
        let far = score(MetricType::L2, &[1.0, 0.0], &[-1.0, 0.0]);
        assert!(near > far);
    }
}
