//! Data types for documents, chunks, and search results.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Result, StoreError};

/// Where a chunk's text originally came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceType {
    Website,
    Pdf,
    Word,
    Ppt,
    #[default]
    Other,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Website => "website",
            SourceType::Pdf => "pdf",
            SourceType::Word => "word",
            SourceType::Ppt => "ppt",
            SourceType::Other => "other",
        }
    }
}

impl From<String> for SourceType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "website" => SourceType::Website,
            "pdf" => SourceType::Pdf,
            "word" => SourceType::Word,
            "ppt" => SourceType::Ppt,
            _ => SourceType::Other,
        }
    }
}

impl From<SourceType> for String {
    fn from(value: SourceType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance and layout information attached to a chunk.
///
/// All fields except `source` are optional. Fields not modelled here are kept
/// in `extra` and stored alongside the known fields by every backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkMetadata {
    pub source: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Caller-defined fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChunkMetadata {
    /// Create metadata for the given source type.
    pub fn new(source: SourceType) -> Self {
        Self { source, ..Self::default() }
    }

    /// Flatten into a single-level JSON object with absent fields omitted.
    ///
    /// This is the shape stored by backends that only accept flat scalar
    /// metadata (Chroma, Pinecone).
    pub fn to_flat_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            _ => Map::new(),
        }
    }

    /// Rebuild metadata from a flat JSON object returned by a backend.
    ///
    /// Whole-number floats are narrowed to integers first, since some
    /// backends return every number as a double. Unparseable input is kept
    /// verbatim in `extra`.
    pub fn from_flat_map(map: Map<String, Value>) -> Self {
        let normalized: Map<String, Value> =
            map.into_iter().map(|(k, v)| (k, narrow_whole_number(v))).collect();
        match serde_json::from_value::<ChunkMetadata>(Value::Object(normalized.clone())) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, "stored chunk metadata did not match the expected shape");
                ChunkMetadata { extra: normalized, ..ChunkMetadata::default() }
            }
        }
    }

    /// Look up a field by name, checking the known fields before `extra`.
    pub fn field(&self, name: &str) -> Option<Value> {
        self.to_flat_map().remove(name)
    }
}

fn narrow_whole_number(value: Value) -> Value {
    match &value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f >= 0.0 && f <= u32::MAX as f64 => {
                Value::from(f as u64)
            }
            _ => value,
        },
        _ => value,
    }
}

/// A source document and the chunks it was split into.
///
/// The document owns its chunks; they are dropped with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub chunks: Vec<DocumentChunk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl Document {
    pub fn new(document_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            name: name.into(),
            path: None,
            chunks: Vec::new(),
            metadata: None,
        }
    }

    /// Append a chunk, stamping it with this document's ID.
    pub fn with_chunk(mut self, mut chunk: DocumentChunk) -> Self {
        chunk.document_id = self.document_id.clone();
        self.chunks.push(chunk);
        self
    }

    /// Promote every chunk to an [`EmbeddedChunk`].
    ///
    /// # Errors
    ///
    /// Fails on the first chunk lacking embeddings or a chunk ID.
    pub fn embedded_chunks(&self) -> Result<Vec<EmbeddedChunk>> {
        self.chunks.iter().cloned().map(EmbeddedChunk::from_chunk).collect()
    }
}

/// One retrievable unit of text, possibly not yet embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChunkMetadata>,
    #[serde(default)]
    pub document_id: String,
}

impl DocumentChunk {
    pub fn new(
        chunk_id: impl Into<String>,
        text: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            text: text.into(),
            embeddings: None,
            metadata: None,
            document_id: document_id.into(),
        }
    }

    pub fn with_embeddings(mut self, embeddings: Vec<f32>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    pub fn with_metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A chunk guaranteed to carry a non-empty ID and a non-empty embedding.
///
/// This is the only chunk type the insertion path accepts. Build one with
/// [`EmbeddedChunk::new`] or promote a [`DocumentChunk`] with
/// [`EmbeddedChunk::from_chunk`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DocumentChunk", into = "DocumentChunk")]
pub struct EmbeddedChunk {
    chunk_id: String,
    text: String,
    embeddings: Vec<f32>,
    metadata: ChunkMetadata,
    document_id: String,
}

impl EmbeddedChunk {
    /// Create an embedded chunk with default metadata.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] if `chunk_id` or `embeddings` is empty.
    pub fn new(
        chunk_id: impl Into<String>,
        text: impl Into<String>,
        embeddings: Vec<f32>,
        document_id: impl Into<String>,
    ) -> Result<Self> {
        Self::from_chunk(DocumentChunk {
            chunk_id: chunk_id.into(),
            text: text.into(),
            embeddings: Some(embeddings),
            metadata: None,
            document_id: document_id.into(),
        })
    }

    /// Promote a [`DocumentChunk`], failing loudly instead of skipping it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] with a message containing
    /// `has no chunk_id` or `has no embeddings`.
    pub fn from_chunk(chunk: DocumentChunk) -> Result<Self> {
        if chunk.chunk_id.trim().is_empty() {
            return Err(StoreError::InvalidInput(format!(
                "chunk of document '{}' has no chunk_id",
                chunk.document_id
            )));
        }
        let embeddings = match chunk.embeddings {
            Some(e) if !e.is_empty() => e,
            _ => {
                return Err(StoreError::InvalidInput(format!(
                    "chunk '{}' has no embeddings",
                    chunk.chunk_id
                )));
            }
        };
        Ok(Self {
            chunk_id: chunk.chunk_id,
            text: chunk.text,
            embeddings,
            metadata: chunk.metadata.unwrap_or_default(),
            document_id: chunk.document_id,
        })
    }

    pub fn with_metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn chunk_id(&self) -> &str {
        &self.chunk_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn embeddings(&self) -> &[f32] {
        &self.embeddings
    }

    pub fn metadata(&self) -> &ChunkMetadata {
        &self.metadata
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Number of dimensions of the embedding.
    pub fn dimension(&self) -> usize {
        self.embeddings.len()
    }
}

impl TryFrom<DocumentChunk> for EmbeddedChunk {
    type Error = StoreError;

    fn try_from(chunk: DocumentChunk) -> Result<Self> {
        Self::from_chunk(chunk)
    }
}

impl From<EmbeddedChunk> for DocumentChunk {
    fn from(chunk: EmbeddedChunk) -> Self {
        DocumentChunk {
            chunk_id: chunk.chunk_id,
            text: chunk.text,
            embeddings: Some(chunk.embeddings),
            metadata: Some(chunk.metadata),
            document_id: chunk.document_id,
        }
    }
}

/// A retrieved chunk paired with a relevance score (higher is more relevant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkWithScore {
    #[serde(flatten)]
    pub chunk: DocumentChunk,
    pub score: f32,
}

/// The hits for one query, as parallel arrays ordered by descending score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub chunks: Vec<ChunkWithScore>,
    pub similarities: Vec<f32>,
    pub ids: Vec<String>,
}

impl QueryResult {
    /// Build a result from scored chunks, sorting them by descending score.
    pub fn from_scored(mut hits: Vec<ChunkWithScore>) -> Self {
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let similarities = hits.iter().map(|h| h.score).collect();
        let ids = hits.iter().map(|h| h.chunk.chunk_id.clone()).collect();
        Self { chunks: hits, similarities, ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Drop hits beyond the first `top_k`.
    pub fn truncate(&mut self, top_k: usize) {
        self.chunks.truncate(top_k);
        self.similarities.truncate(top_k);
        self.ids.truncate(top_k);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn promotion_without_embeddings_fails_loudly() {
        let chunk = DocumentChunk::new("c1", "hello", "d1");
        let err = EmbeddedChunk::from_chunk(chunk).unwrap_err();
        assert!(err.to_string().contains("has no embeddings"));

        let empty = DocumentChunk::new("c2", "hello", "d1").with_embeddings(vec![]);
        let err = EmbeddedChunk::try_from(empty).unwrap_err();
        assert!(err.to_string().contains("has no embeddings"));
    }

    #[test]
    fn promotion_without_chunk_id_fails_loudly() {
        let chunk = DocumentChunk::new("", "hello", "d1").with_embeddings(vec![0.1]);
        let err = EmbeddedChunk::from_chunk(chunk).unwrap_err();
        assert!(err.to_string().contains("has no chunk_id"));
        assert!(err.is_precondition());
    }

    #[test]
    fn embedded_chunk_deserialization_enforces_invariants() {
        let missing = json!({ "chunk_id": "c1", "text": "t", "document_id": "d" });
        assert!(serde_json::from_value::<EmbeddedChunk>(missing).is_err());

        let ok = json!({ "chunk_id": "c1", "text": "t", "document_id": "d", "embeddings": [1.0] });
        let chunk: EmbeddedChunk = serde_json::from_value(ok).unwrap();
        assert_eq!(chunk.metadata().source, SourceType::Other);
    }

    #[test]
    fn metadata_flattens_and_restores() {
        let mut metadata = ChunkMetadata::new(SourceType::Pdf);
        metadata.page_number = Some(3);
        metadata.extra.insert("lang".into(), json!("en"));

        let flat = metadata.to_flat_map();
        assert_eq!(flat.get("source"), Some(&json!("pdf")));
        assert_eq!(flat.get("lang"), Some(&json!("en")));
        assert!(!flat.contains_key("url"));

        let mut from_backend = flat.clone();
        from_backend.insert("page_number".into(), json!(3.0));
        assert_eq!(ChunkMetadata::from_flat_map(from_backend), metadata);
    }

    #[test]
    fn unknown_source_defaults_to_other() {
        let metadata = ChunkMetadata::from_flat_map(
            json!({ "source": "fax" }).as_object().cloned().unwrap_or_default(),
        );
        assert_eq!(metadata.source, SourceType::Other);
    }

    #[test]
    fn query_result_is_sorted_and_parallel() {
        let hit = |id: &str, score: f32| ChunkWithScore {
            chunk: DocumentChunk::new(id, "t", "d"),
            score,
        };
        let result = QueryResult::from_scored(vec![hit("a", 0.1), hit("b", 0.9), hit("c", 0.5)]);
        assert_eq!(result.ids, vec!["b", "c", "a"]);
        assert_eq!(result.similarities, vec![0.9, 0.5, 0.1]);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn document_stamps_chunk_ownership() {
        let doc = Document::new("d1", "guide.pdf")
            .with_chunk(DocumentChunk::new("c1", "a", "other").with_embeddings(vec![1.0]));
        let embedded = doc.embedded_chunks().unwrap();
        assert_eq!(embedded[0].document_id(), "d1");
    }
}
