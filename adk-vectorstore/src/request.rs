//! Request types accepted by [`VectorStore`](crate::VectorStore).

use serde::{Deserialize, Serialize};

use crate::document::{Document, DocumentChunk, EmbeddedChunk};
use crate::error::{Result, StoreError};
use crate::filter::DocumentMetadataFilter;

/// What to search for: raw text, a vector, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchQuery {
    /// Text that still needs embedding (or lexical matching).
    Text(String),
    /// A pre-computed query vector.
    Vector(Vec<f32>),
    /// Text plus its pre-computed vector; the vector is used for search.
    Hybrid { text: String, vector: Vec<f32> },
}

/// A validated nearest-neighbour search against one collection.
///
/// Construction fails immediately if neither a query text nor a query vector
/// is supplied, so a malformed request never reaches a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSearchRequest")]
pub struct SearchRequest {
    collection_name: String,
    query: SearchQuery,
    top_k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata_filter: Option<DocumentMetadataFilter>,
}

impl SearchRequest {
    /// Create a request from optional text and vector.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] if:
    /// - the collection name is empty
    /// - `top_k == 0`
    /// - both `query_text` and `query_vector` are missing or empty
    pub fn new(
        collection_name: impl Into<String>,
        query_text: Option<String>,
        query_vector: Option<Vec<f32>>,
        top_k: usize,
    ) -> Result<Self> {
        let collection_name = collection_name.into();
        if collection_name.trim().is_empty() {
            return Err(StoreError::InvalidInput(
                "search request needs a collection name".into(),
            ));
        }
        if top_k == 0 {
            return Err(StoreError::InvalidInput("top_k must be greater than zero".into()));
        }
        let text = query_text.filter(|t| !t.trim().is_empty());
        let vector = query_vector.filter(|v| !v.is_empty());
        let query = match (text, vector) {
            (Some(text), Some(vector)) => SearchQuery::Hybrid { text, vector },
            (Some(text), None) => SearchQuery::Text(text),
            (None, Some(vector)) => SearchQuery::Vector(vector),
            (None, None) => {
                return Err(StoreError::InvalidInput(
                    "search request needs a query_text or a query_vector".into(),
                ));
            }
        };
        Ok(Self { collection_name, query, top_k, metadata_filter: None })
    }

    /// Search by text, resolved to a vector by the injected embedding provider.
    pub fn text(
        collection_name: impl Into<String>,
        text: impl Into<String>,
        top_k: usize,
    ) -> Result<Self> {
        Self::new(collection_name, Some(text.into()), None, top_k)
    }

    /// Search by a pre-computed vector.
    pub fn vector(
        collection_name: impl Into<String>,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Self> {
        Self::new(collection_name, None, Some(vector), top_k)
    }

    /// Search with both text and its pre-computed vector.
    pub fn hybrid(
        collection_name: impl Into<String>,
        text: impl Into<String>,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Self> {
        Self::new(collection_name, Some(text.into()), Some(vector), top_k)
    }

    /// Restrict results with a metadata filter.
    pub fn with_filter(mut self, filter: DocumentMetadataFilter) -> Result<Self> {
        filter.validate()?;
        self.metadata_filter = Some(filter);
        Ok(self)
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn metadata_filter(&self) -> Option<&DocumentMetadataFilter> {
        self.metadata_filter.as_ref()
    }

    pub fn query_text(&self) -> Option<&str> {
        match &self.query {
            SearchQuery::Text(text) | SearchQuery::Hybrid { text, .. } => Some(text),
            SearchQuery::Vector(_) => None,
        }
    }

    /// The query vector, if one was supplied or already resolved.
    pub fn query_vector(&self) -> Option<&[f32]> {
        match &self.query {
            SearchQuery::Vector(vector) | SearchQuery::Hybrid { vector, .. } => Some(vector),
            SearchQuery::Text(_) => None,
        }
    }

    /// Attach the embedding of a text-only query.
    pub(crate) fn with_resolved_vector(mut self, vector: Vec<f32>) -> Self {
        self.query = match self.query {
            SearchQuery::Text(text) | SearchQuery::Hybrid { text, .. } => {
                SearchQuery::Hybrid { text, vector }
            }
            SearchQuery::Vector(_) => SearchQuery::Vector(vector),
        };
        self
    }
}

#[derive(Deserialize)]
struct RawSearchRequest {
    collection_name: String,
    #[serde(default)]
    query_text: Option<String>,
    #[serde(default)]
    query_vector: Option<Vec<f32>>,
    #[serde(default)]
    query: Option<SearchQuery>,
    top_k: usize,
    #[serde(default)]
    metadata_filter: Option<DocumentMetadataFilter>,
}

impl TryFrom<RawSearchRequest> for SearchRequest {
    type Error = StoreError;

    fn try_from(raw: RawSearchRequest) -> Result<Self> {
        let (text, vector) = match raw.query {
            Some(SearchQuery::Text(text)) => (Some(text), raw.query_vector),
            Some(SearchQuery::Vector(vector)) => (raw.query_text, Some(vector)),
            Some(SearchQuery::Hybrid { text, vector }) => (Some(text), Some(vector)),
            None => (raw.query_text, raw.query_vector),
        };
        let request = SearchRequest::new(raw.collection_name, text, vector, raw.top_k)?;
        match raw.metadata_filter {
            Some(filter) => request.with_filter(filter),
            None => Ok(request),
        }
    }
}

/// A batch of chunks, embeddings already attached, bound for one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRequest {
    pub collection_name: String,
    pub chunks: Vec<DocumentChunk>,
}

impl IngestionRequest {
    pub fn new(collection_name: impl Into<String>, chunks: Vec<DocumentChunk>) -> Self {
        Self { collection_name: collection_name.into(), chunks }
    }

    /// Collect the chunks of several documents into one request.
    pub fn from_documents(collection_name: impl Into<String>, documents: &[Document]) -> Self {
        let chunks = documents.iter().flat_map(|d| d.chunks.iter().cloned()).collect();
        Self::new(collection_name, chunks)
    }

    /// Promote every chunk, failing on the first one that is not embedded.
    pub fn into_embedded(self) -> Result<Vec<EmbeddedChunk>> {
        self.chunks.into_iter().map(EmbeddedChunk::from_chunk).collect()
    }
}

/// Legacy query shape: optional text and embedding plus a result count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryWithEmbedding {
    #[serde(default)]
    pub query_text: Option<String>,
    #[serde(default)]
    pub query_embedding: Option<Vec<f32>>,
    pub top_k: usize,
    #[serde(default)]
    pub filter: Option<DocumentMetadataFilter>,
}

impl QueryWithEmbedding {
    /// Translate into a [`SearchRequest`] against `collection_name`.
    pub fn into_search_request(self, collection_name: &str) -> Result<SearchRequest> {
        let request =
            SearchRequest::new(collection_name, self.query_text, self.query_embedding, self.top_k)?;
        match self.filter {
            Some(filter) => request.with_filter(filter),
            None => Ok(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_without_query_fails_at_construction() {
        let err = SearchRequest::new("docs", None, None, 5).unwrap_err();
        assert!(err.is_precondition());
        assert!(SearchRequest::new("docs", Some("  ".into()), Some(vec![]), 5).is_err());
    }

    #[test]
    fn zero_top_k_fails() {
        assert!(SearchRequest::vector("docs", vec![0.1], 0).is_err());
    }

    #[test]
    fn vector_takes_priority_in_hybrid() {
        let request = SearchRequest::hybrid("docs", "hello", vec![0.5, 0.5], 3).unwrap();
        assert_eq!(request.query_vector(), Some(&[0.5, 0.5][..]));
        assert_eq!(request.query_text(), Some("hello"));
    }

    #[test]
    fn resolving_text_keeps_the_text() {
        let request = SearchRequest::text("docs", "hello", 3).unwrap();
        assert!(request.query_vector().is_none());
        let resolved = request.with_resolved_vector(vec![1.0]);
        assert_eq!(resolved.query_vector(), Some(&[1.0][..]));
        assert_eq!(resolved.query_text(), Some("hello"));
    }

    #[test]
    fn deserialization_validates() {
        let bad = json!({ "collection_name": "docs", "top_k": 2 });
        assert!(serde_json::from_value::<SearchRequest>(bad).is_err());

        let good = json!({ "collection_name": "docs", "top_k": 2, "query_vector": [0.1, 0.2] });
        let request: SearchRequest = serde_json::from_value(good).unwrap();
        assert_eq!(request.top_k(), 2);
    }

    #[test]
    fn ingestion_request_fails_on_unembedded_chunk() {
        let request = IngestionRequest::new(
            "docs",
            vec![
                DocumentChunk::new("c1", "a", "d").with_embeddings(vec![1.0]),
                DocumentChunk::new("c2", "b", "d"),
            ],
        );
        let err = request.into_embedded().unwrap_err();
        assert!(err.to_string().contains("'c2' has no embeddings"));
    }
}
