//! # adk-vectorstore
//!
//! Backend-agnostic vector store layer for ADK-Rust agents.
//!
//! ## Overview
//!
//! Application code talks to a single [`VectorStore`] and never to a native
//! vector database client. The store validates input, scopes connections,
//! wraps results in [`StoreResponse`] envelopes where callers expect them,
//! and resolves text queries through an optional [`EmbeddingProvider`]. Each
//! database is reached through a [`VectorStoreBackend`]:
//!
//! - [`InMemoryBackend`] - always available, for tests and small workloads
//! - [`chroma::ChromaBackend`] - Chroma v2 HTTP API (`chroma` feature)
//! - [`elasticsearch::ElasticsearchBackend`] - dense-vector indices (`elasticsearch` feature)
//! - [`milvus::MilvusBackend`] - Milvus RESTful v2 (`milvus` feature)
//! - [`pinecone::PineconeBackend`] - serverless indexes (`pinecone` feature)
//! - [`weaviate::WeaviateBackend`] - classes with caller-supplied vectors (`weaviate` feature)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use adk_vectorstore::{
//!     CollectionConfig, EmbeddedChunk, InMemoryBackend, SearchRequest, StoreSettings,
//!     VectorStore,
//! };
//!
//! let settings = StoreSettings::builder().embedding_dim(3).build()?;
//! let store = VectorStore::new(Arc::new(InMemoryBackend::new()), settings);
//!
//! store.create_collection(&CollectionConfig::new("docs", 3)?).await?;
//! store
//!     .add_documents("docs", &[EmbeddedChunk::new("c1", "hello", vec![0.1, 0.2, 0.3], "d1")?])
//!     .await?;
//!
//! let results = store.search(SearchRequest::vector("docs", vec![0.1, 0.2, 0.3], 5)?).await?;
//! assert_eq!(results[0].ids, vec!["c1"]);
//! ```

pub mod backend;
pub mod collection;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod inmemory;
pub mod registry;
pub mod request;
pub mod response;
pub mod store;

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "chroma")]
pub mod chroma;
#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;
#[cfg(feature = "milvus")]
pub mod milvus;
#[cfg(feature = "pinecone")]
pub mod pinecone;
#[cfg(feature = "weaviate")]
pub mod weaviate;

pub use backend::{VectorStoreBackend, batch_chunks};
pub use collection::{
    CollectionConfig, CollectionConfigBuilder, CollectionStats, CollectionStatus,
    CreateCollectionOutcome, IndexType, MetricType,
};
pub use config::{DEFAULT_BATCH_SIZE, StoreSettings, StoreSettingsBuilder};
pub use document::{
    ChunkMetadata, ChunkWithScore, Document, DocumentChunk, EmbeddedChunk, QueryResult, SourceType,
};
pub use embedding::EmbeddingProvider;
pub use error::{CollectionErrorKind, Result, StoreError};
pub use filter::{DocumentMetadataFilter, FilterOperator};
pub use inmemory::InMemoryBackend;
pub use registry::{BackendFactory, BackendRegistry};
pub use request::{IngestionRequest, QueryWithEmbedding, SearchQuery, SearchRequest};
pub use response::{DeletionReport, StoreResponse};
pub use store::{ConnectionInfo, VectorStore, VectorStoreBuilder};
