//! The backend-independent half of the store contract.
//!
//! [`VectorStore`] wraps a [`VectorStoreBackend`] and owns everything that
//! does not depend on the native API: input validation, dimension checks,
//! embedding resolution, connection scoping, timeouts, response envelopes,
//! and per-collection write ordering.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use adk_vectorstore::{CollectionConfig, EmbeddedChunk, InMemoryBackend, SearchRequest,
//!     StoreSettings, VectorStore};
//!
//! let store = VectorStore::builder()
//!     .backend(Arc::new(InMemoryBackend::new()))
//!     .settings(StoreSettings::builder().embedding_dim(3).build()?)
//!     .build()?;
//!
//! store.create_collection(&CollectionConfig::new("docs", 3)?).await?;
//! let chunk = EmbeddedChunk::new("c1", "hello", vec![0.1, 0.2, 0.3], "d1")?;
//! store.add_documents("docs", &[chunk]).await?;
//! let results = store.search(SearchRequest::vector("docs", vec![0.1, 0.2, 0.3], 1)?).await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::{VectorStoreBackend, batch_chunks};
use crate::collection::{CollectionConfig, CollectionStats, CreateCollectionOutcome};
use crate::config::StoreSettings;
use crate::document::{Document, EmbeddedChunk, QueryResult};
use crate::embedding::EmbeddingProvider;
use crate::error::{CollectionErrorKind, Result, StoreError};
use crate::request::{IngestionRequest, QueryWithEmbedding, SearchRequest};
use crate::response::{DeletionReport, StoreResponse};

/// Connection bookkeeping exposed for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ConnectionState {
    connected: AtomicBool,
    info: Mutex<ConnectionInfo>,
}

impl ConnectionState {
    /// Connect unless already connected. Returns `true` if this call opened it.
    async fn open(&self, backend: &dyn VectorStoreBackend) -> Result<bool> {
        let mut info = self.info.lock().await;
        if info.connected {
            return Ok(false);
        }
        backend.connect().await.inspect_err(|e| {
            error!(backend = backend.name(), error = %e, "failed to connect");
        })?;
        info.connected = true;
        info.connected_at = Some(Utc::now());
        self.connected.store(true, Ordering::Release);
        info!(backend = backend.name(), "connected to vector store");
        Ok(true)
    }

    async fn close(&self, backend: &dyn VectorStoreBackend) -> Result<()> {
        let mut info = self.info.lock().await;
        if !info.connected {
            return Ok(());
        }
        let result = backend.disconnect().await;
        info.connected = false;
        info.disconnected_at = Some(Utc::now());
        self.connected.store(false, Ordering::Release);
        match &result {
            Ok(()) => info!(backend = backend.name(), "disconnected from vector store"),
            Err(e) => warn!(backend = backend.name(), error = %e, "disconnect reported an error"),
        }
        result
    }
}

/// Closes a connection opened by [`VectorStore::with_connection`] on every
/// exit path. If the scope is dropped before [`release`](Self::release) runs
/// (the future was cancelled), the disconnect is spawned on the runtime.
struct ScopedConnection {
    owned: Option<(Arc<dyn VectorStoreBackend>, Arc<ConnectionState>)>,
}

impl ScopedConnection {
    async fn release(mut self) -> Result<()> {
        match self.owned.take() {
            Some((backend, state)) => state.close(backend.as_ref()).await,
            None => Ok(()),
        }
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        let Some((backend, state)) = self.owned.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = state.close(backend.as_ref()).await;
                });
            }
            Err(_) => {
                warn!(backend = backend.name(), "scoped connection dropped outside a runtime");
            }
        }
    }
}

/// A vector store with one active backend.
///
/// All operations take `&self` and may be called concurrently. Writes to the
/// same collection are serialized; writes to different collections are not.
pub struct VectorStore {
    backend: Arc<dyn VectorStoreBackend>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    settings: StoreSettings,
    connection: Arc<ConnectionState>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl VectorStore {
    /// Create a store without an embedding provider.
    pub fn new(backend: Arc<dyn VectorStoreBackend>, settings: StoreSettings) -> Self {
        Self {
            backend,
            embedding_provider: None,
            settings,
            connection: Arc::new(ConnectionState::default()),
            write_locks: DashMap::new(),
        }
    }

    /// Create a new [`VectorStoreBuilder`].
    pub fn builder() -> VectorStoreBuilder {
        VectorStoreBuilder::default()
    }

    pub fn backend(&self) -> &Arc<dyn VectorStoreBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    // ── connection lifecycle ───────────────────────────────────────────

    /// Connect to the backend. A no-op if already connected.
    pub async fn connect(&self) -> Result<()> {
        self.connection.open(self.backend.as_ref()).await.map(|_| ())
    }

    /// Disconnect from the backend. A no-op if not connected.
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.close(self.backend.as_ref()).await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.connected.load(Ordering::Acquire)
    }

    /// Snapshot of the connection state and its timestamps.
    pub async fn connection_info(&self) -> ConnectionInfo {
        self.connection.info.lock().await.clone()
    }

    /// Run `f` with a connection, connecting first only if needed.
    ///
    /// The connection is closed afterwards only if this call opened it, on
    /// success, on error, and on cancellation alike. A connection the caller
    /// opened is never closed here.
    pub async fn with_connection<'a, F, Fut, T>(&'a self, f: F) -> Result<T>
    where
        F: FnOnce(&'a VectorStore) -> Fut,
        Fut: Future<Output = Result<T>> + 'a,
    {
        let opened = self.connection.open(self.backend.as_ref()).await?;
        let scope = ScopedConnection {
            owned: opened.then(|| (self.backend.clone(), self.connection.clone())),
        };
        let result = f(self).await;
        let released = scope.release().await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }

    // ── health and stats ───────────────────────────────────────────────

    /// Probe the backend. Never fails; a timeout or error yields
    /// `success = false`.
    pub async fn health_check(&self, timeout: Option<Duration>) -> StoreResponse {
        let timeout = timeout.unwrap_or(self.settings.health_check_timeout());
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.backend.health_check()).await;
        let response = match outcome {
            Ok(Ok(details)) => StoreResponse::ok(json!({
                "backend": self.backend.name(),
                "status": "healthy",
                "details": details,
            })),
            Ok(Err(e)) => {
                warn!(backend = self.backend.name(), error = %e, "health check failed");
                StoreResponse::from_error(&e)
            }
            Err(_) => {
                let e = StoreError::store(
                    self.backend.name(),
                    format!("health check timed out after {:.1}s", timeout.as_secs_f64()),
                );
                warn!(backend = self.backend.name(), "health check timed out");
                StoreResponse::from_error(&e)
            }
        };
        response
            .with_metadata("backend", json!(self.backend.name()))
            .with_elapsed(started.elapsed())
    }

    /// Backend statistics for `name`. A missing collection yields
    /// `success = false` with `error_type = "CollectionError"`.
    pub async fn get_collection_stats(&self, name: &str) -> StoreResponse {
        let started = Instant::now();
        let response = match self.fetch_stats(name).await {
            Ok(stats) => match serde_json::to_value(&stats) {
                Ok(data) => StoreResponse::ok(data),
                Err(e) => StoreResponse::from_error(
                    &StoreError::store(self.backend.name(), "failed to encode stats")
                        .with_source(e),
                ),
            },
            Err(e) => {
                debug!(collection = name, error = %e, "collection stats unavailable");
                StoreResponse::from_error(&e)
            }
        };
        response.with_metadata("collection", json!(name)).with_elapsed(started.elapsed())
    }

    /// Whether `name` exists.
    ///
    /// # Errors
    ///
    /// Any failure other than "collection not found" is returned rather than
    /// reported as `false`.
    pub async fn collection_exists(&self, name: &str) -> Result<bool> {
        match self.fetch_stats(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn fetch_stats(&self, name: &str) -> Result<CollectionStats> {
        require_collection_name(name)?;
        self.bounded("collection_stats", self.backend.collection_stats(name)).await
    }

    // ── collections ────────────────────────────────────────────────────

    /// Create a collection, or report that it already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Collection`] naming both dimensions if
    /// `config.dimension()` differs from the embedding model's dimension.
    /// No native call is made in that case.
    pub async fn create_collection(
        &self,
        config: &CollectionConfig,
    ) -> Result<CreateCollectionOutcome> {
        let expected = self.settings.embedding_dim();
        if config.dimension() != expected {
            return Err(StoreError::collection(
                self.backend.name(),
                CollectionErrorKind::Invalid,
                format!(
                    "collection '{}' requested dimension {} but the embedding model \
                     produces dimension {}",
                    config.name(),
                    config.dimension(),
                    expected
                ),
            ));
        }

        let status = self
            .bounded("create_collection", self.backend.create_collection(config))
            .await
            .inspect_err(|e| {
                error!(collection = config.name(), error = %e, "failed to create collection");
            })?;
        info!(
            collection = config.name(),
            ?status,
            dimension = config.dimension(),
            "create collection"
        );

        Ok(CreateCollectionOutcome {
            status,
            name: config.name().to_string(),
            dimension: config.dimension(),
        })
    }

    /// Drop a collection and all of its chunks.
    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        require_collection_name(name)?;
        let lock = self.write_lock(name);
        let _guard = lock.lock().await;
        self.bounded("delete_collection", self.backend.delete_collection(name)).await.inspect_err(
            |e| error!(collection = name, error = %e, "failed to delete collection"),
        )?;
        info!(collection = name, "deleted collection");
        Ok(())
    }

    // ── documents ──────────────────────────────────────────────────────

    /// Insert embedded chunks and return their IDs in input order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] before any native call if a
    /// chunk's embedding dimension differs from the configured one.
    pub async fn add_documents(
        &self,
        collection: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<Vec<String>> {
        require_collection_name(collection)?;
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        self.validate_chunks(chunks)?;

        let lock = self.write_lock(collection);
        let _guard = lock.lock().await;
        self.insert_locked(collection, chunks).await
    }

    /// Hand `chunks` to the backend in consecutive batches of at most
    /// `batch_size`, one batch at a time. Each batch gets `request_timeout`
    /// per native call the backend needs for it.
    async fn insert_locked(
        &self,
        collection: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(chunks.len());
        for batch in batch_chunks(chunks, self.settings.batch_size())? {
            let budget = self.insert_budget(batch.len())?;
            let inserted =
                match tokio::time::timeout(budget, self.backend.add_documents(collection, batch))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(self.timed_out("add_documents", budget)),
                }
                .inspect_err(|e| {
                    error!(collection, inserted = ids.len(), error = %e, "failed to add documents");
                })?;

            if inserted.len() != batch.len() {
                return Err(StoreError::document(
                    self.backend.name(),
                    format!("backend returned {} ids for {} chunks", inserted.len(), batch.len()),
                ));
            }
            ids.extend(inserted);
        }
        info!(collection, count = ids.len(), "added documents");
        Ok(ids)
    }

    fn insert_budget(&self, batch_len: usize) -> Result<Duration> {
        let native_calls = match self.backend.insert_batch_limit() {
            Some(limit) => batch_len.div_ceil(limit.max(1)),
            None => 1,
        }
        .max(1);
        u32::try_from(native_calls)
            .ok()
            .and_then(|calls| self.settings.request_timeout().checked_mul(calls))
            .ok_or_else(|| {
                StoreError::Config(format!(
                    "request_timeout is too large to budget {native_calls} insert calls"
                ))
            })
    }

    fn validate_chunks(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
        let expected = self.settings.embedding_dim();
        match chunks.iter().find(|c| c.dimension() != expected) {
            Some(chunk) => Err(StoreError::InvalidInput(format!(
                "chunk '{}' has dimension {} but the embedding model produces dimension {}",
                chunk.chunk_id(),
                chunk.dimension(),
                expected
            ))),
            None => Ok(()),
        }
    }

    /// Delete every chunk whose chunk ID or document ID is listed.
    ///
    /// Unknown IDs are not an error; they simply do not add to
    /// `deleted_count`. A backend that fails part-way reports
    /// `success = false` together with the count it did delete.
    pub async fn delete_documents(&self, collection: &str, ids: &[String]) -> StoreResponse {
        let started = Instant::now();
        let response = self.delete_documents_inner(collection, ids).await;
        response.with_metadata("collection", json!(collection)).with_elapsed(started.elapsed())
    }

    async fn delete_documents_inner(&self, collection: &str, ids: &[String]) -> StoreResponse {
        if let Err(e) = require_collection_name(collection) {
            return StoreResponse::from_error(&e);
        }
        if ids.is_empty() {
            return StoreResponse::ok(json!({ "deleted_count": 0 }));
        }
        let lock = self.write_lock(collection);
        let _guard = lock.lock().await;
        match self.delete_locked(collection, ids).await {
            Ok(report) if report.is_complete() => {
                info!(collection, deleted = report.deleted_count, "deleted documents");
                StoreResponse::ok(json!({
                    "deleted_count": report.deleted_count,
                    "deleted_ids": report.deleted_ids,
                }))
            }
            Ok(report) => {
                let message = report.error.clone().unwrap_or_default();
                error!(
                    collection,
                    deleted = report.deleted_count,
                    error = %message,
                    "partial delete"
                );
                StoreResponse::from_error(&StoreError::document(self.backend.name(), message))
                    .with_metadata("deleted_count", json!(report.deleted_count))
                    .with_message(
                        "deletion stopped part-way; deleted_count reflects completed deletes",
                    )
            }
            Err(e) => {
                error!(collection, error = %e, "failed to delete documents");
                StoreResponse::from_error(&e)
            }
        }
    }

    async fn delete_locked(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<DeletionReport> {
        self.bounded("delete_documents", self.backend.delete_documents(collection, ids)).await
    }

    /// Replace documents by deleting their chunks and inserting new ones.
    ///
    /// The collection's write lock is held across both steps so no other
    /// write on the collection interleaves.
    pub async fn replace_documents(
        &self,
        collection: &str,
        document_ids: &[String],
        chunks: &[EmbeddedChunk],
    ) -> Result<Vec<String>> {
        require_collection_name(collection)?;
        self.validate_chunks(chunks)?;

        let lock = self.write_lock(collection);
        let _guard = lock.lock().await;
        if !document_ids.is_empty() {
            let report = self.delete_locked(collection, document_ids).await?;
            if let Some(message) = report.error {
                return Err(StoreError::document(self.backend.name(), message));
            }
            debug!(collection, deleted = report.deleted_count, "removed chunks before replace");
        }
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        self.insert_locked(collection, chunks).await
    }

    /// Promote and insert the chunks of an [`IngestionRequest`].
    ///
    /// Every chunk is promoted before anything is written, so an unembedded
    /// chunk fails the whole request without partial inserts.
    pub async fn ingest(&self, request: IngestionRequest) -> Result<Vec<String>> {
        let collection = request.collection_name.clone();
        let chunks = request.into_embedded()?;
        self.add_documents(&collection, &chunks).await
    }

    /// Ingest several requests concurrently.
    ///
    /// Requests for different collections run in parallel; requests for the
    /// same collection wait for each other.
    pub async fn ingest_all(&self, requests: Vec<IngestionRequest>) -> Result<Vec<Vec<String>>> {
        futures::future::try_join_all(requests.into_iter().map(|r| self.ingest(r))).await
    }

    // ── search ─────────────────────────────────────────────────────────

    /// Run a nearest-neighbour search.
    ///
    /// A text-only request is embedded with the injected provider first; a
    /// supplied vector is used as-is. Returns one [`QueryResult`] for the
    /// request, ordered by descending score and capped at `top_k`.
    pub async fn search(&self, request: SearchRequest) -> Result<Vec<QueryResult>> {
        let request = self.resolve_query(request).await?;
        let collection = request.collection_name().to_string();
        let mut result = self
            .bounded("search", self.backend.search(&request))
            .await
            .inspect_err(|e| error!(collection = %collection, error = %e, "search failed"))?;
        result.truncate(request.top_k());
        debug!(collection = %collection, hits = result.len(), "search completed");
        Ok(vec![result])
    }

    async fn resolve_query(&self, request: SearchRequest) -> Result<SearchRequest> {
        let expected = self.settings.embedding_dim();
        if let Some(vector) = request.query_vector() {
            if vector.len() != expected {
                return Err(StoreError::InvalidInput(format!(
                    "query vector has dimension {} but the embedding model produces dimension {}",
                    vector.len(),
                    expected
                )));
            }
            return Ok(request);
        }

        let text = request.query_text().unwrap_or_default().to_string();
        let Some(provider) = &self.embedding_provider else {
            if self.backend.supports_lexical_search() {
                return Ok(request);
            }
            return Err(StoreError::InvalidInput(format!(
                "text query for '{}' needs an embedding provider",
                request.collection_name()
            )));
        };

        let vector = provider.embed(&text).await.inspect_err(|e| {
            error!(provider = provider.name(), error = %e, "query embedding failed");
        })?;
        if vector.is_empty() || vector.len() != expected {
            return Err(StoreError::Embedding {
                provider: provider.name().to_string(),
                message: format!(
                    "expected a vector of dimension {expected}, got {}",
                    vector.len()
                ),
            });
        }
        Ok(request.with_resolved_vector(vector))
    }

    // ── legacy call shapes ─────────────────────────────────────────────

    /// Create a collection from a name and loose metadata.
    ///
    /// Recognized keys: `dimension`, `metric_type` (or `hnsw:space`),
    /// `index_type`, `description`. The dimension defaults to the
    /// embedding model's.
    pub async fn create_collection_with_metadata(
        &self,
        name: &str,
        metadata: &Map<String, Value>,
    ) -> Result<CreateCollectionOutcome> {
        let dimension = metadata
            .get("dimension")
            .and_then(Value::as_u64)
            .map(|d| d as usize)
            .unwrap_or(self.settings.embedding_dim());
        let mut builder = CollectionConfig::builder(name).dimension(dimension);
        if let Some(metric) = metadata
            .get("metric_type")
            .or_else(|| metadata.get("hnsw:space"))
            .and_then(Value::as_str)
        {
            builder = builder.metric(metric);
        }
        if let Some(index) = metadata.get("index_type").and_then(Value::as_str) {
            builder = builder.index_type(index.parse()?);
        }
        if let Some(description) = metadata.get("description").and_then(Value::as_str) {
            builder = builder.description(description);
        }
        self.create_collection(&builder.build()?).await
    }

    /// Insert the chunks of whole documents.
    pub async fn add_document_records(
        &self,
        collection: &str,
        documents: &[Document],
    ) -> Result<Vec<String>> {
        self.ingest(IngestionRequest::from_documents(collection, documents)).await
    }

    /// Search with the legacy query shape.
    pub async fn query(
        &self,
        collection: &str,
        query: QueryWithEmbedding,
    ) -> Result<Vec<QueryResult>> {
        self.search(query.into_search_request(collection)?).await
    }

    // ── helpers ────────────────────────────────────────────────────────

    fn write_lock(&self, collection: &str) -> Arc<Mutex<()>> {
        self.write_locks.entry(collection.to_string()).or_default().clone()
    }

    async fn bounded<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.settings.request_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(operation, timeout)),
        }
    }

    fn timed_out(&self, operation: &str, timeout: Duration) -> StoreError {
        StoreError::store(
            self.backend.name(),
            format!("{operation} timed out after {:.1}s", timeout.as_secs_f64()),
        )
    }
}

fn require_collection_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidInput("collection name must not be empty".into()));
    }
    Ok(())
}

/// Builder for constructing a [`VectorStore`].
#[derive(Default)]
pub struct VectorStoreBuilder {
    backend: Option<Arc<dyn VectorStoreBackend>>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    settings: Option<StoreSettings>,
}

impl VectorStoreBuilder {
    pub fn backend(mut self, backend: Arc<dyn VectorStoreBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    pub fn settings(mut self, settings: StoreSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Build the [`VectorStore`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if no backend is set, or if the
    /// embedding provider's dimension differs from `embedding_dim`.
    pub fn build(self) -> Result<VectorStore> {
        let backend =
            self.backend.ok_or_else(|| StoreError::Config("backend is required".to_string()))?;
        let settings = self.settings.unwrap_or_default();
        if let Some(provider) = &self.embedding_provider {
            if provider.dimensions() != settings.embedding_dim() {
                return Err(StoreError::Config(format!(
                    "embedding provider '{}' produces dimension {} but embedding_dim is {}",
                    provider.name(),
                    provider.dimensions(),
                    settings.embedding_dim()
                )));
            }
        }
        let mut store = VectorStore::new(backend, settings);
        store.embedding_provider = self.embedding_provider;
        Ok(store)
    }
}
