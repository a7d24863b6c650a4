//! The backend half of the store contract.
//!
//! A [`VectorStoreBackend`] translates the contract into one native API.
//! Validation, connection scoping, response envelopes and embedding
//! resolution live in [`VectorStore`](crate::VectorStore), so a backend only
//! implements the native calls.

use async_trait::async_trait;
use serde_json::Value;

use crate::collection::{CollectionConfig, CollectionStats, CollectionStatus};
use crate::document::{EmbeddedChunk, QueryResult};
use crate::error::{Result, StoreError};
use crate::request::SearchRequest;
use crate::response::DeletionReport;

/// A backend-specific implementation of the vector store contract.
///
/// Implementations must be safe to call concurrently through `&self` and
/// must not keep per-call state (such as a "current collection") on the
/// backend value. Every native failure must be converted into a
/// [`StoreError`] before it crosses this trait.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use adk_vectorstore::{InMemoryBackend, StoreSettings, VectorStore};
///
/// let store = VectorStore::new(Arc::new(InMemoryBackend::new()), StoreSettings::default());
/// ```
#[async_trait]
pub trait VectorStoreBackend: Send + Sync {
    /// Short backend name used in errors and logs.
    fn name(&self) -> &str;

    /// Open (or verify) the connection to the backend.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Release any resources held for the connection.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Backend liveness probe. Returns backend-reported details.
    async fn health_check(&self) -> Result<Value>;

    /// Statistics for one collection.
    ///
    /// A missing collection must be reported as a not-found
    /// [`StoreError::Collection`].
    async fn collection_stats(&self, name: &str) -> Result<CollectionStats>;

    /// Create the native collection, or report [`CollectionStatus::Exists`]
    /// without creating anything if it is already there.
    async fn create_collection(&self, config: &CollectionConfig) -> Result<CollectionStatus>;

    /// Drop the native collection and all its data.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Insert chunks and return their IDs in input order.
    async fn add_documents(&self, collection: &str, chunks: &[EmbeddedChunk])
    -> Result<Vec<String>>;

    /// Nearest-neighbour search. The request carries a vector unless the
    /// store had no embedding provider, in which case a backend that cannot
    /// search by text must fail with [`StoreError::InvalidInput`].
    async fn search(&self, request: &SearchRequest) -> Result<QueryResult>;

    /// Delete every chunk whose chunk ID or parent document ID is listed.
    /// Unknown IDs are not an error.
    async fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<DeletionReport>;

    /// Largest number of chunks one native insert call carries, when the
    /// backend splits [`add_documents`](Self::add_documents) further.
    fn insert_batch_limit(&self) -> Option<usize> {
        None
    }

    /// Whether text-only requests can be served without an embedding.
    fn supports_lexical_search(&self) -> bool {
        false
    }
}

/// Split `chunks` into consecutive batches of at most `batch_size`.
///
/// Every batch except possibly the last has exactly `batch_size` items.
///
/// # Errors
///
/// Returns [`StoreError::InvalidInput`] if `batch_size == 0`.
pub fn batch_chunks<T>(chunks: &[T], batch_size: usize) -> Result<std::slice::Chunks<'_, T>> {
    if batch_size == 0 {
        return Err(StoreError::InvalidInput("batch_size must be greater than zero".into()));
    }
    Ok(chunks.chunks(batch_size))
}

/// Check an adapter's configured batch size when the backend is built.
///
/// # Errors
///
/// Returns [`StoreError::Config`] if `batch_size == 0`.
pub(crate) fn require_batch_size(backend: &str, batch_size: usize) -> Result<usize> {
    if batch_size == 0 {
        return Err(StoreError::Config(format!("{backend} batch_size must be greater than zero")));
    }
    Ok(batch_size)
}

/// Fail with a precondition error if `request` has no query vector.
pub(crate) fn require_vector<'a>(backend: &str, request: &'a SearchRequest) -> Result<&'a [f32]> {
    request.query_vector().ok_or_else(|| {
        StoreError::InvalidInput(format!(
            "the {backend} backend needs a query vector; configure an embedding provider"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_cover_input_in_order() {
        let items: Vec<u32> = (0..7).collect();
        let batches: Vec<&[u32]> = batch_chunks(&items, 3).unwrap().collect();
        assert_eq!(batches, vec![&[0, 1, 2][..], &[3, 4, 5][..], &[6][..]]);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let items = [1, 2, 3];
        assert!(batch_chunks(&items, 0).is_err());
        assert_eq!(require_batch_size("test", 0).unwrap_err().error_type(), "ConfigError");
        assert_eq!(require_batch_size("test", 5).unwrap(), 5);
    }
}
