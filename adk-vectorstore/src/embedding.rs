//! Embedding collaborator used to resolve text-only search requests.

use async_trait::async_trait;

use crate::error::Result;

/// A provider that turns text into a vector embedding.
///
/// The store calls [`embed`](EmbeddingProvider::embed) only when a
/// [`SearchRequest`](crate::SearchRequest) carries text without a vector. It
/// never retries a failed embedding.
///
/// # Example
///
/// ```rust,ignore
/// use adk_vectorstore::EmbeddingProvider;
///
/// let embedding = provider.embed("hello world").await?;
/// assert_eq!(embedding.len(), provider.dimensions());
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for a single text input.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Return the dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;

    /// Name used in error messages and logs.
    fn name(&self) -> &str {
        "embedding"
    }
}
