//! Error types for the `adk-vectorstore` crate.
//!
//! Every adapter converts its native failures into one of three kinds
//! ([`StoreError::Collection`], [`StoreError::Document`],
//! [`StoreError::VectorStore`]). Precondition failures
//! ([`StoreError::InvalidInput`]) are raised before any native call and are
//! never worth retrying.

use thiserror::Error;

/// Boxed native error kept as the cause of a normalized failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What went wrong with a collection-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionErrorKind {
    /// The collection does not exist in the backend.
    NotFound,
    /// The collection already exists and the operation required it not to.
    AlreadyExists,
    /// The collection operation was malformed or rejected by the backend.
    Invalid,
}

/// Errors that can occur in vector store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A collection is missing, already exists, or the operation on it failed.
    #[error("Collection error ({backend}): {message}")]
    Collection {
        /// The backend that produced the error.
        backend: String,
        /// Classification of the failure.
        kind: CollectionErrorKind,
        /// A description of the failure.
        message: String,
        /// The native error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// An insert, delete, or query failed at the document/chunk level.
    #[error("Document error ({backend}): {message}")]
    Document {
        /// The backend that produced the error.
        backend: String,
        /// A description of the failure.
        message: String,
        /// The native error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// A connection or otherwise unclassified backend failure.
    #[error("Vector store error ({backend}): {message}")]
    VectorStore {
        /// The backend that produced the error.
        backend: String,
        /// A description of the failure.
        message: String,
        /// The native error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Invalid caller input, detected before any I/O.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The embedding collaborator failed to produce a vector.
    #[error("Embedding error ({provider}): {message}")]
    Embedding {
        /// The embedding provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// A configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Build a [`StoreError::Collection`] with kind [`CollectionErrorKind::NotFound`].
    pub fn collection_not_found(backend: impl Into<String>, name: &str) -> Self {
        Self::Collection {
            backend: backend.into(),
            kind: CollectionErrorKind::NotFound,
            message: format!("collection '{name}' not found"),
            source: None,
        }
    }

    /// Build a [`StoreError::Collection`] with an arbitrary kind and message.
    pub fn collection(
        backend: impl Into<String>,
        kind: CollectionErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Collection { backend: backend.into(), kind, message: message.into(), source: None }
    }

    /// Build a [`StoreError::Document`] without a native cause.
    pub fn document(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Document { backend: backend.into(), message: message.into(), source: None }
    }

    /// Build a [`StoreError::VectorStore`] without a native cause.
    pub fn store(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::VectorStore { backend: backend.into(), message: message.into(), source: None }
    }

    /// Attach a native error as the cause.
    ///
    /// Has no effect on variants that carry no cause.
    pub fn with_source(mut self, err: impl Into<BoxError>) -> Self {
        match &mut self {
            Self::Collection { source, .. }
            | Self::Document { source, .. }
            | Self::VectorStore { source, .. } => *source = Some(err.into()),
            _ => {}
        }
        self
    }

    /// The taxonomy label reported in [`StoreResponse`](crate::StoreResponse) metadata.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Collection { .. } => "CollectionError",
            Self::Document { .. } => "DocumentError",
            Self::VectorStore { .. } => "VectorStoreError",
            Self::InvalidInput(_) => "ValidationError",
            Self::Embedding { .. } => "EmbeddingError",
            Self::Config(_) => "ConfigError",
        }
    }

    /// Returns `true` if this error reports a missing collection.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Collection { kind: CollectionErrorKind::NotFound, .. })
    }

    /// Returns `true` for caller bugs detected before any native call.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::Config(_))
    }
}

/// A convenience result type for vector store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_classified() {
        let err = StoreError::collection_not_found("memory", "docs");
        assert!(err.is_not_found());
        assert_eq!(err.error_type(), "CollectionError");
        assert!(err.to_string().contains("'docs' not found"));
    }

    #[test]
    fn source_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = StoreError::store("chroma", "connection failed").with_source(io);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("refused"));
        assert!(!err.is_precondition());
    }
}
