//! Name-keyed construction of backends from JSON configuration.
//!
//! Applications that pick a backend at runtime (from a config file or an
//! environment variable) register factories here and build by name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::backend::VectorStoreBackend;
use crate::error::{Result, StoreError};
use crate::inmemory::InMemoryBackend;

/// Builds a backend from its JSON configuration.
pub type BackendFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn VectorStoreBackend>> + Send + Sync>;

/// A set of named backend factories.
///
/// # Example
///
/// ```rust,ignore
/// use adk_vectorstore::BackendRegistry;
/// use serde_json::json;
///
/// let registry = BackendRegistry::with_defaults();
/// let backend = registry.build("chroma", &json!({ "url": "http://localhost:8000" }))?;
/// ```
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry").field("backends", &self.names()).finish()
    }
}

/// Deserialize an adapter config, using `fallback` when no config is given.
#[cfg_attr(not(feature = "http"), allow(dead_code))]
fn parse_config<C: DeserializeOwned>(
    backend: &str,
    config: &Value,
    fallback: impl FnOnce() -> Result<C>,
) -> Result<C> {
    if config.is_null() {
        return fallback();
    }
    serde_json::from_value(config.clone())
        .map_err(|e| StoreError::Config(format!("invalid {backend} configuration: {e}")))
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `memory` plus every adapter compiled into this build.
    ///
    /// A `null` configuration makes the adapter read its environment
    /// variables instead.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", |_| Ok(Arc::new(InMemoryBackend::new())));

        #[cfg(feature = "chroma")]
        registry.register("chroma", |config| {
            use crate::chroma::{ChromaBackend, ChromaConfig};
            let config = parse_config("chroma", config, || Ok(ChromaConfig::from_env()))?;
            Ok(Arc::new(ChromaBackend::new(config)?))
        });

        #[cfg(feature = "elasticsearch")]
        registry.register("elasticsearch", |config| {
            use crate::elasticsearch::{ElasticsearchBackend, ElasticsearchConfig};
            let config =
                parse_config("elasticsearch", config, || Ok(ElasticsearchConfig::from_env()))?;
            Ok(Arc::new(ElasticsearchBackend::new(config)?))
        });

        #[cfg(feature = "milvus")]
        registry.register("milvus", |config| {
            use crate::milvus::{MilvusBackend, MilvusConfig};
            let config = parse_config("milvus", config, || Ok(MilvusConfig::from_env()))?;
            Ok(Arc::new(MilvusBackend::new(config)?))
        });

        #[cfg(feature = "pinecone")]
        registry.register("pinecone", |config| {
            use crate::pinecone::{PineconeBackend, PineconeConfig};
            let config = parse_config("pinecone", config, PineconeConfig::from_env)?;
            Ok(Arc::new(PineconeBackend::new(config)?))
        });

        #[cfg(feature = "weaviate")]
        registry.register("weaviate", |config| {
            use crate::weaviate::{WeaviateBackend, WeaviateConfig};
            let config = parse_config("weaviate", config, || Ok(WeaviateConfig::from_env()))?;
            Ok(Arc::new(WeaviateBackend::new(config)?))
        });

        registry
    }

    /// Register (or replace) a factory. Names are case-insensitive.
    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Arc<dyn VectorStoreBackend>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_ascii_lowercase(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Build the backend registered as `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] for an unknown name or a configuration
    /// the backend rejects.
    pub fn build(&self, name: &str, config: &Value) -> Result<Arc<dyn VectorStoreBackend>> {
        let factory = self.factories.get(&name.to_ascii_lowercase()).ok_or_else(|| {
            StoreError::Config(format!(
                "unknown vector store backend '{name}' (registered: {})",
                self.names().join(", ")
            ))
        })?;
        debug!(backend = name, "building vector store backend");
        factory(config)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_include_memory() {
        let registry = BackendRegistry::with_defaults();
        assert!(registry.contains("memory"));
        assert!(registry.contains("MEMORY"));
        let backend = registry.build("memory", &Value::Null).unwrap();
        assert_eq!(backend.name(), "memory");
    }

    #[test]
    fn unknown_backend_lists_registered_names() {
        let err = BackendRegistry::with_defaults().build("faiss", &Value::Null).err().unwrap();
        assert!(matches!(err, StoreError::Config(ref m) if m.contains("memory")));
    }

    #[cfg(feature = "chroma")]
    #[test]
    fn bad_adapter_config_is_a_config_error() {
        let err = BackendRegistry::with_defaults()
            .build("chroma", &json!({ "timeout_secs": "soon" }))
            .err().unwrap();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn custom_factories_replace_defaults() {
        let mut registry = BackendRegistry::new();
        registry.register("fast", |_| Ok(Arc::new(InMemoryBackend::new())));
        assert_eq!(registry.names(), vec!["fast".to_string()]);
        assert!(registry.build("fast", &json!({})).is_ok());
    }
}
