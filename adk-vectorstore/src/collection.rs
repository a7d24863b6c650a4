//! Collection configuration, statistics, and creation outcomes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// Distance metric used to compare vectors in a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    #[default]
    #[serde(rename = "COSINE", alias = "cosine")]
    Cosine,
    #[serde(rename = "L2", alias = "l2")]
    L2,
    #[serde(rename = "IP", alias = "ip")]
    IP,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Cosine => "COSINE",
            MetricType::L2 => "L2",
            MetricType::IP => "IP",
        }
    }

    /// Convert a distance where 0 means identical into a similarity score.
    ///
    /// Cosine and inner-product distances are `1 - similarity`; L2 distances
    /// are mapped into `(0, 1]` with `1 / (1 + d)`.
    pub fn similarity_from_distance(&self, distance: f32) -> f32 {
        match self {
            MetricType::Cosine | MetricType::IP => 1.0 - distance,
            MetricType::L2 => 1.0 / (1.0 + distance.max(0.0)),
        }
    }
}

impl FromStr for MetricType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(MetricType::Cosine),
            "l2" | "euclidean" | "l2_norm" => Ok(MetricType::L2),
            "ip" | "dot" | "dotproduct" | "dot_product" | "inner_product" => Ok(MetricType::IP),
            other => Err(StoreError::InvalidInput(format!(
                "unsupported metric type '{other}' (expected one of COSINE, L2, IP)"
            ))),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Approximate nearest-neighbour index family requested for a collection.
///
/// Backends that do not let callers choose an index ignore this.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexType {
    Flat,
    #[default]
    Hnsw,
    IvfFlat,
    IvfPq,
    Auto,
}

impl IndexType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::Flat => "FLAT",
            IndexType::Hnsw => "HNSW",
            IndexType::IvfFlat => "IVF_FLAT",
            IndexType::IvfPq => "IVF_PQ",
            IndexType::Auto => "AUTOINDEX",
        }
    }
}

impl FromStr for IndexType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FLAT" => Ok(IndexType::Flat),
            "HNSW" => Ok(IndexType::Hnsw),
            "IVF_FLAT" => Ok(IndexType::IvfFlat),
            "IVF_PQ" => Ok(IndexType::IvfPq),
            "AUTO" | "AUTOINDEX" => Ok(IndexType::Auto),
            other => Err(StoreError::InvalidInput(format!("unsupported index type '{other}'"))),
        }
    }
}

/// Immutable description of a collection, validated at construction.
///
/// # Example
///
/// ```rust,ignore
/// use adk_vectorstore::{CollectionConfig, MetricType};
///
/// let config = CollectionConfig::builder("docs")
///     .dimension(384)
///     .metric_type(MetricType::Cosine)
///     .build()?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CollectionConfigBuilder")]
pub struct CollectionConfig {
    name: String,
    dimension: usize,
    metric_type: MetricType,
    index_type: IndexType,
    #[serde(skip_serializing_if = "Option::is_none")]
    index_params: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl CollectionConfig {
    /// Shorthand for a cosine/HNSW collection of the given dimension.
    pub fn new(name: impl Into<String>, dimension: usize) -> Result<Self> {
        Self::builder(name).dimension(dimension).build()
    }

    pub fn builder(name: impl Into<String>) -> CollectionConfigBuilder {
        CollectionConfigBuilder { name: name.into(), ..CollectionConfigBuilder::default() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    pub fn index_params(&self) -> Option<&Map<String, Value>> {
        self.index_params.as_ref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Builder for a validated [`CollectionConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectionConfigBuilder {
    name: String,
    #[serde(default)]
    dimension: usize,
    #[serde(default)]
    metric_type: Option<String>,
    #[serde(default)]
    index_type: Option<String>,
    #[serde(default)]
    index_params: Option<Map<String, Value>>,
    #[serde(default)]
    description: Option<String>,
}

impl CollectionConfigBuilder {
    pub fn dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn metric_type(mut self, metric: MetricType) -> Self {
        self.metric_type = Some(metric.as_str().to_string());
        self
    }

    /// Set the metric from its name (`"cosine"`, `"L2"`, `"IP"`, ...).
    /// Unknown names are rejected by [`build`](Self::build).
    pub fn metric(mut self, metric: impl Into<String>) -> Self {
        self.metric_type = Some(metric.into());
        self
    }

    pub fn index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = Some(index_type.as_str().to_string());
        self
    }

    pub fn index_params(mut self, params: Map<String, Value>) -> Self {
        self.index_params = Some(params);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Build the [`CollectionConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] if:
    /// - the name is empty
    /// - `dimension == 0`
    /// - the metric or index type is not supported
    pub fn build(self) -> Result<CollectionConfig> {
        if self.name.trim().is_empty() {
            return Err(StoreError::InvalidInput("collection name must not be empty".into()));
        }
        if self.dimension == 0 {
            return Err(StoreError::InvalidInput(format!(
                "collection '{}' must have a dimension greater than zero",
                self.name
            )));
        }
        let metric_type = match self.metric_type.as_deref() {
            Some(m) => m.parse()?,
            None => MetricType::default(),
        };
        let index_type = match self.index_type.as_deref() {
            Some(i) => i.parse()?,
            None => IndexType::default(),
        };
        Ok(CollectionConfig {
            name: self.name,
            dimension: self.dimension,
            metric_type,
            index_type,
            index_params: self.index_params,
            description: self.description,
        })
    }
}

impl TryFrom<CollectionConfigBuilder> for CollectionConfig {
    type Error = StoreError;

    fn try_from(builder: CollectionConfigBuilder) -> Result<Self> {
        builder.build()
    }
}

/// Whether `create_collection` made a new collection or found one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Created,
    Exists,
}

/// Result of an idempotent collection creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCollectionOutcome {
    pub status: CollectionStatus,
    pub name: String,
    pub dimension: usize,
}

/// Backend-reported statistics for a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub name: String,
    pub document_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<MetricType>,
    /// Backend-specific extras (index status, namespaces, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl CollectionStats {
    pub fn new(name: impl Into<String>, document_count: u64) -> Self {
        Self { name: name.into(), document_count, ..Self::default() }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn zero_dimension_is_rejected_at_construction() {
        let err = CollectionConfig::new("docs", 0).unwrap_err();
        assert!(err.is_precondition());
        assert!(err.to_string().contains("docs"));
    }

    #[test]
    fn unknown_metric_is_rejected_at_construction() {
        let err = CollectionConfig::builder("docs").dimension(3).metric("hamming").build();
        assert!(err.is_err());
    }

    #[test]
    fn metric_aliases_parse() {
        assert_eq!("euclidean".parse::<MetricType>().unwrap(), MetricType::L2);
        assert_eq!("dotproduct".parse::<MetricType>().unwrap(), MetricType::IP);
        assert_eq!("Cosine".parse::<MetricType>().unwrap(), MetricType::Cosine);
    }

    #[test]
    fn deserialization_runs_validation() {
        let bad = json!({ "name": "docs", "dimension": 0 });
        assert!(serde_json::from_value::<CollectionConfig>(bad).is_err());

        let good = json!({ "name": "docs", "dimension": 8, "metric_type": "ip" });
        let config: CollectionConfig = serde_json::from_value(good).unwrap();
        assert_eq!(config.metric_type(), MetricType::IP);
        assert_eq!(config.index_type(), IndexType::Hnsw);
    }

    #[test]
    fn distances_become_similarities() {
        assert!((MetricType::Cosine.similarity_from_distance(0.25) - 0.75).abs() < 1e-6);
        assert!((MetricType::L2.similarity_from_distance(1.0) - 0.5).abs() < 1e-6);
    }
}
