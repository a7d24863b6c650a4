//! Settings shared by every backend behind a [`VectorStore`](crate::VectorStore).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Default number of chunks per native insert call.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Backend-independent settings for a vector store.
///
/// Settings are only constructed through [`StoreSettingsBuilder::build`],
/// so deserialized values are validated the same way as built ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawStoreSettings")]
pub struct StoreSettings {
    embedding_dim: usize,
    batch_size: usize,
    #[serde(with = "duration_secs")]
    health_check_timeout: Duration,
    #[serde(with = "duration_secs")]
    request_timeout: Duration,
}

/// Unvalidated wire shape of [`StoreSettings`].
#[derive(Deserialize)]
struct RawStoreSettings {
    embedding_dim: usize,
    batch_size: usize,
    #[serde(with = "duration_secs")]
    health_check_timeout: Duration,
    #[serde(with = "duration_secs")]
    request_timeout: Duration,
}

impl TryFrom<RawStoreSettings> for StoreSettings {
    type Error = StoreError;

    fn try_from(raw: RawStoreSettings) -> Result<Self> {
        StoreSettings::builder()
            .embedding_dim(raw.embedding_dim)
            .batch_size(raw.batch_size)
            .health_check_timeout(raw.health_check_timeout)
            .request_timeout(raw.request_timeout)
            .build()
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            embedding_dim: 1536,
            batch_size: DEFAULT_BATCH_SIZE,
            health_check_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl StoreSettings {
    /// Create a new builder for constructing [`StoreSettings`].
    pub fn builder() -> StoreSettingsBuilder {
        StoreSettingsBuilder::default()
    }

    /// Dimension produced by the configured embedding model. Collections and
    /// vectors of any other dimension are rejected.
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Maximum number of chunks handed to the backend in one insert call.
    ///
    /// A backend with a smaller native limit splits each call further.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Upper bound for a health check before it reports failure.
    pub fn health_check_timeout(&self) -> Duration {
        self.health_check_timeout
    }

    /// Upper bound for a single native request.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Load settings from the environment, falling back to defaults.
    ///
    /// Reads `VECTORSTORE_EMBEDDING_DIM`, `VECTORSTORE_BATCH_SIZE`,
    /// `VECTORSTORE_HEALTH_TIMEOUT_SECS` and `VECTORSTORE_REQUEST_TIMEOUT_SECS`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if a variable is set but not a valid
    /// number, or if the resulting settings fail validation.
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder();
        if let Some(dim) = env_number("VECTORSTORE_EMBEDDING_DIM")? {
            builder = builder.embedding_dim(dim as usize);
        }
        if let Some(size) = env_number("VECTORSTORE_BATCH_SIZE")? {
            builder = builder.batch_size(size as usize);
        }
        if let Some(secs) = env_number("VECTORSTORE_HEALTH_TIMEOUT_SECS")? {
            builder = builder.health_check_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = env_number("VECTORSTORE_REQUEST_TIMEOUT_SECS")? {
            builder = builder.request_timeout(Duration::from_secs(secs));
        }
        builder.build()
    }
}

fn env_number(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| StoreError::Config(format!("{key}='{raw}' is not a number: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Builder for constructing validated [`StoreSettings`].
#[derive(Debug, Clone, Default)]
pub struct StoreSettingsBuilder {
    settings: StoreSettings,
}

impl StoreSettingsBuilder {
    pub fn embedding_dim(mut self, dim: usize) -> Self {
        self.settings.embedding_dim = dim;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.settings.batch_size = size;
        self
    }

    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.settings.health_check_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout = timeout;
        self
    }

    /// Build the [`StoreSettings`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if:
    /// - `embedding_dim == 0`
    /// - `batch_size == 0`
    /// - either timeout is zero
    pub fn build(self) -> Result<StoreSettings> {
        let s = self.settings;
        if s.embedding_dim == 0 {
            return Err(StoreError::Config("embedding_dim must be greater than zero".into()));
        }
        if s.batch_size == 0 {
            return Err(StoreError::Config("batch_size must be greater than zero".into()));
        }
        if s.health_check_timeout.is_zero() || s.request_timeout.is_zero() {
            return Err(StoreError::Config("timeouts must be greater than zero".into()));
        }
        Ok(s)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn builder_validates() {
        assert!(StoreSettings::builder().embedding_dim(0).build().is_err());
        assert!(StoreSettings::builder().batch_size(0).build().is_err());
        assert!(StoreSettings::builder().request_timeout(Duration::ZERO).build().is_err());

        let settings = StoreSettings::builder().embedding_dim(3).batch_size(2).build().unwrap();
        assert_eq!(settings.embedding_dim(), 3);
        assert_eq!(settings.batch_size(), 2);
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = StoreSettings::default();
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["health_check_timeout"], 5.0);
        let back: StoreSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn deserialized_settings_are_validated() {
        let zero_batch = json!({
            "embedding_dim": 3,
            "batch_size": 0,
            "health_check_timeout": 5.0,
            "request_timeout": 30.0
        });
        let err = serde_json::from_value::<StoreSettings>(zero_batch).unwrap_err();
        assert!(err.to_string().contains("batch_size must be greater than zero"), "{err}");

        let zero_timeout = json!({
            "embedding_dim": 3,
            "batch_size": 10,
            "health_check_timeout": 5.0,
            "request_timeout": 0.0
        });
        assert!(serde_json::from_value::<StoreSettings>(zero_timeout).is_err());
    }
}
