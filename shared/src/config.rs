use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{KeyNamespace, KvError, KvKey};
use crate::collection::InsertPolicy;
use crate::{
    DEFAULT_MAX_ENTRY_BYTES, DEFAULT_MEMORY_BUDGET_BYTES, DEFAULT_PREFETCH_BATCH_SIZE,
    DISK_SWEEP_INTERVAL_MS, HISTORY_CAPACITY, HISTORY_NAMESPACE, SAVED_NAMESPACE,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("could not parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Storage key owned by this collection.
    pub namespace: String,
    /// `None` means unbounded.
    pub capacity: Option<usize>,
    pub policy: InsertPolicy,
}

impl CollectionConfig {
    #[must_use]
    pub fn history() -> Self {
        Self {
            namespace: HISTORY_NAMESPACE.to_string(),
            capacity: Some(HISTORY_CAPACITY),
            policy: InsertPolicy::MoveToFront,
        }
    }

    #[must_use]
    pub fn saved() -> Self {
        Self {
            namespace: SAVED_NAMESPACE.to_string(),
            capacity: None,
            policy: InsertPolicy::KeepExisting,
        }
    }

    pub fn storage_key(&self) -> Result<KvKey, KvError> {
        KvKey::new(KeyNamespace::Collections, self.namespace.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == Some(0) {
            return Err(ConfigError::invalid("capacity", "must be > 0 when bounded"));
        }
        self.storage_key()
            .map_err(|e| ConfigError::invalid("namespace", e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
    /// Byte budget of the in-memory tier.
    pub memory_budget_bytes: usize,
    /// Larger payloads are served but never retained in memory.
    pub max_entry_bytes: usize,
    pub disk_sweep_interval_ms: u64,
    pub prefetch_batch_size: usize,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            disk_sweep_interval_ms: DISK_SWEEP_INTERVAL_MS,
            prefetch_batch_size: DEFAULT_PREFETCH_BATCH_SIZE,
        }
    }
}

impl ImageCacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_budget_bytes == 0 {
            return Err(ConfigError::invalid("memory_budget_bytes", "must be > 0"));
        }
        if self.max_entry_bytes == 0 {
            return Err(ConfigError::invalid("max_entry_bytes", "must be > 0"));
        }
        if self.disk_sweep_interval_ms == 0 {
            return Err(ConfigError::invalid("disk_sweep_interval_ms", "must be > 0"));
        }
        if self.prefetch_batch_size == 0 {
            return Err(ConfigError::invalid("prefetch_batch_size", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// When false, a failed probe leaves the last known state in place.
    pub assume_offline_on_probe_error: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            assume_offline_on_probe_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_ingredients: usize,
    /// In bytes, after trimming.
    pub max_ingredient_len: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_ingredients: 50,
            max_ingredient_len: 200,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_ingredients == 0 {
            return Err(ConfigError::invalid("max_ingredients", "must be > 0"));
        }
        if self.max_ingredient_len == 0 {
            return Err(ConfigError::invalid("max_ingredient_len", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub history: CollectionConfig,
    pub saved: CollectionConfig,
    pub image_cache: ImageCacheConfig,
    pub network: NetworkConfig,
    pub generation: GenerationConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            history: CollectionConfig::history(),
            saved: CollectionConfig::saved(),
            image_cache: ImageCacheConfig::default(),
            network: NetworkConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.history.validate()?;
        self.saved.validate()?;
        if self.history.namespace == self.saved.namespace {
            return Err(ConfigError::invalid(
                "namespace",
                format!("history and saved both use '{}'", self.history.namespace),
            ));
        }
        self.image_cache.validate()?;
        self.generation.validate()?;
        Ok(())
    }
}
