// lib.rs - Recipe client-state core shared by the mobile shells

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod app;
pub mod capabilities;
pub mod collection;
pub mod config;
pub mod error;
pub mod event;
pub mod generation;
pub mod image_cache;
pub mod model;
pub mod network;

use serde::{Deserialize, Serialize};

pub use app::{CoreCapabilities, RecipeCore};
pub use collection::{
    CollectionMetricsSnapshot, History, InsertOutcome, InsertPolicy, SavedItems, Taggable,
    TaggedCollectionStore,
};
pub use config::{
    CollectionConfig, ConfigError, CoreConfig, GenerationConfig, ImageCacheConfig, NetworkConfig,
};
pub use error::{CoreError, RecipeError, RecipeErrorKind};
pub use event::LifecycleEvent;
pub use generation::{GenerationSnapshot, GenerationState, LastRequest, RecipeGenerationController};
pub use image_cache::{CacheEntry, ImageCache, ImageCacheError};
pub use model::{IdentityKey, NutritionInfo, Recipe, RecipeId, RecipeStep};
pub use network::{NetworkStatusMonitor, Subscription};

pub const HISTORY_CAPACITY: usize = 10;
pub const HISTORY_NAMESPACE: &str = "history";
pub const SAVED_NAMESPACE: &str = "saved";
pub const DISK_SWEEP_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_MEMORY_BUDGET_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_PREFETCH_BATCH_SIZE: usize = 8;
pub const MAX_ERROR_DETAILS_LENGTH: usize = 512;

/// Explicit timestamp unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Truncates in place without splitting a UTF-8 code point.
pub(crate) fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}
